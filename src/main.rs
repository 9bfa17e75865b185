//! Binary entry point for the brkt-imager CLI.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use brkt_imager::{
    BrktConfig, CloudProvider, EncryptRequest, EncryptWorkflow, FakeProvider, HttpStatusClient,
    InstanceConfigError, LaunchRequest, LaunchWorkflow, RetryPolicy, RetryingProvider,
    UnknownCryptoPolicy, UpdateRequest, UpdateWorkflow, WorkflowError, read_payload_file,
};

mod cli;

use cli::{Cli, CommonOptions, EncryptCommand, LaunchCommand, UpdateCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid tag '{0}', expected KEY=VALUE")]
    InvalidTag(String),
    #[error("unknown provider '{0}'; this build only ships the 'fake' adapter")]
    UnknownProvider(String),
    #[error(transparent)]
    Crypto(#[from] UnknownCryptoPolicy),
    #[error(transparent)]
    Payload(#[from] InstanceConfigError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(verbose_flag(&cli));
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };
    process::exit(exit_code);
}

const fn verbose_flag(cli: &Cli) -> bool {
    match cli {
        Cli::Encrypt(cmd) => cmd.common.verbose,
        Cli::Update(cmd) => cmd.common.verbose,
        Cli::Launch(cmd) => cmd.common.verbose,
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Encrypt(cmd) => run_encrypt(cmd).await,
        Cli::Update(cmd) => run_update(cmd).await,
        Cli::Launch(cmd) => run_launch(cmd).await,
    }
}

fn load_config() -> Result<BrktConfig, CliError> {
    let config =
        BrktConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

fn resolve_provider(
    common: &CommonOptions,
    config: &BrktConfig,
) -> Result<Arc<dyn CloudProvider>, CliError> {
    let retry_timeout =
        Duration::from_secs(common.retry_timeout.unwrap_or(config.retry_timeout_secs));
    match common.provider.as_str() {
        "fake" => Ok(Arc::new(RetryingProvider::new(
            FakeProvider::new(),
            RetryPolicy::with_max_elapsed(retry_timeout),
        ))),
        other => Err(CliError::UnknownProvider(other.to_owned())),
    }
}

fn parse_tags(pairs: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    let mut tags = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(CliError::InvalidTag(pair.clone()));
        };
        tags.insert(key.to_owned(), value.to_owned());
    }
    Ok(tags)
}

fn print_result(id: &str) {
    // The id goes to stdout so callers can capture it; log messages go to
    // stderr.
    writeln!(io::stdout(), "{id}").ok();
}

async fn run_encrypt(cmd: EncryptCommand) -> Result<i32, CliError> {
    let config = load_config()?;
    let provider = resolve_provider(&cmd.common, &config)?;

    let mut request = EncryptRequest::new(
        &cmd.image,
        &cmd.encryptor_image,
        cmd.common.zone.clone().unwrap_or(config.default_zone),
    );
    request.encrypted_image_name = cmd.encrypted_image_name;
    request.network_id = cmd.network.or(config.default_network);
    request.subnet_id = cmd.subnet.or(config.default_subnet);
    request.security_group_ids = cmd.security_groups;
    request.instance_type = cmd
        .instance_type
        .unwrap_or(config.default_instance_type);
    request.status_port = cmd.status_port.unwrap_or(config.status_port);
    if let Some(crypto) = &cmd.crypto {
        request.crypto_policy = crypto.parse()?;
    }
    request.identity_token = cmd.token.or(config.token);
    request.ntp_servers = cmd.ntp_servers;
    request.proxy_config = cmd
        .proxy_config_file
        .as_deref()
        .map(read_payload_file)
        .transpose()?;
    request.ca_cert = cmd.ca_cert.as_deref().map(read_payload_file).transpose()?;
    request.validate = !cmd.common.no_validate;
    request.keep_encryptor = cmd.keep_encryptor;
    request.save_encryptor_logs = !cmd.no_save_encryptor_logs;
    request.extra_tags = parse_tags(&cmd.tags)?;

    let workflow = EncryptWorkflow::new(provider, HttpStatusClient::factory());
    let image_id = workflow.run(&request).await?;
    print_result(&image_id);
    Ok(0)
}

async fn run_update(cmd: UpdateCommand) -> Result<i32, CliError> {
    let config = load_config()?;
    let provider = resolve_provider(&cmd.common, &config)?;

    let mut request = UpdateRequest::new(
        &cmd.image,
        &cmd.encryptor_image,
        cmd.common.zone.clone().unwrap_or(config.default_zone),
    );
    request.updated_image_name = cmd.updated_image_name;
    request.network_id = cmd.network.or(config.default_network);
    request.subnet_id = cmd.subnet.or(config.default_subnet);
    request.security_group_ids = cmd.security_groups;
    request.instance_type = cmd
        .instance_type
        .unwrap_or(config.default_instance_type);
    request.status_port = cmd.status_port.unwrap_or(config.status_port);
    request.identity_token = cmd.token.or(config.token);
    request.ntp_servers = cmd.ntp_servers;
    request.validate = !cmd.common.no_validate;
    request.keep_encryptor = cmd.keep_encryptor;
    request.save_encryptor_logs = !cmd.no_save_encryptor_logs;
    request.extra_tags = parse_tags(&cmd.tags)?;

    let workflow = UpdateWorkflow::new(provider, HttpStatusClient::factory());
    let image_id = workflow.run(&request).await?;
    print_result(&image_id);
    Ok(0)
}

async fn run_launch(cmd: LaunchCommand) -> Result<i32, CliError> {
    let config = load_config()?;
    let provider = resolve_provider(&cmd.common, &config)?;

    let mut request = LaunchRequest::new(
        &cmd.image,
        cmd.common.zone.clone().unwrap_or(config.default_zone),
    );
    request.instance_name = cmd.instance_name;
    request.network_id = cmd.network.or(config.default_network);
    request.subnet_id = cmd.subnet.or(config.default_subnet);
    request.security_group_ids = cmd.security_groups;
    request.instance_type = cmd
        .instance_type
        .unwrap_or(config.default_instance_type);
    request.identity_token = cmd.token.or(config.token);
    request.scratch_disks = cmd.ssd_scratch_disks;
    request.delete_boot = cmd.delete_boot;

    let workflow = LaunchWorkflow::new(provider);
    let instance_id = workflow.run(&request).await?;
    print_result(&instance_id);
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tags_splits_on_first_equals() {
        let tags = parse_tags(&[
            String::from("team=infra"),
            String::from("note=a=b"),
        ])
        .expect("tags parse");
        assert_eq!(tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(tags.get("note").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn parse_tags_rejects_missing_separator() {
        let err = parse_tags(&[String::from("oops")]).expect_err("should reject");
        assert!(matches!(err, CliError::InvalidTag(_)));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let common = CommonOptions {
            verbose: false,
            provider: String::from("gce"),
            zone: None,
            retry_timeout: None,
            no_validate: false,
        };
        let config = BrktConfig {
            default_zone: String::from("us-central1-a"),
            default_network: None,
            default_subnet: None,
            default_instance_type: String::from("n1-standard-4"),
            status_port: 80,
            retry_timeout_secs: 600,
            token: None,
        };
        let err = resolve_provider(&common, &config)
            .err()
            .expect("unknown provider");
        assert!(matches!(err, CliError::UnknownProvider(_)));
    }

    #[test]
    fn write_error_renders_display() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::InvalidTag(String::from("x")));
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.contains("invalid tag"), "rendered: {rendered}");
    }
}
