//! Command-line interface definitions for the `brkt-imager` binary.
//!
//! This module isolates the clap parser structures so the build script can
//! reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `brkt-imager` binary.
#[derive(Debug, Parser)]
#[command(
    name = "brkt-imager",
    about = "Create and update Bracket-encrypted machine images",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create an encrypted image from an existing image.
    #[command(name = "encrypt", about = "Create an encrypted image from an existing image")]
    Encrypt(EncryptCommand),
    /// Update an encrypted image with the latest metavisor release.
    #[command(
        name = "update",
        about = "Update an encrypted image with the latest metavisor release"
    )]
    Update(UpdateCommand),
    /// Launch an encrypted image as a metavisor instance.
    #[command(name = "launch", about = "Launch an encrypted image")]
    Launch(LaunchCommand),
}

/// Options shared by every subcommand.
#[derive(Args, Clone, Debug)]
pub(crate) struct CommonOptions {
    /// Print debug log messages.
    #[arg(long)]
    pub(crate) verbose: bool,
    /// Provider adapter to use. Only `fake` resolves in-tree; real cloud
    /// adapters plug in out of tree.
    #[arg(long, value_name = "NAME", env = "BRKT_PROVIDER", default_value = "fake")]
    pub(crate) provider: String,
    /// Override the target zone for this run.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Total time budget in seconds for retrying transient provider
    /// errors.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) retry_timeout: Option<u64>,
    /// Skip validation of images, networks, and name collisions.
    #[arg(long = "no-validate")]
    pub(crate) no_validate: bool,
}

/// Arguments for the `encrypt` subcommand.
#[derive(Args, Debug)]
pub(crate) struct EncryptCommand {
    /// Guest image to encrypt.
    #[arg(long = "image", value_name = "ID")]
    pub(crate) image: String,
    /// Encryptor image to use.
    #[arg(long = "encryptor-image", value_name = "ID")]
    pub(crate) encryptor_image: String,
    /// Name for the output image; derived from the guest name when absent.
    #[arg(long = "name", value_name = "NAME")]
    pub(crate) encrypted_image_name: Option<String>,
    /// Network/VPC to launch the encryptor into.
    #[arg(long, value_name = "ID")]
    pub(crate) network: Option<String>,
    /// Subnet to launch the encryptor into.
    #[arg(long, value_name = "ID")]
    pub(crate) subnet: Option<String>,
    /// Security group to apply; may be repeated. A temporary group is
    /// created when none is given.
    #[arg(long = "security-group", value_name = "ID")]
    pub(crate) security_groups: Vec<String>,
    /// Machine type for the encryptor instance.
    #[arg(long = "instance-type", value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Port to receive HTTP status from the encryptor. Any port in
    /// 1-65535 except 81.
    #[arg(long = "status-port", value_name = "PORT")]
    pub(crate) status_port: Option<u16>,
    /// Crypto policy, `gcm` or `xts`.
    #[arg(long, value_name = "POLICY")]
    pub(crate) crypto: Option<String>,
    /// Identity token passed to the encryptor.
    #[arg(long, value_name = "TOKEN", env = "BRKT_TOKEN")]
    pub(crate) token: Option<String>,
    /// NTP server for the metavisor clock; may be repeated.
    #[arg(long = "ntp-server", value_name = "DNS_NAME")]
    pub(crate) ntp_servers: Vec<String>,
    /// proxy.yaml file defining the proxy the metavisor uses.
    #[arg(long = "proxy-config-file", value_name = "PATH")]
    pub(crate) proxy_config_file: Option<String>,
    /// CA certificate PEM baked in for on-prem management services.
    #[arg(long = "ca-cert", value_name = "CERT_FILE")]
    pub(crate) ca_cert: Option<String>,
    /// Extra tag applied to every created resource; may be repeated.
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    pub(crate) tags: Vec<String>,
    /// Keep the encryptor instance around when the run fails.
    #[arg(long = "keep-encryptor")]
    pub(crate) keep_encryptor: bool,
    /// Do not snapshot the encryptor log volume on failure.
    #[arg(long = "no-save-encryptor-logs")]
    pub(crate) no_save_encryptor_logs: bool,
    #[command(flatten)]
    pub(crate) common: CommonOptions,
}

/// Arguments for the `update` subcommand.
#[derive(Args, Debug)]
pub(crate) struct UpdateCommand {
    /// Encrypted image to update.
    #[arg(long = "image", value_name = "ID")]
    pub(crate) image: String,
    /// Encryptor image carrying the new metavisor.
    #[arg(long = "encryptor-image", value_name = "ID")]
    pub(crate) encryptor_image: String,
    /// Name for the refreshed image; rewritten from the existing name when
    /// absent.
    #[arg(long = "name", value_name = "NAME")]
    pub(crate) updated_image_name: Option<String>,
    /// Network/VPC to launch the updater into.
    #[arg(long, value_name = "ID")]
    pub(crate) network: Option<String>,
    /// Subnet to launch the updater into.
    #[arg(long, value_name = "ID")]
    pub(crate) subnet: Option<String>,
    /// Security group to apply; may be repeated.
    #[arg(long = "security-group", value_name = "ID")]
    pub(crate) security_groups: Vec<String>,
    /// Machine type for the updater instance.
    #[arg(long = "instance-type", value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Port to receive HTTP status from the updater.
    #[arg(long = "status-port", value_name = "PORT")]
    pub(crate) status_port: Option<u16>,
    /// Identity token passed to the updater.
    #[arg(long, value_name = "TOKEN", env = "BRKT_TOKEN")]
    pub(crate) token: Option<String>,
    /// NTP server for the metavisor clock; may be repeated.
    #[arg(long = "ntp-server", value_name = "DNS_NAME")]
    pub(crate) ntp_servers: Vec<String>,
    /// Extra tag applied to every created resource; may be repeated.
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    pub(crate) tags: Vec<String>,
    /// Keep the updater instance around when the run fails.
    #[arg(long = "keep-encryptor")]
    pub(crate) keep_encryptor: bool,
    /// Do not snapshot the updater log volume on failure.
    #[arg(long = "no-save-encryptor-logs")]
    pub(crate) no_save_encryptor_logs: bool,
    #[command(flatten)]
    pub(crate) common: CommonOptions,
}

/// Arguments for the `launch` subcommand.
#[derive(Args, Debug)]
pub(crate) struct LaunchCommand {
    /// Encrypted image to boot.
    #[arg(long = "image", value_name = "ID")]
    pub(crate) image: String,
    /// Name for the launched instance.
    #[arg(long = "instance-name", value_name = "NAME")]
    pub(crate) instance_name: Option<String>,
    /// Network/VPC to launch into.
    #[arg(long, value_name = "ID")]
    pub(crate) network: Option<String>,
    /// Subnet to launch into.
    #[arg(long, value_name = "ID")]
    pub(crate) subnet: Option<String>,
    /// Security group to apply; may be repeated.
    #[arg(long = "security-group", value_name = "ID")]
    pub(crate) security_groups: Vec<String>,
    /// Machine type.
    #[arg(long = "instance-type", value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Identity token passed to the metavisor.
    #[arg(long, value_name = "TOKEN", env = "BRKT_TOKEN")]
    pub(crate) token: Option<String>,
    /// Number of SSD scratch disks to attach (maximum 8).
    #[arg(long = "ssd-scratch-disks", value_name = "N", default_value_t = 0)]
    pub(crate) ssd_scratch_disks: usize,
    /// Discard the boot volume when the instance terminates.
    #[arg(long = "delete-boot")]
    pub(crate) delete_boot: bool,
    #[command(flatten)]
    pub(crate) common: CommonOptions,
}
