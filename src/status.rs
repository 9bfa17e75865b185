//! Client for the encryptor instance's HTTP status endpoint.
//!
//! The agent inside the encryptor serves a small JSON document describing
//! the in-guest encryption phase. Connection failures are expected early in
//! an instance's life (still booting, network path converging) and are
//! treated as transient; only an explicit failure phase or an exhausted
//! time budget ends the poll loop.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::retry::Sleeper;

/// Default port the encryptor agent listens on.
pub const DEFAULT_STATUS_PORT: u16 = 80;
/// Port reserved by the agent for internal use; rejected at validation.
pub const RESERVED_STATUS_PORT: u16 = 81;
/// Interval between status polls.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Budget for the agent to come up before the first successful poll.
pub const ENCRYPTOR_UP_TIMEOUT: Duration = Duration::from_secs(600);

/// Phase reported by the encryption agent.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EncryptState {
    /// Agent is preparing the volumes.
    Initializing,
    /// Agent is fetching key material and artifacts.
    Downloading,
    /// Encryption is running; see `percent_complete`.
    Encrypting,
    /// Encryption finished successfully.
    Successful,
    /// Encryption failed; see `failure_code`.
    Failed,
    /// Any phase this client does not know; treated as in-progress.
    #[serde(other)]
    Unknown,
}

impl EncryptState {
    /// Whether the phase ends the poll loop.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

/// Status document served by the agent.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StatusReport {
    /// Current phase.
    pub state: EncryptState,
    /// Progress percentage, when the agent reports one.
    #[serde(default)]
    pub percent_complete: Option<u8>,
    /// Machine-readable failure reason, present in the `failed` phase.
    #[serde(default)]
    pub failure_code: Option<String>,
}

/// Error raised by a single status fetch.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("status endpoint unreachable: {message}")]
pub struct StatusFetchError {
    /// Transport or parse failure description.
    pub message: String,
}

/// Future returned by [`StatusClient::fetch_status`].
pub type StatusFuture<'a> =
    Pin<Box<dyn Future<Output = Result<StatusReport, StatusFetchError>> + Send + 'a>>;

/// One poll of an encryptor instance's status endpoint.
pub trait StatusClient: Send + Sync {
    /// Fetches the current status document.
    fn fetch_status(&self) -> StatusFuture<'_>;
}

/// Constructor for status clients, invoked once the encryptor's addresses
/// are known.
pub type StatusClientFactory = Box<dyn Fn(Vec<IpAddr>, u16) -> Box<dyn StatusClient> + Send + Sync>;

/// Status client speaking HTTP to the agent, trying each candidate address
/// in order until one answers.
pub struct HttpStatusClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpStatusClient {
    /// Creates a client polling `ips` on `port`, public addresses first.
    #[must_use]
    pub fn new(ips: &[IpAddr], port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let endpoints = ips
            .iter()
            .map(|ip| match ip {
                IpAddr::V6(v6) => format!("http://[{v6}]:{port}/"),
                IpAddr::V4(v4) => format!("http://{v4}:{port}/"),
            })
            .collect();
        Self { client, endpoints }
    }

    /// Factory wiring [`HttpStatusClient`] into a workflow.
    #[must_use]
    pub fn factory() -> StatusClientFactory {
        Box::new(|ips, port| Box::new(Self::new(&ips, port)))
    }
}

impl StatusClient for HttpStatusClient {
    fn fetch_status(&self) -> StatusFuture<'_> {
        Box::pin(async move {
            let mut last_error = String::from("no candidate addresses");
            for endpoint in &self.endpoints {
                match self.client.get(endpoint).send().await {
                    Ok(response) => match response.json::<StatusReport>().await {
                        Ok(report) => return Ok(report),
                        Err(err) => last_error = format!("{endpoint}: {err}"),
                    },
                    Err(err) => last_error = format!("{endpoint}: {err}"),
                }
            }
            Err(StatusFetchError {
                message: last_error,
            })
        })
    }
}

/// Terminal outcomes of the status poll loop.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EncryptionError {
    /// The agent reported an in-guest failure.
    #[error("encryption failed{}", failure_code.as_ref().map(|c| format!(" (code {c})")).unwrap_or_default())]
    AgentFailure {
        /// Machine-readable reason reported by the agent.
        failure_code: Option<String>,
    },
    /// The time budget elapsed without a terminal phase.
    #[error("encryption did not finish within {waited:?}")]
    Timeout {
        /// Budget that was exhausted.
        waited: Duration,
    },
}

/// Polls until the agent answers at all.
///
/// # Errors
///
/// Returns [`EncryptionError::Timeout`] when the agent never answers inside
/// the budget.
pub async fn wait_for_encryptor_up(
    client: &dyn StatusClient,
    sleeper: &dyn Sleeper,
    timeout: Duration,
) -> Result<StatusReport, EncryptionError> {
    let started = Instant::now();
    loop {
        match client.fetch_status().await {
            Ok(report) => {
                info!("encryption service is up (state {:?})", report.state);
                return Ok(report);
            }
            Err(err) => debug!("encryption service not up yet: {err}"),
        }
        if started.elapsed() >= timeout {
            return Err(EncryptionError::Timeout { waited: timeout });
        }
        sleeper.sleep(STATUS_POLL_INTERVAL).await;
    }
}

/// Polls until the agent reports success or failure.
///
/// Connection errors are transient (the agent restarts its listener while
/// pivoting volumes) and only the elapsed budget ends the loop early.
///
/// # Errors
///
/// Returns [`EncryptionError::AgentFailure`] for an explicit failure phase
/// and [`EncryptionError::Timeout`] when the budget runs out.
pub async fn wait_for_encryption(
    client: &dyn StatusClient,
    sleeper: &dyn Sleeper,
    timeout: Duration,
) -> Result<(), EncryptionError> {
    let started = Instant::now();
    let mut last_logged_percent: Option<u8> = None;
    loop {
        match client.fetch_status().await {
            Ok(report) => match report.state {
                EncryptState::Successful => return Ok(()),
                EncryptState::Failed => {
                    return Err(EncryptionError::AgentFailure {
                        failure_code: report.failure_code,
                    });
                }
                _ => {
                    if report.percent_complete != last_logged_percent {
                        if let Some(percent) = report.percent_complete {
                            info!("encryption is {percent}% complete");
                        }
                        last_logged_percent = report.percent_complete;
                    }
                }
            },
            Err(err) => debug!("status poll failed, will retry: {err}"),
        }
        if started.elapsed() >= timeout {
            return Err(EncryptionError::Timeout { waited: timeout });
        }
        sleeper.sleep(STATUS_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoopSleeper;
    use crate::test_support::ScriptedStatusClient;

    fn report(state: EncryptState, percent: Option<u8>) -> StatusReport {
        StatusReport {
            state,
            percent_complete: percent,
            failure_code: None,
        }
    }

    #[tokio::test]
    async fn encryption_completes_on_successful_state() {
        let client = ScriptedStatusClient::new(
            vec![
                Ok(report(EncryptState::Encrypting, Some(40))),
                Ok(report(EncryptState::Encrypting, Some(90))),
            ],
            Ok(report(EncryptState::Successful, Some(100))),
        );
        let result =
            wait_for_encryption(&client, &NoopSleeper, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failed_state_carries_failure_code() {
        let client = ScriptedStatusClient::new(
            vec![],
            Ok(StatusReport {
                state: EncryptState::Failed,
                percent_complete: None,
                failure_code: Some(String::from("guest_unbootable")),
            }),
        );
        let err = wait_for_encryption(&client, &NoopSleeper, Duration::from_secs(5))
            .await
            .expect_err("failure state should error");
        assert_eq!(
            err,
            EncryptionError::AgentFailure {
                failure_code: Some(String::from("guest_unbootable"))
            }
        );
    }

    #[tokio::test]
    async fn never_terminal_endpoint_times_out() {
        let client = ScriptedStatusClient::new(
            vec![],
            Ok(report(EncryptState::Encrypting, Some(50))),
        );
        let err = wait_for_encryption(&client, &NoopSleeper, Duration::from_millis(0))
            .await
            .expect_err("should time out");
        assert!(matches!(err, EncryptionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn connect_errors_are_transient_for_up_check() {
        let client = ScriptedStatusClient::new(
            vec![
                Err(StatusFetchError {
                    message: String::from("connection refused"),
                }),
                Err(StatusFetchError {
                    message: String::from("connection refused"),
                }),
            ],
            Ok(report(EncryptState::Initializing, None)),
        );
        let result =
            wait_for_encryptor_up(&client, &NoopSleeper, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[test]
    fn unknown_states_deserialize_as_unknown() {
        let report: StatusReport =
            serde_json::from_str(r#"{"state":"defragging","percent_complete":5}"#)
                .expect("parse");
        assert_eq!(report.state, EncryptState::Unknown);
        assert!(!report.state.is_terminal());
    }
}
