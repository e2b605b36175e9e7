use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::{FederatedCommand, ResponseEnvelope};

use crate::config::FederatedConfig;
use crate::error::FederatedError;

pub type FederatedResult = std::result::Result<ResponseEnvelope, FederatedError>;

/// One delivery attempt of a command to a party.
///
/// Implementations return the decoded envelope for any 2xx answer, whatever
/// its code; interpreting the code is left to [`FederatedScheduler`].
#[async_trait]
pub trait FederatedTransport: Send + Sync {
    async fn send(&self, dest_party_id: &str, command: &FederatedCommand) -> FederatedResult;
}

/// Receiver side of a federated command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: FederatedCommand) -> ResponseEnvelope;
}

/// Retrying, timeout-bounded client over a [`FederatedTransport`].
pub struct FederatedScheduler {
    transport: Arc<dyn FederatedTransport>,
    config: FederatedConfig,
}

impl FederatedScheduler {
    pub fn new(transport: Arc<dyn FederatedTransport>, config: FederatedConfig) -> Self {
        Self { transport, config }
    }

    /// Deliver `command` to one party, retrying network failures.
    pub async fn send(&self, party_id: &str, command: &FederatedCommand) -> FederatedResult {
        let endpoint = command.endpoint();
        let try_times = self.config.try_times.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.attempt(party_id, command).await {
                Ok(envelope) if envelope.is_success() => {
                    debug!(party_id, endpoint, attempt, "Federated command delivered");
                    return Ok(envelope);
                }
                Ok(envelope) => FederatedError::Application {
                    party_id: party_id.to_string(),
                    endpoint: endpoint.to_string(),
                    code: envelope.code,
                    message: envelope.message,
                },
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(party_id, endpoint, error = %error, "Federated command rejected");
                return Err(error);
            }

            if attempt >= try_times {
                warn!(party_id, endpoint, attempts = attempt, error = %error, "Federated command failed");
                return Err(FederatedError::RetriesExhausted {
                    party_id: party_id.to_string(),
                    endpoint: endpoint.to_string(),
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            debug!(party_id, endpoint, attempt, error = %error, "Retrying federated command");
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    async fn attempt(&self, party_id: &str, command: &FederatedCommand) -> FederatedResult {
        match tokio::time::timeout(self.config.timeout, self.transport.send(party_id, command)).await {
            Ok(result) => result,
            Err(_) => Err(FederatedError::Timeout {
                party_id: party_id.to_string(),
                endpoint: command.endpoint().to_string(),
                timeout_ms: duration_ms(self.config.timeout),
            }),
        }
    }

    /// Send the same command to every party concurrently.
    pub async fn broadcast(
        &self,
        party_ids: &[String],
        command: &FederatedCommand,
    ) -> BTreeMap<String, FederatedResult> {
        let sends = party_ids.iter().map(|party_id| async move {
            (party_id.clone(), self.send(party_id, command).await)
        });
        join_all(sends).await.into_iter().collect()
    }

    /// Send a distinct command to each party concurrently, keeping input order.
    pub async fn send_all(
        &self,
        commands: Vec<(String, FederatedCommand)>,
    ) -> Vec<(String, FederatedCommand, FederatedResult)> {
        let sends = commands.into_iter().map(|(party_id, command)| async move {
            let result = self.send(&party_id, &command).await;
            (party_id, command, result)
        });
        join_all(sends).await
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Routes commands for the local party to its own handler and everything
/// else to the remote transport.
pub struct LoopbackTransport {
    local_party_id: String,
    local: Arc<dyn CommandHandler>,
    remote: Arc<dyn FederatedTransport>,
}

impl LoopbackTransport {
    pub fn new(
        local_party_id: impl Into<String>,
        local: Arc<dyn CommandHandler>,
        remote: Arc<dyn FederatedTransport>,
    ) -> Self {
        Self {
            local_party_id: local_party_id.into(),
            local,
            remote,
        }
    }
}

#[async_trait]
impl FederatedTransport for LoopbackTransport {
    async fn send(&self, dest_party_id: &str, command: &FederatedCommand) -> FederatedResult {
        if dest_party_id == self.local_party_id {
            Ok(self.local.handle(command.clone()).await)
        } else {
            self.remote.send(dest_party_id, command).await
        }
    }
}

/// Transport for processes that talk to nobody but themselves.
pub struct NoRemoteTransport;

#[async_trait]
impl FederatedTransport for NoRemoteTransport {
    async fn send(&self, dest_party_id: &str, _command: &FederatedCommand) -> FederatedResult {
        Err(FederatedError::NoRoute(dest_party_id.to_string()))
    }
}
