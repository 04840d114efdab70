//! Registration handshake with the control server.
//!
//! Every attempt ends in one of three outcomes: success marks the agent
//! registered, a fatal rejection is returned to the caller, and anything else
//! is retried with backoff until one of the first two happens or shutdown is
//! signaled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_proto::control::v1::{RegisterRequest, RegisterResponse, ResponseCode};
use tracing::{error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::connection::ConnectionManager;
use crate::envelope;
use crate::error::{AgentError, TransportError};
use crate::host::CapabilityProvider;
use crate::identity::AgentId;
use crate::shutdown::ShutdownSignal;
use crate::transport::Transport;

/// Result of a single registration attempt.
#[derive(Debug)]
pub enum RegistrationOutcome {
    Success,
    /// Must not be retried.
    Fatal(AgentError),
    /// Worth another attempt. `reconnect` is set when the connection itself is
    /// suspect.
    Retryable { reason: String, reconnect: bool },
}

/// Classify the transport result and the application response code of one
/// attempt.
pub fn classify(result: Result<RegisterResponse, TransportError>) -> RegistrationOutcome {
    let response = match result {
        Ok(response) => response,
        Err(TransportError::Config(msg)) => return RegistrationOutcome::Fatal(AgentError::Config(msg)),
        Err(TransportError::Rpc(status)) if crate::error::is_fatal_code(status.code()) => {
            return RegistrationOutcome::Fatal(AgentError::Registration {
                code: ResponseCode::Unauthorized,
                message: status.message().to_string(),
            });
        }
        Err(e) => {
            return RegistrationOutcome::Retryable {
                reconnect: e.needs_reconnect(),
                reason: e.to_string(),
            };
        }
    };

    let envelope = response.envelope.unwrap_or_default();
    match envelope.response_code() {
        ResponseCode::Success => RegistrationOutcome::Success,
        code @ (ResponseCode::AgentAlreadyConnected | ResponseCode::Unauthorized) => {
            RegistrationOutcome::Fatal(AgentError::Registration {
                code,
                message: envelope.message,
            })
        }
        code => RegistrationOutcome::Retryable {
            reason: format!("{}: {}", code.as_str_name(), envelope.message),
            reconnect: false,
        },
    }
}

/// Runs the registration handshake and tracks whether the agent is registered.
pub struct Registrar<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    agent_id: AgentId,
    capabilities: Arc<dyn CapabilityProvider>,
    backoff: BackoffPolicy,
    registered: AtomicBool,
}

impl<T: Transport> Registrar<T> {
    pub fn new(
        connection: Arc<ConnectionManager<T>>,
        agent_id: AgentId,
        capabilities: Arc<dyn CapabilityProvider>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            connection,
            agent_id,
            capabilities,
            backoff,
            registered: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn capabilities(&self) -> &Arc<dyn CapabilityProvider> {
        &self.capabilities
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }

    /// Whether the last completed handshake succeeded.
    ///
    /// Stays set while a re-registration is in progress and is only cleared
    /// by a fatal outcome.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Register, retrying until success, a fatal rejection, or shutdown.
    pub async fn register(&self, shutdown: &mut ShutdownSignal) -> Result<(), AgentError> {
        let result = self.register_until_settled(shutdown).await;
        match &result {
            Ok(()) => self.registered.store(true, Ordering::SeqCst),
            Err(AgentError::Shutdown) => {}
            Err(e) => {
                error!(agent_id = %self.agent_id, error = %e, reason = e.reason_code(), "Registration failed permanently");
                self.registered.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    async fn register_until_settled(&self, shutdown: &mut ShutdownSignal) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.backoff);
        let mut attempt = 0u32;

        loop {
            if shutdown.is_triggered() {
                return Err(AgentError::Shutdown);
            }

            let conn = self.connection.reconnect(shutdown).await?;
            attempt += 1;

            let request = self.request();
            let result = tokio::select! {
                result = self.connection.transport().register(&conn.handle, request) => result,
                _ = shutdown.triggered() => return Err(AgentError::Shutdown),
            };

            match classify(result) {
                RegistrationOutcome::Success => {
                    info!(agent_id = %self.agent_id, attempt, "Agent registered");
                    return Ok(());
                }
                RegistrationOutcome::Fatal(e) => return Err(e),
                RegistrationOutcome::Retryable { reason, reconnect } => {
                    if reconnect {
                        self.connection.report_failure(conn.generation, &reason);
                    }
                    let delay = backoff.next();
                    warn!(
                        agent_id = %self.agent_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Registration failed, retrying"
                    );
                    if !shutdown.sleep(delay).await {
                        return Err(AgentError::Shutdown);
                    }
                }
            }
        }
    }

    fn request(&self) -> RegisterRequest {
        let snapshot = self.capabilities.snapshot();
        RegisterRequest {
            base: Some(envelope::base(&self.agent_id)),
            capabilities: snapshot.capabilities,
            features: snapshot.features,
        }
    }
}
