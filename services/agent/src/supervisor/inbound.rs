//! Receive side of a control stream.
//!
//! Runs as its own task per stream. It never writes to the stream: requests
//! go to their kind's queue and immediate answers go to the reply channel,
//! both drained by the main loop.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_proto::control::v1::{
    server_message, Ack, AgentMessage, AgentUpdateRequest, Request, ResponseCode, ServerMessage,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::BusKind;
use crate::envelope;
use crate::error::{is_fatal_code, AgentError, TransportError};
use crate::host::{AgentUpdate, UpdateHandler};
use crate::identity::AgentId;
use crate::transport::InboundStream;

/// Kind name used when answering agent-update requests.
pub const AGENT_UPDATE_KIND: &str = "AgentUpdate";

/// Why the receive task stopped.
#[derive(Debug)]
pub(super) enum ReceiveExit {
    /// The stream ended or failed. `reconnect` is set when the connection
    /// itself is suspect.
    StreamDone { reason: String, reconnect: bool },

    /// The server no longer knows this agent's session.
    Reregister(ResponseCode),

    Fatal(AgentError),
}

/// Routes inbound messages of one stream.
pub(super) struct Router {
    pub(super) agent_id: AgentId,
    pub(super) queues: HashMap<(BusKind, String), mpsc::Sender<Request>>,
    pub(super) replies: mpsc::Sender<AgentMessage>,
    pub(super) updates: Arc<dyn UpdateHandler>,
}

impl Router {
    /// Receive until the stream ends or a message requires leaving the stream.
    pub(super) async fn run(self, mut inbound: InboundStream) -> ReceiveExit {
        loop {
            let message = match inbound.next().await {
                Some(Ok(message)) => message,
                Some(Err(status)) if is_fatal_code(status.code()) => {
                    return ReceiveExit::Fatal(AgentError::Fatal(format!(
                        "server rejected stream: {}",
                        status.message()
                    )));
                }
                Some(Err(status)) => {
                    let err = TransportError::from(status);
                    return ReceiveExit::StreamDone {
                        reconnect: err.needs_reconnect(),
                        reason: err.to_string(),
                    };
                }
                None => {
                    return ReceiveExit::StreamDone {
                        reason: "stream closed by server".to_string(),
                        reconnect: false,
                    };
                }
            };

            if let Some(exit) = self.route(message).await {
                return exit;
            }
        }
    }

    async fn route(&self, message: ServerMessage) -> Option<ReceiveExit> {
        match message.payload {
            Some(server_message::Payload::Ack(ack)) => self.on_ack(ack),
            Some(server_message::Payload::Command(request)) => {
                self.on_request(BusKind::Command, request).await;
                None
            }
            Some(server_message::Payload::Query(request)) => {
                self.on_request(BusKind::Query, request).await;
                None
            }
            Some(server_message::Payload::AgentUpdate(update)) => {
                self.on_update(update).await;
                None
            }
            None => {
                debug!("Ignoring server message without a known payload");
                None
            }
        }
    }

    fn on_ack(&self, ack: Ack) -> Option<ReceiveExit> {
        let kind = ack.kind().as_str_name();
        let envelope = ack.envelope.unwrap_or_default();

        if !self.agent_id.matches(&envelope.agent_id) {
            warn!(target_agent = %envelope.agent_id, kind, "Dropping ack addressed to another agent");
            return None;
        }

        match envelope.response_code() {
            ResponseCode::Success => {
                debug!(kind, message_id = %envelope.message_id, "Ack received");
                None
            }
            code @ (ResponseCode::AgentNotFound | ResponseCode::AgentAlreadyConnected) => {
                warn!(
                    kind,
                    code = code.as_str_name(),
                    detail = %envelope.message,
                    "Server lost agent session, re-registering"
                );
                Some(ReceiveExit::Reregister(code))
            }
            code => {
                info!(
                    kind,
                    code = code.as_str_name(),
                    detail = %envelope.message,
                    "Unexpected ack code"
                );
                None
            }
        }
    }

    async fn on_request(&self, bus: BusKind, request: Request) {
        let message_id = envelope::message_id(request.base.as_ref()).to_string();
        let target = envelope::target(request.base.as_ref());

        if !self.agent_id.matches(target) {
            warn!(
                bus = bus.as_str(),
                kind = %request.kind,
                target_agent = target,
                message_id = %message_id,
                "Rejecting request addressed to another agent"
            );
            self.reply(&message_id, &request.kind, ResponseCode::Unauthorized, "agent id mismatch")
                .await;
            return;
        }

        let Some(queue) = self.queues.get(&(bus, request.kind.clone())) else {
            warn!(bus = bus.as_str(), kind = %request.kind, message_id = %message_id, "No handler for request kind");
            let reason = format!("no handler registered for kind '{}'", request.kind);
            self.reply(&message_id, &request.kind, ResponseCode::ServerError, reason)
                .await;
            return;
        };

        match queue.try_send(request) {
            Ok(()) => debug!(bus = bus.as_str(), message_id = %message_id, "Request queued"),
            Err(TrySendError::Full(request)) => {
                warn!(
                    bus = bus.as_str(),
                    kind = %request.kind,
                    message_id = %message_id,
                    "Request queue full, rejecting"
                );
                self.reply(
                    &message_id,
                    &request.kind,
                    ResponseCode::TooManyRequests,
                    "request queue full",
                )
                .await;
            }
            Err(TrySendError::Closed(request)) => {
                debug!(kind = %request.kind, message_id = %message_id, "Request queue closed, dropping");
            }
        }
    }

    async fn on_update(&self, update: AgentUpdateRequest) {
        let message_id = envelope::message_id(update.base.as_ref()).to_string();
        let target = envelope::target(update.base.as_ref());

        if !self.agent_id.matches(target) {
            warn!(target_agent = target, message_id = %message_id, "Rejecting agent update addressed to another agent");
            self.reply(&message_id, AGENT_UPDATE_KIND, ResponseCode::Unauthorized, "agent id mismatch")
                .await;
            return;
        }

        info!(version = %update.version, message_id = %message_id, "Applying agent update");
        let result = self
            .updates
            .apply(AgentUpdate {
                version: update.version,
                artifact_url: update.artifact_url,
                sha256: update.sha256,
            })
            .await;

        match result {
            Ok(()) => {
                self.reply(&message_id, AGENT_UPDATE_KIND, ResponseCode::Success, "")
                    .await
            }
            Err(e) => {
                warn!(error = %e, message_id = %message_id, "Agent update failed");
                self.reply(&message_id, AGENT_UPDATE_KIND, ResponseCode::ServerError, format!("{e:#}"))
                    .await;
            }
        }
    }

    /// Hand an immediate answer to the main loop.
    ///
    /// Waits while the reply channel is full, which stops this task from
    /// reading further messages until the main loop catches up.
    async fn reply(&self, message_id: &str, kind: &str, code: ResponseCode, message: impl Into<String>) {
        let response = envelope::response(&self.agent_id, message_id, kind, code, message, Vec::new());
        if self.replies.send(response).await.is_err() {
            debug!(kind, message_id, code = code.as_str_name(), "Stream abandoned, dropping reply");
        }
    }
}
