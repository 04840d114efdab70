//! Dispatch buses for server requests.
//!
//! A bus maps a request kind name to the code that executes it, so the
//! control-channel core never has to enumerate the request types the
//! orchestration backends understand.
//!
//! ## Design
//!
//! - **Explicit registry**: each handler is wrapped in a typed adapter that
//!   decodes the JSON payload for exactly one kind and executes it.
//! - **Register before traffic**: the first dispatch seals the registry;
//!   later registrations fail with [`BusError::RegistrationClosed`].
//! - **Caller-driven concurrency**: dispatch runs the handler on the calling
//!   task. The bus never spawns.
//! - **Graceful drain**: [`CommandBus::shutdown`] rejects new dispatches and
//!   [`CommandBus::wait_for_completion`] waits for the in-flight ones.
//!
//! Commands return only success or failure; queries also return a result,
//! JSON-encoded for the wire. Both share the registry and lifecycle in
//! `registry.rs`.

mod command;
mod query;
mod registry;

use thiserror::Error;

pub use command::{Command, CommandBus, CommandHandler};
pub use query::{Query, QueryBus, QueryHandler};

/// Errors returned by the dispatch buses.
#[derive(Debug, Error)]
pub enum BusError {
    /// A handler for this kind is already registered.
    #[error("handler already registered for kind '{0}'")]
    DuplicateHandler(String),

    /// The handler's declared kind cannot be registered.
    #[error("invalid handler for kind '{kind}': {reason}")]
    InvalidHandler { kind: String, reason: &'static str },

    /// Registration was attempted after dispatching started.
    #[error("registration closed, cannot register kind '{0}' after dispatch started")]
    RegistrationClosed(String),

    /// No handler is registered for this kind.
    #[error("no handler registered for kind '{0}'")]
    NoHandler(String),

    /// The bus no longer accepts dispatches.
    #[error("bus is shutting down")]
    ShuttingDown,

    /// The request payload does not decode into the kind's request type.
    #[error("failed to decode '{kind}' request: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The query result could not be encoded.
    #[error("failed to encode '{kind}' result: {source}")]
    Encode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The handler returned an error.
    #[error("handler for '{kind}' failed: {source}")]
    Handler {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// The handler panicked.
    #[error("handler for '{0}' panicked")]
    HandlerPanicked(String),
}

impl BusError {
    /// Returns true if the handler ran and reported or caused the failure.
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            BusError::Handler { .. } | BusError::HandlerPanicked(_)
        )
    }
}

/// Decode a JSON request payload. An empty payload decodes as `null`, which
/// fits unit-struct requests.
fn decode_payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    payload: &[u8],
) -> Result<T, BusError> {
    let payload: &[u8] = if payload.is_empty() { b"null" } else { payload };
    serde_json::from_slice(payload).map_err(|source| BusError::Decode {
        kind: kind.to_string(),
        source,
    })
}
