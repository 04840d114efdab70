//! Fleet Node Agent Library
//!
//! The agent runs on each managed host and keeps a mutually authenticated
//! control channel to the orchestration server. It registers, holds a
//! bidirectional stream open through network drops and server restarts,
//! routes server requests to handlers by kind name, and reports heartbeats
//! and metrics.
//!
//! ## Architecture
//!
//! ```text
//! StreamSupervisor
//! ├── Registrar          (registration handshake, retry with backoff)
//! │   └── ConnectionManager  (mTLS connection, serialized reconnects)
//! ├── receive task       (per stream: identity check, per-kind queues)
//! └── CommandBus / QueryBus  (kind name -> handler)
//! ```
//!
//! ## Modules
//!
//! - `backoff`: exponential retry delays
//! - `bus`: command and query dispatch buses
//! - `connection`: connectivity state machine over a [`transport::Transport`]
//! - `registration`: registration handshake and outcome classification
//! - `supervisor`: the control stream loop
//! - `transport`: transport seam and the tonic implementation

pub mod backoff;
pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod host;
pub mod identity;
pub mod registration;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use bus::{BusError, Command, CommandBus, CommandHandler, Query, QueryBus, QueryHandler};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectivityState};
pub use error::{AgentError, TransportError};
pub use identity::AgentId;
pub use registration::Registrar;
pub use shutdown::ShutdownSignal;
pub use supervisor::{StreamSupervisor, SupervisorSettings, SupervisorState};
pub use transport::{GrpcTransport, Transport};
