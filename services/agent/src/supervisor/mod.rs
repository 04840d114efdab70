//! Stream supervisor - keeps the control stream alive and serves requests.
//!
//! Each iteration of the outer loop owns one stream:
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ StreamOpen ─▶ Streaming ─┬─▶ ReconnectNeeded ──┐
//!       ▲                                                ├─▶ ReregisterNeeded ─┤
//!       │                                                └─▶ Stopped           │
//!       └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The receive task fans inbound requests into per-kind bounded queues. The
//! main loop is the only writer on the stream: it drains the queues through
//! the dispatch buses and interleaves heartbeats, metrics and immediate
//! replies from the receive task.

mod inbound;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_proto::control::v1::{AgentMessage, Request, ResponseCode};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::bus::{BusError, CommandBus, QueryBus};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::envelope;
use crate::error::AgentError;
use crate::host::{HostMetrics, MetricsProvider, RejectUpdates, UpdateHandler};
use crate::registration::Registrar;
use crate::shutdown::ShutdownSignal;
use crate::transport::{StreamPair, StreamSender, Transport};

pub use inbound::AGENT_UPDATE_KIND;
use inbound::{ReceiveExit, Router};

/// Immediate replies buffered between the receive task and the main loop.
/// The receive task waits when it is full.
const REPLY_BUFFER: usize = 64;

/// Shortest ticker period accepted for heartbeats and metrics.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Supervisor lifecycle, observable through [`StreamSupervisor::subscribe_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    /// Stream opened, initial heartbeat not yet sent.
    StreamOpen,
    Streaming,
    ReconnectNeeded,
    ReregisterNeeded,
    /// Terminal.
    Stopped,
}

/// Which bus serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Command,
    Query,
}

impl BusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusKind::Command => "command",
            BusKind::Query => "query",
        }
    }
}

/// Cadences and limits of the streaming session.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub heartbeat_interval: Duration,
    pub metrics_interval: Duration,
    /// Per-kind request queue capacity.
    pub queue_capacity: usize,
    /// Delay between stream recreation attempts.
    pub backoff: BackoffPolicy,
}

impl SupervisorSettings {
    /// Clamp values the stream loop cannot run with: zero ticker periods and
    /// a zero queue capacity.
    pub fn sanitized(self) -> Self {
        Self {
            heartbeat_interval: self.heartbeat_interval.max(MIN_INTERVAL),
            metrics_interval: self.metrics_interval.max(MIN_INTERVAL),
            queue_capacity: self.queue_capacity.max(1),
            backoff: self.backoff,
        }
    }
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            metrics_interval: config.metrics_interval,
            queue_capacity: config.queue_capacity,
            backoff: config.backoff,
        }
    }
}

/// How a stream ended.
#[derive(Debug)]
enum StreamOutcome {
    /// The stream broke but the connection is presumed fine.
    Recreate(String),
    /// The connection is suspect.
    Reconnect(String),
    Reregister,
    Shutdown,
    Fatal(AgentError),
}

/// Aborts the receive task when the stream it reads is abandoned.
struct ReceiveTask(JoinHandle<ReceiveExit>);

impl Drop for ReceiveTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs the control stream until shutdown or a fatal error.
pub struct StreamSupervisor<T: Transport> {
    registrar: Arc<Registrar<T>>,
    commands: Arc<CommandBus>,
    queries: Arc<QueryBus>,
    metrics: Arc<dyn MetricsProvider>,
    updates: Arc<dyn UpdateHandler>,
    settings: SupervisorSettings,
    state: watch::Sender<SupervisorState>,
}

impl<T: Transport> StreamSupervisor<T> {
    /// Create a supervisor reporting [`HostMetrics`] and rejecting agent
    /// updates.
    pub fn new(
        registrar: Arc<Registrar<T>>,
        commands: Arc<CommandBus>,
        queries: Arc<QueryBus>,
        settings: SupervisorSettings,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            registrar,
            commands,
            queries,
            metrics: Arc::new(HostMetrics::new()),
            updates: Arc::new(RejectUpdates),
            settings: settings.sanitized(),
            state,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_update_handler(mut self, updates: Arc<dyn UpdateHandler>) -> Self {
        self.updates = updates;
        self
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn connection(&self) -> &Arc<ConnectionManager<T>> {
        self.registrar.connection()
    }

    /// Supervise the control stream.
    ///
    /// Requires a prior successful registration. Returns `Ok` on shutdown and
    /// an error for anything that must not be retried.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), AgentError> {
        // Handler tables are fixed once traffic can arrive.
        self.commands.seal();
        self.queries.seal();

        let result = self.supervise(&mut shutdown).await;
        self.set_state(SupervisorState::Stopped);
        match &result {
            Ok(()) => info!("Stream supervisor stopped"),
            Err(e) => error!(error = %e, reason = e.reason_code(), "Stream supervisor failed"),
        }
        result
    }

    async fn supervise(&self, shutdown: &mut ShutdownSignal) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.settings.backoff);

        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }
            if !self.registrar.is_registered() {
                return Err(AgentError::NotRegistered);
            }

            self.set_state(SupervisorState::Connecting);
            let conn = match self.connection().reconnect(shutdown).await {
                Ok(conn) => conn,
                Err(AgentError::Shutdown) => return Ok(()),
                Err(e) => return Err(e),
            };

            let opened = tokio::select! {
                result = self.connection().transport().open_stream(&conn.handle) => result,
                _ = shutdown.triggered() => return Ok(()),
            };
            let outcome = match opened {
                Ok(pair) => {
                    self.set_state(SupervisorState::StreamOpen);
                    self.run_stream(pair, &mut backoff, shutdown).await
                }
                Err(e) if e.is_fatal() => StreamOutcome::Fatal(AgentError::Fatal(e.to_string())),
                Err(e) if e.needs_reconnect() => StreamOutcome::Reconnect(e.to_string()),
                Err(e) => StreamOutcome::Recreate(e.to_string()),
            };

            match outcome {
                StreamOutcome::Shutdown => return Ok(()),
                StreamOutcome::Fatal(e) => return Err(e),
                StreamOutcome::Reregister => {
                    self.set_state(SupervisorState::ReregisterNeeded);
                    match self.registrar.register(shutdown).await {
                        Ok(()) => backoff.reset(),
                        Err(AgentError::Shutdown) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                StreamOutcome::Reconnect(reason) => {
                    self.set_state(SupervisorState::ReconnectNeeded);
                    // A reported failure makes the next reconnect back off.
                    if self.connection().report_failure(conn.generation, &reason) {
                        warn!(reason = %reason, "Control stream lost, reconnecting");
                    } else if !self.pause(&mut backoff, &reason, shutdown).await {
                        return Ok(());
                    }
                }
                StreamOutcome::Recreate(reason) => {
                    self.set_state(SupervisorState::ReconnectNeeded);
                    if !self.pause(&mut backoff, &reason, shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Back off before the next stream. Returns `false` on shutdown.
    async fn pause(&self, backoff: &mut Backoff, reason: &str, shutdown: &mut ShutdownSignal) -> bool {
        let delay = backoff.next();
        warn!(reason, delay_ms = delay.as_millis() as u64, "Control stream lost, recreating");
        shutdown.sleep(delay).await
    }

    /// Serve one stream until it has to be abandoned.
    async fn run_stream(
        &self,
        pair: StreamPair,
        backoff: &mut Backoff,
        shutdown: &mut ShutdownSignal,
    ) -> StreamOutcome {
        let StreamPair { sender, inbound } = pair;
        let agent_id = self.registrar.agent_id();

        let hello = envelope::heartbeat(agent_id, Some(self.registrar.capabilities().snapshot()));
        if let Err(outcome) = self.send(&sender, hello, shutdown).await {
            return outcome;
        }
        self.set_state(SupervisorState::Streaming);
        backoff.reset();
        info!(agent_id = %agent_id, "Control stream established");

        let capacity = self.settings.queue_capacity;
        let mut routes = HashMap::new();
        let mut queues = StreamMap::new();
        for (bus, kinds) in [
            (BusKind::Command, self.commands.kinds()),
            (BusKind::Query, self.queries.kinds()),
        ] {
            for kind in kinds {
                let (tx, rx) = mpsc::channel::<Request>(capacity);
                routes.insert((bus, kind.clone()), tx);
                queues.insert((bus, kind), ReceiverStream::new(rx));
            }
        }

        let (reply_tx, mut replies) = mpsc::channel(REPLY_BUFFER);
        let router = Router {
            agent_id: agent_id.clone(),
            queues: routes,
            replies: reply_tx,
            updates: Arc::clone(&self.updates),
        };
        let mut receiver = ReceiveTask(tokio::spawn(router.run(inbound)));

        let heartbeat_every = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let metrics_every = self.settings.metrics_interval;
        let mut metrics = interval_at(Instant::now() + metrics_every, metrics_every);
        metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let message = tokio::select! {
                biased;

                _ = shutdown.triggered() => {
                    debug!("Closing control stream for shutdown");
                    return StreamOutcome::Shutdown;
                }
                exit = &mut receiver.0 => return match exit {
                    Ok(ReceiveExit::StreamDone { reason, reconnect: true }) => StreamOutcome::Reconnect(reason),
                    Ok(ReceiveExit::StreamDone { reason, reconnect: false }) => StreamOutcome::Recreate(reason),
                    Ok(ReceiveExit::Reregister(code)) => {
                        info!(code = code.as_str_name(), "Closing control stream to re-register");
                        StreamOutcome::Reregister
                    }
                    Ok(ReceiveExit::Fatal(e)) => StreamOutcome::Fatal(e),
                    Err(e) => StreamOutcome::Recreate(format!("receive task failed: {e}")),
                },
                Some(reply) = replies.recv() => reply,
                Some(((bus, kind), request)) = queues.next() => self.dispatch(bus, &kind, request).await,
                _ = heartbeat.tick() => envelope::heartbeat(agent_id, None),
                _ = metrics.tick() => envelope::metrics(agent_id, self.metrics.collect()),
            };

            if let Err(outcome) = self.send(&sender, message, shutdown).await {
                return outcome;
            }
        }
    }

    /// Run a queued request through its bus and build the response.
    async fn dispatch(&self, bus: BusKind, kind: &str, request: Request) -> AgentMessage {
        let message_id = envelope::message_id(request.base.as_ref()).to_string();
        let agent_id = self.registrar.agent_id();

        let result = match bus {
            BusKind::Command => self
                .commands
                .dispatch(kind, &request.payload)
                .await
                .map(|()| Vec::new()),
            BusKind::Query => self.queries.dispatch(kind, &request.payload).await,
        };

        match result {
            Ok(result) => {
                debug!(bus = bus.as_str(), kind, message_id = %message_id, "Request handled");
                envelope::response(agent_id, &message_id, kind, ResponseCode::Success, "", result)
            }
            Err(e) => {
                warn!(bus = bus.as_str(), kind, message_id = %message_id, error = %e, "Request failed");
                let code = match e {
                    BusError::Decode { .. } => ResponseCode::BadRequest,
                    _ => ResponseCode::ServerError,
                };
                envelope::response(agent_id, &message_id, kind, code, e.to_string(), Vec::new())
            }
        }
    }

    /// Write one message; shutdown interrupts a blocked write.
    async fn send(
        &self,
        sender: &StreamSender,
        message: AgentMessage,
        shutdown: &mut ShutdownSignal,
    ) -> Result<(), StreamOutcome> {
        let result = tokio::select! {
            result = sender.send(message) => result,
            _ = shutdown.triggered() => return Err(StreamOutcome::Shutdown),
        };
        result.map_err(|e| {
            if e.is_fatal() {
                StreamOutcome::Fatal(AgentError::Fatal(e.to_string()))
            } else if e.needs_reconnect() {
                StreamOutcome::Reconnect(e.to_string())
            } else {
                StreamOutcome::Recreate(e.to_string())
            }
        })
    }

    fn set_state(&self, next: SupervisorState) {
        self.state.send_if_modified(|state| {
            if *state == next || *state == SupervisorState::Stopped {
                return false;
            }
            debug!(from = ?*state, to = ?next, "Supervisor state change");
            *state = next;
            true
        });
    }
}
