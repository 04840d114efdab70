//! Connection manager - owns the transport connection to the control server.
//!
//! Tracks a connectivity state machine:
//!
//! ```text
//! Idle ──connect──▶ Connecting ──ok──▶ Ready ──failure report──▶ TransientFailure
//!                        │                                            │
//!                        └──────────────err──────────────────────────▶│
//!                                                                     │
//!              ◀──────────────── backoff sleep, connect ──────────────┘
//! any state ──shutdown──▶ Shutdown
//! ```
//!
//! Reconnects are serialized: callers arriving while one is in progress wait
//! for it and reuse its result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::{AgentError, TransportError};
use crate::shutdown::ShutdownSignal;
use crate::transport::Transport;

/// Connectivity of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No connection attempt has been made.
    Idle,
    /// A dial is in progress.
    Connecting,
    /// Connected and usable.
    Ready,
    /// The last dial failed or the connection was reported broken.
    TransientFailure,
    /// Shut down. Terminal.
    Shutdown,
}

/// A ready connection handle tagged with its generation.
///
/// The generation increases with every successful dial, so a failure report
/// about an older connection cannot tear down a newer one.
#[derive(Debug, Clone)]
pub struct Connection<C> {
    pub handle: C,
    pub generation: u64,
}

/// Owns the connection to the control server.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    state: watch::Sender<ConnectivityState>,
    current: Mutex<Option<Connection<T::Conn>>>,
    generation: AtomicU64,
    backoff: Mutex<Backoff>,
    reconnect_lock: tokio::sync::Mutex<()>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, backoff: BackoffPolicy) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        Self {
            transport,
            state,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            backoff: Mutex::new(Backoff::new(backoff)),
            reconnect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current connectivity state.
    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// The ready connection, if any.
    pub fn current(&self) -> Option<Connection<T::Conn>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Dial once.
    ///
    /// Only starts a dial from `Idle` or `TransientFailure`; otherwise returns
    /// immediately. A failed dial moves to `TransientFailure` and still
    /// returns `Ok`, except for configuration and credential errors which are
    /// returned and must not be retried.
    pub async fn connect(&self) -> Result<(), AgentError> {
        let started = self.state.send_if_modified(|state| match state {
            ConnectivityState::Idle | ConnectivityState::TransientFailure => {
                *state = ConnectivityState::Connecting;
                true
            }
            _ => false,
        });
        if !started {
            return Ok(());
        }

        match self.transport.dial().await {
            Ok(handle) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Connection { handle, generation });
                self.transition(ConnectivityState::Ready);
                info!(generation, "Connection ready");
                Ok(())
            }
            Err(TransportError::Config(msg)) => {
                error!(error = %msg, "Connection configuration is unusable");
                self.transition(ConnectivityState::TransientFailure);
                Err(AgentError::Config(msg))
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Server rejected agent credentials");
                self.transition(ConnectivityState::TransientFailure);
                Err(AgentError::Fatal(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                self.transition(ConnectivityState::TransientFailure);
                Ok(())
            }
        }
    }

    /// Wait until the state differs from `from`.
    ///
    /// Returns `false` if shutdown was signaled first.
    pub async fn wait_for_state_change(
        &self,
        from: ConnectivityState,
        shutdown: &mut ShutdownSignal,
    ) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            changed = rx.wait_for(|state| *state != from) => changed.is_ok(),
            _ = shutdown.triggered() => false,
        }
    }

    /// Drive the state machine until the connection is ready.
    ///
    /// Never gives up on transient failures. Fails on shutdown and on
    /// configuration or credential errors.
    pub async fn wait_for_connection_ready(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Connection<T::Conn>, AgentError> {
        loop {
            if shutdown.is_triggered() {
                self.shutdown();
                return Err(AgentError::Shutdown);
            }

            match self.state() {
                ConnectivityState::Ready => match self.current() {
                    Some(conn) => {
                        self.backoff
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .reset();
                        return Ok(conn);
                    }
                    None => self.transition(ConnectivityState::TransientFailure),
                },
                ConnectivityState::Shutdown => return Err(AgentError::Shutdown),
                ConnectivityState::TransientFailure => {
                    let delay = self
                        .backoff
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .next();
                    info!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                    if !shutdown.sleep(delay).await {
                        continue;
                    }
                    self.connect_unless_shutdown(shutdown).await?;
                }
                ConnectivityState::Idle => self.connect_unless_shutdown(shutdown).await?,
                ConnectivityState::Connecting => {
                    if !self
                        .wait_for_state_change(ConnectivityState::Connecting, shutdown)
                        .await
                    {
                        continue;
                    }
                }
            }
        }
    }

    /// Ensure a ready connection, serialized with other reconnect callers.
    ///
    /// If the connection is already ready when the lock is acquired, it is
    /// returned as is.
    pub async fn reconnect(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Connection<T::Conn>, AgentError> {
        let _guard = tokio::select! {
            guard = self.reconnect_lock.lock() => guard,
            _ = shutdown.triggered() => return Err(AgentError::Shutdown),
        };

        if self.state() == ConnectivityState::Ready {
            if let Some(conn) = self.current() {
                debug!(generation = conn.generation, "Connection already ready");
                return Ok(conn);
            }
        }

        self.wait_for_connection_ready(shutdown).await
    }

    /// Mark the connection of `generation` as broken.
    ///
    /// Ignored if a newer connection has replaced it. Returns whether the
    /// report took effect.
    pub fn report_failure(&self, generation: u64, reason: &str) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if !current
            .as_ref()
            .is_some_and(|conn| conn.generation == generation)
        {
            debug!(generation, reason, "Ignoring failure report for stale connection");
            return false;
        }

        warn!(generation, reason, "Connection reported broken");
        *current = None;
        drop(current);
        self.transition(ConnectivityState::TransientFailure);
        true
    }

    /// Tear down the connection and refuse further connects.
    pub fn shutdown(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.state.send_replace(ConnectivityState::Shutdown) != ConnectivityState::Shutdown {
            info!("Connection manager shut down");
        }
    }

    async fn connect_unless_shutdown(&self, shutdown: &mut ShutdownSignal) -> Result<(), AgentError> {
        tokio::select! {
            result = self.connect() => result,
            _ = shutdown.triggered() => {
                self.shutdown();
                Err(AgentError::Shutdown)
            }
        }
    }

    /// Move to `next` unless already shut down.
    fn transition(&self, next: ConnectivityState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectivityState::Shutdown || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}
