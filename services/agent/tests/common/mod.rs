//! In-memory control server for integration tests.
//!
//! `FakeServer` implements `Transport`. Every opened stream is handed to the
//! test as a `ServerStream`, which reads what the agent wrote and injects
//! server messages.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_agent::backoff::BackoffPolicy;
use fleet_agent::host::{CapabilityProvider, CapabilitySnapshot, MetricsProvider};
use fleet_agent::transport::{StreamPair, StreamSender};
use fleet_agent::{
    AgentError, CommandBus, ConnectionManager, QueryBus, Registrar, ShutdownSignal,
    StreamSupervisor, SupervisorSettings, SupervisorState, Transport, TransportError,
};
use fleet_proto::control::v1::{
    agent_message, server_message, Ack, AckKind, AgentMessage, BaseEnvelope, Metrics, RegisterRequest,
    RegisterResponse, Request, Response, ResponseCode, ResponseEnvelope, ServerMessage,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Status;

pub const AGENT: &str = "node-1";

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct FakeServer {
    register_script: Mutex<VecDeque<RegisterResponse>>,
    registrations: AtomicUsize,
    streams_opened: AtomicUsize,
    streams: mpsc::UnboundedSender<ServerStream>,
}

impl FakeServer {
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    /// Queue responses for upcoming registrations. Unscripted ones succeed.
    pub fn script_registrations(&self, codes: &[ResponseCode]) {
        let mut script = self.register_script.lock().unwrap();
        script.extend(codes.iter().map(|code| register_response(*code)));
    }
}

#[async_trait]
impl Transport for FakeServer {
    type Conn = ();

    async fn dial(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn register(
        &self,
        _conn: &(),
        request: RegisterRequest,
    ) -> Result<RegisterResponse, TransportError> {
        assert_eq!(request.base.as_ref().map(|b| b.agent_id.as_str()), Some(AGENT));
        self.registrations.fetch_add(1, Ordering::SeqCst);
        let scripted = self.register_script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| register_response(ResponseCode::Success)))
    }

    async fn open_stream(&self, _conn: &()) -> Result<StreamPair, TransportError> {
        let index = self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let _ = self.streams.send(ServerStream {
            index,
            outbound: out_rx,
            inbound: in_tx,
        });

        Ok(StreamPair {
            sender: StreamSender::new(out_tx),
            inbound: Box::pin(UnboundedReceiverStream::new(in_rx)),
        })
    }
}

fn register_response(code: ResponseCode) -> RegisterResponse {
    RegisterResponse {
        envelope: Some(ResponseEnvelope {
            message_id: "reg".into(),
            agent_id: AGENT.into(),
            response_code: code.into(),
            message: String::new(),
        }),
    }
}

/// Server end of one control stream.
pub struct ServerStream {
    pub index: usize,
    pub outbound: mpsc::Receiver<AgentMessage>,
    pub inbound: mpsc::UnboundedSender<Result<ServerMessage, Status>>,
}

impl ServerStream {
    /// Next message written by the agent. `None` once the agent closed its side.
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for agent message")
    }

    pub async fn next_message(&mut self) -> AgentMessage {
        self.recv().await.expect("agent closed the stream")
    }

    pub async fn next_metrics(&mut self) -> Metrics {
        loop {
            if let Some(agent_message::Payload::Metrics(metrics)) = self.next_message().await.payload {
                return metrics;
            }
        }
    }

    pub async fn next_heartbeat(&mut self) -> AgentMessage {
        loop {
            let message = self.next_message().await;
            if is_heartbeat(&message) {
                return message;
            }
        }
    }

    /// Next response, skipping heartbeats and metrics.
    pub async fn next_response(&mut self) -> Response {
        loop {
            if let Some(agent_message::Payload::Response(response)) =
                self.next_message().await.payload
            {
                return response;
            }
        }
    }

    pub fn push(&self, message: ServerMessage) {
        self.inbound.send(Ok(message)).expect("receive task gone");
    }

    pub fn fail(&self, status: Status) {
        let _ = self.inbound.send(Err(status));
    }
}

pub fn is_heartbeat(message: &AgentMessage) -> bool {
    matches!(message.payload, Some(agent_message::Payload::Heartbeat(_)))
}

pub fn request(target: &str, message_id: &str, kind: &str, payload: &[u8]) -> Request {
    Request {
        base: Some(BaseEnvelope {
            message_id: message_id.into(),
            timestamp: None,
            agent_id: target.into(),
        }),
        kind: kind.into(),
        payload: payload.to_vec(),
    }
}

pub fn command(target: &str, message_id: &str, kind: &str, payload: &[u8]) -> ServerMessage {
    ServerMessage {
        payload: Some(server_message::Payload::Command(request(
            target, message_id, kind, payload,
        ))),
    }
}

pub fn query(target: &str, message_id: &str, kind: &str, payload: &[u8]) -> ServerMessage {
    ServerMessage {
        payload: Some(server_message::Payload::Query(request(
            target, message_id, kind, payload,
        ))),
    }
}

pub fn ack(kind: AckKind, code: ResponseCode) -> ServerMessage {
    ServerMessage {
        payload: Some(server_message::Payload::Ack(Ack {
            envelope: Some(ResponseEnvelope {
                message_id: "ack".into(),
                agent_id: AGENT.into(),
                response_code: code.into(),
                message: String::new(),
            }),
            kind: kind.into(),
        })),
    }
}

pub fn heartbeat_ack(code: ResponseCode) -> ServerMessage {
    ack(AckKind::Heartbeat, code)
}

/// `(message_id, code)` of a response.
pub fn outcome(response: &Response) -> (String, ResponseCode) {
    let envelope = response.envelope.as_ref().expect("response without envelope");
    (envelope.message_id.clone(), envelope.response_code())
}

pub struct FixedCapabilities;

impl CapabilityProvider for FixedCapabilities {
    fn snapshot(&self) -> CapabilitySnapshot {
        CapabilitySnapshot {
            capabilities: HashMap::from([("os".to_string(), "linux".to_string())]),
            features: HashMap::from([("compose".to_string(), true)]),
        }
    }
}

pub struct FixedMetrics;

impl MetricsProvider for FixedMetrics {
    fn collect(&self) -> HashMap<String, f64> {
        HashMap::from([("load1".to_string(), 0.5)])
    }
}

pub fn settings(heartbeat: Duration) -> SupervisorSettings {
    SupervisorSettings {
        heartbeat_interval: heartbeat,
        metrics_interval: Duration::from_secs(3600),
        queue_capacity: 1,
        backoff: BackoffPolicy {
            min: Duration::from_millis(10),
            max: Duration::from_millis(40),
        },
    }
}

/// Agent core wired to a `FakeServer`.
pub struct Harness {
    pub server: Arc<FakeServer>,
    pub streams: mpsc::UnboundedReceiver<ServerStream>,
    pub commands: Arc<CommandBus>,
    pub queries: Arc<QueryBus>,
    pub registrar: Arc<Registrar<FakeServer>>,
    pub state: Option<watch::Receiver<SupervisorState>>,
    settings: SupervisorSettings,
    shutdown_tx: watch::Sender<bool>,
    shutdown: ShutdownSignal,
    supervisor: Option<JoinHandle<Result<(), AgentError>>>,
}

impl Harness {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (streams_tx, streams) = mpsc::unbounded_channel();
        let server = Arc::new(FakeServer {
            register_script: Mutex::new(VecDeque::new()),
            registrations: AtomicUsize::new(0),
            streams_opened: AtomicUsize::new(0),
            streams: streams_tx,
        });
        let connection = Arc::new(ConnectionManager::new(Arc::clone(&server), settings.backoff));
        let registrar = Arc::new(Registrar::new(
            connection,
            AGENT.parse().unwrap(),
            Arc::new(FixedCapabilities),
            settings.backoff,
        ));
        let (shutdown_tx, shutdown) = ShutdownSignal::channel();

        Self {
            server,
            streams,
            commands: Arc::new(CommandBus::new()),
            queries: Arc::new(QueryBus::new()),
            registrar,
            state: None,
            settings,
            shutdown_tx,
            shutdown,
            supervisor: None,
        }
    }

    /// Register, then run the supervisor in the background.
    pub async fn start(&mut self) {
        let mut shutdown = self.shutdown.clone();
        self.registrar.register(&mut shutdown).await.unwrap();

        let supervisor = StreamSupervisor::new(
            Arc::clone(&self.registrar),
            Arc::clone(&self.commands),
            Arc::clone(&self.queries),
            self.settings,
        )
        .with_metrics(Arc::new(FixedMetrics));
        self.state = Some(supervisor.subscribe_state());

        let shutdown = self.shutdown.clone();
        self.supervisor = Some(tokio::spawn(async move { supervisor.run(shutdown).await }));
    }

    pub async fn next_stream(&mut self) -> ServerStream {
        tokio::time::timeout(WAIT, self.streams.recv())
            .await
            .expect("timed out waiting for a stream")
            .expect("server dropped")
    }

    /// Trigger shutdown and return what the supervisor returned.
    pub async fn stop(mut self) -> Result<(), AgentError> {
        self.shutdown_tx.send(true).unwrap();
        let handle = self.supervisor.take().expect("not started");
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("supervisor did not stop")
            .expect("supervisor panicked")
    }
}
