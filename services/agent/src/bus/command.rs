use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::registry::{run_guarded, HandlerBus};
use super::{decode_payload, BusError};

/// A side-effecting server request.
pub trait Command: DeserializeOwned + Send + 'static {
    /// Kind name carried on the wire.
    const KIND: &'static str;
}

/// Executes exactly one command kind.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Command: Command;

    async fn handle(&self, command: Self::Command) -> anyhow::Result<()>;
}

#[async_trait]
trait ErasedCommandHandler: Send + Sync {
    async fn call(&self, payload: &[u8]) -> Result<(), BusError>;
}

struct Adapter<H>(H);

#[async_trait]
impl<H: CommandHandler> ErasedCommandHandler for Adapter<H> {
    async fn call(&self, payload: &[u8]) -> Result<(), BusError> {
        let kind = <H::Command as Command>::KIND;
        let command = decode_payload::<H::Command>(kind, payload)?;
        self.0
            .handle(command)
            .await
            .map_err(|source| BusError::Handler {
                kind: kind.to_string(),
                source,
            })
    }
}

/// Bus for commands: handlers return only success or an error.
pub struct CommandBus {
    inner: HandlerBus<dyn ErasedCommandHandler>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            inner: HandlerBus::new("command"),
        }
    }

    /// Register a handler under its command's kind name.
    pub fn register<H: CommandHandler>(&self, handler: H) -> Result<(), BusError> {
        let handler: Arc<dyn ErasedCommandHandler> = Arc::new(Adapter(handler));
        self.inner.insert(<H::Command as Command>::KIND, handler)
    }

    /// Decode `payload` for `kind` and run its handler to completion.
    pub async fn dispatch(&self, kind: &str, payload: &[u8]) -> Result<(), BusError> {
        let (handler, _in_flight) = self.inner.begin(kind)?;

        let started = Instant::now();
        let result = run_guarded(kind, handler.call(payload)).await;
        debug!(
            bus = "command",
            kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Dispatched"
        );
        result
    }

    /// Encode and dispatch a typed command in-process.
    pub async fn send<C: Command + Serialize>(&self, command: &C) -> Result<(), BusError> {
        let payload = serde_json::to_vec(command).map_err(|source| BusError::Encode {
            kind: C::KIND.to_string(),
            source,
        })?;
        self.dispatch(C::KIND, &payload).await
    }

    /// Close registration ahead of the first dispatch.
    pub fn seal(&self) {
        self.inner.seal();
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.inner.kinds()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.inner.contains(kind)
    }

    /// Reject all further dispatches. In-flight dispatches keep running.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// Wait until no dispatch is executing. Call [`CommandBus::shutdown`]
    /// first, or new dispatches may keep arriving.
    pub async fn wait_for_completion(&self) {
        self.inner.wait_for_completion().await;
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Rename {
        from: String,
        to: String,
    }

    impl Command for Rename {
        const KIND: &'static str = "Rename";
    }

    struct RenameHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler for RenameHandler {
        type Command = Rename;

        async fn handle(&self, command: Rename) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if command.to.is_empty() {
                anyhow::bail!("target name cannot be empty");
            }
            Ok(())
        }
    }

    fn bus_with_rename() -> (CommandBus, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let bus = CommandBus::new();
        bus.register(RenameHandler {
            calls: Arc::clone(&calls),
        })
        .unwrap();
        (bus, calls)
    }

    #[tokio::test]
    async fn test_dispatch_decodes_payload() {
        let (bus, calls) = bus_with_rename();

        bus.dispatch("Rename", br#"{"from":"web","to":"web-v2"}"#)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_returned_verbatim() {
        let (bus, _) = bus_with_rename();

        let err = bus
            .send(&Rename {
                from: "web".into(),
                to: String::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_handler_failure());
        assert!(err.to_string().contains("target name cannot be empty"));
    }

    #[tokio::test]
    async fn test_bad_payload_skips_handler() {
        let (bus, calls) = bus_with_rename();

        let err = bus.dispatch("Rename", b"not json").await.unwrap_err();
        assert!(matches!(err, BusError::Decode { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let (bus, _) = bus_with_rename();
        let err = bus.dispatch("Explode", b"{}").await.unwrap_err();
        assert!(matches!(err, BusError::NoHandler(ref k) if k == "Explode"));
    }
}
