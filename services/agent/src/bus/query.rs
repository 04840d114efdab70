use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::registry::{run_guarded, HandlerBus};
use super::{decode_payload, BusError};

/// A server request that produces a result.
pub trait Query: DeserializeOwned + Send + 'static {
    /// Kind name carried on the wire.
    const KIND: &'static str;

    /// Result type, JSON-encoded into the response.
    type Output: Serialize + Send + 'static;
}

/// Executes exactly one query kind.
#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    type Query: Query;

    async fn handle(&self, query: Self::Query) -> anyhow::Result<<Self::Query as Query>::Output>;
}

#[async_trait]
trait ErasedQueryHandler: Send + Sync {
    async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, BusError>;
}

struct Adapter<H>(H);

#[async_trait]
impl<H: QueryHandler> ErasedQueryHandler for Adapter<H> {
    async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, BusError> {
        let kind = <H::Query as Query>::KIND;
        let query = decode_payload::<H::Query>(kind, payload)?;
        let output = self
            .0
            .handle(query)
            .await
            .map_err(|source| BusError::Handler {
                kind: kind.to_string(),
                source,
            })?;
        serde_json::to_vec(&output).map_err(|source| BusError::Encode {
            kind: kind.to_string(),
            source,
        })
    }
}

/// Bus for queries: handlers return a result or an error.
pub struct QueryBus {
    inner: HandlerBus<dyn ErasedQueryHandler>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self {
            inner: HandlerBus::new("query"),
        }
    }

    /// Register a handler under its query's kind name.
    pub fn register<H: QueryHandler>(&self, handler: H) -> Result<(), BusError> {
        let handler: Arc<dyn ErasedQueryHandler> = Arc::new(Adapter(handler));
        self.inner.insert(<H::Query as Query>::KIND, handler)
    }

    /// Decode `payload` for `kind`, run its handler and return the
    /// JSON-encoded result.
    pub async fn dispatch(&self, kind: &str, payload: &[u8]) -> Result<Vec<u8>, BusError> {
        let (handler, _in_flight) = self.inner.begin(kind)?;

        let started = Instant::now();
        let result = run_guarded(kind, handler.call(payload)).await;
        debug!(
            bus = "query",
            kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Dispatched"
        );
        result
    }

    /// Dispatch a typed query in-process and decode its result.
    pub async fn ask<Q>(&self, query: &Q) -> Result<Q::Output, BusError>
    where
        Q: Query + Serialize,
        Q::Output: DeserializeOwned,
    {
        let payload = serde_json::to_vec(query).map_err(|source| BusError::Encode {
            kind: Q::KIND.to_string(),
            source,
        })?;
        let result = self.dispatch(Q::KIND, &payload).await?;
        decode_payload(Q::KIND, &result)
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

    /// Wait until no dispatch is executing. Call [`QueryBus::shutdown`]
    /// first, or new dispatches may keep arriving.
    pub async fn wait_for_completion(&self) {
        self.inner.wait_for_completion().await;
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct ListApps {
        prefix: String,
    }

    impl Query for ListApps {
        const KIND: &'static str = "ListApps";
        type Output = Vec<String>;
    }

    struct ListAppsHandler {
        apps: Vec<String>,
    }

    #[async_trait]
    impl QueryHandler for ListAppsHandler {
        type Query = ListApps;

        async fn handle(&self, query: ListApps) -> anyhow::Result<Vec<String>> {
            Ok(self
                .apps
                .iter()
                .filter(|app| app.starts_with(&query.prefix))
                .cloned()
                .collect())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Env;

    impl Query for Env {
        const KIND: &'static str = "Env";
        type Output = HashMap<String, String>;
    }

    struct EnvHandler;

    #[async_trait]
    impl QueryHandler for EnvHandler {
        type Query = Env;

        async fn handle(&self, _query: Env) -> anyhow::Result<HashMap<String, String>> {
            anyhow::bail!("environment is not readable")
        }
    }

    fn bus() -> QueryBus {
        let bus = QueryBus::new();
        bus.register(ListAppsHandler {
            apps: vec!["web".into(), "worker".into(), "db".into()],
        })
        .unwrap();
        bus.register(EnvHandler).unwrap();
        bus
    }

    #[tokio::test]
    async fn test_dispatch_returns_encoded_result() {
        let bus = bus();
        let raw = bus.dispatch("ListApps", br#"{"prefix":"w"}"#).await.unwrap();
        let apps: Vec<String> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(apps, vec!["web", "worker"]);
    }

    #[tokio::test]
    async fn test_ask_typed() {
        let bus = bus();
        let apps = bus.ask(&ListApps { prefix: "d".into() }).await.unwrap();
        assert_eq!(apps, vec!["db"]);
    }

    #[tokio::test]
    async fn test_unit_query_accepts_empty_payload() {
        let bus = bus();
        let err = bus.dispatch("Env", b"").await.unwrap_err();
        assert!(matches!(err, BusError::Handler { ref kind, .. } if kind == "Env"));
    }

    #[test]
    fn test_kinds_sorted() {
        assert_eq!(bus().kinds(), vec!["Env", "ListApps"]);
    }
}
