//! Registry and lifecycle shared by the command and query buses.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::BusError;

/// Longest kind name accepted for registration.
const MAX_KIND_LEN: usize = 128;

/// Name-keyed handler registry with shutdown and in-flight tracking.
///
/// `H` is the type-erased handler shape of the concrete bus.
pub(crate) struct HandlerBus<H: ?Sized> {
    /// Bus label for logs ("command" or "query").
    label: &'static str,

    handlers: RwLock<HashMap<String, Arc<H>>>,

    /// Set on first dispatch or explicit seal. Registration fails afterwards.
    sealed: AtomicBool,

    shutting_down: AtomicBool,

    /// Number of dispatches currently executing.
    in_flight: watch::Sender<usize>,
}

impl<H: ?Sized + Send + Sync> HandlerBus<H> {
    pub(crate) fn new(label: &'static str) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            label,
            handlers: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            in_flight,
        }
    }

    pub(crate) fn insert(&self, kind: &str, handler: Arc<H>) -> Result<(), BusError> {
        validate_kind(kind)?;

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if self.sealed.load(Ordering::SeqCst) {
            return Err(BusError::RegistrationClosed(kind.to_string()));
        }
        if handlers.contains_key(kind) {
            return Err(BusError::DuplicateHandler(kind.to_string()));
        }
        handlers.insert(kind.to_string(), handler);

        info!(bus = self.label, kind, "Registered handler");
        Ok(())
    }

    /// Close registration. Idempotent.
    pub(crate) fn seal(&self) {
        // Taken under the write lock so no registration can interleave.
        let _handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if !self.sealed.swap(true, Ordering::SeqCst) {
            debug!(bus = self.label, "Handler registry sealed");
        }
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Registered kind names, sorted.
    pub(crate) fn kinds(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<String> = handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub(crate) fn contains(&self, kind: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    /// Look up the handler for `kind` and count the dispatch as in flight.
    ///
    /// The returned guard must be held until the handler finishes.
    pub(crate) fn begin(&self, kind: &str) -> Result<(Arc<H>, InFlightGuard<'_>), BusError> {
        if !self.is_sealed() {
            self.seal();
        }

        // Count first, then check the flag: a waiter that saw zero after
        // shutdown() is then guaranteed to make this check fail.
        let guard = InFlightGuard::acquire(&self.in_flight);
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
            .ok_or_else(|| BusError::NoHandler(kind.to_string()))?;

        Ok((handler, guard))
    }

    pub(crate) fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!(
                bus = self.label,
                in_flight = self.in_flight(),
                "Bus shutting down"
            );
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub(crate) async fn wait_for_completion(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Decrements the in-flight counter when dropped, including on panic or
/// when the dispatching future is cancelled.
pub(crate) struct InFlightGuard<'a> {
    counter: &'a watch::Sender<usize>,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Run a handler future, turning a panic into [`BusError::HandlerPanicked`].
pub(crate) async fn run_guarded<T, F>(kind: &str, fut: F) -> Result<T, BusError>
where
    F: Future<Output = Result<T, BusError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(kind, "Handler panicked");
            Err(BusError::HandlerPanicked(kind.to_string()))
        }
    }
}

fn validate_kind(kind: &str) -> Result<(), BusError> {
    let reason = if kind.is_empty() {
        "kind name is empty"
    } else if kind.len() > MAX_KIND_LEN {
        "kind name is too long"
    } else if kind.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "kind name contains whitespace or control characters"
    } else {
        return Ok(());
    };

    Err(BusError::InvalidHandler {
        kind: kind.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type Bus = HandlerBus<str>;

    fn handler(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let bus = Bus::new("test");
        bus.insert("Deploy", handler("first")).unwrap();

        let err = bus.insert("Deploy", handler("second")).unwrap_err();
        assert!(matches!(err, BusError::DuplicateHandler(ref k) if k == "Deploy"));

        let (active, _guard) = bus.begin("Deploy").unwrap();
        assert_eq!(&*active, "first");
    }

    #[test]
    fn test_first_dispatch_seals_registry() {
        let bus = Bus::new("test");
        bus.insert("Deploy", handler("deploy")).unwrap();
        assert!(!bus.is_sealed());

        drop(bus.begin("Deploy").unwrap());
        assert!(bus.is_sealed());

        let err = bus.insert("Stop", handler("stop")).unwrap_err();
        assert!(matches!(err, BusError::RegistrationClosed(_)));
        assert!(!bus.contains("Stop"));
    }

    #[test]
    fn test_invalid_kind_names() {
        let bus = Bus::new("test");
        for kind in ["", "has space", "tab\there"] {
            let err = bus.insert(kind, handler("x")).unwrap_err();
            assert!(matches!(err, BusError::InvalidHandler { .. }), "{kind:?}");
        }
        let long = "k".repeat(MAX_KIND_LEN + 1);
        assert!(bus.insert(&long, handler("x")).is_err());
    }

    #[test]
    fn test_guard_tracks_in_flight() {
        let bus = Bus::new("test");
        bus.insert("Deploy", handler("deploy")).unwrap();

        let (_, first) = bus.begin("Deploy").unwrap();
        let (_, second) = bus.begin("Deploy").unwrap();
        assert_eq!(bus.in_flight(), 2);

        drop(first);
        assert_eq!(bus.in_flight(), 1);
        drop(second);
        assert_eq!(bus.in_flight(), 0);
    }

    #[test]
    fn test_rejected_dispatch_does_not_leak_count() {
        let bus = Bus::new("test");
        assert!(matches!(bus.begin("Missing"), Err(BusError::NoHandler(_))));
        assert_eq!(bus.in_flight(), 0);

        bus.shutdown();
        assert!(matches!(bus.begin("Missing"), Err(BusError::ShuttingDown)));
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_completion_idle() {
        let bus = Bus::new("test");
        bus.shutdown();
        bus.wait_for_completion().await;
    }

    #[tokio::test]
    async fn test_run_guarded_catches_panic() {
        async fn explode() -> Result<(), BusError> {
            panic!("handler bug")
        }

        let result = run_guarded("Boom", explode()).await;
        assert!(matches!(result, Err(BusError::HandlerPanicked(ref k)) if k == "Boom"));
    }
}
