use crate::errors::{BridgeError, Result};
use crate::events::types::{BrowserEvent, EventKind, EventOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Handles one kind of inbound event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: BrowserEvent) -> Result<EventOutcome>;
}

/// Publish/subscribe registry with one handler per event kind.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<EventKind, Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any earlier registration.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.insert(kind, handler);
    }

    pub async fn is_subscribed(&self, kind: EventKind) -> bool {
        self.handlers.read().await.contains_key(&kind)
    }

    pub async fn subscribed_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.handlers.read().await.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Runs the handler for `event` and waits for its outcome.
    pub async fn dispatch(&self, event: BrowserEvent) -> Result<EventOutcome> {
        let kind = event.kind();
        let handler = self.handlers.read().await.get(&kind).cloned();
        let handler = handler.ok_or_else(|| {
            BridgeError::InvalidArgument(format!("no handler registered for {kind:?}"))
        })?;

        let start_time = std::time::Instant::now();
        let outcome = handler.handle(event).await;
        debug!(
            ?kind,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "event handled"
        );
        outcome
    }

    /// Queues `event` without waiting; failures are only logged.
    pub fn emit(&self, event: BrowserEvent) {
        let bus = self.clone();
        tokio::spawn(async move {
            let kind = event.kind();
            if let Err(err) = bus.dispatch(event).await {
                warn!(?kind, error = %err, "emitted event failed");
            }
        });
    }
}
