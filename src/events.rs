//! Observation points for external collaborators.
//!
//! The engine emits a small set of events over an mpsc channel. With no
//! subscriber attached (or a full channel), events are dropped; the engine
//! never blocks on observation.

use serde::Serialize;
use tokio::sync::mpsc;

/// Events a collaborator may subscribe to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    CycleCompleted {
        cycle: u64,
        intents: usize,
        candidates: usize,
        negotiated: usize,
        submitted: usize,
        duration_ms: u64,
        tokens_spent: u64,
    },
    #[serde(rename_all = "camelCase")]
    SettlementTransitioned {
        settlement_id: String,
        from: String,
        to: String,
    },
    #[serde(rename_all = "camelCase")]
    ReputationUpdated { weight: f64 },
}

/// Fire-and-forget event emitter.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
}

impl EventSink {
    /// A sink with a subscriber.
    pub fn subscribed(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            // Dropped on a full channel; observation must never stall a loop.
            let _ = tx.try_send(event);
        }
    }
}
