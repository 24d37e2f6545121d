//! Local mirror of this mediator's reputation counters.
//!
//! Counters are monotone; the weight is recomputed on every increment and
//! republished to the chain best-effort. A failed publish never blocks local
//! progression and is retried on the next update or flush. The latest
//! counters are also cached on disk so a restart with an unreachable chain
//! starts from something better than zero.

use crate::chain::ChainAdapter;
use crate::error::{MediatorError, MediatorResult};
use crate::persist::atomic_write;
use crate::types::{now_ms, MediatorReputation};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CACHE_FILE: &str = "reputation.json";

struct RepState {
    rep: MediatorReputation,
    publish_pending: bool,
}

/// Owner of the four reputation counters and the derived weight.
pub struct ReputationLedger {
    adapter: Arc<ChainAdapter>,
    cache_path: PathBuf,
    state: Mutex<RepState>,
}

impl ReputationLedger {
    pub fn new(adapter: Arc<ChainAdapter>, data_dir: &std::path::Path) -> Self {
        let rep = MediatorReputation::new(adapter.mediator_id());
        Self {
            adapter,
            cache_path: data_dir.join(CACHE_FILE),
            state: Mutex::new(RepState {
                rep,
                publish_pending: false,
            }),
        }
    }

    /// Load the chain's view of our counters, falling back to the disk cache
    /// and then to zeroed defaults.
    pub async fn load(&self) {
        let mediator_id = self.adapter.mediator_id().to_string();
        match self.adapter.get_reputation(&mediator_id).await {
            Ok(rep) => {
                info!(weight = rep.weight, "loaded reputation from chain");
                self.state.lock().rep = rep;
                return;
            }
            Err(err) => {
                warn!(error = %err, "cannot load reputation from chain, trying disk cache");
            }
        }
        match std::fs::read(&self.cache_path)
            .map_err(MediatorError::from)
            .and_then(|bytes| {
                serde_json::from_slice::<MediatorReputation>(&bytes)
                    .map_err(|e| MediatorError::Persistence(e.to_string()))
            }) {
            Ok(mut rep) => {
                rep.recompute_weight();
                info!(weight = rep.weight, "loaded reputation from disk cache");
                self.state.lock().rep = rep;
            }
            Err(err) => {
                debug!(error = %err, "no usable reputation cache, starting from defaults");
            }
        }
    }

    pub fn weight(&self) -> f64 {
        self.state.lock().rep.weight
    }

    pub fn snapshot(&self) -> MediatorReputation {
        self.state.lock().rep.clone()
    }

    /// A settlement of ours reached `closed`.
    pub async fn record_closure(&self) {
        self.apply(|rep| rep.successful_closures += 1).await;
    }

    /// A challenge we submitted was resolved as rejected.
    pub async fn record_failed_challenge(&self) {
        self.apply(|rep| rep.failed_challenges += 1).await;
    }

    /// A challenge against one of our settlements was upheld: the fee is
    /// forfeited and the upheld-against counter moves.
    pub async fn record_upheld_against(&self) {
        self.apply(|rep| {
            rep.upheld_challenges_against += 1;
            rep.forfeited_fees += 1;
        })
        .await;
    }

    /// Retry a previously failed publish; called from the monitor loop.
    pub async fn flush(&self) {
        let snapshot = {
            let state = self.state.lock();
            if !state.publish_pending {
                return;
            }
            state.rep.clone()
        };
        self.publish(snapshot).await;
    }

    async fn apply(&self, mutate: impl FnOnce(&mut MediatorReputation)) {
        let snapshot = {
            let mut state = self.state.lock();
            mutate(&mut state.rep);
            state.rep.recompute_weight();
            state.rep.last_updated = now_ms();
            state.publish_pending = true;
            state.rep.clone()
        };

        if let Err(err) = atomic_write(
            &self.cache_path,
            &serde_json::to_vec_pretty(&snapshot).unwrap_or_default(),
        ) {
            warn!(error = %err, "cannot cache reputation to disk");
        }

        self.publish(snapshot).await;
    }

    async fn publish(&self, snapshot: MediatorReputation) {
        match self.adapter.publish_reputation(&snapshot).await {
            Ok(()) => {
                self.state.lock().publish_pending = false;
                debug!(weight = snapshot.weight, "reputation published");
            }
            Err(err) => {
                warn!(error = %err, "reputation publish failed, will retry on next update");
            }
        }
    }
}
