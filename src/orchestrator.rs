//! Engine composition and the three periodic loops.
//!
//! Ingest refreshes the intent cache; the cycle runs map → negotiate →
//! submit; the settlement monitor polls acceptance, claims fees and scans
//! foreign settlements for challenges. All three share one shutdown signal
//! and every failure is caught at the loop boundary: one bad cycle never
//! stops the next.

use crate::cache::IntentCache;
use crate::chain::ChainAdapter;
use crate::challenge::ChallengeDetector;
use crate::config::MediatorConfig;
use crate::error::MediatorResult;
use crate::events::{EngineEvent, EventSink};
use crate::index::VectorIndex;
use crate::llm::{ChatClient, Embedder, NegotiationOutcome, Negotiator};
use crate::reputation::ReputationLedger;
use crate::settlement::{SettlementTracker, SettlementTransition};
use crate::signing::MediatorIdentity;
use crate::types::{
    now_ms, AlignmentCandidate, Intent, ProposedSettlement, SettlementStatus,
};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How far back the challenge scanner looks on each monitor tick.
const CHALLENGE_SCAN_WINDOW_MS: i64 = 24 * 3_600_000;
/// Upper bound on pending intents fetched per ingest.
const INGEST_FETCH_LIMIT: usize = 1_000;

/// Point-in-time view of engine liveness, consumed by an external health
/// surface.
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub last_ingest_ms: Option<i64>,
    pub last_cycle_ms: Option<i64>,
    pub intents_cached: usize,
    pub settlements_open: usize,
    pub challenges_pending: usize,
    pub circuit_state: String,
    pub reputation_weight: f64,
}

/// The mediation engine: owns every component and the loop lifecycles.
pub struct MediationEngine {
    config: MediatorConfig,
    adapter: Arc<ChainAdapter>,
    cache: Arc<IntentCache>,
    index: Mutex<VectorIndex>,
    embedder: Arc<Embedder>,
    negotiator: Arc<Negotiator>,
    tracker: Arc<SettlementTracker>,
    detector: Arc<ChallengeDetector>,
    reputation: Arc<ReputationLedger>,
    events: EventSink,
    shutdown_tx: watch::Sender<bool>,
    cycle_counter: AtomicU64,
    ingest_in_flight: AtomicBool,
    last_ingest_ms: AtomicI64,
    last_cycle_ms: AtomicI64,
}

impl MediationEngine {
    /// Build the engine. Key material and index initialisation failures are
    /// fatal; everything downstream is survivable at runtime.
    pub fn new(config: MediatorConfig, events: EventSink) -> MediatorResult<Arc<Self>> {
        config.validate()?;

        let identity = Arc::new(MediatorIdentity::from_config(&config.identity)?);
        let adapter = Arc::new(ChainAdapter::new(&config.chain, identity)?);

        let index = VectorIndex::initialize(
            &config.storage.data_dir,
            config.storage.max_index_elements,
            config.embedding.dimension,
            config.mediation.min_similarity,
        )?;
        let embedder = Arc::new(Embedder::new(&config.embedding)?);

        let chat = ChatClient::new(&config.llm)?;
        let negotiator = Arc::new(Negotiator::new(chat, config.mediation.min_confidence));

        let tracker = Arc::new(SettlementTracker::new());
        let reputation = Arc::new(ReputationLedger::new(
            adapter.clone(),
            &config.storage.data_dir,
        ));
        let detector = Arc::new(ChallengeDetector::new(
            adapter.clone(),
            negotiator.clone(),
            reputation.clone(),
            config.mediation.challenges_enabled,
            config.mediation.min_challenge_confidence,
            config.mediation.challenge_scan_limit,
        ));

        let (shutdown_tx, _) = watch::channel(false);
        let cache = Arc::new(IntentCache::new(config.storage.max_cached_intents));

        Ok(Arc::new(Self {
            config,
            adapter,
            cache,
            index: Mutex::new(index),
            embedder,
            negotiator,
            tracker,
            detector,
            reputation,
            events,
            shutdown_tx,
            cycle_counter: AtomicU64::new(0),
            ingest_in_flight: AtomicBool::new(false),
            last_ingest_ms: AtomicI64::new(0),
            last_cycle_ms: AtomicI64::new(0),
        }))
    }

    /// Run the three loops until `shutdown` is called, then drain within the
    /// configured deadline and persist the index.
    pub async fn run(self: Arc<Self>) -> MediatorResult<()> {
        info!(
            mediator_id = self.adapter.mediator_id(),
            chain = %self.config.chain.endpoint,
            "mediation engine starting"
        );
        self.reputation.load().await;

        let ingest = tokio::spawn(Self::run_loop(
            self.clone(),
            self.config.mediation.ingest_period_ms,
            LoopKind::Ingest,
        ));
        let cycle = tokio::spawn(Self::run_loop(
            self.clone(),
            self.config.mediation.cycle_period_ms,
            LoopKind::Cycle,
        ));
        let monitor = tokio::spawn(Self::run_loop(
            self.clone(),
            self.config.mediation.monitor_period_ms,
            LoopKind::Monitor,
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.changed().await;
        info!("shutdown requested, draining loops");

        let deadline = Duration::from_millis(self.config.mediation.shutdown_deadline_ms);
        let drained = tokio::time::timeout(
            deadline,
            futures::future::join_all([ingest, cycle, monitor]),
        )
        .await;
        if drained.is_err() {
            warn!(
                deadline_ms = self.config.mediation.shutdown_deadline_ms,
                "shutdown deadline exceeded, abandoning in-flight work"
            );
        }

        self.persist_index();
        info!("mediation engine stopped");
        Ok(())
    }

    /// Flip the shared cancellation signal.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn health(&self) -> EngineHealth {
        let last_ingest = self.last_ingest_ms.load(Ordering::Relaxed);
        let last_cycle = self.last_cycle_ms.load(Ordering::Relaxed);
        EngineHealth {
            last_ingest_ms: (last_ingest > 0).then_some(last_ingest),
            last_cycle_ms: (last_cycle > 0).then_some(last_cycle),
            intents_cached: self.cache.len(),
            settlements_open: self.tracker.open_count(),
            challenges_pending: self.detector.pending_count(),
            circuit_state: self.adapter.circuit_state().as_str().to_string(),
            reputation_weight: self.reputation.weight(),
        }
    }

    pub fn tracker(&self) -> &SettlementTracker {
        &self.tracker
    }

    pub fn adapter(&self) -> &ChainAdapter {
        &self.adapter
    }

    pub fn reputation(&self) -> &ReputationLedger {
        &self.reputation
    }

    async fn run_loop(engine: Arc<Self>, period_ms: u64, kind: LoopKind) {
        let mut shutdown_rx = engine.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let result = match kind {
                        LoopKind::Ingest => engine.run_ingest_once().await,
                        LoopKind::Cycle => engine.run_cycle_once().await,
                        LoopKind::Monitor => engine.run_monitor_once().await,
                    };
                    if let Err(err) = result {
                        error!(loop_kind = kind.as_str(), error = %err, "loop iteration failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!(loop_kind = kind.as_str(), "loop stopping");
                    break;
                }
            }
        }
    }

    /// One ingest pass: fetch the pending set and reconcile the cache. A
    /// fetch failure leaves the cache untouched.
    pub async fn run_ingest_once(&self) -> MediatorResult<()> {
        if self
            .ingest_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("previous ingest still in flight, skipping tick");
            return Ok(());
        }
        let result = self.ingest_inner().await;
        self.ingest_in_flight.store(false, Ordering::Release);
        result
    }

    async fn ingest_inner(&self) -> MediatorResult<()> {
        let pending = self.adapter.list_pending_intents(INGEST_FETCH_LIMIT).await?;
        let fetched = pending.len();
        let outcome = self.cache.reconcile(pending);

        if !outcome.removed.is_empty() {
            let mut index = self.index.lock();
            for fingerprint in &outcome.removed {
                index.remove(fingerprint);
                self.embedder.remove(fingerprint);
            }
        }

        self.last_ingest_ms.store(now_ms(), Ordering::Relaxed);
        counter!("mediator_ingest_total").increment(1);
        debug!(
            fetched,
            inserted = outcome.inserted.len(),
            removed = outcome.removed.len(),
            cached = self.cache.len(),
            "ingest complete"
        );
        Ok(())
    }

    /// One alignment cycle: embed, index, pick candidates, negotiate and
    /// submit, under the cycle's LLM and wall-clock budgets.
    pub async fn run_cycle_once(&self) -> MediatorResult<()> {
        let cycle = self.cycle_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let wall_deadline =
            started + Duration::from_millis(self.config.mediation.cycle_budget_ms);
        let mut llm_calls = 0usize;
        let mut tokens_spent = 0u64;
        let mut negotiated = 0usize;
        let mut submitted = 0usize;

        // Map: embed what is missing, upsert, then ask for candidates.
        let snapshot = self.cache.snapshot();
        let items = self.embed_snapshot(&snapshot).await;
        let mut candidates = {
            let index = self.index.lock();
            index.top_alignment_candidates(&items, self.config.mediation.top_k)
        };

        candidates.retain(|c| !self.tracker.has_open_pair(&c.a.fingerprint, &c.b.fingerprint));
        let shortlist: Vec<AlignmentCandidate> = candidates
            .into_iter()
            .take(self.config.mediation.max_per_cycle)
            .collect();

        for candidate in &shortlist {
            if llm_calls >= self.config.mediation.max_llm_calls_per_cycle {
                debug!("cycle llm budget exhausted, deferring remaining candidates");
                break;
            }
            if Instant::now() >= wall_deadline {
                debug!("cycle wall-clock budget exhausted, deferring remaining candidates");
                break;
            }

            llm_calls += 1;
            match self.negotiator.negotiate(&candidate.a, &candidate.b).await {
                Ok(NegotiationOutcome::Proposed(proposal)) => {
                    negotiated += 1;
                    tokens_spent += proposal.usage.total_tokens();
                    if self.submit_proposal(candidate, proposal.reasoning, proposal.terms).await {
                        submitted += 1;
                    }
                }
                Ok(NegotiationOutcome::Refused { reason, usage }) => {
                    tokens_spent += usage.total_tokens();
                    debug!(
                        a = %candidate.a.fingerprint,
                        b = %candidate.b.fingerprint,
                        reason = %reason,
                        "negotiation refused"
                    );
                }
                Err(err) => {
                    warn!(
                        a = %candidate.a.fingerprint,
                        b = %candidate.b.fingerprint,
                        error = %err,
                        "negotiation failed, candidate deferred"
                    );
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.last_cycle_ms.store(now_ms(), Ordering::Relaxed);
        counter!("mediator_cycles_total").increment(1);
        counter!("mediator_settlements_submitted_total").increment(submitted as u64);
        counter!("mediator_llm_tokens_total").increment(tokens_spent);
        histogram!("mediator_cycle_duration_ms").record(duration_ms as f64);
        self.events.emit(EngineEvent::CycleCompleted {
            cycle,
            intents: snapshot.len(),
            candidates: shortlist.len(),
            negotiated,
            submitted,
            duration_ms,
            tokens_spent,
        });
        info!(
            cycle,
            intents = snapshot.len(),
            candidates = shortlist.len(),
            negotiated,
            submitted,
            duration_ms,
            "cycle complete"
        );
        Ok(())
    }

    /// Embed every snapshot intent that lacks a vector and make sure it is
    /// in the index before it can appear as a candidate. Per-intent
    /// failures skip that intent; it retries next cycle.
    async fn embed_snapshot(
        &self,
        snapshot: &[Arc<Intent>],
    ) -> Vec<(Arc<Intent>, Arc<Vec<f32>>)> {
        let mut items = Vec::with_capacity(snapshot.len());
        for intent in snapshot {
            let vector = match self.embedder.embed(intent).await {
                Ok(vector) => vector,
                Err(err) => {
                    warn!(
                        fingerprint = %intent.fingerprint,
                        error = %err,
                        "embedding failed, intent skipped this cycle"
                    );
                    continue;
                }
            };

            let needs_upsert = {
                let index = self.index.lock();
                !index.contains(&intent.fingerprint)
            };
            if needs_upsert {
                let mut index = self.index.lock();
                if let Err(err) = index.upsert(intent, &vector) {
                    error!(
                        fingerprint = %intent.fingerprint,
                        error = %err,
                        "index upsert failed"
                    );
                    continue;
                }
            }
            items.push((intent.clone(), vector));
        }
        items
    }

    /// Register then submit a settlement; registration first so a duplicate
    /// is suppressed even if the process dies mid-submit. A refused
    /// submission marks the local entry rejected and is not retried.
    async fn submit_proposal(
        &self,
        candidate: &AlignmentCandidate,
        reasoning: String,
        terms: crate::types::ProposedTerms,
    ) -> bool {
        let timestamp = now_ms();
        let estimated_value = candidate.estimated_value();
        let settlement = ProposedSettlement {
            id: format!("st-{}", Uuid::new_v4()),
            intent_a: candidate.a.fingerprint.clone(),
            intent_b: candidate.b.fingerprint.clone(),
            reasoning_trace: reasoning,
            proposed_terms: terms,
            facilitation_fee: estimated_value * self.config.mediation.fee_percent / 100.0,
            fee_percent: self.config.mediation.fee_percent,
            model_integrity_hash: self.negotiator.model_integrity_hash().to_string(),
            mediator_id: self.adapter.mediator_id().to_string(),
            timestamp,
            status: SettlementStatus::Proposed,
            acceptance_deadline: timestamp + self.config.acceptance_window_ms(),
            party_a_accepted: false,
            party_b_accepted: false,
        };
        let settlement_id = settlement.id.clone();

        if let Err(err) = self.tracker.register(settlement.clone()) {
            warn!(error = %err, "settlement registration suppressed");
            return false;
        }
        match self.adapter.submit_settlement(&settlement).await {
            Ok(()) => {
                info!(
                    settlement_id = %settlement_id,
                    a = %settlement.intent_a,
                    b = %settlement.intent_b,
                    fee = settlement.facilitation_fee,
                    "settlement submitted"
                );
                true
            }
            Err(err) => {
                error!(
                    settlement_id = %settlement_id,
                    error = %err,
                    "settlement submission failed, marking rejected"
                );
                self.tracker.mark_rejected(&settlement_id);
                false
            }
        }
    }

    /// One settlement-monitor pass: poll acceptance for our open
    /// settlements, claim fees, then run the challenge scanner.
    pub async fn run_monitor_once(&self) -> MediatorResult<()> {
        for settlement in self.tracker.non_terminal() {
            let report = match self.adapter.get_settlement_status(&settlement.id).await {
                Ok(report) => report.unwrap_or_default(),
                Err(err) => {
                    warn!(
                        settlement_id = %settlement.id,
                        error = %err,
                        "status poll failed"
                    );
                    continue;
                }
            };
            let transition = match self.tracker.apply_report(&settlement.id, &report, now_ms()) {
                Ok(transition) => transition,
                Err(err) => {
                    error!(settlement_id = %settlement.id, error = %err, "cannot apply report");
                    continue;
                }
            };
            if let Some(transition) = transition {
                self.handle_transition(&settlement.id, settlement.status, transition)
                    .await;
            }
        }

        let since = now_ms() - CHALLENGE_SCAN_WINDOW_MS;
        match self.detector.scan(since).await {
            Ok(outcome) => {
                if outcome.scanned > 0 {
                    debug!(
                        scanned = outcome.scanned,
                        submitted = outcome.submitted,
                        "challenge scan complete"
                    );
                }
                counter!("mediator_llm_tokens_total").increment(outcome.tokens_spent);
            }
            Err(err) => warn!(error = %err, "challenge scan failed"),
        }
        if let Err(err) = self.detector.poll_resolutions().await {
            warn!(error = %err, "challenge resolution poll failed");
        }

        self.reputation.flush().await;
        Ok(())
    }

    async fn handle_transition(
        &self,
        settlement_id: &str,
        from: SettlementStatus,
        transition: SettlementTransition,
    ) {
        let to = match transition {
            SettlementTransition::Accepted => SettlementStatus::Accepted,
            SettlementTransition::Challenged => SettlementStatus::Challenged,
            SettlementTransition::Closed => SettlementStatus::Closed,
            SettlementTransition::Rejected { .. } => SettlementStatus::Rejected,
        };
        self.events.emit(EngineEvent::SettlementTransitioned {
            settlement_id: settlement_id.to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });

        match transition {
            SettlementTransition::Accepted => {
                let Some(amount) = self.tracker.take_fee_claim(settlement_id) else {
                    return;
                };
                match self.adapter.submit_payout_claim(settlement_id, amount).await {
                    Ok(()) => {
                        if let Err(err) = self.tracker.mark_closed(settlement_id) {
                            error!(settlement_id, error = %err, "cannot close after payout");
                            return;
                        }
                        counter!("mediator_settlements_closed_total").increment(1);
                        self.events.emit(EngineEvent::SettlementTransitioned {
                            settlement_id: settlement_id.to_string(),
                            from: SettlementStatus::Accepted.as_str().to_string(),
                            to: SettlementStatus::Closed.as_str().to_string(),
                        });
                        self.reputation.record_closure().await;
                        self.events.emit(EngineEvent::ReputationUpdated {
                            weight: self.reputation.weight(),
                        });
                    }
                    Err(err) => {
                        // The claim was handed out once; the settlement stays
                        // accepted and the failure is investigated, not retried.
                        error!(settlement_id, error = %err, "payout claim failed");
                    }
                }
            }
            SettlementTransition::Closed => {
                counter!("mediator_settlements_closed_total").increment(1);
                self.reputation.record_closure().await;
                self.events.emit(EngineEvent::ReputationUpdated {
                    weight: self.reputation.weight(),
                });
            }
            SettlementTransition::Rejected { upheld_challenge } => {
                if upheld_challenge {
                    counter!("mediator_fees_forfeited_total").increment(1);
                    self.reputation.record_upheld_against().await;
                    self.events.emit(EngineEvent::ReputationUpdated {
                        weight: self.reputation.weight(),
                    });
                }
            }
            SettlementTransition::Challenged => {
                info!(settlement_id, "settlement challenged");
            }
        }
    }

    /// Persist the vector index; called on shutdown.
    fn persist_index(&self) {
        if let Err(err) = self.index.lock().save() {
            error!(error = %err, "cannot persist vector index");
        }
    }
}

#[derive(Clone, Copy)]
enum LoopKind {
    Ingest,
    Cycle,
    Monitor,
}

impl LoopKind {
    fn as_str(self) -> &'static str {
        match self {
            LoopKind::Ingest => "ingest",
            LoopKind::Cycle => "cycle",
            LoopKind::Monitor => "monitor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingProvider, IdentityConfig};
    use crate::error::MediatorError;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> MediatorConfig {
        let mut config = MediatorConfig::default();
        config.identity = IdentityConfig {
            public_key: String::new(),
            private_key: hex::encode([11u8; 32]),
        };
        config.embedding.provider = EmbeddingProvider::Fallback;
        config.embedding.dimension = 32;
        config.mediation.production = false;
        config.storage.data_dir = dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn engine_builds_and_reports_health() {
        let dir = TempDir::new().unwrap();
        let engine = MediationEngine::new(test_config(&dir), EventSink::disabled()).unwrap();
        let health = engine.health();
        assert_eq!(health.last_ingest_ms, None);
        assert_eq!(health.last_cycle_ms, None);
        assert_eq!(health.intents_cached, 0);
        assert_eq!(health.settlements_open, 0);
        assert_eq!(health.circuit_state, "closed");
    }

    #[tokio::test]
    async fn bad_private_key_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.identity.private_key = "zz".to_string();
        let result = MediationEngine::new(config, EventSink::disabled());
        assert!(matches!(result, Err(MediatorError::Signing(_))));
    }

    #[tokio::test]
    async fn fallback_embeddings_rejected_in_production() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.mediation.production = true;
        let result = MediationEngine::new(config, EventSink::disabled());
        assert!(matches!(result, Err(MediatorError::Config(_))));
    }
}
