//! Challenge detection over other mediators' settlements.
//!
//! Recently proposed foreign settlements are run through the verification
//! prompt; a confident contradiction becomes a challenge entry. Submitted
//! challenges are tracked until the chain resolves them, and resolutions
//! feed the reputation ledger.

use crate::chain::ChainAdapter;
use crate::error::MediatorResult;
use crate::llm::{LlmUsage, Negotiator};
use crate::reputation::ReputationLedger;
use crate::types::{Challenge, ChallengeStatus, ProposedSettlement};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one scan pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanOutcome {
    pub scanned: usize,
    pub submitted: usize,
    pub tokens_spent: u64,
}

struct SubmittedChallenge {
    settlement_id: String,
    resolved: bool,
}

#[derive(Default)]
struct DetectorState {
    /// Settlement ids already analysed; a settlement is analysed once.
    scanned: HashSet<String>,
    /// challenge id → tracking record.
    submitted: HashMap<String, SubmittedChallenge>,
}

/// Scans foreign settlements and submits challenges on this mediator's
/// behalf.
pub struct ChallengeDetector {
    adapter: Arc<ChainAdapter>,
    negotiator: Arc<Negotiator>,
    reputation: Arc<ReputationLedger>,
    enabled: bool,
    min_confidence: f64,
    scan_limit: usize,
    state: Mutex<DetectorState>,
}

impl ChallengeDetector {
    pub fn new(
        adapter: Arc<ChainAdapter>,
        negotiator: Arc<Negotiator>,
        reputation: Arc<ReputationLedger>,
        enabled: bool,
        min_confidence: f64,
        scan_limit: usize,
    ) -> Self {
        Self {
            adapter,
            negotiator,
            reputation,
            enabled,
            min_confidence,
            scan_limit,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Challenges submitted and not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .submitted
            .values()
            .filter(|c| !c.resolved)
            .count()
    }

    /// Analyse recent foreign settlements and challenge confident
    /// contradictions. Transient failures leave a settlement unscanned so a
    /// later tick retries it.
    pub async fn scan(&self, since_ms: i64) -> MediatorResult<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        let ours = self.adapter.mediator_id().to_string();
        let settlements = self
            .adapter
            .list_recent_settlements(since_ms, self.scan_limit)
            .await?;

        for settlement in settlements {
            if settlement.mediator_id == ours {
                continue;
            }
            if self.state.lock().scanned.contains(&settlement.id) {
                continue;
            }
            match self.analyse(&settlement).await {
                Ok((challenged, usage)) => {
                    outcome.scanned += 1;
                    outcome.tokens_spent += usage.total_tokens();
                    if challenged {
                        outcome.submitted += 1;
                    }
                    self.state.lock().scanned.insert(settlement.id.clone());
                }
                Err(err) if err.is_transient() => {
                    debug!(settlement_id = %settlement.id, error = %err, "scan deferred");
                }
                Err(err) => {
                    warn!(settlement_id = %settlement.id, error = %err, "scan failed");
                    self.state.lock().scanned.insert(settlement.id.clone());
                }
            }
        }
        Ok(outcome)
    }

    async fn analyse(&self, settlement: &ProposedSettlement) -> MediatorResult<(bool, LlmUsage)> {
        let Some(intent_a) = self.adapter.get_intent(&settlement.intent_a).await? else {
            debug!(settlement_id = %settlement.id, "intent A not found, skipping");
            return Ok((false, LlmUsage::default()));
        };
        let Some(intent_b) = self.adapter.get_intent(&settlement.intent_b).await? else {
            debug!(settlement_id = %settlement.id, "intent B not found, skipping");
            return Ok((false, LlmUsage::default()));
        };

        let (analysis, usage) = self
            .negotiator
            .verify_settlement(settlement, &intent_a, &intent_b)
            .await?;

        if !analysis.has_contradiction || analysis.confidence < self.min_confidence {
            return Ok((false, usage));
        }
        if !self.enabled {
            info!(
                settlement_id = %settlement.id,
                confidence = analysis.confidence,
                "contradiction found but challenge submission is disabled"
            );
            return Ok((false, usage));
        }

        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            settlement_id: settlement.id.clone(),
            challenger: self.adapter.mediator_id().to_string(),
            contradiction_proof: analysis.contradiction_proof,
            paraphrase_evidence: analysis.paraphrase_evidence,
            status: ChallengeStatus::Pending,
        };
        self.adapter.submit_challenge(&challenge).await?;
        info!(
            settlement_id = %settlement.id,
            challenge_id = %challenge.id,
            confidence = analysis.confidence,
            "challenge submitted"
        );
        self.state.lock().submitted.insert(
            challenge.id,
            SubmittedChallenge {
                settlement_id: settlement.id.clone(),
                resolved: false,
            },
        );
        Ok((true, usage))
    }

    /// Check the chain for resolutions of our submitted challenges. A
    /// rejected challenge increments our failed-challenge counter; an upheld
    /// one moves the target mediator's tally on the chain, not ours.
    pub async fn poll_resolutions(&self) -> MediatorResult<()> {
        let unresolved: Vec<(String, String)> = self
            .state
            .lock()
            .submitted
            .iter()
            .filter(|(_, c)| !c.resolved)
            .map(|(id, c)| (id.clone(), c.settlement_id.clone()))
            .collect();

        for (challenge_id, settlement_id) in unresolved {
            let Some(report) = self.adapter.get_settlement_status(&settlement_id).await? else {
                continue;
            };
            let Some(resolved) = report
                .challenges
                .iter()
                .find(|c| c.id == challenge_id)
                .map(|c| c.status)
            else {
                continue;
            };
            match resolved {
                ChallengeStatus::Pending => {}
                ChallengeStatus::Rejected => {
                    info!(challenge_id = %challenge_id, "our challenge was rejected");
                    self.reputation.record_failed_challenge().await;
                    self.mark_resolved(&challenge_id);
                }
                ChallengeStatus::Upheld => {
                    info!(challenge_id = %challenge_id, "our challenge was upheld");
                    self.mark_resolved(&challenge_id);
                }
            }
        }
        Ok(())
    }

    fn mark_resolved(&self, challenge_id: &str) {
        if let Some(challenge) = self.state.lock().submitted.get_mut(challenge_id) {
            challenge.resolved = true;
        }
    }
}
