//! Lifecycle tracking for settlements this mediator proposed.
//!
//! The tracker is registered before the chain submission happens, enforces
//! at most one non-terminal settlement per unordered intent pair, applies
//! chain status reports idempotently and hands out the fee claim exactly
//! once. Local state is authoritative: a chain report that walks a
//! settlement backwards is logged and ignored.

use crate::chain::SettlementStatusReport;
use crate::error::{MediatorError, MediatorResult};
use crate::types::{ChallengeStatus, ProposedSettlement, SettlementStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

/// A state change produced by applying a chain report or a payout
/// acknowledgement. The orchestrator turns these into submissions and
/// reputation updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementTransition {
    /// Both parties accepted inside the window; claim the fee.
    Accepted,
    /// Terminal failure; `upheld_challenge` distinguishes a forfeited fee
    /// from a lapsed acceptance window.
    Rejected { upheld_challenge: bool },
    /// First pending challenge observed.
    Challenged,
    /// Terminal success via challenge resolution (all challenges rejected,
    /// both parties accepted).
    Closed,
}

struct Tracked {
    settlement: ProposedSettlement,
    fee_claimed: bool,
}

#[derive(Default)]
struct Inner {
    settlements: HashMap<String, Tracked>,
    /// pair key → settlement id, for non-terminal settlements only.
    open_pairs: HashMap<String, String>,
}

/// In-memory owner of this mediator's proposed settlements.
#[derive(Default)]
pub struct SettlementTracker {
    inner: Mutex<Inner>,
}

impl SettlementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new proposal. Must happen before the chain submission so a
    /// crash between the two leaves a suppressing entry, not a duplicate.
    pub fn register(&self, settlement: ProposedSettlement) -> MediatorResult<()> {
        settlement.validate()?;
        let mut inner = self.inner.lock();
        let key = settlement.pair_key();
        if inner.open_pairs.contains_key(&key) {
            return Err(MediatorError::DuplicateSettlement(key));
        }
        inner.open_pairs.insert(key, settlement.id.clone());
        inner.settlements.insert(
            settlement.id.clone(),
            Tracked {
                settlement,
                fee_claimed: false,
            },
        );
        Ok(())
    }

    /// Whether a non-terminal settlement already covers this pair.
    pub fn has_open_pair(&self, a: &str, b: &str) -> bool {
        self.inner
            .lock()
            .open_pairs
            .contains_key(&crate::types::pair_key(a, b))
    }

    /// Mark a settlement rejected locally (chain refused the submission).
    pub fn mark_rejected(&self, id: &str) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if let Some(tracked) = inner.settlements.get_mut(id) {
            if !tracked.settlement.status.is_terminal() {
                tracked.settlement.status = SettlementStatus::Rejected;
                let key = tracked.settlement.pair_key();
                inner.open_pairs.remove(&key);
            }
        }
    }

    /// Apply one chain status report. Idempotent: the same report applied
    /// twice is a no-op after the first.
    pub fn apply_report(
        &self,
        id: &str,
        report: &SettlementStatusReport,
        now_ms: i64,
    ) -> MediatorResult<Option<SettlementTransition>> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let tracked = inner
            .settlements
            .get_mut(id)
            .ok_or_else(|| MediatorError::SettlementNotFound(id.to_string()))?;
        let settlement = &mut tracked.settlement;

        if settlement.status.is_terminal() {
            return Ok(None);
        }

        // Acceptance flags only ever move forward; a chain regression is
        // logged and the local view kept.
        if settlement.party_a_accepted && !report.party_a_accepted
            || settlement.party_b_accepted && !report.party_b_accepted
        {
            warn!(
                settlement_id = %id,
                "chain reports acceptance regression, keeping local state"
            );
        }
        settlement.party_a_accepted |= report.party_a_accepted;
        settlement.party_b_accepted |= report.party_b_accepted;

        let any_upheld = report
            .challenges
            .iter()
            .any(|c| c.status == ChallengeStatus::Upheld);
        let any_pending = report
            .challenges
            .iter()
            .any(|c| c.status == ChallengeStatus::Pending);
        let all_rejected = !report.challenges.is_empty()
            && report
                .challenges
                .iter()
                .all(|c| c.status == ChallengeStatus::Rejected);
        let both_accepted = settlement.party_a_accepted && settlement.party_b_accepted;
        let deadline_passed = now_ms > settlement.acceptance_deadline;

        let transition = match settlement.status {
            SettlementStatus::Proposed => {
                if any_upheld {
                    Some(SettlementTransition::Rejected {
                        upheld_challenge: true,
                    })
                } else if any_pending {
                    Some(SettlementTransition::Challenged)
                } else if both_accepted && !deadline_passed {
                    Some(SettlementTransition::Accepted)
                } else if deadline_passed {
                    Some(SettlementTransition::Rejected {
                        upheld_challenge: false,
                    })
                } else {
                    None
                }
            }
            SettlementStatus::Challenged => {
                if any_upheld {
                    Some(SettlementTransition::Rejected {
                        upheld_challenge: true,
                    })
                } else if all_rejected && both_accepted {
                    Some(SettlementTransition::Closed)
                } else {
                    None
                }
            }
            // Accepted settlements close through the payout path, not
            // through status reports.
            SettlementStatus::Accepted => None,
            SettlementStatus::Closed | SettlementStatus::Rejected => None,
        };

        if let Some(transition) = transition {
            let new_status = match transition {
                SettlementTransition::Accepted => SettlementStatus::Accepted,
                SettlementTransition::Challenged => SettlementStatus::Challenged,
                SettlementTransition::Closed => SettlementStatus::Closed,
                SettlementTransition::Rejected { .. } => SettlementStatus::Rejected,
            };
            info!(
                settlement_id = %id,
                from = settlement.status.as_str(),
                to = new_status.as_str(),
                "settlement transition"
            );
            settlement.status = new_status;
            if new_status.is_terminal() {
                let key = settlement.pair_key();
                inner.open_pairs.remove(&key);
            }
        }
        Ok(transition)
    }

    /// Hand out the fee claim for an accepted settlement, at most once.
    pub fn take_fee_claim(&self, id: &str) -> Option<f64> {
        let mut inner = self.inner.lock();
        let tracked = inner.settlements.get_mut(id)?;
        if tracked.settlement.status == SettlementStatus::Accepted && !tracked.fee_claimed {
            tracked.fee_claimed = true;
            Some(tracked.settlement.facilitation_fee)
        } else {
            None
        }
    }

    /// Close an accepted settlement after the payout claim was acknowledged.
    pub fn mark_closed(&self, id: &str) -> MediatorResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let tracked = inner
            .settlements
            .get_mut(id)
            .ok_or_else(|| MediatorError::SettlementNotFound(id.to_string()))?;
        match tracked.settlement.status {
            SettlementStatus::Accepted => {
                tracked.settlement.status = SettlementStatus::Closed;
                let key = tracked.settlement.pair_key();
                inner.open_pairs.remove(&key);
                Ok(())
            }
            SettlementStatus::Closed => Ok(()),
            other => Err(MediatorError::InvalidTransition {
                from: other.as_str().to_string(),
                to: SettlementStatus::Closed.as_str().to_string(),
            }),
        }
    }

    /// Snapshot of every non-terminal settlement for the monitor loop.
    pub fn non_terminal(&self) -> Vec<ProposedSettlement> {
        self.inner
            .lock()
            .settlements
            .values()
            .filter(|t| !t.settlement.status.is_terminal())
            .map(|t| t.settlement.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ProposedSettlement> {
        self.inner
            .lock()
            .settlements
            .get(id)
            .map(|t| t.settlement.clone())
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open_pairs.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().settlements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().settlements.is_empty()
    }
}
