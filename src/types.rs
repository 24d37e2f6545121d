//! Core domain records: intents, settlements, challenges, reputation.
//!
//! All timestamps are milliseconds since the Unix epoch. Wire-facing types
//! use camelCase field names to match the ledger's JSON.

use crate::error::{MediatorError, MediatorResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque, globally unique, content-stable identifier of an intent.
pub type Fingerprint = String;

/// Upper bound on intent prose length in characters.
pub const MAX_PROSE_CHARS: usize = 10_000;
/// Upper bound on a single desire/constraint item in characters.
pub const MAX_ITEM_CHARS: usize = 1_000;
/// Upper bound on desire/constraint list lengths.
pub const MAX_LIST_ITEMS: usize = 100;
/// Fee smoothing term in the candidate priority formula.
pub const PRIORITY_EPSILON: f64 = 0.01;

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Canonical key for an unordered fingerprint pair.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// Lifecycle status of an intent on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Accepted,
    Rejected,
    Closed,
    Unalignable,
}

/// A human-authored statement of desire or offer, pulled from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub fingerprint: Fingerprint,
    pub author: String,
    pub prose: String,
    #[serde(default)]
    pub desires: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Offered facilitation fee, non-negative when present.
    #[serde(default)]
    pub offered_fee: Option<f64>,
    pub timestamp: i64,
    #[serde(default = "default_intent_status")]
    pub status: IntentStatus,
}

fn default_intent_status() -> IntentStatus {
    IntentStatus::Pending
}

impl Intent {
    /// Offered fee, treating absence as zero.
    pub fn fee(&self) -> f64 {
        self.offered_fee.unwrap_or(0.0)
    }

    /// Enforce prose, list, fingerprint and numeric bounds. Applied on every
    /// read from the ledger, not only on write.
    pub fn validate(&self) -> MediatorResult<()> {
        validate_fingerprint(&self.fingerprint)?;
        let prose_chars = self.prose.chars().count();
        if prose_chars == 0 || prose_chars > MAX_PROSE_CHARS {
            return Err(MediatorError::InvalidIntent(format!(
                "prose length {} outside 1..={}",
                prose_chars, MAX_PROSE_CHARS
            )));
        }
        for (name, list) in [("desires", &self.desires), ("constraints", &self.constraints)] {
            if list.len() > MAX_LIST_ITEMS {
                return Err(MediatorError::InvalidIntent(format!(
                    "{name} has {} items, limit {}",
                    list.len(),
                    MAX_LIST_ITEMS
                )));
            }
            if let Some(item) = list.iter().find(|i| i.chars().count() > MAX_ITEM_CHARS) {
                return Err(MediatorError::InvalidIntent(format!(
                    "{name} item of {} chars exceeds limit {}",
                    item.chars().count(),
                    MAX_ITEM_CHARS
                )));
            }
        }
        if let Some(fee) = self.offered_fee {
            if !fee.is_finite() || fee < 0.0 {
                return Err(MediatorError::InvalidIntent(format!(
                    "offered fee {fee} is negative or non-finite"
                )));
            }
        }
        if self.timestamp < 0 {
            return Err(MediatorError::InvalidIntent(
                "timestamp before epoch".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fingerprints are opaque but bounded: 8..=128 chars drawn from a
/// url-safe alphabet.
pub fn validate_fingerprint(fingerprint: &str) -> MediatorResult<()> {
    let len = fingerprint.len();
    if !(8..=128).contains(&len) {
        return Err(MediatorError::InvalidIntent(format!(
            "fingerprint length {len} outside 8..=128"
        )));
    }
    if !fingerprint
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
    {
        return Err(MediatorError::InvalidIntent(
            "fingerprint contains characters outside [A-Za-z0-9:._-]".to_string(),
        ));
    }
    Ok(())
}

/// A similarity-and-fee-weighted pairing of two intents deemed plausibly
/// compatible.
#[derive(Debug, Clone)]
pub struct AlignmentCandidate {
    pub a: Arc<Intent>,
    pub b: Arc<Intent>,
    /// Cosine similarity clipped to [0, 1].
    pub similarity: f64,
}

impl AlignmentCandidate {
    pub fn estimated_value(&self) -> f64 {
        self.a.fee() + self.b.fee()
    }

    /// Ranking score: similarity weighted by the combined offered fees,
    /// smoothed so zero-fee pairs still rank by similarity.
    pub fn priority(&self) -> f64 {
        self.similarity * (self.estimated_value() + PRIORITY_EPSILON)
    }

    pub fn pair_key(&self) -> String {
        pair_key(&self.a.fingerprint, &self.b.fingerprint)
    }
}

/// Lifecycle status of a proposed settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Proposed,
    Accepted,
    Rejected,
    Closed,
    Challenged,
}

impl SettlementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SettlementStatus::Closed | SettlementStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SettlementStatus::Proposed => "proposed",
            SettlementStatus::Accepted => "accepted",
            SettlementStatus::Rejected => "rejected",
            SettlementStatus::Closed => "closed",
            SettlementStatus::Challenged => "challenged",
        }
    }
}

/// Structured terms produced by a negotiation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedTerms {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub deliverables: Option<Vec<String>>,
    #[serde(default)]
    pub timeline: Option<String>,
}

/// A concrete proposal to resolve two aligned intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedSettlement {
    pub id: String,
    pub intent_a: Fingerprint,
    pub intent_b: Fingerprint,
    pub reasoning_trace: String,
    pub proposed_terms: ProposedTerms,
    pub facilitation_fee: f64,
    pub fee_percent: f64,
    /// Hash of (model id ∥ prompt template version) for auditability.
    pub model_integrity_hash: String,
    pub mediator_id: String,
    pub timestamp: i64,
    pub status: SettlementStatus,
    pub acceptance_deadline: i64,
    #[serde(default)]
    pub party_a_accepted: bool,
    #[serde(default)]
    pub party_b_accepted: bool,
}

impl ProposedSettlement {
    pub fn pair_key(&self) -> String {
        pair_key(&self.intent_a, &self.intent_b)
    }

    pub fn validate(&self) -> MediatorResult<()> {
        if !(0.0..=100.0).contains(&self.fee_percent) {
            return Err(MediatorError::Internal(format!(
                "fee percent {} outside 0..=100",
                self.fee_percent
            )));
        }
        if self.intent_a == self.intent_b {
            return Err(MediatorError::Internal(
                "settlement pairs an intent with itself".to_string(),
            ));
        }
        if self.acceptance_deadline <= self.timestamp {
            return Err(MediatorError::Internal(
                "acceptance deadline not after proposal timestamp".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolution status of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Upheld,
    Rejected,
}

/// A third party's claim that a settlement violates one of the underlying
/// intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub settlement_id: String,
    pub challenger: String,
    pub contradiction_proof: String,
    pub paraphrase_evidence: String,
    pub status: ChallengeStatus,
}

/// The four reputation counters plus the derived weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediatorReputation {
    pub mediator_id: String,
    pub successful_closures: u64,
    pub failed_challenges: u64,
    pub upheld_challenges_against: u64,
    pub forfeited_fees: u64,
    pub weight: f64,
    pub last_updated: i64,
}

impl MediatorReputation {
    pub fn new(mediator_id: impl Into<String>) -> Self {
        let mut rep = Self {
            mediator_id: mediator_id.into(),
            successful_closures: 0,
            failed_challenges: 0,
            upheld_challenges_against: 0,
            forfeited_fees: 0,
            weight: 0.0,
            last_updated: now_ms(),
        };
        rep.recompute_weight();
        rep
    }

    /// weight = (sc + 2·fc) / (1 + uca + ff)
    pub fn recompute_weight(&mut self) {
        let favourable = self.successful_closures as f64 + 2.0 * self.failed_challenges as f64;
        let adverse = 1.0 + self.upheld_challenges_against as f64 + self.forfeited_fees as f64;
        self.weight = favourable / adverse;
    }
}
