//! Ledger wire formats and read-side validation.
//!
//! Every response is validated when it is read: unknown entry types and
//! unknown fields are ignored, missing required fields are schema errors,
//! and bounds are enforced before a record enters the engine.

use crate::error::{MediatorError, MediatorResult};
use crate::types::{Challenge, Intent, MediatorReputation, ProposedSettlement};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single ledger entry before its payload is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChainEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Entry kinds this mediator submits. The ledger additionally produces
/// `intent` entries, which we only ever read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Settlement,
    Accept,
    Challenge,
    Payout,
    ReputationUpdate,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Settlement => "settlement",
            EntryKind::Accept => "accept",
            EntryKind::Challenge => "challenge",
            EntryKind::Payout => "payout",
            EntryKind::ReputationUpdate => "reputationUpdate",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct PendingResponse {
    pub entries: Vec<RawChainEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContractListResponse {
    pub contracts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    #[serde(default)]
    pub matches: Vec<String>,
}

/// Union of the ledger's submission acknowledgements: `POST /entry` answers
/// `{entryId, status}`, the contract endpoints answer `{ok, id?}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(default)]
    pub entry_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub id: Option<String>,
}

impl SubmitResponse {
    pub fn accepted(&self) -> bool {
        match self.ok {
            Some(ok) => ok,
            None => self.entry_id.is_some(),
        }
    }
}

/// Acceptance/challenge snapshot for one settlement. The default (nothing
/// accepted, no challenges) is what the monitor assumes when a settlement
/// has left the chain's open set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementStatusReport {
    #[serde(default)]
    pub party_a_accepted: bool,
    #[serde(default)]
    pub party_b_accepted: bool,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

/// Interpret an entry's payload as an intent, enforcing all read bounds.
pub fn parse_intent(data: Value) -> MediatorResult<Intent> {
    let intent: Intent = serde_json::from_value(data)
        .map_err(|e| MediatorError::Schema(format!("intent entry: {e}")))?;
    intent.validate()?;
    Ok(intent)
}

/// Interpret a contract record as a settlement, enforcing numeric ranges.
pub fn parse_settlement(data: Value) -> MediatorResult<ProposedSettlement> {
    let settlement: ProposedSettlement = serde_json::from_value(data)
        .map_err(|e| MediatorError::Schema(format!("settlement entry: {e}")))?;
    if !(0.0..=100.0).contains(&settlement.fee_percent) {
        return Err(MediatorError::Schema(format!(
            "settlement {} fee percent {} outside 0..=100",
            settlement.id, settlement.fee_percent
        )));
    }
    if settlement.facilitation_fee < 0.0 || !settlement.facilitation_fee.is_finite() {
        return Err(MediatorError::Schema(format!(
            "settlement {} facilitation fee {} invalid",
            settlement.id, settlement.facilitation_fee
        )));
    }
    Ok(settlement)
}

/// Interpret a reputation response, recomputing the weight locally rather
/// than trusting the published one.
pub fn parse_reputation(data: Value) -> MediatorResult<MediatorReputation> {
    let mut rep: MediatorReputation = serde_json::from_value(data)
        .map_err(|e| MediatorError::Schema(format!("reputation record: {e}")))?;
    rep.recompute_weight();
    Ok(rep)
}

/// Pull every valid intent out of a pending listing. Entries of other types
/// are ignored; malformed intents are returned separately so the caller can
/// log them without losing the batch.
pub fn collect_pending_intents(
    response: PendingResponse,
) -> (Vec<Intent>, Vec<MediatorError>) {
    let mut intents = Vec::new();
    let mut rejected = Vec::new();
    for entry in response.entries {
        if entry.entry_type != "intent" {
            continue;
        }
        match parse_intent(entry.data) {
            Ok(intent) => intents.push(intent),
            Err(err) => rejected.push(err),
        }
    }
    (intents, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_listing_skips_unknown_types_and_bad_intents() {
        let response: PendingResponse = serde_json::from_value(json!({
            "entries": [
                {"type": "intent", "data": {
                    "fingerprint": "intent-aaaa-0001",
                    "author": "alice",
                    "prose": "I need a logo designed.",
                    "timestamp": 1_700_000_000_000i64
                }},
                {"type": "governanceVote", "data": {"anything": true}},
                {"type": "intent", "data": {
                    "fingerprint": "bad",
                    "author": "mallory",
                    "prose": "short fingerprint",
                    "timestamp": 1_700_000_000_000i64
                }},
                {"type": "intent", "data": {"missing": "fields"}}
            ]
        }))
        .unwrap();

        let (intents, rejected) = collect_pending_intents(response);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].fingerprint, "intent-aaaa-0001");
        assert_eq!(rejected.len(), 2);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let intent = parse_intent(json!({
            "fingerprint": "intent-aaaa-0001",
            "author": "alice",
            "prose": "I need a logo designed.",
            "timestamp": 1_700_000_000_000i64,
            "futureField": {"nested": true}
        }))
        .unwrap();
        assert_eq!(intent.author, "alice");
    }

    #[test]
    fn settlement_fee_percent_enforced_on_read() {
        let result = parse_settlement(json!({
            "id": "st-1",
            "intentA": "intent-aaaa-0001",
            "intentB": "intent-aaaa-0002",
            "reasoningTrace": "",
            "proposedTerms": {},
            "facilitationFee": 1.0,
            "feePercent": 250.0,
            "modelIntegrityHash": "00",
            "mediatorId": "med-1",
            "timestamp": 1_000,
            "status": "proposed",
            "acceptanceDeadline": 2_000
        }));
        assert!(matches!(result, Err(MediatorError::Schema(_))));
    }

    #[test]
    fn submit_response_union() {
        let entry: SubmitResponse =
            serde_json::from_value(json!({"entryId": "e-1", "status": "accepted"})).unwrap();
        assert!(entry.accepted());

        let contract: SubmitResponse = serde_json::from_value(json!({"ok": true, "id": "c-1"})).unwrap();
        assert!(contract.accepted());

        let refused: SubmitResponse = serde_json::from_value(json!({"ok": false})).unwrap();
        assert!(!refused.accepted());
    }

    #[test]
    fn reputation_weight_recomputed_on_read() {
        let rep = parse_reputation(json!({
            "mediatorId": "med-1",
            "successfulClosures": 4,
            "failedChallenges": 0,
            "upheldChallengesAgainst": 1,
            "forfeitedFees": 0,
            "weight": 99.0,
            "lastUpdated": 0
        }))
        .unwrap();
        assert!((rep.weight - 2.0).abs() < 1e-9);
    }
}
