//! The sole HTTP bridge to the intent ledger.
//!
//! Typed operations over the ledger API, with per-class timeouts, transient
//! retries, a circuit breaker, read-side schema validation and stable client
//! tokens so every write is at-most-once even on a ledger without
//! server-side deduplication.

use crate::chain::resilience::{CircuitBreaker, CircuitState, RetryPolicy};
use crate::chain::wire::{
    collect_pending_intents, parse_reputation, parse_settlement, ContractListResponse, EntryKind,
    HealthResponse, MatchResponse, PendingResponse, SettlementStatusReport, SubmitResponse,
    ValidateResponse,
};
use crate::config::ChainConfig;
use crate::error::{MediatorError, MediatorResult};
use crate::signing::MediatorIdentity;
use crate::types::{Challenge, Intent, MediatorReputation, ProposedSettlement};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP client for the ledger. Every other component talks to the chain
/// only through this.
pub struct ChainAdapter {
    http: reqwest::Client,
    base: String,
    chain_id: String,
    identity: Arc<MediatorIdentity>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    read_timeout: Duration,
    write_timeout: Duration,
    /// `/contract/propose` is optional on the ledger; sticky fallback to
    /// `POST /entry` once a 404/405 is seen.
    propose_supported: AtomicBool,
}

impl ChainAdapter {
    pub fn new(config: &ChainConfig, identity: Arc<MediatorIdentity>) -> MediatorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.write_timeout_ms.max(config.read_timeout_ms)))
            .build()
            .map_err(|e| MediatorError::Config(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            base: config.endpoint.trim_end_matches('/').to_string(),
            chain_id: config.chain_id.clone(),
            identity,
            retry: RetryPolicy::with_max_retries(config.max_retries),
            breaker: CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_millis(config.breaker_cooldown_ms),
            ),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            propose_supported: AtomicBool::new(true),
        })
    }

    /// Current breaker state, surfaced in the engine health snapshot.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn mediator_id(&self) -> &str {
        self.identity.mediator_id()
    }

    /// `GET /health`.
    pub async fn health(&self) -> MediatorResult<bool> {
        let response: HealthResponse = self
            .guarded(|| self.get_json("/health", self.read_timeout))
            .await?;
        Ok(response.ok)
    }

    /// `GET /validate/chain` — the ledger's own integrity check, surfaced by
    /// the health probe.
    pub async fn validate_chain(&self) -> MediatorResult<(bool, Vec<String>)> {
        let response: ValidateResponse = self
            .guarded(|| self.get_json("/validate/chain", self.read_timeout))
            .await?;
        Ok((response.valid, response.issues))
    }

    /// `GET /pending`, filtered to valid intents. Malformed intents are
    /// logged and dropped from candidacy here, at ingest.
    pub async fn list_pending_intents(&self, limit: usize) -> MediatorResult<Vec<Intent>> {
        let response: PendingResponse = self
            .guarded(|| self.get_json("/pending", self.read_timeout))
            .await?;
        let (mut intents, rejected) = collect_pending_intents(response);
        for err in &rejected {
            warn!(error = %err, "dropping invalid pending intent");
        }
        if intents.len() > limit {
            intents.truncate(limit);
        }
        Ok(intents)
    }

    /// Look up a single intent through the keyword search endpoint.
    pub async fn get_intent(&self, fingerprint: &str) -> MediatorResult<Option<Intent>> {
        let path = format!("/entries/search?intent={fingerprint}");
        let response: PendingResponse = self
            .guarded(|| self.get_json(&path, self.read_timeout))
            .await?;
        let (intents, rejected) = collect_pending_intents(response);
        for err in &rejected {
            warn!(error = %err, fingerprint, "invalid intent in search result");
        }
        Ok(intents.into_iter().find(|i| i.fingerprint == fingerprint))
    }

    /// Chain-side candidate hint; an empty list is a valid answer.
    pub async fn find_match_candidates(&self, fingerprint: &str) -> MediatorResult<Vec<String>> {
        let body = json!({ "fingerprint": fingerprint });
        let response: MatchResponse = self
            .guarded(|| self.post_json("/contract/match", &body, self.read_timeout))
            .await?;
        Ok(response.matches)
    }

    /// Submit a settlement proposal. Prefers `/contract/propose`; falls back
    /// permanently to `POST /entry` if the ledger does not serve it.
    pub async fn submit_settlement(&self, settlement: &ProposedSettlement) -> MediatorResult<()> {
        let data = serde_json::to_value(settlement)
            .map_err(|e| MediatorError::Internal(format!("encoding settlement: {e}")))?;
        if self.propose_supported.load(Ordering::Acquire) {
            let envelope = self.envelope(EntryKind::Settlement, &data)?;
            let result: MediatorResult<SubmitResponse> = self
                .guarded(|| self.post_json("/contract/propose", &envelope, self.write_timeout))
                .await;
            match result {
                Ok(response) if response.accepted() => return Ok(()),
                Ok(_) => {
                    return Err(MediatorError::ChainTerminal(
                        "ledger refused settlement proposal".to_string(),
                    ))
                }
                Err(err) if endpoint_missing(&err) => {
                    info!("ledger does not serve /contract/propose, using /entry");
                    self.propose_supported.store(false, Ordering::Release);
                }
                Err(err) => return Err(err),
            }
        }
        self.submit_entry(EntryKind::Settlement, data).await
    }

    /// Submit any ledger entry through `POST /entry`.
    pub async fn submit_entry(&self, kind: EntryKind, data: Value) -> MediatorResult<()> {
        let envelope = self.envelope(kind, &data)?;
        let response: SubmitResponse = self
            .guarded(|| self.post_json("/entry", &envelope, self.write_timeout))
            .await?;
        if response.accepted() {
            Ok(())
        } else {
            Err(MediatorError::ChainTerminal(format!(
                "ledger refused {} entry",
                kind.as_str()
            )))
        }
    }

    /// Submit a challenge against a foreign settlement.
    pub async fn submit_challenge(&self, challenge: &Challenge) -> MediatorResult<()> {
        let data = serde_json::to_value(challenge)
            .map_err(|e| MediatorError::Internal(format!("encoding challenge: {e}")))?;
        self.submit_entry(EntryKind::Challenge, data).await
    }

    /// `POST /contract/payout` — claim the facilitation fee for an accepted
    /// settlement.
    pub async fn submit_payout_claim(
        &self,
        settlement_id: &str,
        amount: f64,
    ) -> MediatorResult<()> {
        let data = json!({ "settlementId": settlement_id, "amount": amount });
        let envelope = self.envelope(EntryKind::Payout, &data)?;
        let response: SubmitResponse = self
            .guarded(|| self.post_json("/contract/payout", &envelope, self.write_timeout))
            .await?;
        if response.accepted() {
            Ok(())
        } else {
            Err(MediatorError::ChainTerminal(format!(
                "ledger refused payout claim for {settlement_id}"
            )))
        }
    }

    /// Acceptance and challenge snapshot for one of our open settlements.
    /// `None` means the contract is no longer in the ledger's open set and
    /// the chain has nothing new to say.
    pub async fn get_settlement_status(
        &self,
        settlement_id: &str,
    ) -> MediatorResult<Option<SettlementStatusReport>> {
        let contracts = self.list_open_contracts().await?;
        for contract in contracts {
            let id_matches = contract
                .get("id")
                .and_then(Value::as_str)
                .map(|id| id == settlement_id)
                .unwrap_or(false);
            if id_matches {
                let report: SettlementStatusReport = serde_json::from_value(contract)
                    .map_err(|e| MediatorError::Schema(format!("settlement status: {e}")))?;
                return Ok(Some(report));
            }
        }
        Ok(None)
    }

    /// Foreign settlements proposed since `since_ms`, newest first, for
    /// challenge scanning. Malformed contracts are logged and skipped.
    pub async fn list_recent_settlements(
        &self,
        since_ms: i64,
        limit: usize,
    ) -> MediatorResult<Vec<ProposedSettlement>> {
        let contracts = self.list_open_contracts().await?;
        let mut settlements = Vec::new();
        for contract in contracts {
            match parse_settlement(contract) {
                Ok(settlement) if settlement.timestamp >= since_ms => {
                    settlements.push(settlement)
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "skipping malformed contract"),
            }
        }
        settlements.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
        settlements.truncate(limit);
        Ok(settlements)
    }

    /// `GET /reputation/:id`; absent records come back as zeroed defaults.
    pub async fn get_reputation(&self, mediator_id: &str) -> MediatorResult<MediatorReputation> {
        let path = format!("/reputation/{mediator_id}");
        let result: MediatorResult<Value> = self
            .guarded(|| self.get_json(&path, self.read_timeout))
            .await;
        match result {
            Ok(value) => parse_reputation(value),
            Err(err) if endpoint_missing(&err) => {
                debug!(mediator_id, "no reputation on chain yet, using defaults");
                Ok(MediatorReputation::new(mediator_id))
            }
            Err(err) => Err(err),
        }
    }

    /// `POST /reputation` — best-effort publish of the local counters.
    pub async fn publish_reputation(&self, reputation: &MediatorReputation) -> MediatorResult<()> {
        let rep_value = serde_json::to_value(reputation)
            .map_err(|e| MediatorError::Internal(format!("encoding reputation: {e}")))?;
        let body = json!({
            "mediatorId": reputation.mediator_id,
            "reputation": rep_value,
        });
        let _: SubmitResponse = self
            .guarded(|| self.post_json("/reputation", &body, self.write_timeout))
            .await?;
        Ok(())
    }

    async fn list_open_contracts(&self) -> MediatorResult<Vec<Value>> {
        let response: ContractListResponse = self
            .guarded(|| self.get_json("/contract/list?status=open", self.read_timeout))
            .await?;
        Ok(response.contracts)
    }

    /// Signed submission envelope with a content-stable client token. The
    /// token doubles as an idempotency key: a retried or replayed submission
    /// carries the same token, so the ledger (or this adapter's own history)
    /// can collapse duplicates.
    fn envelope(&self, kind: EntryKind, data: &Value) -> MediatorResult<Value> {
        let token = client_token(kind, data);
        let mut envelope = json!({
            "type": kind.as_str(),
            "data": data,
            "clientToken": token,
            "chainId": self.chain_id,
            "mediatorId": self.identity.mediator_id(),
        });
        let signature = self.identity.sign_json(&envelope)?;
        if let Some(map) = envelope.as_object_mut() {
            map.insert("signature".to_string(), Value::String(signature));
        }
        Ok(envelope)
    }

    /// Run one logical operation through the breaker and retry policy. The
    /// breaker sees every attempt.
    async fn guarded<T, F, Fut>(&self, f: F) -> MediatorResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = MediatorResult<T>>,
    {
        self.retry
            .execute(|| {
                let attempt = f();
                async {
                    self.breaker.admit()?;
                    let result = attempt.await;
                    self.breaker.record(result.as_ref().err());
                    result
                }
            })
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> MediatorResult<T> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_transport)?;
        decode_response(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> MediatorResult<T> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.http.post(&url).timeout(timeout).json(body);
        if let Some(token) = body.get("clientToken").and_then(Value::as_str) {
            request = request.header("Idempotency-Key", token);
        }
        let response = request.send().await.map_err(classify_transport)?;
        decode_response(response).await
    }
}

/// Content-stable client token for a submission.
pub fn client_token(kind: EntryKind, data: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(data.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn classify_transport(err: reqwest::Error) -> MediatorError {
    if err.is_timeout() {
        MediatorError::ChainTransient(format!("timeout: {err}"))
    } else {
        MediatorError::ChainTransient(format!("connection: {err}"))
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> MediatorResult<T> {
    let status = response.status();
    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| MediatorError::Schema(format!("decoding response: {e}")))
    } else if status.is_server_error() {
        Err(MediatorError::ChainTransient(format!("HTTP {status}")))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(MediatorError::ChainTerminal(format!(
            "HTTP {}: {}",
            status.as_u16(),
            body.chars().take(200).collect::<String>()
        )))
    }
}

/// 404/405 on an optional endpoint.
fn endpoint_missing(err: &MediatorError) -> bool {
    matches!(err, MediatorError::ChainTerminal(msg)
        if msg.starts_with("HTTP 404") || msg.starts_with("HTTP 405"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::types::{IntentStatus, ProposedTerms, SettlementStatus};
    use wiremock::matchers::{body_string_contains, header_exists, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_adapter(uri: &str) -> ChainAdapter {
        let identity = Arc::new(
            MediatorIdentity::from_config(&IdentityConfig {
                public_key: String::new(),
                private_key: hex::encode([9u8; 32]),
            })
            .unwrap(),
        );
        let config = ChainConfig {
            endpoint: uri.to_string(),
            max_retries: 2,
            breaker_threshold: 10,
            ..ChainConfig::default()
        };
        ChainAdapter::new(&config, identity).unwrap()
    }

    fn settlement() -> ProposedSettlement {
        ProposedSettlement {
            id: "st-0001".to_string(),
            intent_a: "intent-aaaa-0001".to_string(),
            intent_b: "intent-aaaa-0002".to_string(),
            reasoning_trace: "both sides want a React landing page".to_string(),
            proposed_terms: ProposedTerms {
                price: Some(650.0),
                deliverables: Some(vec!["landing page".to_string()]),
                timeline: Some("2 weeks".to_string()),
            },
            facilitation_fee: 0.65,
            fee_percent: 5.0,
            model_integrity_hash: "ab".repeat(32),
            mediator_id: "med-1".to_string(),
            timestamp: 1_700_000_000_000,
            status: SettlementStatus::Proposed,
            acceptance_deadline: 1_700_000_000_000 + 72 * 3_600_000,
            party_a_accepted: false,
            party_b_accepted: false,
        }
    }

    #[tokio::test]
    async fn lists_and_validates_pending_intents() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pending"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": [
                    {"type": "intent", "data": {
                        "fingerprint": "intent-aaaa-0001",
                        "author": "alice",
                        "prose": "I will build a landing page in React for $500.",
                        "desires": ["web development"],
                        "offeredFee": 5.0,
                        "timestamp": 1_700_000_000_000i64
                    }},
                    {"type": "intent", "data": {
                        "fingerprint": "nope",
                        "author": "mallory",
                        "prose": "fingerprint too short",
                        "timestamp": 1_700_000_000_000i64
                    }},
                    {"type": "settlement", "data": {}}
                ]
            })))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let intents = adapter.list_pending_intents(10).await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].status, IntentStatus::Pending);
    }

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pending"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pending"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"entries": []})),
            )
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let intents = adapter.list_pending_intents(10).await.unwrap();
        assert!(intents.is_empty());
    }

    #[tokio::test]
    async fn terminal_4xx_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pending"))
            .respond_with(ResponseTemplate::new(422))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let result = adapter.list_pending_intents(10).await;
        assert!(matches!(result, Err(MediatorError::ChainTerminal(_))));
    }

    #[tokio::test]
    async fn settlement_submission_is_signed_and_tokenised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contract/propose"))
            .and(header_exists("Idempotency-Key"))
            .and(body_string_contains("clientToken"))
            .and(body_string_contains("signature"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true, "id": "c-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        adapter.submit_settlement(&settlement()).await.unwrap();
    }

    #[tokio::test]
    async fn propose_falls_back_to_entry_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contract/propose"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/entry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"entryId": "e-1", "status": "accepted"}),
            ))
            .expect(2)
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        adapter.submit_settlement(&settlement()).await.unwrap();
        // Fallback is sticky: the second submission goes straight to /entry.
        adapter.submit_settlement(&settlement()).await.unwrap();
    }

    #[tokio::test]
    async fn match_candidates_hint_tolerates_empty_answers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contract/match"))
            .and(body_string_contains("intent-aaaa-0001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "matches": ["intent-bbbb-0002", "intent-cccc-0003"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/contract/match"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"matches": []})),
            )
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let hints = adapter
            .find_match_candidates("intent-aaaa-0001")
            .await
            .unwrap();
        assert_eq!(hints, vec!["intent-bbbb-0002", "intent-cccc-0003"]);
        // An empty hint list is a valid answer.
        let none = adapter.find_match_candidates("intent-zzzz-0009").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn missing_reputation_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/reputation/.*$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let rep = adapter.get_reputation("med-404").await.unwrap();
        assert_eq!(rep.successful_closures, 0);
        assert!((rep.weight - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn settlement_status_found_in_open_contracts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contract/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "contracts": [{
                    "id": "st-0001",
                    "partyAAccepted": true,
                    "partyBAccepted": false,
                    "challenges": []
                }]
            })))
            .mount(&server)
            .await;

        let adapter = test_adapter(&server.uri());
        let report = adapter.get_settlement_status("st-0001").await.unwrap();
        let report = report.unwrap();
        assert!(report.party_a_accepted);
        assert!(!report.party_b_accepted);
        assert!(adapter
            .get_settlement_status("st-miss")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn client_token_is_stable() {
        let data = serde_json::json!({"settlementId": "st-1", "amount": 1.5});
        let a = client_token(EntryKind::Payout, &data);
        let b = client_token(EntryKind::Payout, &data);
        assert_eq!(a, b);
        let other = client_token(EntryKind::Payout, &serde_json::json!({"settlementId": "st-2", "amount": 1.5}));
        assert_ne!(a, other);
    }
}
