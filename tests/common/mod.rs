//! Shared fixtures: a wiremock ledger, mock LLM/embedding backends and an
//! engine configuration wired to them.

#![allow(dead_code)]

use intent_mediator::config::{
    EmbeddingProvider, IdentityConfig, LlmProvider, MediatorConfig,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Engine configuration pointing every backend at mock servers.
pub fn test_config(
    chain_uri: &str,
    llm_uri: &str,
    embed_uri: &str,
    data_dir: &TempDir,
) -> MediatorConfig {
    let mut config = MediatorConfig::default();
    config.chain.endpoint = chain_uri.to_string();
    config.chain.max_retries = 0;
    config.identity = IdentityConfig {
        public_key: String::new(),
        private_key: hex::encode([42u8; 32]),
    };
    config.llm.provider = LlmProvider::Anthropic;
    config.llm.api_key = "test-key".to_string();
    config.llm.model = "test-model".to_string();
    config.llm.base_url = Some(llm_uri.to_string());
    config.embedding.provider = EmbeddingProvider::Openai;
    config.embedding.api_key = "test-key".to_string();
    config.embedding.base_url = Some(embed_uri.to_string());
    config.embedding.dimension = 4;
    config.mediation.production = false;
    config.storage.data_dir = data_dir.path().to_path_buf();
    config.log_level = "info".to_string();
    config
}

/// An intent entry as the ledger serves it from `/pending`.
pub fn intent_entry(fingerprint: &str, prose: &str, fee: f64) -> Value {
    json!({
        "type": "intent",
        "data": {
            "fingerprint": fingerprint,
            "author": format!("author-of-{fingerprint}"),
            "prose": prose,
            "desires": [],
            "constraints": [],
            "offeredFee": fee,
            "timestamp": 1_700_000_000_000i64,
            "status": "pending"
        }
    })
}

/// Serve a fixed pending set.
pub async fn mount_pending(server: &MockServer, entries: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/pending"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": entries })))
        .mount(server)
        .await;
}

/// Map an embedding request whose body contains `needle` to a fixed vector.
pub async fn mount_embedding(server: &MockServer, needle: &str, vector: Vec<f32>) {
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(body_string_contains(needle))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"embedding": vector}]
        })))
        .mount(server)
        .await;
}

/// An Anthropic-shaped completion whose text is `reply`.
pub fn llm_reply(reply: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "content": [{"type": "text", "text": reply}],
        "usage": {"input_tokens": 100, "output_tokens": 40}
    }))
}

/// Mount a successful negotiation reply with the given price.
pub async fn mount_negotiation_success(server: &MockServer, price: f64, confidence: f64) {
    let reply = format!(
        r#"{{"success": true, "confidence": {confidence}, "reasoning": "both sides describe the same deliverable", "proposedTerms": {{"price": {price}, "deliverables": ["landing page"], "timeline": "2 weeks"}}}}"#
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(llm_reply(&reply))
        .mount(server)
        .await;
}

/// Baseline chain endpoints every engine touches: reputation, contract
/// listing, health.
pub async fn mount_chain_defaults(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/reputation/.*$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reputation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/contract/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "contracts": [] })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(server)
        .await;
}

/// A proposed-settlement record as the tracker stores it, for seeding
/// lifecycle tests.
pub fn seeded_settlement(
    id: &str,
    mediator_id: &str,
    deadline_ms: i64,
) -> intent_mediator::ProposedSettlement {
    intent_mediator::ProposedSettlement {
        id: id.to_string(),
        intent_a: "intent-aaaa-0001".to_string(),
        intent_b: "intent-aaaa-0002".to_string(),
        reasoning_trace: "compatible deliverables".to_string(),
        proposed_terms: intent_mediator::ProposedTerms {
            price: Some(650.0),
            deliverables: Some(vec!["landing page".to_string()]),
            timeline: Some("2 weeks".to_string()),
        },
        facilitation_fee: 0.65,
        fee_percent: 5.0,
        model_integrity_hash: "ab".repeat(32),
        mediator_id: mediator_id.to_string(),
        timestamp: deadline_ms - 72 * 3_600_000,
        status: intent_mediator::SettlementStatus::Proposed,
        acceptance_deadline: deadline_ms,
        party_a_accepted: false,
        party_b_accepted: false,
    }
}

/// A `/contract/list` contract record reporting acceptance flags and
/// challenges for a settlement id.
pub fn contract_report(id: &str, a: bool, b: bool, challenges: Value) -> Value {
    json!({
        "id": id,
        "partyAAccepted": a,
        "partyBAccepted": b,
        "challenges": challenges
    })
}

pub fn challenge_json(id: &str, settlement_id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "settlementId": settlement_id,
        "challenger": "a-watcher",
        "contradictionProof": "terms exceed the stated budget",
        "paraphraseEvidence": "party A capped spend",
        "status": status
    })
}
