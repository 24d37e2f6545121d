//! Configuration for the mediation engine.
//!
//! Defaults are production-shaped; `from_env` applies `MEDIATOR_*` overrides
//! and `validate` rejects configurations the engine cannot run with.

use crate::error::{MediatorError, MediatorResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// LLM inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    Openai,
}

impl LlmProvider {
    pub fn parse(value: &str) -> MediatorResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(LlmProvider::Anthropic),
            "openai" => Ok(LlmProvider::Openai),
            other => Err(MediatorError::Config(format!(
                "unknown llm provider '{other}'"
            ))),
        }
    }
}

/// Embedding backend. `Fallback` is a deterministic hash-to-vector scheme for
/// development only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Openai,
    Voyage,
    Cohere,
    Fallback,
}

impl EmbeddingProvider {
    pub fn parse(value: &str) -> MediatorResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "openai" => Ok(EmbeddingProvider::Openai),
            "voyage" => Ok(EmbeddingProvider::Voyage),
            "cohere" => Ok(EmbeddingProvider::Cohere),
            "fallback" => Ok(EmbeddingProvider::Fallback),
            other => Err(MediatorError::Config(format!(
                "unknown embedding provider '{other}'"
            ))),
        }
    }
}

/// Ledger connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Base URL of the ledger HTTP API.
    pub endpoint: String,
    /// Identifier of the chain this mediator serves.
    pub chain_id: String,
    /// Timeout for read operations, milliseconds.
    pub read_timeout_ms: u64,
    /// Timeout for write operations, milliseconds.
    pub write_timeout_ms: u64,
    /// Retry attempts for transient failures.
    pub max_retries: u32,
    /// Consecutive transient failures before the breaker opens.
    pub breaker_threshold: u32,
    /// Breaker cooldown before a probe is allowed, milliseconds.
    pub breaker_cooldown_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8787".to_string(),
            chain_id: "intent-chain".to_string(),
            read_timeout_ms: 10_000,
            write_timeout_ms: 15_000,
            max_retries: 3,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

/// Mediator key material, hex-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub public_key: String,
    pub private_key: String,
}

/// Negotiation LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: String,
    pub model: String,
    /// Override for tests and proxies; provider default when absent.
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            api_key: String::new(),
            model: "claude-sonnet-4-5".to_string(),
            base_url: None,
            request_timeout_ms: 30_000,
            max_tokens: 2_048,
        }
    }
}

/// Embedding service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub api_key: String,
    pub model: String,
    /// Vector dimension; must match the persisted index.
    pub dimension: usize,
    /// Override for tests and proxies; provider default when absent.
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Openai,
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1_536,
            base_url: None,
            request_timeout_ms: 30_000,
        }
    }
}

/// Mediation policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediationConfig {
    /// Facilitation fee as a percentage of the settlement's estimated value.
    pub fee_percent: f64,
    /// Window within which both parties must accept.
    pub acceptance_window_hours: u64,
    pub ingest_period_ms: u64,
    pub cycle_period_ms: u64,
    pub monitor_period_ms: u64,
    /// Minimum negotiation confidence for a settlement to be submitted.
    pub min_confidence: f64,
    /// Minimum cosine similarity for a candidate pair.
    pub min_similarity: f64,
    /// Candidate pairs negotiated per cycle.
    pub max_per_cycle: usize,
    /// Candidate pool size handed to the negotiation stage.
    pub top_k: usize,
    /// LLM calls allowed per cycle.
    pub max_llm_calls_per_cycle: usize,
    /// Wall-clock budget for one cycle, milliseconds.
    pub cycle_budget_ms: u64,
    pub challenges_enabled: bool,
    /// Minimum contradiction confidence before a challenge is submitted.
    pub min_challenge_confidence: f64,
    /// Foreign settlements scanned per monitor tick.
    pub challenge_scan_limit: usize,
    /// Drain deadline on shutdown, milliseconds.
    pub shutdown_deadline_ms: u64,
    /// Refuses the fallback embedder and other development affordances.
    pub production: bool,
}

impl Default for MediationConfig {
    fn default() -> Self {
        Self {
            fee_percent: 5.0,
            acceptance_window_hours: 72,
            ingest_period_ms: 10_000,
            cycle_period_ms: 30_000,
            monitor_period_ms: 60_000,
            min_confidence: 0.6,
            min_similarity: 0.5,
            max_per_cycle: 3,
            top_k: 20,
            max_llm_calls_per_cycle: 8,
            cycle_budget_ms: 120_000,
            challenges_enabled: true,
            min_challenge_confidence: 0.8,
            challenge_scan_limit: 25,
            shutdown_deadline_ms: 10_000,
            production: true,
        }
    }
}

/// On-disk state locations and cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the persisted state layout (`vectors/`, `reputation.json`).
    pub data_dir: PathBuf,
    /// Bounded size of the pending-intent cache.
    pub max_cached_intents: usize,
    /// Capacity hint for the vector index.
    pub max_index_elements: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./mediator-data"),
            max_cached_intents: 10_000,
            max_index_elements: 50_000,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediatorConfig {
    pub chain: ChainConfig,
    pub identity: IdentityConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub mediation: MediationConfig,
    pub storage: StorageConfig,
    pub log_level: String,
}

impl MediatorConfig {
    /// Load defaults and apply `MEDIATOR_*` environment overrides.
    pub fn from_env() -> MediatorResult<Self> {
        let mut config = Self {
            log_level: "info".to_string(),
            ..Self::default()
        };

        if let Ok(val) = std::env::var("MEDIATOR_CHAIN_ENDPOINT") {
            config.chain.endpoint = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_CHAIN_ID") {
            config.chain.chain_id = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_PUBLIC_KEY") {
            config.identity.public_key = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_PRIVATE_KEY") {
            config.identity.private_key = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_LLM_PROVIDER") {
            config.llm.provider = LlmProvider::parse(&val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_LLM_API_KEY") {
            config.llm.api_key = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_LLM_MODEL") {
            config.llm.model = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_EMBEDDING_PROVIDER") {
            config.embedding.provider = EmbeddingProvider::parse(&val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_EMBEDDING_API_KEY") {
            config.embedding.api_key = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_EMBEDDING_MODEL") {
            config.embedding.model = val;
        }
        if let Ok(val) = std::env::var("MEDIATOR_EMBEDDING_DIMENSION") {
            config.embedding.dimension = parse_env("MEDIATOR_EMBEDDING_DIMENSION", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_FEE_PERCENT") {
            config.mediation.fee_percent = parse_env("MEDIATOR_FEE_PERCENT", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_ACCEPTANCE_WINDOW_HOURS") {
            config.mediation.acceptance_window_hours =
                parse_env("MEDIATOR_ACCEPTANCE_WINDOW_HOURS", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_INGEST_PERIOD_MS") {
            config.mediation.ingest_period_ms = parse_env("MEDIATOR_INGEST_PERIOD_MS", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_CYCLE_PERIOD_MS") {
            config.mediation.cycle_period_ms = parse_env("MEDIATOR_CYCLE_PERIOD_MS", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_MONITOR_PERIOD_MS") {
            config.mediation.monitor_period_ms = parse_env("MEDIATOR_MONITOR_PERIOD_MS", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_MIN_CONFIDENCE") {
            config.mediation.min_confidence = parse_env("MEDIATOR_MIN_CONFIDENCE", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_MIN_SIMILARITY") {
            config.mediation.min_similarity = parse_env("MEDIATOR_MIN_SIMILARITY", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_MAX_PER_CYCLE") {
            config.mediation.max_per_cycle = parse_env("MEDIATOR_MAX_PER_CYCLE", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_CHALLENGES_ENABLED") {
            config.mediation.challenges_enabled = parse_env("MEDIATOR_CHALLENGES_ENABLED", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_MIN_CHALLENGE_CONFIDENCE") {
            config.mediation.min_challenge_confidence =
                parse_env("MEDIATOR_MIN_CHALLENGE_CONFIDENCE", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MEDIATOR_MAX_CACHED_INTENTS") {
            config.storage.max_cached_intents = parse_env("MEDIATOR_MAX_CACHED_INTENTS", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_PRODUCTION") {
            config.mediation.production = parse_env("MEDIATOR_PRODUCTION", &val)?;
        }
        if let Ok(val) = std::env::var("MEDIATOR_LOG_LEVEL") {
            config.log_level = val;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MediatorResult<()> {
        if self.chain.endpoint.is_empty() {
            return Err(MediatorError::Config("chain endpoint is empty".into()));
        }
        if !(0.0..=100.0).contains(&self.mediation.fee_percent) {
            return Err(MediatorError::Config(format!(
                "fee percent {} outside 0..=100",
                self.mediation.fee_percent
            )));
        }
        for (name, value) in [
            ("min confidence", self.mediation.min_confidence),
            ("min similarity", self.mediation.min_similarity),
            (
                "min challenge confidence",
                self.mediation.min_challenge_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MediatorError::Config(format!(
                    "{name} {value} outside 0..=1"
                )));
            }
        }
        if self.embedding.dimension == 0 {
            return Err(MediatorError::Config("embedding dimension is zero".into()));
        }
        if self.mediation.acceptance_window_hours == 0 {
            return Err(MediatorError::Config("acceptance window is zero".into()));
        }
        if self.mediation.max_per_cycle == 0 || self.mediation.top_k == 0 {
            return Err(MediatorError::Config(
                "candidate limits must be positive".into(),
            ));
        }
        if self.storage.max_cached_intents == 0 {
            return Err(MediatorError::Config("intent cache bound is zero".into()));
        }
        if self.mediation.production && self.embedding.provider == EmbeddingProvider::Fallback {
            return Err(MediatorError::Config(
                "fallback embedding provider is not allowed in production".into(),
            ));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !self.log_level.is_empty() && !valid_levels.contains(&self.log_level.as_str()) {
            return Err(MediatorError::Config(format!(
                "invalid log level: {}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Acceptance window in milliseconds.
    pub fn acceptance_window_ms(&self) -> i64 {
        self.mediation.acceptance_window_hours as i64 * 3_600_000
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> MediatorResult<T> {
    value
        .parse()
        .map_err(|_| MediatorError::Config(format!("cannot parse {key}='{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut config = MediatorConfig::default();
        config.log_level = "info".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn fee_percent_bounds() {
        let mut config = MediatorConfig::default();
        config.mediation.fee_percent = 101.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn confidence_bounds() {
        let mut config = MediatorConfig::default();
        config.mediation.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_refuses_fallback_embeddings() {
        let mut config = MediatorConfig::default();
        config.embedding.provider = EmbeddingProvider::Fallback;
        config.mediation.production = true;
        assert!(config.validate().is_err());

        config.mediation.production = false;
        config.validate().unwrap();
    }

    #[test]
    fn provider_parsing() {
        assert_eq!(LlmProvider::parse("Anthropic").unwrap(), LlmProvider::Anthropic);
        assert!(LlmProvider::parse("gemini").is_err());
        assert_eq!(
            EmbeddingProvider::parse("voyage").unwrap(),
            EmbeddingProvider::Voyage
        );
        assert!(EmbeddingProvider::parse("local").is_err());
    }

    #[test]
    fn acceptance_window_conversion() {
        let config = MediatorConfig::default();
        assert_eq!(config.acceptance_window_ms(), 72 * 3_600_000);
    }
}
