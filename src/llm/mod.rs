//! LLM-facing facades: sanitisation, chat/embedding clients, the embedder
//! and the negotiator.

pub mod client;
pub mod embedder;
pub mod negotiator;
pub mod sanitize;

pub use client::{ChatClient, ChatOutcome, EmbeddingClient, LlmUsage};
pub use embedder::Embedder;
pub use negotiator::{
    integrity_hash, ContradictionAnalysis, NegotiationOutcome, NegotiationProposal, Negotiator,
    NEGOTIATION_TEMPLATE_VERSION, VERIFICATION_TEMPLATE_VERSION,
};
