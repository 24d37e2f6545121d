//! Ledger access: wire formats, resilience guards and the adapter.

pub mod adapter;
pub mod resilience;
pub mod wire;

pub use adapter::{client_token, ChainAdapter};
pub use resilience::{CircuitBreaker, CircuitState, RetryPolicy};
pub use wire::{EntryKind, SettlementStatusReport};
