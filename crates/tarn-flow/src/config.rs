//! Orchestration configuration.
//!
//! All tunable bounds live in an explicit [`FlowConfig`] threaded through
//! constructors; nothing in this crate reads process-wide mutable state.

use std::time::Duration;

/// Configuration for the orchestration engine.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Maximum number of declared steps in one chain.
    ///
    /// Oversized chains are rejected at validation, before any mutation.
    pub max_chain_steps: usize,

    /// Maximum number of lookup instructions per request.
    pub max_lookup_fanout: usize,

    /// TTL on the per-chain coordination mutex.
    ///
    /// A crashed holder's mutex becomes acquirable once this expires; there
    /// is no other release path besides explicit deletion by the holder.
    pub mutex_ttl: Duration,

    /// Maximum tokens requested from the model validator per classification.
    pub validation_max_tokens: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_chain_steps: 50,
            max_lookup_fanout: 20,
            mutex_ttl: Duration::from_secs(30),
            validation_max_tokens: 100,
        }
    }
}
