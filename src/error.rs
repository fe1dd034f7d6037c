//! Error taxonomy for the ingestion pipeline.
//!
//! The orchestrator matches on kinds, never on message strings. Recoverable
//! kinds (rate limits, pool exhaustion, transient remote failures) are fully
//! handled inside the pool and the per-chain loop; everything else surfaces
//! as a chain status transition.

use crate::models::NetworkId;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Provider budget exhausted for the current minute. Yield, don't retry.
    #[error("rate limited by provider {provider} on {network}")]
    RateLimited {
        network: NetworkId,
        provider: String,
    },

    /// Every provider in the pool is cooling down or disabled.
    #[error("no selectable providers for {network}")]
    NoProviders { network: NetworkId },

    /// Remote call exceeded its per-provider deadline.
    #[error("rpc deadline exceeded for {network} via {provider}")]
    Timeout {
        network: NetworkId,
        provider: String,
    },

    /// Transient remote failure (5xx, connection reset, JSON-RPC error object).
    #[error("rpc error on {network}: {message}")]
    Rpc { network: NetworkId, message: String },

    /// A single log payload could not be decoded. Skipped, never fatal.
    #[error("unparseable log in tx {tx_hash}: {message}")]
    Parse { tx_hash: String, message: String },

    /// Planned window does not abut the sync checkpoint. Fatal for the chain
    /// until an operator reset.
    #[error("window [{from_block},{to_block}] breaks continuity on {network} (checkpoint {last_synced_block})")]
    GapOrOverlap {
        network: NetworkId,
        from_block: u64,
        to_block: u64,
        last_synced_block: u64,
    },

    /// Sync-state operation against a chain that was never initialized.
    #[error("unknown chain {0}")]
    UnknownChain(String),

    /// Persistence failure other than a duplicate key. Batch aborted.
    #[error("store error: {0}")]
    Store(String),
}

impl IngestError {
    /// True for kinds the per-chain loop absorbs with backoff instead of
    /// counting against the chain's error budget.
    pub fn is_budget_pressure(&self) -> bool {
        matches!(
            self,
            IngestError::RateLimited { .. } | IngestError::NoProviders { .. }
        )
    }

    /// True for kinds that count as a transient chain error (feeds the
    /// consecutive-error auto-pause).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Timeout { .. } | IngestError::Rpc { .. } | IngestError::Store(_)
        )
    }
}
