//! Deterministic block window planning.
//!
//! Windows always start at `last_synced_block + 1` and never reach past the
//! reorg-buffered head. The validator re-checks continuity right before a
//! fetch; a failure there is fatal for the chain, not a transient error.

use crate::error::IngestError;
use crate::models::{BlockWindow, ChainSyncState, NetworkId, WindowReason};

/// Blocks held back from the head for reorg safety.
pub const HEAD_BUFFER: u64 = 5;
/// Adaptive sizing never shrinks a window below this.
pub const MIN_WINDOW: u64 = 10;

/// Catch-up classification, in multiples of the chain's window size.
const CATCHUP_FACTOR: u64 = 3;
const BACKFILL_FACTOR: u64 = 10;

/// Adaptive shrink thresholds.
const ERROR_RATE_SOFT: f64 = 0.05;
const ERROR_RATE_HARD: f64 = 0.10;
const LATENCY_SOFT_MS: f64 = 5_000.0;
const LATENCY_HARD_MS: f64 = 10_000.0;

/// Plan the next window, or None when the chain is caught up to the safe
/// head.
pub fn next_window(
    state: &ChainSyncState,
    current_head: u64,
    override_size: Option<u64>,
) -> Option<BlockWindow> {
    let safe_head = current_head.saturating_sub(HEAD_BUFFER);
    if state.last_synced_block >= safe_head {
        return None;
    }

    let max_window = override_size
        .unwrap_or_else(|| state.chain.default_window_size())
        .max(1);
    let lag = safe_head - state.last_synced_block;

    let from_block = state.last_synced_block + 1;
    let to_block = (from_block + max_window - 1).min(safe_head);

    let reason = if lag > BACKFILL_FACTOR * max_window {
        WindowReason::Backfill
    } else if lag > CATCHUP_FACTOR * max_window {
        WindowReason::Catchup
    } else if state.consecutive_errors > 0 {
        WindowReason::Recovery
    } else {
        WindowReason::Normal
    };

    Some(BlockWindow {
        chain: state.chain,
        from_block,
        to_block,
        window_size: to_block - from_block + 1,
        reason,
        target_head: safe_head,
        lag_after_window: safe_head - to_block,
    })
}

/// Reject any window that would gap or overlap the checkpoint. The
/// orchestrator must never submit a window that fails this.
pub fn validate(window: &BlockWindow, state: &ChainSyncState) -> Result<(), IngestError> {
    if window.from_block == 0 || window.to_block < window.from_block {
        return Err(IngestError::GapOrOverlap {
            network: window.chain,
            from_block: window.from_block,
            to_block: window.to_block,
            last_synced_block: state.last_synced_block,
        });
    }
    if window.from_block != state.last_synced_block + 1 {
        return Err(IngestError::GapOrOverlap {
            network: window.chain,
            from_block: window.from_block,
            to_block: window.to_block,
            last_synced_block: state.last_synced_block,
        });
    }
    Ok(())
}

/// Shrink the next window while a chain is erroring or slow: 25% off past
/// the soft thresholds, 50% past the hard ones, floored at `MIN_WINDOW`.
pub fn optimal_size(
    chain: NetworkId,
    error_rate: f64,
    latency_ms: f64,
    override_size: Option<u64>,
) -> u64 {
    let base = override_size.unwrap_or_else(|| chain.default_window_size());
    let factor = if error_rate > ERROR_RATE_HARD || latency_ms > LATENCY_HARD_MS {
        0.5
    } else if error_rate > ERROR_RATE_SOFT || latency_ms > LATENCY_SOFT_MS {
        0.75
    } else {
        1.0
    };
    (((base as f64) * factor) as u64).max(MIN_WINDOW)
}
