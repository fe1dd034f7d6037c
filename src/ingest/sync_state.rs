//! Per-chain sync state: the single source of truth for progress, status,
//! and error budgets.
//!
//! All mutations go through this tracker and are serialized by the per-chain
//! worker; every write is mirrored to the database as a conditional upsert so
//! checkpoints survive restarts. PAUSED is sticky: only an explicit resume
//! clears it.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::params;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::IngestError;
use crate::models::{ChainStatus, ChainSyncState, NetworkId};
use crate::store::db::Db;

/// Consecutive failures that auto-pause a chain.
const AUTO_PAUSE_THRESHOLD: u32 = 5;
/// Windowed errors that demote an OK chain to DEGRADED.
const DEGRADE_ERROR_THRESHOLD: u32 = 10;
/// Lag bands for status recomputation after a successful window.
const LAG_ERROR: u64 = 500;
const LAG_DEGRADED: u64 = 100;

pub struct ChainSyncTracker {
    db: Db,
    states: RwLock<HashMap<NetworkId, ChainSyncState>>,
    ema_alpha: f64,
}

impl ChainSyncTracker {
    pub fn new(db: Db, ema_alpha: f64) -> Self {
        Self {
            db,
            states: RwLock::new(HashMap::new()),
            ema_alpha,
        }
    }

    /// Load persisted checkpoints, creating rows for chains seen for the
    /// first time.
    pub fn init_all(&self, start_blocks: &HashMap<NetworkId, u64>) -> Result<()> {
        let mut states = self.states.write();
        for (&chain, &start_block) in start_blocks {
            let state = match self.load(chain)? {
                Some(existing) => {
                    info!(
                        chain = %chain,
                        checkpoint = existing.last_synced_block,
                        status = existing.status.as_str(),
                        "resuming from persisted checkpoint"
                    );
                    existing
                }
                None => {
                    let fresh = ChainSyncState::new(chain, start_block);
                    self.persist(&fresh)?;
                    fresh
                }
            };
            states.insert(chain, state);
        }
        Ok(())
    }

    pub fn get(&self, chain: NetworkId) -> Result<ChainSyncState, IngestError> {
        self.states
            .read()
            .get(&chain)
            .cloned()
            .ok_or_else(|| IngestError::UnknownChain(chain.as_str().to_string()))
    }

    pub fn all(&self) -> Vec<ChainSyncState> {
        let mut all: Vec<ChainSyncState> = self.states.read().values().cloned().collect();
        all.sort_by_key(|s| s.chain.as_str());
        all
    }

    pub fn update_head(&self, chain: NetworkId, head: u64) -> Result<(), IngestError> {
        self.mutate(chain, |state| {
            if head > state.last_head_block {
                state.last_head_block = head;
            }
        })
    }

    /// Advance the checkpoint after a committed window.
    pub fn on_success(
        &self,
        chain: NetworkId,
        from_block: u64,
        to_block: u64,
        head: u64,
        events: usize,
        latency_ms: f64,
    ) -> Result<ChainSyncState, IngestError> {
        let alpha = self.ema_alpha;
        self.mutate(chain, |state| {
            debug_assert!(to_block >= from_block);
            if to_block > state.last_synced_block {
                state.last_synced_block = to_block;
            }
            if head > state.last_head_block {
                state.last_head_block = head;
            }

            let blocks = (to_block - from_block + 1) as f64;
            let events_per_block = events as f64 / blocks;
            state.avg_events_per_block = ema(state.avg_events_per_block, events_per_block, alpha);
            state.avg_latency_ms = ema(state.avg_latency_ms, latency_ms, alpha);

            state.total_events_ingested += events as u64;
            state.consecutive_errors = 0;
            state.last_success_at = Some(Utc::now().timestamp());

            if state.status != ChainStatus::Paused {
                state.status = status_for_lag(state.lag());
                if state.status == ChainStatus::Ok {
                    state.pause_reason = None;
                }
            }
        })?;
        self.get(chain)
    }

    /// Record a transient failure. Returns true when the chain crossed the
    /// consecutive-error threshold and was auto-paused.
    pub fn on_error(&self, chain: NetworkId, error: &str) -> Result<bool, IngestError> {
        let mut should_pause = false;
        self.mutate(chain, |state| {
            state.error_count += 1;
            state.consecutive_errors += 1;
            state.last_error = Some(error.to_string());
            state.last_error_at = Some(Utc::now().timestamp());

            if state.consecutive_errors >= AUTO_PAUSE_THRESHOLD {
                state.status = ChainStatus::Paused;
                state.pause_reason = Some(format!(
                    "auto-paused after {} consecutive errors: {}",
                    state.consecutive_errors, error
                ));
                should_pause = true;
            } else if state.error_count >= DEGRADE_ERROR_THRESHOLD
                && state.status == ChainStatus::Ok
            {
                state.status = ChainStatus::Degraded;
            }
        })?;
        if should_pause {
            warn!(chain = %chain, error, "chain auto-paused");
        }
        Ok(should_pause)
    }

    pub fn pause(&self, chain: NetworkId, reason: &str) -> Result<(), IngestError> {
        info!(chain = %chain, reason, "chain paused");
        self.mutate(chain, |state| {
            state.status = ChainStatus::Paused;
            state.pause_reason = Some(reason.to_string());
        })
    }

    /// Explicit resume; the only way out of PAUSED.
    pub fn resume(&self, chain: NetworkId) -> Result<(), IngestError> {
        info!(chain = %chain, "chain resumed");
        self.mutate(chain, |state| {
            state.consecutive_errors = 0;
            state.pause_reason = None;
            state.status = status_for_lag(state.lag());
        })
    }

    /// Operator reset after a gap/overlap escalation or a re-index.
    pub fn reset(&self, chain: NetworkId, new_start: u64) -> Result<(), IngestError> {
        warn!(chain = %chain, new_start, "chain checkpoint reset");
        self.mutate(chain, |state| {
            state.last_synced_block = new_start;
            state.error_count = 0;
            state.consecutive_errors = 0;
            state.status = ChainStatus::Ok;
            state.pause_reason = None;
            state.last_error = None;
        })
    }

    /// Mark a fatal continuity violation. Requires an operator reset.
    pub fn mark_error(&self, chain: NetworkId, error: &str) -> Result<(), IngestError> {
        warn!(chain = %chain, error, "chain marked ERROR");
        self.mutate(chain, |state| {
            state.status = ChainStatus::Error;
            state.last_error = Some(error.to_string());
            state.last_error_at = Some(Utc::now().timestamp());
        })
    }

    /// Rolling error window: zero the windowed counter, leave the
    /// consecutive streak untouched.
    pub fn reset_error_counts(&self) {
        let chains: Vec<NetworkId> = self.states.read().keys().copied().collect();
        for chain in chains {
            let _ = self.mutate(chain, |state| {
                state.error_count = 0;
            });
        }
    }

    fn mutate<F>(&self, chain: NetworkId, f: F) -> Result<(), IngestError>
    where
        F: FnOnce(&mut ChainSyncState),
    {
        let snapshot = {
            let mut states = self.states.write();
            let state = states
                .get_mut(&chain)
                .ok_or_else(|| IngestError::UnknownChain(chain.as_str().to_string()))?;
            f(state);
            state.clone()
        };
        self.persist(&snapshot)
            .map_err(|e| IngestError::Store(e.to_string()))
    }

    fn persist(&self, state: &ChainSyncState) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO chain_sync_state (
                chain, last_synced_block, last_head_block, status, pause_reason,
                error_count, consecutive_errors, last_error, last_error_at,
                last_success_at, total_events_ingested, avg_events_per_block, avg_latency_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(chain) DO UPDATE SET
                last_synced_block = excluded.last_synced_block,
                last_head_block = excluded.last_head_block,
                status = excluded.status,
                pause_reason = excluded.pause_reason,
                error_count = excluded.error_count,
                consecutive_errors = excluded.consecutive_errors,
                last_error = excluded.last_error,
                last_error_at = excluded.last_error_at,
                last_success_at = excluded.last_success_at,
                total_events_ingested = excluded.total_events_ingested,
                avg_events_per_block = excluded.avg_events_per_block,
                avg_latency_ms = excluded.avg_latency_ms",
            params![
                state.chain.as_str(),
                state.last_synced_block,
                state.last_head_block,
                state.status.as_str(),
                state.pause_reason,
                state.error_count,
                state.consecutive_errors,
                state.last_error,
                state.last_error_at,
                state.last_success_at,
                state.total_events_ingested,
                state.avg_events_per_block,
                state.avg_latency_ms,
            ],
        )
        .context("persist chain sync state")?;
        Ok(())
    }

    fn load(&self, chain: NetworkId) -> Result<Option<ChainSyncState>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT last_synced_block, last_head_block, status, pause_reason,
                    error_count, consecutive_errors, last_error, last_error_at,
                    last_success_at, total_events_ingested, avg_events_per_block,
                    avg_latency_ms
             FROM chain_sync_state WHERE chain = ?1",
        )?;
        let state = stmt
            .query_row([chain.as_str()], |row| {
                let status_tag: String = row.get(2)?;
                Ok(ChainSyncState {
                    chain,
                    last_synced_block: row.get::<_, i64>(0)? as u64,
                    last_head_block: row.get::<_, i64>(1)? as u64,
                    status: ChainStatus::from_tag(&status_tag).unwrap_or(ChainStatus::Ok),
                    pause_reason: row.get(3)?,
                    error_count: row.get(4)?,
                    consecutive_errors: row.get(5)?,
                    last_error: row.get(6)?,
                    last_error_at: row.get(7)?,
                    last_success_at: row.get(8)?,
                    total_events_ingested: row.get::<_, i64>(9)? as u64,
                    avg_events_per_block: row.get(10)?,
                    avg_latency_ms: row.get(11)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(state)
    }
}

fn ema(prev: f64, sample: f64, alpha: f64) -> f64 {
    if prev == 0.0 {
        sample
    } else {
        alpha * sample + (1.0 - alpha) * prev
    }
}

fn status_for_lag(lag: u64) -> ChainStatus {
    if lag > LAG_ERROR {
        ChainStatus::Error
    } else if lag > LAG_DEGRADED {
        ChainStatus::Degraded
    } else {
        ChainStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(chain: NetworkId, start: u64) -> ChainSyncTracker {
        let tracker = ChainSyncTracker::new(Db::open_in_memory().unwrap(), 0.2);
        tracker
            .init_all(&HashMap::from([(chain, start)]))
            .unwrap();
        tracker
    }

    #[test]
    fn successful_window_advances_and_clears_streak() {
        let tracker = tracker_with(NetworkId::Eth, 1_000);
        tracker.on_error(NetworkId::Eth, "blip").unwrap();

        let state = tracker
            .on_success(NetworkId::Eth, 1_001, 1_500, 1_800, 250, 420.0)
            .unwrap();
        assert_eq!(state.last_synced_block, 1_500);
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(state.status, ChainStatus::Ok);
        assert_eq!(state.total_events_ingested, 250);
        assert!(state.avg_events_per_block > 0.0);
    }

    #[test]
    fn lag_drives_degraded_and_recovers() {
        let tracker = tracker_with(NetworkId::Eth, 1_000);
        // Caught up: lag 0 after the window.
        let s = tracker
            .on_success(NetworkId::Eth, 1_001, 1_195, 1_195, 10, 100.0)
            .unwrap();
        assert_eq!(s.status, ChainStatus::Ok);

        // Head jumps; a small window leaves lag above the degraded band.
        tracker.update_head(NetworkId::Eth, 1_305).unwrap();
        let s = tracker
            .on_success(NetworkId::Eth, 1_196, 1_200, 1_305, 0, 100.0)
            .unwrap();
        assert_eq!(s.lag(), 105);
        assert_eq!(s.status, ChainStatus::Degraded);

        // Catch back up.
        let s = tracker
            .on_success(NetworkId::Eth, 1_201, 1_305, 1_305, 5, 100.0)
            .unwrap();
        assert_eq!(s.status, ChainStatus::Ok);
    }

    #[test]
    fn five_consecutive_errors_auto_pause() {
        let tracker = tracker_with(NetworkId::Base, 100);
        for i in 0..4 {
            assert!(!tracker.on_error(NetworkId::Base, "rpc down").unwrap(), "{i}");
        }
        assert!(tracker.on_error(NetworkId::Base, "rpc down").unwrap());

        let state = tracker.get(NetworkId::Base).unwrap();
        assert_eq!(state.status, ChainStatus::Paused);
        assert!(state.pause_reason.as_deref().unwrap().contains("rpc down"));

        // Paused is sticky across successes.
        tracker
            .on_success(NetworkId::Base, 101, 110, 120, 1, 10.0)
            .unwrap();
        assert_eq!(tracker.get(NetworkId::Base).unwrap().status, ChainStatus::Paused);

        tracker.resume(NetworkId::Base).unwrap();
        let state = tracker.get(NetworkId::Base).unwrap();
        assert_ne!(state.status, ChainStatus::Paused);
        assert_eq!(state.consecutive_errors, 0);
    }

    #[test]
    fn windowed_errors_degrade_without_pausing() {
        let tracker = tracker_with(NetworkId::Op, 0);
        for _ in 0..3 {
            tracker.on_error(NetworkId::Op, "e").unwrap();
            // A success between failures keeps the streak short.
            tracker.on_success(NetworkId::Op, 1, 1, 1, 0, 1.0).unwrap();
        }
        for _ in 0..4 {
            tracker.on_error(NetworkId::Op, "e").unwrap();
            tracker.on_success(NetworkId::Op, 1, 1, 1, 0, 1.0).unwrap();
        }
        for _ in 0..3 {
            tracker.on_error(NetworkId::Op, "e").unwrap();
        }
        let state = tracker.get(NetworkId::Op).unwrap();
        assert_eq!(state.error_count, 10);
        assert_eq!(state.status, ChainStatus::Degraded);
        assert_ne!(state.status, ChainStatus::Paused);
    }

    #[test]
    fn rolling_reset_clears_window_but_not_streak() {
        let tracker = tracker_with(NetworkId::Arb, 0);
        tracker.on_error(NetworkId::Arb, "e").unwrap();
        tracker.on_error(NetworkId::Arb, "e").unwrap();
        tracker.reset_error_counts();
        let state = tracker.get(NetworkId::Arb).unwrap();
        assert_eq!(state.error_count, 0);
        assert_eq!(state.consecutive_errors, 2);
    }

    #[test]
    fn unknown_chain_is_typed() {
        let tracker = tracker_with(NetworkId::Eth, 0);
        assert!(matches!(
            tracker.get(NetworkId::Linea),
            Err(IngestError::UnknownChain(_))
        ));
    }

    #[test]
    fn checkpoints_survive_reload() {
        let db = Db::open_in_memory().unwrap();
        let tracker = ChainSyncTracker::new(db.clone(), 0.2);
        tracker
            .init_all(&HashMap::from([(NetworkId::Eth, 1_000)]))
            .unwrap();
        tracker
            .on_success(NetworkId::Eth, 1_001, 1_500, 1_800, 42, 100.0)
            .unwrap();

        let reloaded = ChainSyncTracker::new(db, 0.2);
        reloaded
            .init_all(&HashMap::from([(NetworkId::Eth, 0)]))
            .unwrap();
        let state = reloaded.get(NetworkId::Eth).unwrap();
        assert_eq!(state.last_synced_block, 1_500);
        assert_eq!(state.total_events_ingested, 42);
    }
}
