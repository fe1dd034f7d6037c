//! Ingestion health rollups.
//!
//! Pure computation over sync-state snapshots: per-chain lag, minutes since
//! the last successful window, and an error-rate proxy, mapped through fixed
//! warning/critical thresholds. Alert transport is external; this module
//! only produces the tuples and logs them.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

use crate::ingest::sync_state::ChainSyncTracker;
use crate::models::{ChainSyncState, NetworkId};

const LAG_WARNING: u64 = 50;
const LAG_CRITICAL: u64 = 200;
const MINUTES_WARNING: f64 = 5.0;
const MINUTES_CRITICAL: f64 = 15.0;
const ERROR_RATE_WARNING: f64 = 0.10;
const ERROR_RATE_CRITICAL: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub chain: NetworkId,
    pub message: String,
    pub metric: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainHealth {
    pub chain: NetworkId,
    pub level: HealthLevel,
    pub lag: u64,
    pub minutes_since_sync: Option<f64>,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthLevel,
    pub computed_at: i64,
    pub chains: Vec<ChainHealth>,
    pub alerts: Vec<Alert>,
}

/// Compute the rollup for a set of chain states at `now`.
pub fn compute_health(states: &[ChainSyncState], now: i64) -> HealthReport {
    let mut chains = Vec::with_capacity(states.len());
    let mut alerts = Vec::new();

    for state in states {
        let initialized = state.last_success_at.is_some() || state.total_events_ingested > 0;
        if !initialized {
            chains.push(ChainHealth {
                chain: state.chain,
                level: HealthLevel::Unknown,
                lag: state.lag(),
                minutes_since_sync: None,
                error_rate: 0.0,
            });
            continue;
        }

        let lag = state.lag();
        let minutes_since_sync = state
            .last_success_at
            .map(|ts| ((now - ts).max(0) as f64) / 60.0);
        let error_rate = (state.consecutive_errors as f64 / 10.0).min(1.0);

        let mut level = HealthLevel::Healthy;
        let mut push_alert = |severity: Severity, metric: &'static str, value: f64, msg: String| {
            alerts.push(Alert {
                severity,
                chain: state.chain,
                message: msg,
                metric,
                value,
            });
        };

        if lag >= LAG_CRITICAL {
            level = HealthLevel::Critical;
            push_alert(
                Severity::Critical,
                "lag",
                lag as f64,
                format!("{} lag {} blocks", state.chain, lag),
            );
        } else if lag >= LAG_WARNING {
            level = HealthLevel::Warning;
            push_alert(
                Severity::Warning,
                "lag",
                lag as f64,
                format!("{} lag {} blocks", state.chain, lag),
            );
        }

        if let Some(minutes) = minutes_since_sync {
            if minutes >= MINUTES_CRITICAL {
                level = HealthLevel::Critical;
                push_alert(
                    Severity::Critical,
                    "minutes_since_sync",
                    minutes,
                    format!("{} last synced {minutes:.1} minutes ago", state.chain),
                );
            } else if minutes >= MINUTES_WARNING {
                if level == HealthLevel::Healthy {
                    level = HealthLevel::Warning;
                }
                push_alert(
                    Severity::Warning,
                    "minutes_since_sync",
                    minutes,
                    format!("{} last synced {minutes:.1} minutes ago", state.chain),
                );
            }
        }

        if error_rate >= ERROR_RATE_CRITICAL {
            level = HealthLevel::Critical;
            push_alert(
                Severity::Critical,
                "error_rate",
                error_rate,
                format!("{} error rate {error_rate:.2}", state.chain),
            );
        } else if error_rate >= ERROR_RATE_WARNING {
            if level == HealthLevel::Healthy {
                level = HealthLevel::Warning;
            }
            push_alert(
                Severity::Warning,
                "error_rate",
                error_rate,
                format!("{} error rate {error_rate:.2}", state.chain),
            );
        }

        chains.push(ChainHealth {
            chain: state.chain,
            level,
            lag,
            minutes_since_sync,
            error_rate,
        });
    }

    let overall = if chains.is_empty() || chains.iter().all(|c| c.level == HealthLevel::Unknown) {
        if chains.is_empty() {
            HealthLevel::Healthy
        } else {
            HealthLevel::Unknown
        }
    } else if chains.iter().any(|c| c.level == HealthLevel::Critical) {
        HealthLevel::Critical
    } else if chains.iter().any(|c| c.level == HealthLevel::Warning) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    };

    HealthReport {
        overall,
        computed_at: now,
        chains,
        alerts,
    }
}

/// Holds the latest report for readers; refreshed by the scheduler.
pub struct HealthMonitor {
    tracker: Arc<ChainSyncTracker>,
    latest: RwLock<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(tracker: Arc<ChainSyncTracker>) -> Self {
        Self {
            tracker,
            latest: RwLock::new(None),
        }
    }

    pub fn refresh(&self) -> HealthReport {
        let report = compute_health(&self.tracker.all(), Utc::now().timestamp());
        for alert in &report.alerts {
            match alert.severity {
                Severity::Critical => error!(
                    chain = %alert.chain,
                    metric = alert.metric,
                    value = alert.value,
                    "{}",
                    alert.message
                ),
                Severity::Warning => warn!(
                    chain = %alert.chain,
                    metric = alert.metric,
                    value = alert.value,
                    "{}",
                    alert.message
                ),
            }
        }
        *self.latest.write() = Some(report.clone());
        report
    }

    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChainSyncState;

    fn synced_state(chain: NetworkId, synced: u64, head: u64, now: i64) -> ChainSyncState {
        let mut s = ChainSyncState::new(chain, synced);
        s.last_head_block = head;
        s.last_success_at = Some(now);
        s.total_events_ingested = 1;
        s
    }

    #[test]
    fn uninitialized_chains_roll_up_unknown() {
        let states = vec![
            ChainSyncState::new(NetworkId::Eth, 0),
            ChainSyncState::new(NetworkId::Base, 0),
        ];
        let report = compute_health(&states, 1_000);
        assert_eq!(report.overall, HealthLevel::Unknown);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn big_lag_is_critical() {
        let now = 1_700_000_000;
        let states = vec![
            synced_state(NetworkId::Eth, 1_000, 1_600, now),
            synced_state(NetworkId::Base, 500, 505, now),
        ];
        let report = compute_health(&states, now);
        assert_eq!(report.overall, HealthLevel::Critical);
        let alert = report
            .alerts
            .iter()
            .find(|a| a.chain == NetworkId::Eth && a.metric == "lag")
            .unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.value, 600.0);
    }

    #[test]
    fn warning_band_and_healthy_chains() {
        let now = 1_700_000_000;
        let states = vec![
            synced_state(NetworkId::Eth, 1_000, 1_060, now),
            synced_state(NetworkId::Op, 500, 505, now),
        ];
        let report = compute_health(&states, now);
        assert_eq!(report.overall, HealthLevel::Warning);
        let eth = report
            .chains
            .iter()
            .find(|c| c.chain == NetworkId::Eth)
            .unwrap();
        assert_eq!(eth.level, HealthLevel::Warning);
        let op = report
            .chains
            .iter()
            .find(|c| c.chain == NetworkId::Op)
            .unwrap();
        assert_eq!(op.level, HealthLevel::Healthy);
    }

    #[test]
    fn stale_sync_and_error_streaks_alert() {
        let now = 1_700_000_000;
        let mut stale = synced_state(NetworkId::Arb, 100, 101, now - 20 * 60);
        // One consecutive error proxies to rate 0.10: warning band, not critical.
        stale.consecutive_errors = 1;
        let report = compute_health(&[stale], now);
        assert_eq!(report.overall, HealthLevel::Critical);
        assert!(report
            .alerts
            .iter()
            .any(|a| a.metric == "minutes_since_sync" && a.severity == Severity::Critical));
        assert!(report
            .alerts
            .iter()
            .any(|a| a.metric == "error_rate" && a.severity == Severity::Warning));

        // Three consecutive errors proxy to 0.30 and cross the critical band.
        let mut erroring = synced_state(NetworkId::Arb, 100, 101, now);
        erroring.consecutive_errors = 3;
        let report = compute_health(&[erroring], now);
        assert!(report
            .alerts
            .iter()
            .any(|a| a.metric == "error_rate" && a.severity == Severity::Critical));
    }
}
