//! Periodic frozen views of the aggregated graph.
//!
//! Snapshots read only the materialized relation and node-analytics
//! collections, never the raw ledger, so "what the window looked like at
//! snapshot_at" is deterministic even while ingestion keeps writing. The
//! most recent `keep_count` snapshots are retained per window tier.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::db::Db;

/// Actors and edges captured per snapshot.
const ACTOR_CAP: usize = 100;
const EDGE_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotWindow {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl SnapshotWindow {
    pub const ALL: [SnapshotWindow; 3] = [
        SnapshotWindow::Day,
        SnapshotWindow::Week,
        SnapshotWindow::Month,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotWindow::Day => "24h",
            SnapshotWindow::Week => "7d",
            SnapshotWindow::Month => "30d",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            SnapshotWindow::Day => 86_400,
            SnapshotWindow::Week => 7 * 86_400,
            SnapshotWindow::Month => 30 * 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotActor {
    pub address: String,
    pub network: String,
    pub total_volume_usd: f64,
    pub net_flow_usd: f64,
    pub tx_count: u64,
    pub influence_score: f64,
    /// Short-horizon intensity: activity damped by staleness.
    pub burst_score: f64,
    pub participation_trend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub from: String,
    pub to: String,
    pub network: String,
    pub volume_usd: f64,
    pub confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub actor_count: usize,
    pub edge_count: usize,
    pub total_edge_volume_usd: f64,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub snapshot_id: String,
    pub window: SnapshotWindow,
    pub snapshot_at: i64,
    pub actors: Vec<SnapshotActor>,
    pub edges: Vec<SnapshotEdge>,
    pub stats: SnapshotStats,
}

pub struct SnapshotBuilder {
    db: Db,
    keep_count: usize,
}

impl SnapshotBuilder {
    pub fn new(db: Db, keep_count: usize) -> Self {
        Self {
            db,
            keep_count: keep_count.max(1),
        }
    }

    /// Materialize the current aggregated view for one window tier.
    pub fn build(&self, window: SnapshotWindow, now: i64) -> Result<SignalSnapshot> {
        let since = now - window.seconds();

        let actors = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT address, network, total_volume_usd, net_flow_usd, tx_count,
                        influence_score, activity_score, recency_score
                 FROM node_analytics
                 WHERE last_seen IS NOT NULL AND last_seen >= ?1
                 ORDER BY influence_score DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![since, ACTOR_CAP], |row| {
                let activity: f64 = row.get(6)?;
                let recency: f64 = row.get(7)?;
                Ok(SnapshotActor {
                    address: row.get(0)?,
                    network: row.get(1)?,
                    total_volume_usd: row.get(2)?,
                    net_flow_usd: row.get(3)?,
                    tx_count: row.get::<_, i64>(4)? as u64,
                    influence_score: row.get(5)?,
                    burst_score: (activity * recency).clamp(0.0, 1.0),
                    participation_trend: trend_for_recency(recency).to_string(),
                })
            })?;
            rows.filter_map(|r| r.ok()).collect::<Vec<_>>()
        };

        let edges = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT from_addr, to_addr, network, volume_usd, confidence, weight
                 FROM aggregated_relations
                 WHERE last_seen >= ?1
                 ORDER BY weight DESC, volume_usd DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![since, EDGE_CAP], |row| {
                Ok(SnapshotEdge {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    network: row.get(2)?,
                    volume_usd: row.get(3)?,
                    confidence: row.get(4)?,
                    weight: row.get(5)?,
                })
            })?;
            rows.filter_map(|r| r.ok()).collect::<Vec<_>>()
        };

        let total_edge_volume: f64 = edges.iter().map(|e| e.volume_usd).sum();
        let avg_confidence = if edges.is_empty() {
            0.0
        } else {
            edges.iter().map(|e| e.confidence).sum::<f64>() / edges.len() as f64
        };

        Ok(SignalSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            window,
            snapshot_at: now,
            stats: SnapshotStats {
                actor_count: actors.len(),
                edge_count: edges.len(),
                total_edge_volume_usd: total_edge_volume,
                avg_confidence,
            },
            actors,
            edges,
        })
    }

    /// Persist a snapshot and evict everything older than the retention
    /// count for its window.
    pub fn persist(&self, snapshot: &SignalSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot).context("serialize snapshot")?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO signal_snapshots (snapshot_id, window, snapshot_at, payload_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.snapshot_id,
                snapshot.window.as_str(),
                snapshot.snapshot_at,
                payload
            ],
        )?;
        conn.execute(
            "DELETE FROM signal_snapshots
             WHERE window = ?1 AND snapshot_id NOT IN (
                SELECT snapshot_id FROM signal_snapshots
                WHERE window = ?1
                ORDER BY snapshot_at DESC
                LIMIT ?2
             )",
            params![snapshot.window.as_str(), self.keep_count],
        )?;
        Ok(())
    }

    pub fn build_and_persist(&self, window: SnapshotWindow, now: i64) -> Result<SignalSnapshot> {
        let snapshot = self.build(window, now)?;
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    pub fn latest(&self, window: SnapshotWindow) -> Result<Option<SignalSnapshot>> {
        let conn = self.db.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM signal_snapshots
                 WHERE window = ?1 ORDER BY snapshot_at DESC LIMIT 1",
                [window.as_str()],
                |row| row.get(0),
            )
            .ok();
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn count(&self, window: SnapshotWindow) -> Result<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signal_snapshots WHERE window = ?1",
            [window.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn trend_for_recency(recency: f64) -> &'static str {
    if recency > 0.8 {
        "rising"
    } else if recency >= 0.4 {
        "flat"
    } else {
        "falling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_aggregates(db: &Db, now: i64) {
        let conn = db.lock();
        conn.execute(
            "INSERT INTO node_analytics (
                address, network, in_volume_usd, out_volume_usd, total_volume_usd,
                net_flow_usd, in_tx_count, out_tx_count, tx_count, unique_in_degree,
                unique_out_degree, hub_score, first_seen, last_seen, recency_score,
                influence_score, activity_score, entity_type, entity_name, tags_json,
                updated_at
             ) VALUES ('0xwhale', 'ETH', 10.0, 5.0, 15.0, 5.0, 3, 2, 5, 3, 2, 0.4,
                       ?1, ?2, 0.95, 0.7, 0.5, NULL, NULL, '[]', ?2)",
            params![now - 5_000, now - 100],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO aggregated_relations (
                from_addr, to_addr, network, tx_count, volume_usd, volume_native,
                avg_tx_size, first_seen, last_seen, direction, counterparty,
                tokens_json, confidence, confidence_level, weight, entity_type,
                entity_name, updated_at
             ) VALUES ('0xwhale', '0xpeer', 'ETH', 5, 500.0, '5', 100.0, ?1, ?2,
                       'OUT', '0xpeer', '[]', 0.6, 'HIGH', 0.5, NULL, NULL, ?2)",
            params![now - 5_000, now - 100],
        )
        .unwrap();
    }

    #[test]
    fn snapshot_captures_actors_edges_and_stats() {
        let db = Db::open_in_memory().unwrap();
        let now = 1_700_000_000;
        seed_aggregates(&db, now);

        let builder = SnapshotBuilder::new(db, 3);
        let snap = builder.build(SnapshotWindow::Day, now).unwrap();
        assert_eq!(snap.actors.len(), 1);
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(snap.stats.actor_count, 1);
        assert_eq!(snap.stats.total_edge_volume_usd, 500.0);
        assert!((snap.stats.avg_confidence - 0.6).abs() < 1e-9);
        assert_eq!(snap.actors[0].participation_trend, "rising");
        assert!(snap.actors[0].burst_score > 0.0);
    }

    #[test]
    fn stale_rows_fall_out_of_short_windows() {
        let db = Db::open_in_memory().unwrap();
        let now = 1_700_000_000;
        seed_aggregates(&db, now - 10 * 86_400);

        let builder = SnapshotBuilder::new(db, 3);
        let day = builder.build(SnapshotWindow::Day, now).unwrap();
        assert!(day.actors.is_empty());
        assert!(day.edges.is_empty());

        let month = builder.build(SnapshotWindow::Month, now).unwrap();
        assert_eq!(month.actors.len(), 1);
    }

    #[test]
    fn retention_keeps_newest_per_window() {
        let db = Db::open_in_memory().unwrap();
        let now = 1_700_000_000;
        seed_aggregates(&db, now);

        let builder = SnapshotBuilder::new(db, 2);
        for i in 0..5 {
            builder
                .build_and_persist(SnapshotWindow::Day, now + i * 60)
                .unwrap();
        }
        assert_eq!(builder.count(SnapshotWindow::Day).unwrap(), 2);

        let latest = builder.latest(SnapshotWindow::Day).unwrap().unwrap();
        assert_eq!(latest.snapshot_at, now + 4 * 60);
        // Other windows are unaffected.
        assert_eq!(builder.count(SnapshotWindow::Week).unwrap(), 0);
    }
}
