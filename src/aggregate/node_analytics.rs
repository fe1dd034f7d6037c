//! Per-address analytics derived from the ledger.
//!
//! Two one-pass aggregations per address (outgoing, incoming) feed counts,
//! USD sums, unique degrees, and the derived scores. Rows are cached with a
//! one-hour TTL; a fresh read within the TTL serves the cached row with an
//! age hint, and a failed recompute falls back to the stale row rather than
//! erroring the read path.

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::labels::LabelMaps;
use crate::models::NetworkId;
use crate::store::db::Db;
use crate::store::events::EventStore;

/// Cached rows older than this are recomputed on read.
pub const NODE_ANALYTICS_TTL_SECONDS: i64 = 3_600;

const ANCHOR_EVENT_LIMIT: usize = 10_000;
/// Degree where the hub term saturates.
const HUB_SATURATION: f64 = 100.0;
/// Transfers where the activity term saturates.
const ACTIVITY_SATURATION: f64 = 100.0;
/// USD volume where the influence volume term saturates.
const VOLUME_SATURATION: f64 = 1_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAnalytics {
    pub address: String,
    pub network: NetworkId,
    pub in_volume_usd: f64,
    pub out_volume_usd: f64,
    pub total_volume_usd: f64,
    pub net_flow_usd: f64,
    pub in_tx_count: u64,
    pub out_tx_count: u64,
    pub tx_count: u64,
    pub unique_in_degree: u64,
    pub unique_out_degree: u64,
    pub hub_score: f64,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    pub recency_score: f64,
    pub influence_score: f64,
    pub activity_score: f64,
    pub entity_type: Option<String>,
    pub entity_name: Option<String>,
    pub tags: Vec<String>,
    pub updated_at: i64,
}

/// A served row plus how stale it was at read time.
#[derive(Debug, Clone)]
pub struct NodeAnalyticsRead {
    pub analytics: NodeAnalytics,
    /// Set when a cached row was served instead of a fresh compute.
    pub age_seconds: Option<i64>,
}

/// Logarithmic saturation of combined degree.
pub fn hub_score(unique_in_degree: u64, unique_out_degree: u64) -> f64 {
    let degree = (unique_in_degree + unique_out_degree) as f64;
    ((1.0 + degree).ln() / (1.0 + HUB_SATURATION).ln()).clamp(0.0, 1.0)
}

pub fn recency_score(days_since_last: f64) -> f64 {
    (1.0 - days_since_last / 90.0).clamp(0.0, 1.0)
}

pub fn activity_score(tx_count: u64) -> f64 {
    (tx_count as f64 / ACTIVITY_SATURATION).clamp(0.0, 1.0)
}

fn volume_term(total_volume_usd: f64) -> f64 {
    if total_volume_usd <= 0.0 {
        return 0.0;
    }
    ((1.0 + total_volume_usd).ln() / (1.0 + VOLUME_SATURATION).ln()).clamp(0.0, 1.0)
}

/// Weighted blend of hub, activity, volume, and a known-entity boost. Every
/// term is pre-clamped, so the blend stays in [0, 1].
pub fn influence_score(
    hub: f64,
    activity: f64,
    total_volume_usd: f64,
    known_entity: bool,
) -> f64 {
    let boost = if known_entity { 1.0 } else { 0.0 };
    (0.35 * hub + 0.25 * activity + 0.25 * volume_term(total_volume_usd) + 0.15 * boost)
        .clamp(0.0, 1.0)
}

pub struct NodeAnalyticsBuilder {
    events: EventStore,
    db: Db,
    labels: Arc<LabelMaps>,
    address_cap: usize,
}

impl NodeAnalyticsBuilder {
    pub fn new(events: EventStore, db: Db, labels: Arc<LabelMaps>, address_cap: usize) -> Self {
        Self {
            events,
            db,
            labels,
            address_cap,
        }
    }

    /// Pure compute over the ledger: one pass splits into the outgoing and
    /// incoming aggregations.
    pub fn compute(&self, network: NetworkId, address: &str, now: i64) -> Result<NodeAnalytics> {
        let address = address.to_lowercase();
        let events = self
            .events
            .events_for_anchor(network, &address, 0, ANCHOR_EVENT_LIMIT)?;

        let mut in_volume = 0.0;
        let mut out_volume = 0.0;
        let mut in_tx = 0u64;
        let mut out_tx = 0u64;
        let mut senders: HashSet<&str> = HashSet::new();
        let mut receivers: HashSet<&str> = HashSet::new();
        let mut first_seen: Option<i64> = None;
        let mut last_seen: Option<i64> = None;

        for event in &events {
            let usd = event.amount_usd.unwrap_or(0.0);
            if event.from == address {
                out_tx += 1;
                out_volume += usd;
                receivers.insert(event.to.as_str());
            }
            if event.to == address {
                in_tx += 1;
                in_volume += usd;
                senders.insert(event.from.as_str());
            }
            first_seen = Some(first_seen.map_or(event.timestamp, |f| f.min(event.timestamp)));
            last_seen = Some(last_seen.map_or(event.timestamp, |l| l.max(event.timestamp)));
        }

        let unique_in_degree = senders.len() as u64;
        let unique_out_degree = receivers.len() as u64;
        let tx_count = in_tx + out_tx;
        let total_volume = in_volume + out_volume;

        let hub = hub_score(unique_in_degree, unique_out_degree);
        let recency = last_seen
            .map(|ts| recency_score(((now - ts).max(0) as f64) / 86_400.0))
            .unwrap_or(0.0);
        let activity = activity_score(tx_count);

        let known = self.labels.entity(&address);
        let influence = influence_score(hub, activity, total_volume, known.is_some());

        Ok(NodeAnalytics {
            address,
            network,
            in_volume_usd: in_volume,
            out_volume_usd: out_volume,
            total_volume_usd: total_volume,
            net_flow_usd: in_volume - out_volume,
            in_tx_count: in_tx,
            out_tx_count: out_tx,
            tx_count,
            unique_in_degree,
            unique_out_degree,
            hub_score: hub,
            first_seen,
            last_seen,
            recency_score: recency,
            influence_score: influence,
            activity_score: activity,
            entity_type: known.map(|e| e.entity_type.clone()),
            entity_name: known.map(|e| e.name.clone()),
            tags: Vec::new(),
            updated_at: now,
        })
    }

    /// TTL-cached read: fresh rows are served with an age hint, stale rows
    /// are recomputed, and a failed recompute falls back to the stale row.
    pub fn get_or_compute(
        &self,
        network: NetworkId,
        address: &str,
        now: i64,
    ) -> Result<NodeAnalyticsRead> {
        let cached = self.get(network, address)?;
        if let Some(row) = &cached {
            let age = now - row.updated_at;
            if age <= NODE_ANALYTICS_TTL_SECONDS {
                return Ok(NodeAnalyticsRead {
                    analytics: row.clone(),
                    age_seconds: Some(age.max(0)),
                });
            }
        }

        match self.compute(network, address, now) {
            Ok(fresh) => {
                self.upsert(&fresh)?;
                Ok(NodeAnalyticsRead {
                    analytics: fresh,
                    age_seconds: None,
                })
            }
            Err(e) => match cached {
                Some(stale) => {
                    warn!(
                        address,
                        network = %network,
                        error = %e,
                        "node analytics recompute failed, serving stale row"
                    );
                    let age = (now - stale.updated_at).max(0);
                    Ok(NodeAnalyticsRead {
                        analytics: stale,
                        age_seconds: Some(age),
                    })
                }
                None => Err(e),
            },
        }
    }

    pub fn upsert(&self, row: &NodeAnalytics) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO node_analytics (
                address, network, in_volume_usd, out_volume_usd, total_volume_usd,
                net_flow_usd, in_tx_count, out_tx_count, tx_count, unique_in_degree,
                unique_out_degree, hub_score, first_seen, last_seen, recency_score,
                influence_score, activity_score, entity_type, entity_name, tags_json,
                updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                       ?15, ?16, ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT(address, network) DO UPDATE SET
                in_volume_usd = excluded.in_volume_usd,
                out_volume_usd = excluded.out_volume_usd,
                total_volume_usd = excluded.total_volume_usd,
                net_flow_usd = excluded.net_flow_usd,
                in_tx_count = excluded.in_tx_count,
                out_tx_count = excluded.out_tx_count,
                tx_count = excluded.tx_count,
                unique_in_degree = excluded.unique_in_degree,
                unique_out_degree = excluded.unique_out_degree,
                hub_score = excluded.hub_score,
                first_seen = excluded.first_seen,
                last_seen = excluded.last_seen,
                recency_score = excluded.recency_score,
                influence_score = excluded.influence_score,
                activity_score = excluded.activity_score,
                entity_type = excluded.entity_type,
                entity_name = excluded.entity_name,
                tags_json = excluded.tags_json,
                updated_at = excluded.updated_at",
            params![
                row.address,
                row.network.as_str(),
                row.in_volume_usd,
                row.out_volume_usd,
                row.total_volume_usd,
                row.net_flow_usd,
                row.in_tx_count,
                row.out_tx_count,
                row.tx_count,
                row.unique_in_degree,
                row.unique_out_degree,
                row.hub_score,
                row.first_seen,
                row.last_seen,
                row.recency_score,
                row.influence_score,
                row.activity_score,
                row.entity_type,
                row.entity_name,
                serde_json::to_string(&row.tags)?,
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, network: NetworkId, address: &str) -> Result<Option<NodeAnalytics>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLUMNS} FROM node_analytics WHERE address = ?1 AND network = ?2"
        ))?;
        let row = stmt
            .query_row(params![address.to_lowercase(), network.as_str()], |row| {
                row_to_analytics(row, network)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    pub fn batch_get(
        &self,
        network: NetworkId,
        addresses: &[String],
    ) -> Result<Vec<NodeAnalytics>> {
        let mut out = Vec::with_capacity(addresses.len());
        for address in addresses {
            if let Some(row) = self.get(network, address)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    pub fn top_by_influence(&self, network: NetworkId, k: usize) -> Result<Vec<NodeAnalytics>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLUMNS} FROM node_analytics WHERE network = ?1
             ORDER BY influence_score DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![network.as_str(), k], |row| {
            row_to_analytics(row, network)
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Refresh the N most recently active addresses on a network.
    pub fn refresh_network(&self, network: NetworkId, now: i64) -> Result<usize> {
        let addresses = self.events.recent_addresses(network, self.address_cap)?;
        for address in &addresses {
            let row = self.compute(network, address, now)?;
            self.upsert(&row)?;
        }
        Ok(addresses.len())
    }
}

const NODE_COLUMNS: &str = "address, in_volume_usd, out_volume_usd, total_volume_usd, \
    net_flow_usd, in_tx_count, out_tx_count, tx_count, unique_in_degree, \
    unique_out_degree, hub_score, first_seen, last_seen, recency_score, \
    influence_score, activity_score, entity_type, entity_name, tags_json, updated_at";

fn row_to_analytics(
    row: &rusqlite::Row<'_>,
    network: NetworkId,
) -> rusqlite::Result<NodeAnalytics> {
    let tags_json: String = row.get(18)?;
    Ok(NodeAnalytics {
        address: row.get(0)?,
        network,
        in_volume_usd: row.get(1)?,
        out_volume_usd: row.get(2)?,
        total_volume_usd: row.get(3)?,
        net_flow_usd: row.get(4)?,
        in_tx_count: row.get::<_, i64>(5)? as u64,
        out_tx_count: row.get::<_, i64>(6)? as u64,
        tx_count: row.get::<_, i64>(7)? as u64,
        unique_in_degree: row.get::<_, i64>(8)? as u64,
        unique_out_degree: row.get::<_, i64>(9)? as u64,
        hub_score: row.get(10)?,
        first_seen: row.get(11)?,
        last_seen: row.get(12)?,
        recency_score: row.get(13)?,
        influence_score: row.get(14)?,
        activity_score: row.get(15)?,
        entity_type: row.get(16)?,
        entity_name: row.get(17)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        updated_at: row.get(19)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, IngestionSource, UnifiedEvent};
    use crate::store::events::event_id;

    fn event(
        network: NetworkId,
        n: u64,
        from: &str,
        to: &str,
        usd: f64,
        ts: i64,
    ) -> UnifiedEvent {
        let tx_hash = format!("0x{n:064x}");
        UnifiedEvent {
            event_id: event_id(network, &tx_hash, n),
            network,
            chain_id: network.chain_id(),
            tx_hash,
            log_index: n,
            block_number: n,
            timestamp: ts,
            from: from.into(),
            to: to.into(),
            token_address: Some("0xusdc".into()),
            amount: "1000000".into(),
            amount_usd: Some(usd),
            event_type: EventType::Transfer,
            ingestion_source: IngestionSource::Rpc,
        }
    }

    fn builder(db: Db) -> NodeAnalyticsBuilder {
        NodeAnalyticsBuilder::new(
            EventStore::new(db.clone()),
            db,
            Arc::new(LabelMaps::builtin()),
            100,
        )
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        for deg in [0u64, 1, 10, 100, 10_000] {
            assert!((0.0..=1.0).contains(&hub_score(deg, deg)));
        }
        for days in [0.0, 45.0, 90.0, 500.0] {
            assert!((0.0..=1.0).contains(&recency_score(days)));
        }
        for tx in [0u64, 50, 100, 100_000] {
            assert!((0.0..=1.0).contains(&activity_score(tx)));
        }
        for vol in [0.0, 1e3, 1e6, 1e12] {
            assert!((0.0..=1.0).contains(&influence_score(1.0, 1.0, vol, true)));
        }
    }

    #[test]
    fn two_pass_aggregation_splits_directions() {
        let db = Db::open_in_memory().unwrap();
        let b = builder(db.clone());
        let store = EventStore::new(db);
        let now = 1_700_000_000;
        store
            .insert_events(&[
                event(NetworkId::Eth, 1, "0xhub", "0xr1", 100.0, now - 300),
                event(NetworkId::Eth, 2, "0xhub", "0xr2", 200.0, now - 200),
                event(NetworkId::Eth, 3, "0xs1", "0xhub", 50.0, now - 100),
                event(NetworkId::Eth, 4, "0xs1", "0xhub", 25.0, now - 50),
            ])
            .unwrap();

        let row = b.compute(NetworkId::Eth, "0xHUB", now).unwrap();
        assert_eq!(row.out_tx_count, 2);
        assert_eq!(row.in_tx_count, 2);
        assert_eq!(row.tx_count, 4);
        assert_eq!(row.out_volume_usd, 300.0);
        assert_eq!(row.in_volume_usd, 75.0);
        assert_eq!(row.net_flow_usd, -225.0);
        assert_eq!(row.unique_out_degree, 2);
        assert_eq!(row.unique_in_degree, 1);
        assert_eq!(row.first_seen, Some(now - 300));
        assert_eq!(row.last_seen, Some(now - 50));
        assert!(row.recency_score > 0.99);
    }

    #[test]
    fn known_entity_gets_influence_boost() {
        let db = Db::open_in_memory().unwrap();
        let b = builder(db.clone());
        let store = EventStore::new(db);
        let now = 1_700_000_000;
        let exchange = "0x28c6c06298d514db089934071355e5743bf21d60";
        store
            .insert_events(&[
                event(NetworkId::Eth, 1, exchange, "0xr1", 100.0, now),
                event(NetworkId::Eth, 2, "0xplain", "0xr1", 100.0, now),
            ])
            .unwrap();

        let tagged = b.compute(NetworkId::Eth, exchange, now).unwrap();
        let plain = b.compute(NetworkId::Eth, "0xplain", now).unwrap();
        assert_eq!(tagged.entity_type.as_deref(), Some("EXCHANGE"));
        assert!(tagged.influence_score > plain.influence_score);
    }

    #[test]
    fn ttl_read_serves_cached_then_recomputes() {
        let db = Db::open_in_memory().unwrap();
        let b = builder(db.clone());
        let store = EventStore::new(db);
        let now = 1_700_000_000;
        store
            .insert_events(&[event(NetworkId::Eth, 1, "0xa", "0xb", 10.0, now - 10)])
            .unwrap();

        // First read computes.
        let first = b.get_or_compute(NetworkId::Eth, "0xa", now).unwrap();
        assert!(first.age_seconds.is_none());

        // Within the TTL the cached row is served with an age hint.
        let cached = b.get_or_compute(NetworkId::Eth, "0xa", now + 60).unwrap();
        assert_eq!(cached.age_seconds, Some(60));
        assert_eq!(cached.analytics.updated_at, now);

        // Past the TTL it recomputes.
        store
            .insert_events(&[event(NetworkId::Eth, 2, "0xa", "0xc", 30.0, now + 100)])
            .unwrap();
        let later = now + NODE_ANALYTICS_TTL_SECONDS + 1;
        let fresh = b.get_or_compute(NetworkId::Eth, "0xa", later).unwrap();
        assert!(fresh.age_seconds.is_none());
        assert_eq!(fresh.analytics.tx_count, 2);
    }

    #[test]
    fn top_by_influence_orders_descending() {
        let db = Db::open_in_memory().unwrap();
        let b = builder(db.clone());
        let store = EventStore::new(db);
        let now = 1_700_000_000;
        let mut batch = Vec::new();
        // 0xbig fans out to many counterparties; 0xsmall makes one transfer.
        for i in 0..20 {
            batch.push(event(
                NetworkId::Eth,
                100 + i,
                "0xbig",
                &format!("0xr{i}"),
                1_000.0,
                now - i as i64,
            ));
        }
        batch.push(event(NetworkId::Eth, 500, "0xsmall", "0xr0", 5.0, now));
        store.insert_events(&batch).unwrap();

        assert!(b.refresh_network(NetworkId::Eth, now).unwrap() > 0);
        let top = b.top_by_influence(NetworkId::Eth, 3).unwrap();
        assert!(!top.is_empty());
        assert_eq!(top[0].address, "0xbig");
        assert!(top
            .windows(2)
            .all(|w| w[0].influence_score >= w[1].influence_score));
    }
}
