//! Relation aggregation: rolls ledger events into per-edge aggregates with
//! confidence scoring and render weights.
//!
//! Confidence blends transaction count, volume, recency, frequency, and
//! token diversity; the count and volume terms are log-normalized between a
//! 0.3 floor (3 tx / $1k) and a 1.0 ceiling (20 tx / $100k). When the ledger
//! has nothing for an anchor, the aggregator falls back to the legacy
//! precomputed relations collection.

use anyhow::Result;
use chrono::Utc;
use num_bigint::BigUint;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::labels::LabelMaps;
use crate::models::NetworkId;
use crate::store::db::Db;
use crate::store::events::EventStore;

const ANCHOR_EVENT_LIMIT: usize = 10_000;

/// Edge direction from the anchor's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "IN" => Some(Direction::In),
            "OUT" => Some(Direction::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "LOW",
            ConfidenceLevel::Medium => "MEDIUM",
            ConfidenceLevel::High => "HIGH",
            ConfidenceLevel::VeryHigh => "VERY_HIGH",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(ConfidenceLevel::Low),
            "MEDIUM" => Some(ConfidenceLevel::Medium),
            "HIGH" => Some(ConfidenceLevel::High),
            "VERY_HIGH" => Some(ConfidenceLevel::VeryHigh),
            _ => None,
        }
    }

    pub fn for_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            ConfidenceLevel::VeryHigh
        } else if confidence >= 0.6 {
            ConfidenceLevel::High
        } else if confidence >= 0.4 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Directed edge aggregate, unique per `(from, to, network)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedRelation {
    pub from: String,
    pub to: String,
    pub network: NetworkId,
    pub tx_count: u64,
    pub volume_usd: f64,
    /// Raw-unit sum as a decimal string.
    pub volume_native: String,
    pub avg_tx_size: f64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub direction: Direction,
    pub counterparty: String,
    pub tokens: Vec<String>,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub weight: f64,
    pub entity_type: Option<String>,
    pub entity_name: Option<String>,
    pub updated_at: i64,
}

/// Log-normalized tx-count term: 0.3 at 3 transfers, 1.0 at 20.
pub fn tx_count_score(tx_count: u64) -> f64 {
    if tx_count == 0 {
        return 0.0;
    }
    let raw = 0.3 + 0.7 * ((tx_count as f64 / 3.0).ln() / (20.0f64 / 3.0).ln());
    raw.clamp(0.3, 1.0)
}

/// Log-normalized volume term: 0.3 at $1k, 1.0 at $100k.
pub fn volume_score(volume_usd: f64) -> f64 {
    if volume_usd <= 0.0 {
        return 0.3;
    }
    let raw = 0.3 + 0.7 * ((volume_usd / 1_000.0).ln() / 100.0f64.ln());
    raw.clamp(0.3, 1.0)
}

/// Linear decay over 90 days since the last transfer.
pub fn recency_score(days_since_last: f64) -> f64 {
    (1.0 - days_since_last / 90.0).max(0.0)
}

/// Transfers per day against a half-per-day saturation point.
pub fn frequency_score(tx_count: u64, day_span: f64) -> f64 {
    let span = day_span.max(1.0);
    ((tx_count as f64 / span) / 0.5).min(1.0)
}

/// Distinct tokens against a three-token saturation point.
pub fn diversity_score(token_count: usize) -> f64 {
    (token_count as f64 / 3.0).min(1.0)
}

pub fn confidence(
    tx_count: u64,
    volume_usd: f64,
    days_since_last: f64,
    day_span: f64,
    token_count: usize,
) -> f64 {
    let c = 0.25 * tx_count_score(tx_count)
        + 0.25 * volume_score(volume_usd)
        + 0.25 * recency_score(days_since_last)
        + 0.15 * frequency_score(tx_count, day_span)
        + 0.10 * diversity_score(token_count);
    c.clamp(0.0, 1.0)
}

/// Render weight: volume-dominated with a confidence kicker, floored so thin
/// edges stay visible.
pub fn edge_weight(volume_usd: f64, max_volume_usd: f64, confidence: f64) -> f64 {
    let ratio = if max_volume_usd > 0.0 {
        (volume_usd / max_volume_usd).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (0.7 * ratio.sqrt() + 0.3 * confidence).clamp(0.15, 1.0)
}

struct EdgeBucket {
    tx_count: u64,
    volume_usd: f64,
    volume_native: BigUint,
    first_seen: i64,
    last_seen: i64,
    tokens: Vec<String>,
}

pub struct RelationAggregator {
    events: EventStore,
    db: Db,
    labels: Arc<LabelMaps>,
    lookback_days: i64,
}

impl RelationAggregator {
    pub fn new(events: EventStore, db: Db, labels: Arc<LabelMaps>, lookback_days: i64) -> Self {
        Self {
            events,
            db,
            labels,
            lookback_days,
        }
    }

    /// Aggregate the anchor's edges over the look-back window. Deterministic
    /// for a fixed ledger prefix and `now`.
    pub fn aggregate_for_anchor(
        &self,
        network: NetworkId,
        anchor: &str,
        now: i64,
    ) -> Result<Vec<AggregatedRelation>> {
        let anchor = anchor.to_lowercase();
        let since = now - self.lookback_days * 86_400;
        let events = self
            .events
            .events_for_anchor(network, &anchor, since, ANCHOR_EVENT_LIMIT)?;

        if events.is_empty() {
            debug!(network = %network, anchor = %anchor, "ledger empty, using legacy relations");
            return self.legacy_relations(network, &anchor);
        }

        let mut buckets: BTreeMap<(String, String), EdgeBucket> = BTreeMap::new();
        for event in &events {
            let key = (event.from.clone(), event.to.clone());
            let bucket = buckets.entry(key).or_insert_with(|| EdgeBucket {
                tx_count: 0,
                volume_usd: 0.0,
                volume_native: BigUint::default(),
                first_seen: event.timestamp,
                last_seen: event.timestamp,
                tokens: Vec::new(),
            });
            bucket.tx_count += 1;
            bucket.volume_usd += event.amount_usd.unwrap_or(0.0);
            if let Ok(native) = event.amount.parse::<BigUint>() {
                bucket.volume_native += native;
            }
            bucket.first_seen = bucket.first_seen.min(event.timestamp);
            bucket.last_seen = bucket.last_seen.max(event.timestamp);
            if let Some(token) = &event.token_address {
                if !bucket.tokens.contains(token) {
                    bucket.tokens.push(token.clone());
                }
            }
        }

        let max_volume = buckets
            .values()
            .map(|b| b.volume_usd)
            .fold(0.0f64, f64::max);

        let relations = buckets
            .into_iter()
            .map(|((from, to), bucket)| {
                let direction = if from == anchor {
                    Direction::Out
                } else {
                    Direction::In
                };
                let counterparty = if direction == Direction::Out {
                    to.clone()
                } else {
                    from.clone()
                };

                let days_since_last = ((now - bucket.last_seen).max(0) as f64) / 86_400.0;
                // Frequency is measured over the edge's whole observed life.
                let day_span = ((now - bucket.first_seen).max(0) as f64) / 86_400.0;
                let confidence = confidence(
                    bucket.tx_count,
                    bucket.volume_usd,
                    days_since_last,
                    day_span,
                    bucket.tokens.len(),
                );

                let (entity_type, entity_name) = self.label_for(&counterparty);

                AggregatedRelation {
                    from,
                    to,
                    network,
                    tx_count: bucket.tx_count,
                    volume_usd: bucket.volume_usd,
                    volume_native: bucket.volume_native.to_string(),
                    avg_tx_size: bucket.volume_usd / bucket.tx_count as f64,
                    first_seen: bucket.first_seen,
                    last_seen: bucket.last_seen,
                    direction,
                    counterparty,
                    tokens: bucket.tokens,
                    confidence,
                    confidence_level: ConfidenceLevel::for_confidence(confidence),
                    weight: edge_weight(bucket.volume_usd, max_volume, confidence),
                    entity_type,
                    entity_name,
                    updated_at: now,
                }
            })
            .collect();

        Ok(relations)
    }

    /// Bridge identity wins over the generic entity label.
    fn label_for(&self, address: &str) -> (Option<String>, Option<String>) {
        if let Some(bridge) = self.labels.bridge(address) {
            return (Some("BRIDGE".to_string()), Some(bridge.name.clone()));
        }
        match self.labels.entity(address) {
            Some(e) => (Some(e.entity_type.clone()), Some(e.name.clone())),
            None => (None, None),
        }
    }

    pub fn upsert_relations(&self, relations: &[AggregatedRelation]) -> Result<()> {
        if relations.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO aggregated_relations (
                    from_addr, to_addr, network, tx_count, volume_usd, volume_native,
                    avg_tx_size, first_seen, last_seen, direction, counterparty,
                    tokens_json, confidence, confidence_level, weight, entity_type,
                    entity_name, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(from_addr, to_addr, network) DO UPDATE SET
                    tx_count = excluded.tx_count,
                    volume_usd = excluded.volume_usd,
                    volume_native = excluded.volume_native,
                    avg_tx_size = excluded.avg_tx_size,
                    first_seen = excluded.first_seen,
                    last_seen = excluded.last_seen,
                    direction = excluded.direction,
                    counterparty = excluded.counterparty,
                    tokens_json = excluded.tokens_json,
                    confidence = excluded.confidence,
                    confidence_level = excluded.confidence_level,
                    weight = excluded.weight,
                    entity_type = excluded.entity_type,
                    entity_name = excluded.entity_name,
                    updated_at = excluded.updated_at",
            )?;
            for r in relations {
                stmt.execute(params![
                    r.from,
                    r.to,
                    r.network.as_str(),
                    r.tx_count,
                    r.volume_usd,
                    r.volume_native,
                    r.avg_tx_size,
                    r.first_seen,
                    r.last_seen,
                    r.direction.as_str(),
                    r.counterparty,
                    serde_json::to_string(&r.tokens)?,
                    r.confidence,
                    r.confidence_level.as_str(),
                    r.weight,
                    r.entity_type,
                    r.entity_name,
                    r.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Refresh every anchor in the list, returning the number of edges
    /// written. Scheduler entry point.
    pub fn refresh_anchors(
        &self,
        network: NetworkId,
        anchors: &[String],
        now: i64,
    ) -> Result<usize> {
        let mut total = 0;
        for anchor in anchors {
            let relations = self.aggregate_for_anchor(network, anchor, now)?;
            total += relations.len();
            self.upsert_relations(&relations)?;
        }
        Ok(total)
    }

    fn legacy_relations(
        &self,
        network: NetworkId,
        anchor: &str,
    ) -> Result<Vec<AggregatedRelation>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT from_addr, to_addr, tx_count, volume_usd, volume_native, avg_tx_size,
                    first_seen, last_seen, direction, counterparty, tokens_json, confidence,
                    confidence_level, weight, entity_type, entity_name, updated_at
             FROM relations_legacy
             WHERE network = ?1 AND (from_addr = ?2 OR to_addr = ?2)",
        )?;
        let rows = stmt.query_map(params![network.as_str(), anchor], |row| {
            let direction_tag: String = row.get(8)?;
            let level_tag: String = row.get(12)?;
            let tokens_json: String = row.get(10)?;
            Ok(AggregatedRelation {
                from: row.get(0)?,
                to: row.get(1)?,
                network,
                tx_count: row.get::<_, i64>(2)? as u64,
                volume_usd: row.get(3)?,
                volume_native: row.get(4)?,
                avg_tx_size: row.get(5)?,
                first_seen: row.get(6)?,
                last_seen: row.get(7)?,
                direction: Direction::from_tag(&direction_tag).unwrap_or(Direction::Out),
                counterparty: row.get(9)?,
                tokens: serde_json::from_str(&tokens_json).unwrap_or_default(),
                confidence: row.get(11)?,
                confidence_level: ConfidenceLevel::from_tag(&level_tag)
                    .unwrap_or(ConfidenceLevel::Low),
                weight: row.get(13)?,
                entity_type: row.get(14)?,
                entity_name: row.get(15)?,
                updated_at: row.get(16)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, IngestionSource, UnifiedEvent};
    use crate::store::events::event_id;

    fn event(
        network: NetworkId,
        block: u64,
        from: &str,
        to: &str,
        token: &str,
        usd: f64,
        ts: i64,
    ) -> UnifiedEvent {
        let tx_hash = format!("0x{block:064x}");
        UnifiedEvent {
            event_id: event_id(network, &tx_hash, block),
            network,
            chain_id: network.chain_id(),
            tx_hash,
            log_index: block,
            block_number: block,
            timestamp: ts,
            from: from.into(),
            to: to.into(),
            token_address: Some(token.into()),
            amount: "1000000".into(),
            amount_usd: Some(usd),
            event_type: EventType::Transfer,
            ingestion_source: IngestionSource::Rpc,
        }
    }

    fn aggregator(db: Db) -> RelationAggregator {
        RelationAggregator::new(
            EventStore::new(db.clone()),
            db,
            Arc::new(LabelMaps::builtin()),
            90,
        )
    }

    #[test]
    fn weak_stale_edge_scores_low() {
        // 1 tx, $500, 120 days stale, single token.
        let c = confidence(1, 500.0, 120.0, 120.0, 1);
        assert!(c < 0.4, "confidence {c} should be LOW");
        assert_eq!(ConfidenceLevel::for_confidence(c), ConfidenceLevel::Low);
        assert!((0.15..=0.25).contains(&c), "expected ~0.18, got {c}");
    }

    #[test]
    fn strong_fresh_edge_scores_very_high() {
        // 25 tx, $250k, fresh, three tokens over a month.
        let c = confidence(25, 250_000.0, 0.0, 30.0, 3);
        assert!(c >= 0.90, "confidence {c} should be VERY_HIGH");
        assert_eq!(ConfidenceLevel::for_confidence(c), ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn confidence_and_weight_stay_in_bounds() {
        for tx in [0u64, 1, 3, 20, 500] {
            for vol in [0.0, 999.0, 1_000.0, 100_000.0, 1e9] {
                for days in [0.0, 45.0, 90.0, 400.0] {
                    let c = confidence(tx, vol, days, 10.0, 2);
                    assert!((0.0..=1.0).contains(&c));
                    let w = edge_weight(vol, 1e9, c);
                    assert!((0.15..=1.0).contains(&w));
                }
            }
        }
        // Zero max volume still floors the weight.
        assert_eq!(edge_weight(0.0, 0.0, 0.0), 0.15);
    }

    #[test]
    fn aggregation_groups_edges_and_sets_direction() {
        let db = Db::open_in_memory().unwrap();
        let agg = aggregator(db.clone());
        let store = EventStore::new(db);
        let now = 1_700_000_000;
        store
            .insert_events(&[
                event(NetworkId::Eth, 1, "0xanchor", "0xpeer", "0xusdc", 100.0, now - 86_400),
                event(NetworkId::Eth, 2, "0xanchor", "0xpeer", "0xweth", 300.0, now - 3_600),
                event(NetworkId::Eth, 3, "0xpeer", "0xanchor", "0xusdc", 50.0, now - 7_200),
            ])
            .unwrap();

        let relations = agg
            .aggregate_for_anchor(NetworkId::Eth, "0xANCHOR", now)
            .unwrap();
        assert_eq!(relations.len(), 2);

        let out = relations
            .iter()
            .find(|r| r.direction == Direction::Out)
            .unwrap();
        assert_eq!(out.tx_count, 2);
        assert_eq!(out.volume_usd, 400.0);
        assert_eq!(out.counterparty, "0xpeer");
        assert_eq!(out.tokens.len(), 2);
        assert_eq!(out.volume_native, "2000000");

        let inbound = relations
            .iter()
            .find(|r| r.direction == Direction::In)
            .unwrap();
        assert_eq!(inbound.counterparty, "0xpeer");
        assert_eq!(inbound.tx_count, 1);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let db = Db::open_in_memory().unwrap();
        let agg = aggregator(db.clone());
        let store = EventStore::new(db);
        let now = 1_700_000_000;
        store
            .insert_events(&[
                event(NetworkId::Eth, 1, "0xa", "0xb", "0xusdc", 10.0, now - 50),
                event(NetworkId::Eth, 2, "0xb", "0xa", "0xusdc", 20.0, now - 40),
            ])
            .unwrap();

        let first = agg.aggregate_for_anchor(NetworkId::Eth, "0xa", now).unwrap();
        let second = agg.aggregate_for_anchor(NetworkId::Eth, "0xa", now).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn counterparty_entity_tagging_uses_labels() {
        let db = Db::open_in_memory().unwrap();
        let agg = aggregator(db.clone());
        let store = EventStore::new(db);
        let now = 1_700_000_000;
        let bridge = "0x99c9fc46f92e8a1c0dec1b1747d010903e884be1";
        store
            .insert_events(&[event(
                NetworkId::Eth,
                1,
                "0xanchor",
                bridge,
                "0xusdc",
                100.0,
                now - 60,
            )])
            .unwrap();

        let relations = agg
            .aggregate_for_anchor(NetworkId::Eth, "0xanchor", now)
            .unwrap();
        assert_eq!(relations[0].entity_type.as_deref(), Some("BRIDGE"));
        assert_eq!(relations[0].entity_name.as_deref(), Some("Optimism Gateway"));
    }

    #[test]
    fn empty_ledger_falls_back_to_legacy_collection() {
        let db = Db::open_in_memory().unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO relations_legacy (
                    from_addr, to_addr, network, tx_count, volume_usd, volume_native,
                    avg_tx_size, first_seen, last_seen, direction, counterparty,
                    tokens_json, confidence, confidence_level, weight, entity_type,
                    entity_name, updated_at
                 ) VALUES ('0xa', '0xb', 'ETH', 4, 1200.0, '4000000', 300.0, 1, 2,
                           'OUT', '0xb', '[\"0xusdc\"]', 0.5, 'MEDIUM', 0.4,
                           NULL, NULL, 10)",
                [],
            )
            .unwrap();
        }
        let agg = aggregator(db);
        let relations = agg
            .aggregate_for_anchor(NetworkId::Eth, "0xa", 1_700_000_000)
            .unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].tx_count, 4);
        assert_eq!(relations[0].confidence_level, ConfidenceLevel::Medium);
    }

    #[test]
    fn upsert_is_idempotent_per_edge() {
        let db = Db::open_in_memory().unwrap();
        let agg = aggregator(db.clone());
        let store = EventStore::new(db.clone());
        let now = 1_700_000_000;
        store
            .insert_events(&[event(NetworkId::Eth, 1, "0xa", "0xb", "0xusdc", 10.0, now - 50)])
            .unwrap();
        let relations = agg.aggregate_for_anchor(NetworkId::Eth, "0xa", now).unwrap();
        agg.upsert_relations(&relations).unwrap();
        agg.upsert_relations(&relations).unwrap();

        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM aggregated_relations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
