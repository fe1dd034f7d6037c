//! Unified event ledger with replay-guarded batch insert.
//!
//! The primary key is a content-addressed event id, so re-inserting the same
//! batch is a counted no-op. A batch either commits whole or rolls back
//! whole; duplicates never abort it, any other persistence failure does.

use anyhow::Result;
use rusqlite::{params, params_from_iter};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::IngestError;
use crate::models::{
    EventType, IngestionSource, InsertReport, NetworkId, UnifiedEvent,
};
use crate::store::db::Db;

/// Content key: sha256 over `(network, txHash, logIndex)` truncated to 16
/// bytes. Collision-resistant and stable across retries and sources.
pub fn event_id(network: NetworkId, tx_hash: &str, log_index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(network.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(tx_hash.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(log_index.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[derive(Clone)]
pub struct EventStore {
    db: Db,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Idempotent batch insert. Duplicates are counted and skipped; any other
    /// failure rolls the whole batch back so sync state never advances past
    /// a partial write.
    pub fn insert_events(&self, events: &[UnifiedEvent]) -> Result<InsertReport, IngestError> {
        let mut report = InsertReport::default();
        if events.is_empty() {
            return Ok(report);
        }

        let mut conn = self.db.lock();
        let tx = conn
            .transaction()
            .map_err(|e| IngestError::Store(e.to_string()))?;

        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO unified_events (
                        event_id, network, chain_id, tx_hash, log_index, block_number,
                        timestamp, from_addr, to_addr, token_address, amount, amount_usd,
                        event_type, ingestion_source
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .map_err(|e| IngestError::Store(e.to_string()))?;

            for event in events {
                let outcome = stmt.execute(params![
                    event.event_id,
                    event.network.as_str(),
                    event.chain_id,
                    event.tx_hash,
                    event.log_index,
                    event.block_number,
                    event.timestamp,
                    event.from,
                    event.to,
                    event.token_address,
                    event.amount,
                    event.amount_usd,
                    event.event_type.as_str(),
                    event.ingestion_source.as_str(),
                ]);
                match outcome {
                    Ok(1) => report.inserted += 1,
                    Ok(_) => report.duplicates += 1,
                    Err(e) => {
                        report.errors += 1;
                        report.error_messages.push(e.to_string());
                    }
                }
            }
        }

        if report.errors > 0 {
            // Integrity failure other than a duplicate: abort, don't advance.
            drop(tx);
            return Err(IngestError::Store(report.error_messages.join(" | ")));
        }

        tx.commit().map_err(|e| IngestError::Store(e.to_string()))?;
        debug!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            "event batch committed"
        );
        Ok(report)
    }

    /// Events touching `address` on `network` since `since_ts`, oldest first.
    pub fn events_for_anchor(
        &self,
        network: NetworkId,
        address: &str,
        since_ts: i64,
        limit: usize,
    ) -> Result<Vec<UnifiedEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, network, chain_id, tx_hash, log_index, block_number,
                    timestamp, from_addr, to_addr, token_address, amount, amount_usd,
                    event_type, ingestion_source
             FROM unified_events
             WHERE network = ?1 AND (from_addr = ?2 OR to_addr = ?2) AND timestamp >= ?3
             ORDER BY timestamp ASC, block_number ASC, log_index ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![network.as_str(), address.to_lowercase(), since_ts, limit],
            row_to_event,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Events where any of `addresses` is sender or receiver, across all
    /// networks, since `since_ts`. Entity aggregation input.
    pub fn events_for_address_set(
        &self,
        addresses: &[String],
        since_ts: i64,
        limit: usize,
    ) -> Result<Vec<UnifiedEvent>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let normalized: Vec<String> = addresses.iter().map(|a| a.to_lowercase()).collect();
        let placeholders: Vec<String> = (1..=normalized.len())
            .map(|i| format!("?{i}"))
            .collect();
        let in_clause = placeholders.join(", ");
        let since_idx = normalized.len() + 1;
        let limit_idx = normalized.len() + 2;

        let sql = format!(
            "SELECT event_id, network, chain_id, tx_hash, log_index, block_number,
                    timestamp, from_addr, to_addr, token_address, amount, amount_usd,
                    event_type, ingestion_source
             FROM unified_events
             WHERE (from_addr IN ({in_clause}) OR to_addr IN ({in_clause}))
               AND timestamp >= ?{since_idx}
             ORDER BY timestamp ASC
             LIMIT ?{limit_idx}"
        );

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<rusqlite::types::Value> = normalized
            .iter()
            .map(|a| rusqlite::types::Value::Text(a.clone()))
            .collect();
        values.push(rusqlite::types::Value::Integer(since_ts));
        values.push(rusqlite::types::Value::Integer(limit as i64));
        let rows = stmt.query_map(params_from_iter(values), row_to_event)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Most recently active addresses on a network, newest first.
    pub fn recent_addresses(&self, network: NetworkId, cap: usize) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT addr FROM (
                SELECT from_addr AS addr, MAX(timestamp) AS ts
                  FROM unified_events WHERE network = ?1 GROUP BY from_addr
                UNION ALL
                SELECT to_addr AS addr, MAX(timestamp) AS ts
                  FROM unified_events WHERE network = ?1 GROUP BY to_addr
             )
             GROUP BY addr
             ORDER BY MAX(ts) DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![network.as_str(), cap], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Distinct block numbers persisted for a chain inside a range.
    /// Gap-freeness checks and bootstrap coverage reporting.
    pub fn blocks_in_range(
        &self,
        network: NetworkId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<u64>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT block_number FROM unified_events
             WHERE network = ?1 AND block_number BETWEEN ?2 AND ?3
             ORDER BY block_number ASC",
        )?;
        let rows = stmt.query_map(params![network.as_str(), from_block, to_block], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(rows.filter_map(|r| r.ok()).map(|b| b as u64).collect())
    }

    pub fn count_for_network(&self, network: NetworkId) -> Result<u64> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM unified_events WHERE network = ?1",
            [network.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn has_events_for_anchor(
        &self,
        network: NetworkId,
        address: &str,
        since_ts: i64,
    ) -> Result<bool> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM unified_events
                WHERE network = ?1 AND (from_addr = ?2 OR to_addr = ?2) AND timestamp >= ?3
             )",
            params![network.as_str(), address.to_lowercase(), since_ts],
            |row| row.get(0),
        )?;
        Ok(count != 0)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<UnifiedEvent> {
    let network_tag: String = row.get(1)?;
    let event_type_tag: String = row.get(12)?;
    let source_tag: String = row.get(13)?;

    // Tags were validated at the write boundary; treat a mismatch here as a
    // corrupt row.
    let network = NetworkId::from_tag(&network_tag).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown network tag {network_tag}").into(),
        )
    })?;
    let event_type = EventType::from_tag(&event_type_tag).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            12,
            rusqlite::types::Type::Text,
            format!("unknown event type {event_type_tag}").into(),
        )
    })?;
    let ingestion_source = IngestionSource::from_tag(&source_tag).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            13,
            rusqlite::types::Type::Text,
            format!("unknown ingestion source {source_tag}").into(),
        )
    })?;

    Ok(UnifiedEvent {
        event_id: row.get(0)?,
        network,
        chain_id: row.get::<_, i64>(2)? as u64,
        tx_hash: row.get(3)?,
        log_index: row.get::<_, i64>(4)? as u64,
        block_number: row.get::<_, i64>(5)? as u64,
        timestamp: row.get(6)?,
        from: row.get(7)?,
        to: row.get(8)?,
        token_address: row.get(9)?,
        amount: row.get(10)?,
        amount_usd: row.get(11)?,
        event_type,
        ingestion_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(
        network: NetworkId,
        block: u64,
        index: u64,
        from: &str,
        to: &str,
        usd: f64,
    ) -> UnifiedEvent {
        let tx_hash = format!("0x{block:032x}{index:032x}");
        UnifiedEvent {
            event_id: event_id(network, &tx_hash, index),
            network,
            chain_id: network.chain_id(),
            tx_hash,
            log_index: index,
            block_number: block,
            timestamp: 1_700_000_000 + block as i64,
            from: from.to_lowercase(),
            to: to.to_lowercase(),
            token_address: Some("0xusdc".into()),
            amount: "1000000".into(),
            amount_usd: Some(usd),
            event_type: EventType::Transfer,
            ingestion_source: IngestionSource::Rpc,
        }
    }

    #[test]
    fn event_id_is_deterministic_and_case_insensitive() {
        let a = event_id(NetworkId::Arb, "0xABCD", 7);
        let b = event_id(NetworkId::Arb, "0xabcd", 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, event_id(NetworkId::Arb, "0xabcd", 8));
        assert_ne!(a, event_id(NetworkId::Op, "0xabcd", 7));
    }

    #[test]
    fn replaying_a_batch_is_a_counted_no_op() {
        let store = EventStore::new(Db::open_in_memory().unwrap());
        let events: Vec<UnifiedEvent> = (0..100)
            .map(|i| sample_event(NetworkId::Arb, 1_000 + i, 0, "0xaa", "0xbb", 5.0))
            .collect();

        let first = store.insert_events(&events).unwrap();
        assert_eq!(first.inserted, 100);
        assert_eq!(first.duplicates, 0);

        let second = store.insert_events(&events).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 100);

        assert_eq!(store.count_for_network(NetworkId::Arb).unwrap(), 100);
    }

    #[test]
    fn anchor_query_sees_both_directions() {
        let store = EventStore::new(Db::open_in_memory().unwrap());
        store
            .insert_events(&[
                sample_event(NetworkId::Eth, 1, 0, "0xanchor", "0xpeer", 10.0),
                sample_event(NetworkId::Eth, 2, 0, "0xpeer", "0xanchor", 20.0),
                sample_event(NetworkId::Eth, 3, 0, "0xother", "0xpeer", 30.0),
                sample_event(NetworkId::Base, 4, 0, "0xanchor", "0xpeer", 40.0),
            ])
            .unwrap();

        let events = store
            .events_for_anchor(NetworkId::Eth, "0xANCHOR", 0, 100)
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn recent_addresses_order_newest_first() {
        let store = EventStore::new(Db::open_in_memory().unwrap());
        store
            .insert_events(&[
                sample_event(NetworkId::Eth, 1, 0, "0xold", "0xcold", 1.0),
                sample_event(NetworkId::Eth, 50, 0, "0xmid", "0xcold", 1.0),
                sample_event(NetworkId::Eth, 100, 0, "0xnew", "0xhot", 1.0),
            ])
            .unwrap();
        let addrs = store.recent_addresses(NetworkId::Eth, 2).unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains(&"0xnew".to_string()) || addrs.contains(&"0xhot".to_string()));
    }

    #[test]
    fn blocks_in_range_reports_coverage() {
        let store = EventStore::new(Db::open_in_memory().unwrap());
        store
            .insert_events(&[
                sample_event(NetworkId::Op, 10, 0, "0xa", "0xb", 1.0),
                sample_event(NetworkId::Op, 11, 0, "0xa", "0xb", 1.0),
                sample_event(NetworkId::Op, 13, 0, "0xa", "0xb", 1.0),
            ])
            .unwrap();
        let blocks = store.blocks_in_range(NetworkId::Op, 10, 13).unwrap();
        assert_eq!(blocks, vec![10, 11, 13]);
    }
}
