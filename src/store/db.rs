//! Shared sqlite handle and schema.
//!
//! WAL mode for concurrent reads during ingestion writes, WITHOUT ROWID
//! tables clustered on their natural keys, and covering secondary indexes
//! for the aggregators' scan patterns. One connection, short critical
//! sections behind a parking_lot mutex.

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS unified_events (
    event_id TEXT PRIMARY KEY,
    network TEXT NOT NULL,
    chain_id INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    from_addr TEXT NOT NULL,
    to_addr TEXT NOT NULL,
    token_address TEXT,
    amount TEXT NOT NULL,
    amount_usd REAL,
    event_type TEXT NOT NULL,
    ingestion_source TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_network_block
    ON unified_events(network, block_number);
CREATE INDEX IF NOT EXISTS idx_events_network_from
    ON unified_events(network, from_addr, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_network_to
    ON unified_events(network, to_addr, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_network_token
    ON unified_events(network, token_address);

CREATE TABLE IF NOT EXISTS chain_sync_state (
    chain TEXT PRIMARY KEY,
    last_synced_block INTEGER NOT NULL,
    last_head_block INTEGER NOT NULL,
    status TEXT NOT NULL,
    pause_reason TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    consecutive_errors INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_error_at INTEGER,
    last_success_at INTEGER,
    total_events_ingested INTEGER NOT NULL DEFAULT 0,
    avg_events_per_block REAL NOT NULL DEFAULT 0,
    avg_latency_ms REAL NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS aggregated_relations (
    from_addr TEXT NOT NULL,
    to_addr TEXT NOT NULL,
    network TEXT NOT NULL,
    tx_count INTEGER NOT NULL,
    volume_usd REAL NOT NULL,
    volume_native TEXT NOT NULL,
    avg_tx_size REAL NOT NULL,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    direction TEXT NOT NULL,
    counterparty TEXT NOT NULL,
    tokens_json TEXT NOT NULL,
    confidence REAL NOT NULL,
    confidence_level TEXT NOT NULL,
    weight REAL NOT NULL,
    entity_type TEXT,
    entity_name TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (from_addr, to_addr, network)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_relations_network_conf
    ON aggregated_relations(network, confidence DESC);

-- Pre-unified-ledger aggregates; read-only fallback for the relation
-- aggregator when the ledger has no matching events.
CREATE TABLE IF NOT EXISTS relations_legacy (
    from_addr TEXT NOT NULL,
    to_addr TEXT NOT NULL,
    network TEXT NOT NULL,
    tx_count INTEGER NOT NULL,
    volume_usd REAL NOT NULL,
    volume_native TEXT NOT NULL,
    avg_tx_size REAL NOT NULL,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    direction TEXT NOT NULL,
    counterparty TEXT NOT NULL,
    tokens_json TEXT NOT NULL,
    confidence REAL NOT NULL,
    confidence_level TEXT NOT NULL,
    weight REAL NOT NULL,
    entity_type TEXT,
    entity_name TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (from_addr, to_addr, network)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS node_analytics (
    address TEXT NOT NULL,
    network TEXT NOT NULL,
    in_volume_usd REAL NOT NULL,
    out_volume_usd REAL NOT NULL,
    total_volume_usd REAL NOT NULL,
    net_flow_usd REAL NOT NULL,
    in_tx_count INTEGER NOT NULL,
    out_tx_count INTEGER NOT NULL,
    tx_count INTEGER NOT NULL,
    unique_in_degree INTEGER NOT NULL,
    unique_out_degree INTEGER NOT NULL,
    hub_score REAL NOT NULL,
    first_seen INTEGER,
    last_seen INTEGER,
    recency_score REAL NOT NULL,
    influence_score REAL NOT NULL,
    activity_score REAL NOT NULL,
    entity_type TEXT,
    entity_name TEXT,
    tags_json TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (address, network)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_node_analytics_influence
    ON node_analytics(network, influence_score DESC);

CREATE TABLE IF NOT EXISTS bootstrap_tasks (
    dedup_key TEXT PRIMARY KEY,
    subject_type TEXT NOT NULL,
    network TEXT NOT NULL,
    address TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    progress INTEGER NOT NULL DEFAULT 0,
    step TEXT NOT NULL DEFAULT 'queued',
    eta_seconds INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    next_attempt_at INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    callback_emitted INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bootstrap_due
    ON bootstrap_tasks(status, next_attempt_at, priority, created_at);

CREATE TABLE IF NOT EXISTS signal_snapshots (
    snapshot_id TEXT PRIMARY KEY,
    window TEXT NOT NULL,
    snapshot_at INTEGER NOT NULL,
    payload_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snapshots_window_at
    ON signal_snapshots(window, snapshot_at DESC);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Cloneable handle to the shared connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM unified_events", [], |row| row.get(0))
            .unwrap_or(0);
        let tasks: i64 = conn
            .query_row("SELECT COUNT(*) FROM bootstrap_tasks", [], |row| row.get(0))
            .unwrap_or(0);
        info!(
            db = db_path,
            events, bootstrap_tasks = tasks, "database initialized"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn get_metadata(&self, key: &str) -> Option<String> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1 LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .ok();
        value.filter(|v| !v.trim().is_empty())
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
