//! On-demand bootstrap indexing for previously unseen subjects.
//!
//! A lookup of an unknown wallet or token enqueues a dedup-keyed task; the
//! worker indexes the subject in phases and publishes progress so the
//! resolver surface can report honest `pending -> analyzing -> completed`
//! status. Terminal states are sticky and the resolver callback fires
//! exactly once per task, surviving worker restarts via a persisted flag.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::node_analytics::NodeAnalyticsBuilder;
use crate::aggregate::relations::RelationAggregator;
use crate::models::{IngestionSource, NetworkId};
use crate::price::{enrich_events_usd, PriceProvider};
use crate::rpc::adapter::ChainAdapter;
use crate::store::db::Db;
use crate::store::events::EventStore;

/// Blocks scanned behind the head for a bootstrap subject.
const BOOTSTRAP_BLOCK_SPAN: u64 = 10_000;
/// Retry backoff base; doubles per attempt with jitter.
const RETRY_BASE_SECONDS: i64 = 30;
/// Static per-subject cost table for ETA estimates.
const WALLET_COST_SECONDS: u64 = 45;
const TOKEN_COST_SECONDS: u64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Wallet,
    Token,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Wallet => "wallet",
            SubjectType::Token => "token",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s {
            "wallet" => Some(SubjectType::Wallet),
            "token" => Some(SubjectType::Token),
            _ => None,
        }
    }

    /// Default queue priority; lower runs first.
    pub fn default_priority(&self) -> u32 {
        match self {
            SubjectType::Token => 2,
            SubjectType::Wallet => 3,
        }
    }

    fn base_cost_seconds(&self) -> u64 {
        match self {
            SubjectType::Wallet => WALLET_COST_SECONDS,
            SubjectType::Token => TOKEN_COST_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapTask {
    pub dedup_key: String,
    pub subject_type: SubjectType,
    pub network: NetworkId,
    pub address: String,
    pub priority: u32,
    pub status: TaskStatus,
    pub attempts: u32,
    pub progress: u8,
    pub step: String,
    pub eta_seconds: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    /// True when this call created the task.
    pub queued: bool,
    pub status: TaskStatus,
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub exists: bool,
    pub status: Option<TaskStatus>,
    pub progress: u8,
    pub step: Option<String>,
    pub eta_seconds: Option<u64>,
}

/// Resolver-surface collaborator notified when a task reaches a terminal
/// state.
#[async_trait]
pub trait ResolverSink: Send + Sync {
    async fn update_resolution_after_bootstrap(&self, address: &str, status: TaskStatus);
}

/// Default sink for deployments without a resolver wired in.
pub struct NoopResolver;

#[async_trait]
impl ResolverSink for NoopResolver {
    async fn update_resolution_after_bootstrap(&self, address: &str, status: TaskStatus) {
        debug!(address, status = status.as_str(), "bootstrap completion (no resolver)");
    }
}

pub fn dedup_key(subject_type: SubjectType, network: NetworkId, address: &str) -> String {
    format!(
        "{}:{}:{}",
        subject_type.as_str(),
        network.as_str(),
        address.to_lowercase()
    )
}

#[derive(Clone)]
pub struct BootstrapQueue {
    db: Db,
    max_attempts: u32,
}

impl BootstrapQueue {
    pub fn new(db: Db, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Idempotent enqueue: the first caller creates the task, everyone else
    /// gets the existing one with its current progress.
    pub fn enqueue(
        &self,
        subject_type: SubjectType,
        network: NetworkId,
        address: &str,
        priority: Option<u32>,
    ) -> Result<EnqueueOutcome> {
        let key = dedup_key(subject_type, network, address);
        let now = Utc::now().timestamp();
        let priority = priority.unwrap_or_else(|| subject_type.default_priority());
        let eta = self.estimate_eta(subject_type)?;

        let inserted = {
            let conn = self.db.lock();
            conn.execute(
                "INSERT OR IGNORE INTO bootstrap_tasks (
                    dedup_key, subject_type, network, address, priority, status,
                    attempts, progress, step, eta_seconds, created_at, updated_at,
                    next_attempt_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, 0, 'queued', ?6, ?7, ?7, 0)",
                params![
                    key,
                    subject_type.as_str(),
                    network.as_str(),
                    address.to_lowercase(),
                    priority,
                    eta,
                    now
                ],
            )?
        };

        if inserted == 1 {
            debug!(key = %key, priority, "bootstrap task enqueued");
            return Ok(EnqueueOutcome {
                queued: true,
                status: TaskStatus::Queued,
                progress: 0,
            });
        }

        let existing = self
            .get(subject_type, network, address)?
            .expect("conflicting bootstrap row must exist");
        Ok(EnqueueOutcome {
            queued: false,
            status: existing.status,
            progress: existing.progress,
        })
    }

    pub fn get_status(
        &self,
        subject_type: SubjectType,
        network: NetworkId,
        address: &str,
    ) -> Result<TaskStatusView> {
        match self.get(subject_type, network, address)? {
            Some(task) => Ok(TaskStatusView {
                exists: true,
                status: Some(task.status),
                progress: task.progress,
                step: Some(task.step),
                eta_seconds: task.eta_seconds,
            }),
            None => Ok(TaskStatusView {
                exists: false,
                status: None,
                progress: 0,
                step: None,
                eta_seconds: None,
            }),
        }
    }

    /// Known per-subject cost scaled by the live tasks ahead in the queue.
    pub fn estimate_eta(&self, subject_type: SubjectType) -> Result<u64> {
        let conn = self.db.lock();
        let ahead: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bootstrap_tasks WHERE status IN ('queued', 'running')",
            [],
            |row| row.get(0),
        )?;
        Ok(subject_type.base_cost_seconds() * (ahead as u64 + 1))
    }

    pub fn get(
        &self,
        subject_type: SubjectType,
        network: NetworkId,
        address: &str,
    ) -> Result<Option<BootstrapTask>> {
        let key = dedup_key(subject_type, network, address);
        self.get_by_key(&key)
    }

    fn get_by_key(&self, key: &str) -> Result<Option<BootstrapTask>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT dedup_key, subject_type, network, address, priority, status,
                    attempts, progress, step, eta_seconds, created_at, updated_at,
                    completed_at, last_error
             FROM bootstrap_tasks WHERE dedup_key = ?1",
        )?;
        let task = stmt
            .query_row([key], row_to_task)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(task)
    }

    /// Claim the next due task: lowest priority number first, oldest first.
    /// The select-and-mark runs under the connection lock, so two workers
    /// never claim the same task.
    pub fn claim_next(&self, now: i64) -> Result<Option<BootstrapTask>> {
        let conn = self.db.lock();
        let key: Option<String> = conn
            .query_row(
                "SELECT dedup_key FROM bootstrap_tasks
                 WHERE status = 'queued' AND next_attempt_at <= ?1
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1",
                [now],
                |row| row.get(0),
            )
            .ok();
        let Some(key) = key else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE bootstrap_tasks
             SET status = 'running', step = 'starting', updated_at = ?2
             WHERE dedup_key = ?1 AND status = 'queued'",
            params![key, now],
        )?;
        drop(conn);
        self.get_by_key(&key)
    }

    /// Phase-boundary progress publication. Progress is monotone; stale
    /// writes are ignored.
    pub fn publish_progress(&self, key: &str, progress: u8, step: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.db.lock();
        conn.execute(
            "UPDATE bootstrap_tasks
             SET progress = MAX(progress, ?2), step = ?3, updated_at = ?4
             WHERE dedup_key = ?1 AND status = 'running'",
            params![key, progress.min(100), step, now],
        )?;
        Ok(())
    }

    pub fn complete(&self, key: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.db.lock();
        conn.execute(
            "UPDATE bootstrap_tasks
             SET status = 'done', progress = 100, step = 'done', updated_at = ?2,
                 completed_at = ?2
             WHERE dedup_key = ?1 AND status = 'running'",
            params![key, now],
        )?;
        Ok(())
    }

    /// Reschedule with exponential backoff and jitter, or mark terminally
    /// failed once the attempt budget is spent.
    pub fn fail(&self, key: &str, error: &str) -> Result<TaskStatus> {
        let now = Utc::now().timestamp();
        let Some(task) = self.get_by_key(key)? else {
            return Ok(TaskStatus::Failed);
        };
        let attempts = task.attempts + 1;

        if attempts >= self.max_attempts {
            let conn = self.db.lock();
            conn.execute(
                "UPDATE bootstrap_tasks
                 SET status = 'failed', attempts = ?2, step = 'failed',
                     last_error = ?3, updated_at = ?4, completed_at = ?4
                 WHERE dedup_key = ?1",
                params![key, attempts, error, now],
            )?;
            warn!(key = %key, attempts, error, "bootstrap task terminally failed");
            return Ok(TaskStatus::Failed);
        }

        let backoff = RETRY_BASE_SECONDS << (attempts - 1).min(6);
        let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
        let next_attempt = now + backoff + jitter;
        let conn = self.db.lock();
        conn.execute(
            "UPDATE bootstrap_tasks
             SET status = 'queued', attempts = ?2, step = 'retry_scheduled',
                 last_error = ?3, updated_at = ?4, next_attempt_at = ?5
             WHERE dedup_key = ?1",
            params![key, attempts, error, now, next_attempt],
        )?;
        debug!(key = %key, attempts, next_attempt, "bootstrap task rescheduled");
        Ok(TaskStatus::Queued)
    }

    /// Terminal tasks whose resolver callback has not fired yet.
    pub fn pending_callbacks(&self) -> Result<Vec<BootstrapTask>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT dedup_key, subject_type, network, address, priority, status,
                    attempts, progress, step, eta_seconds, created_at, updated_at,
                    completed_at, last_error
             FROM bootstrap_tasks
             WHERE status IN ('done', 'failed') AND callback_emitted = 0
             ORDER BY completed_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Flips the exactly-once flag; returns false when another worker beat
    /// us to it.
    pub fn mark_callback_emitted(&self, key: &str) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE bootstrap_tasks SET callback_emitted = 1
             WHERE dedup_key = ?1 AND callback_emitted = 0",
            [key],
        )?;
        Ok(changed == 1)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<BootstrapTask> {
    let subject_tag: String = row.get(1)?;
    let network_tag: String = row.get(2)?;
    let status_tag: String = row.get(5)?;
    Ok(BootstrapTask {
        dedup_key: row.get(0)?,
        subject_type: SubjectType::from_tag(&subject_tag).unwrap_or(SubjectType::Wallet),
        network: NetworkId::from_tag(&network_tag).unwrap_or(NetworkId::Eth),
        address: row.get(3)?,
        priority: row.get(4)?,
        status: TaskStatus::from_tag(&status_tag).unwrap_or(TaskStatus::Queued),
        attempts: row.get(6)?,
        progress: row.get::<_, i64>(7)? as u8,
        step: row.get(8)?,
        eta_seconds: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        completed_at: row.get(12)?,
        last_error: row.get(13)?,
    })
}

/// Drives queued tasks: discover head, fetch the subject's recent transfers,
/// aggregate, and publish completion.
pub struct BootstrapWorker {
    queue: BootstrapQueue,
    adapter: Arc<ChainAdapter>,
    events: EventStore,
    nodes: Arc<NodeAnalyticsBuilder>,
    relations: Arc<RelationAggregator>,
    price: Arc<dyn PriceProvider>,
    resolver: Arc<dyn ResolverSink>,
    poll: Duration,
}

impl BootstrapWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: BootstrapQueue,
        adapter: Arc<ChainAdapter>,
        events: EventStore,
        nodes: Arc<NodeAnalyticsBuilder>,
        relations: Arc<RelationAggregator>,
        price: Arc<dyn PriceProvider>,
        resolver: Arc<dyn ResolverSink>,
        poll_secs: u64,
    ) -> Self {
        Self {
            queue,
            adapter,
            events,
            nodes,
            relations,
            price,
            resolver,
            poll: Duration::from_secs(poll_secs.max(1)),
        }
    }

    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("bootstrap worker started");
            loop {
                // Callbacks first so restarts drain anything left over.
                self.emit_callbacks().await;

                let now = Utc::now().timestamp();
                let task = match self.queue.claim_next(now) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "bootstrap claim failed");
                        None
                    }
                };

                match task {
                    Some(task) => {
                        let key = task.dedup_key.clone();
                        if let Err(e) = self.run_task(&task).await {
                            let _ = self.queue.fail(&key, &e.to_string());
                        } else if let Err(e) = self.queue.complete(&key) {
                            warn!(key = %key, error = %e, "bootstrap completion write failed");
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(self.poll) => {}
                            _ = shutdown.recv() => break,
                        }
                    }
                }

                if shutdown.try_recv().is_ok() {
                    break;
                }
            }
            info!("bootstrap worker stopped");
        })
    }

    async fn run_task(&self, task: &BootstrapTask) -> Result<()> {
        let key = &task.dedup_key;
        let network = task.network;
        let address = &task.address;

        self.queue.publish_progress(key, 5, "discover")?;
        let head = self
            .adapter
            .latest_block(network)
            .await
            .map_err(|e| anyhow::anyhow!("head discovery failed: {e}"))?;
        let from_block = head.saturating_sub(BOOTSTRAP_BLOCK_SPAN);
        self.queue.publish_progress(key, 20, "fetch")?;

        let fetched = self
            .adapter
            .fetch_address_transfers(network, from_block, head, address, IngestionSource::Bootstrap)
            .await
            .map_err(|e| anyhow::anyhow!("subject fetch failed: {e}"))?;

        let mut events = fetched.events;
        enrich_events_usd(&mut events, self.price.as_ref()).await;
        let report = self
            .events
            .insert_events(&events)
            .map_err(|e| anyhow::anyhow!("subject persist failed: {e}"))?;
        debug!(
            key = %key,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "bootstrap events persisted"
        );
        self.queue.publish_progress(key, 80, "aggregate")?;

        let now = Utc::now().timestamp();
        let analytics = self.nodes.compute(network, address, now)?;
        self.nodes.upsert(&analytics)?;
        let relations = self.relations.aggregate_for_anchor(network, address, now)?;
        self.relations.upsert_relations(&relations)?;
        self.queue.publish_progress(key, 100, "finalize")?;

        Ok(())
    }

    async fn emit_callbacks(&self) {
        let pending = match self.queue.pending_callbacks() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "callback listing failed");
                return;
            }
        };
        for task in pending {
            match self.queue.mark_callback_emitted(&task.dedup_key) {
                Ok(true) => {
                    self.resolver
                        .update_resolution_after_bootstrap(&task.address, task.status)
                        .await;
                    info!(
                        address = %task.address,
                        status = task.status.as_str(),
                        "bootstrap completion published"
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(key = %task.dedup_key, error = %e, "callback flag write failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> BootstrapQueue {
        BootstrapQueue::new(Db::open_in_memory().unwrap(), 3)
    }

    #[test]
    fn enqueue_is_idempotent() {
        let q = queue();
        let first = q
            .enqueue(SubjectType::Wallet, NetworkId::Eth, "0xABC", None)
            .unwrap();
        assert!(first.queued);
        assert_eq!(first.status, TaskStatus::Queued);

        for _ in 0..2 {
            let again = q
                .enqueue(SubjectType::Wallet, NetworkId::Eth, "0xabc", None)
                .unwrap();
            assert!(!again.queued);
            assert_eq!(again.status, TaskStatus::Queued);
        }

        // Same address, different subject type is a distinct task.
        let token = q
            .enqueue(SubjectType::Token, NetworkId::Eth, "0xabc", None)
            .unwrap();
        assert!(token.queued);
    }

    #[test]
    fn tokens_claim_before_wallets() {
        let q = queue();
        q.enqueue(SubjectType::Wallet, NetworkId::Eth, "0xwallet", None)
            .unwrap();
        q.enqueue(SubjectType::Token, NetworkId::Eth, "0xtoken", None)
            .unwrap();

        let now = Utc::now().timestamp();
        let claimed = q.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.subject_type, SubjectType::Token);
        assert_eq!(claimed.status, TaskStatus::Running);

        let next = q.claim_next(now).unwrap().unwrap();
        assert_eq!(next.subject_type, SubjectType::Wallet);

        assert!(q.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn progress_is_monotone_and_terminal_states_sticky() {
        let q = queue();
        q.enqueue(SubjectType::Wallet, NetworkId::Eth, "0xabc", None)
            .unwrap();
        let now = Utc::now().timestamp();
        let task = q.claim_next(now).unwrap().unwrap();

        q.publish_progress(&task.dedup_key, 40, "fetch").unwrap();
        q.publish_progress(&task.dedup_key, 20, "fetch").unwrap();
        let view = q
            .get_status(SubjectType::Wallet, NetworkId::Eth, "0xabc")
            .unwrap();
        assert_eq!(view.progress, 40);

        q.complete(&task.dedup_key).unwrap();
        let view = q
            .get_status(SubjectType::Wallet, NetworkId::Eth, "0xabc")
            .unwrap();
        assert_eq!(view.status, Some(TaskStatus::Done));
        assert_eq!(view.progress, 100);

        // No further writes apply to a terminal task.
        q.publish_progress(&task.dedup_key, 10, "late").unwrap();
        let view = q
            .get_status(SubjectType::Wallet, NetworkId::Eth, "0xabc")
            .unwrap();
        assert_eq!(view.progress, 100);
        assert_eq!(view.status, Some(TaskStatus::Done));
    }

    #[test]
    fn retries_back_off_then_fail_terminally() {
        let q = queue();
        q.enqueue(SubjectType::Wallet, NetworkId::Eth, "0xabc", None)
            .unwrap();
        let now = Utc::now().timestamp();

        let task = q.claim_next(now).unwrap().unwrap();
        assert_eq!(q.fail(&task.dedup_key, "boom").unwrap(), TaskStatus::Queued);

        // Not due yet: backoff pushed next_attempt_at into the future.
        assert!(q.claim_next(now).unwrap().is_none());
        let far_future = now + 10_000;
        let task = q.claim_next(far_future).unwrap().unwrap();
        assert_eq!(task.attempts, 1);

        assert_eq!(q.fail(&task.dedup_key, "boom").unwrap(), TaskStatus::Queued);
        let task = q.claim_next(far_future + 10_000).unwrap().unwrap();
        assert_eq!(task.attempts, 2);

        // Third failure exhausts the budget.
        assert_eq!(q.fail(&task.dedup_key, "boom").unwrap(), TaskStatus::Failed);
        let view = q
            .get_status(SubjectType::Wallet, NetworkId::Eth, "0xabc")
            .unwrap();
        assert_eq!(view.status, Some(TaskStatus::Failed));
    }

    #[test]
    fn callbacks_fire_exactly_once() {
        let q = queue();
        q.enqueue(SubjectType::Wallet, NetworkId::Eth, "0xabc", None)
            .unwrap();
        let now = Utc::now().timestamp();
        let task = q.claim_next(now).unwrap().unwrap();
        q.complete(&task.dedup_key).unwrap();

        let pending = q.pending_callbacks().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(q.mark_callback_emitted(&task.dedup_key).unwrap());
        assert!(!q.mark_callback_emitted(&task.dedup_key).unwrap());
        assert!(q.pending_callbacks().unwrap().is_empty());
    }

    #[test]
    fn eta_scales_with_queue_depth() {
        let q = queue();
        let empty = q.estimate_eta(SubjectType::Wallet).unwrap();
        assert_eq!(empty, WALLET_COST_SECONDS);

        q.enqueue(SubjectType::Wallet, NetworkId::Eth, "0xa", None)
            .unwrap();
        q.enqueue(SubjectType::Wallet, NetworkId::Eth, "0xb", None)
            .unwrap();
        let behind_two = q.estimate_eta(SubjectType::Token).unwrap();
        assert_eq!(behind_two, TOKEN_COST_SECONDS * 3);
    }
}
