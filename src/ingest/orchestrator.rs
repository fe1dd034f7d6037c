//! Ingestion orchestrator: one worker task per chain, strictly sequential
//! windows within a chain.
//!
//! The loop consults the sync tracker and the control state at every
//! re-entry, asks the planner for a window, fetches through the pool-backed
//! adapter, and commits through the replay-guarded store. Budget pressure
//! (rate limits, exhausted pools) backs off with jittered exponential delay;
//! transient remote errors feed the chain's error budget; a continuity
//! violation marks the chain ERROR until an operator reset.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::IngestError;
use crate::ingest::sync_state::ChainSyncTracker;
use crate::ingest::window;
use crate::models::{ChainStatus, IngestionSource, NetworkId};
use crate::price::{enrich_events_usd, PriceProvider};
use crate::rpc::adapter::ChainAdapter;
use crate::rpc::pool::RpcPool;
use crate::rpc::provider::ProviderStatusRow;
use crate::store::events::EventStore;

/// Consecutive windows a catching-up chain may take before yielding.
const CATCHUP_CAP_STANDARD: usize = 4;
const CATCHUP_CAP_FULL: usize = 8;
/// Backoff ceiling for budget pressure.
const BACKOFF_CEILING: Duration = Duration::from_secs(60);
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestionMode {
    Limited,
    Standard,
    Full,
    Boost,
}

impl IngestionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionMode::Limited => "LIMITED",
            IngestionMode::Standard => "STANDARD",
            IngestionMode::Full => "FULL",
            IngestionMode::Boost => "BOOST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pools,
    Swaps,
    Liquidity,
}

impl Stage {
    pub fn from_tag(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pools" => Some(Stage::Pools),
            "swaps" => Some(Stage::Swaps),
            "liquidity" => Some(Stage::Liquidity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageToggles {
    pub pools: bool,
    pub swaps: bool,
    pub liquidity: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            pools: true,
            swaps: true,
            liquidity: true,
        }
    }
}

impl StageToggles {
    pub fn any_enabled(&self) -> bool {
        self.pools || self.swaps || self.liquidity
    }
}

#[derive(Debug)]
struct ControlState {
    mode: IngestionMode,
    boost_until: Option<i64>,
    stages: StageToggles,
    global_paused: bool,
}

impl ControlState {
    fn effective_mode(&mut self, now: i64) -> IngestionMode {
        if self.mode == IngestionMode::Boost {
            match self.boost_until {
                Some(until) if now < until => IngestionMode::Boost,
                _ => {
                    // Boost expired; fall back quietly.
                    self.mode = IngestionMode::Standard;
                    self.boost_until = None;
                    IngestionMode::Standard
                }
            }
        } else {
            self.mode
        }
    }
}

/// Admin-surface view: mode, stages, pools, and per-chain checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub mode: String,
    pub boost_remaining_secs: Option<i64>,
    pub stages: StageToggles,
    pub global_paused: bool,
    pub chains: Vec<crate::models::ChainSyncState>,
    pub providers: HashMap<String, Vec<ProviderStatusRow>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub chain: String,
    pub last_synced_block: u64,
    pub last_head_block: u64,
    pub total_events_ingested: u64,
}

struct OrchestratorInner {
    adapter: ChainAdapter,
    pool: Arc<RpcPool>,
    tracker: Arc<ChainSyncTracker>,
    events: EventStore,
    price: Arc<dyn PriceProvider>,
    control: Arc<Mutex<ControlState>>,
    window_overrides: HashMap<NetworkId, u64>,
    active_networks: Vec<NetworkId>,
    /// Chains that stay active in LIMITED mode.
    limited_networks: Vec<NetworkId>,
    idle_ms: u64,
    shutdown: broadcast::Sender<()>,
}

pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        adapter: ChainAdapter,
        pool: Arc<RpcPool>,
        tracker: Arc<ChainSyncTracker>,
        events: EventStore,
        price: Arc<dyn PriceProvider>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(8);
        let window_overrides = config
            .active_networks
            .iter()
            .filter_map(|n| {
                config
                    .providers
                    .settings(*n)
                    .window_override
                    .map(|w| (*n, w))
            })
            .collect();

        let limited_networks = config
            .active_networks
            .iter()
            .copied()
            .filter(|n| matches!(n, NetworkId::Eth | NetworkId::Base))
            .collect::<Vec<_>>();

        let inner = OrchestratorInner {
            adapter,
            pool,
            tracker,
            events,
            price,
            control: Arc::new(Mutex::new(ControlState {
                mode: IngestionMode::Standard,
                boost_until: None,
                stages: StageToggles::default(),
                global_paused: false,
            })),
            window_overrides,
            active_networks: config.active_networks.clone(),
            limited_networks,
            idle_ms: config.chain_idle_ms,
            shutdown,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            control: self.inner.control.clone(),
            tracker: self.inner.tracker.clone(),
            pool: self.inner.pool.clone(),
        }
    }

    /// One worker per active chain. Workers exit on the shutdown broadcast,
    /// finishing or aborting the in-flight window first.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        self.inner
            .active_networks
            .iter()
            .map(|&chain| {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    chain_loop(inner, chain).await;
                })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        info!("ingestion shutdown requested");
        let _ = self.inner.shutdown.send(());
    }

    pub fn shutdown_subscriber(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }
}

/// The behaviors behind the external admin surface. Transport (HTTP, CLI)
/// lives outside this crate; these methods are the contract.
#[derive(Clone)]
pub struct ControlHandle {
    control: Arc<Mutex<ControlState>>,
    tracker: Arc<ChainSyncTracker>,
    pool: Arc<RpcPool>,
}

impl ControlHandle {
    pub fn status(&self) -> IngestionStatus {
        let now = Utc::now().timestamp();
        let (mode, boost_until, stages, global_paused) = {
            let mut control = self.control.lock();
            let mode = control.effective_mode(now);
            (mode, control.boost_until, control.stages, control.global_paused)
        };
        let providers = self
            .pool
            .all_status_rows()
            .into_iter()
            .map(|(n, rows)| (n.as_str().to_string(), rows))
            .collect();
        IngestionStatus {
            mode: mode.as_str().to_string(),
            boost_remaining_secs: boost_until.map(|u| (u - now).max(0)),
            stages,
            global_paused,
            chains: self.tracker.all(),
            providers,
        }
    }

    /// LIMITED / STANDARD / FULL. BOOST goes through [`Self::boost`].
    pub fn set_mode(&self, mode: IngestionMode) -> anyhow::Result<()> {
        if mode == IngestionMode::Boost {
            anyhow::bail!("use boost(minutes) for temporary BOOST");
        }
        let mut control = self.control.lock();
        control.mode = mode;
        control.boost_until = None;
        info!(mode = mode.as_str(), "ingestion mode set");
        Ok(())
    }

    /// Temporary FULL-aggressiveness with an expiry.
    pub fn boost(&self, minutes: u64) -> anyhow::Result<()> {
        if !(1..=60).contains(&minutes) {
            anyhow::bail!("boost minutes must be within 1..=60");
        }
        let mut control = self.control.lock();
        control.mode = IngestionMode::Boost;
        control.boost_until = Some(Utc::now().timestamp() + (minutes as i64) * 60);
        info!(minutes, "boost engaged");
        Ok(())
    }

    pub fn pause_all(&self) {
        self.control.lock().global_paused = true;
        info!("global ingestion pause");
    }

    pub fn resume_all(&self) {
        self.control.lock().global_paused = false;
        info!("global ingestion resume");
    }

    pub fn pause_chain(&self, chain: NetworkId, reason: &str) -> Result<(), IngestError> {
        self.tracker.pause(chain, reason)
    }

    pub fn resume_chain(&self, chain: NetworkId) -> Result<(), IngestError> {
        self.tracker.resume(chain)
    }

    pub fn reset_chain(&self, chain: NetworkId, new_start: u64) -> Result<(), IngestError> {
        self.tracker.reset(chain, new_start)
    }

    pub fn set_stage(&self, stage: Stage, enabled: bool) {
        let mut control = self.control.lock();
        match stage {
            Stage::Pools => control.stages.pools = enabled,
            Stage::Swaps => control.stages.swaps = enabled,
            Stage::Liquidity => control.stages.liquidity = enabled,
        }
        info!(?stage, enabled, "stage toggled");
    }

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        let stages = self.control.lock().stages;
        match stage {
            Stage::Pools => stages.pools,
            Stage::Swaps => stages.swaps,
            Stage::Liquidity => stages.liquidity,
        }
    }

    pub fn is_limited(&self) -> bool {
        let now = Utc::now().timestamp();
        self.control.lock().effective_mode(now) == IngestionMode::Limited
    }

    pub fn set_provider_enabled(
        &self,
        network: NetworkId,
        provider_id: &str,
        enabled: bool,
    ) -> Result<(), IngestError> {
        self.pool.set_provider_enabled(network, provider_id, enabled)
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.tracker
            .all()
            .into_iter()
            .map(|s| Checkpoint {
                chain: s.chain.as_str().to_string(),
                last_synced_block: s.last_synced_block,
                last_head_block: s.last_head_block,
                total_events_ingested: s.total_events_ingested,
            })
            .collect()
    }
}

/// Jittered exponential backoff for budget pressure.
struct Backoff {
    attempts: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempts: 0 }
    }

    fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE.as_millis() as u64 * (1u64 << self.attempts.min(6));
        let capped = exp.min(BACKOFF_CEILING.as_millis() as u64);
        self.attempts = self.attempts.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_millis(((capped as f64) * jitter) as u64)
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Per-iteration gates derived from control state.
struct LoopGates {
    active: bool,
    catchup_cap: usize,
    idle: Duration,
}

impl OrchestratorInner {
    fn gates(&self, chain: NetworkId) -> LoopGates {
        let now = Utc::now().timestamp();
        let mut control = self.control.lock();
        let mode = control.effective_mode(now);
        let chain_allowed = match mode {
            IngestionMode::Limited => self.limited_networks.contains(&chain),
            _ => true,
        };
        let active = !control.global_paused && chain_allowed && control.stages.any_enabled();
        let (catchup_cap, idle_ms) = match mode {
            IngestionMode::Full | IngestionMode::Boost => {
                (CATCHUP_CAP_FULL, (self.idle_ms / 2).max(250))
            }
            _ => (CATCHUP_CAP_STANDARD, self.idle_ms),
        };
        LoopGates {
            active,
            catchup_cap,
            idle: Duration::from_millis(idle_ms),
        }
    }
}

/// Sleep that wakes early on shutdown. Returns true when shutting down.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}

async fn chain_loop(inner: Arc<OrchestratorInner>, chain: NetworkId) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut backoff = Backoff::new();
    // Shrunk window while the chain recovers; cleared on the next success.
    let mut shrink_override: Option<u64> = None;

    info!(chain = %chain, "chain worker started");

    loop {
        let gates = inner.gates(chain);
        if !gates.active {
            if sleep_or_shutdown(gates.idle, &mut shutdown).await {
                break;
            }
            continue;
        }

        let state = match inner.tracker.get(chain) {
            Ok(s) => s,
            Err(e) => {
                warn!(chain = %chain, error = %e, "chain worker stopping");
                break;
            }
        };
        if matches!(state.status, ChainStatus::Paused | ChainStatus::Error) {
            if sleep_or_shutdown(gates.idle, &mut shutdown).await {
                break;
            }
            continue;
        }

        let head = match inner.adapter.latest_block(chain).await {
            Ok(h) => h,
            Err(e) if e.is_budget_pressure() => {
                let delay = backoff.next_delay();
                debug!(chain = %chain, error = %e, ?delay, "budget pressure on head fetch");
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                let _ = inner.tracker.on_error(chain, &e.to_string());
                if sleep_or_shutdown(gates.idle, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        if inner.tracker.update_head(chain, head).is_err() {
            break;
        }

        // Window burst: catch-up chains take several consecutive windows,
        // capped so no chain starves the others.
        let mut windows_done = 0usize;
        let mut stop = false;
        loop {
            if shutdown.try_recv().is_ok() {
                stop = true;
                break;
            }
            let state = match inner.tracker.get(chain) {
                Ok(s) => s,
                Err(_) => {
                    stop = true;
                    break;
                }
            };
            if state.status == ChainStatus::Paused {
                break;
            }

            let configured = inner.window_overrides.get(&chain).copied();
            let override_size = shrink_override.or(configured);
            let Some(plan) = window::next_window(&state, head, override_size) else {
                break; // caught up to the safe head
            };
            if let Err(e) = window::validate(&plan, &state) {
                // Continuity violation: fatal for the chain, operator reset required.
                let _ = inner.tracker.mark_error(chain, &e.to_string());
                break;
            }

            let started = Instant::now();
            match inner
                .adapter
                .fetch(chain, plan.from_block, plan.to_block, IngestionSource::Rpc)
                .await
            {
                Ok(fetched) => {
                    if fetched.degraded {
                        warn!(
                            chain = %chain,
                            from = plan.from_block,
                            to = plan.to_block,
                            "block timestamps incomplete; events stamped with wall clock"
                        );
                    }
                    let mut events = fetched.events;
                    enrich_events_usd(&mut events, inner.price.as_ref()).await;

                    match inner.events.insert_events(&events) {
                        Ok(report) => {
                            let latency_ms = started.elapsed().as_millis() as f64;
                            if inner
                                .tracker
                                .on_success(
                                    chain,
                                    plan.from_block,
                                    plan.to_block,
                                    head,
                                    events.len(),
                                    latency_ms,
                                )
                                .is_err()
                            {
                                stop = true;
                                break;
                            }
                            debug!(
                                chain = %chain,
                                from = plan.from_block,
                                to = plan.to_block,
                                reason = plan.reason.as_str(),
                                inserted = report.inserted,
                                duplicates = report.duplicates,
                                "window committed"
                            );
                            shrink_override = None;
                            backoff.reset();
                            windows_done += 1;
                            let keep_going = matches!(
                                plan.reason,
                                crate::models::WindowReason::Catchup
                                    | crate::models::WindowReason::Backfill
                            );
                            if !keep_going || windows_done >= gates.catchup_cap {
                                break;
                            }
                        }
                        Err(e) => {
                            // Batch aborted; checkpoint untouched.
                            let paused =
                                inner.tracker.on_error(chain, &e.to_string()).unwrap_or(false);
                            if !paused {
                                shrink_override = Some(shrunk_window(&inner, chain, configured));
                            }
                            break;
                        }
                    }
                }
                Err(e) if e.is_budget_pressure() => {
                    let delay = backoff.next_delay();
                    debug!(chain = %chain, error = %e, ?delay, "budget pressure on fetch");
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        stop = true;
                    }
                    break;
                }
                Err(e) => {
                    let paused = inner.tracker.on_error(chain, &e.to_string()).unwrap_or(false);
                    if !paused {
                        shrink_override = Some(shrunk_window(&inner, chain, configured));
                    }
                    break;
                }
            }
        }
        if stop {
            break;
        }

        if sleep_or_shutdown(gates.idle, &mut shutdown).await {
            break;
        }
    }

    info!(chain = %chain, "chain worker stopped");
}

fn shrunk_window(
    inner: &OrchestratorInner,
    chain: NetworkId,
    configured: Option<u64>,
) -> u64 {
    let state = inner.tracker.get(chain).ok();
    let (error_rate, latency_ms) = state
        .map(|s| (s.consecutive_errors as f64 / 10.0, s.avg_latency_ms))
        .unwrap_or((0.0, 0.0));
    window::optimal_size(chain, error_rate, latency_ms, configured)
}
