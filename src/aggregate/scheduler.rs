//! Single owner of all periodic work: relation refresh, node analytics
//! refresh, snapshot builds, the rolling error-window reset, and health
//! computation.
//!
//! Each job runs on its own interval inside one select loop, checks the
//! mode and stage toggles before doing anything, and exits on the shutdown
//! broadcast.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::aggregate::node_analytics::NodeAnalyticsBuilder;
use crate::aggregate::relations::RelationAggregator;
use crate::aggregate::snapshot::{SnapshotBuilder, SnapshotWindow};
use crate::config::Config;
use crate::ingest::health::HealthMonitor;
use crate::ingest::orchestrator::{ControlHandle, Stage};
use crate::ingest::sync_state::ChainSyncTracker;
use crate::models::NetworkId;
use crate::store::events::EventStore;

/// Anchors refreshed per network per relation pass.
const RELATION_ANCHOR_CAP: usize = 200;

pub struct Scheduler {
    control: ControlHandle,
    tracker: Arc<ChainSyncTracker>,
    events: EventStore,
    relations: Arc<RelationAggregator>,
    nodes: Arc<NodeAnalyticsBuilder>,
    snapshots: Arc<SnapshotBuilder>,
    health: Arc<HealthMonitor>,
    networks: Vec<NetworkId>,
    relation_refresh: Duration,
    node_refresh: Duration,
    snapshot_refresh: Duration,
    health_check: Duration,
    error_reset: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        control: ControlHandle,
        tracker: Arc<ChainSyncTracker>,
        events: EventStore,
        relations: Arc<RelationAggregator>,
        nodes: Arc<NodeAnalyticsBuilder>,
        snapshots: Arc<SnapshotBuilder>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            control,
            tracker,
            events,
            relations,
            nodes,
            snapshots,
            health,
            networks: config.active_networks.clone(),
            relation_refresh: Duration::from_secs(config.relation_refresh_secs),
            node_refresh: Duration::from_secs(config.node_refresh_secs),
            snapshot_refresh: Duration::from_secs(config.snapshot_refresh_secs),
            health_check: Duration::from_secs(config.health_check_secs),
            error_reset: Duration::from_secs(config.error_reset_secs),
        }
    }

    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("scheduler started");
            let mut relation_tick = interval(self.relation_refresh);
            let mut node_tick = interval(self.node_refresh);
            let mut snapshot_tick = interval(self.snapshot_refresh);
            let mut health_tick = interval(self.health_check);
            let mut error_reset_tick = interval(self.error_reset);

            loop {
                tokio::select! {
                    _ = relation_tick.tick() => self.run_relation_refresh(),
                    _ = node_tick.tick() => self.run_node_refresh(),
                    _ = snapshot_tick.tick() => self.run_snapshots(),
                    _ = health_tick.tick() => {
                        self.health.refresh();
                    }
                    _ = error_reset_tick.tick() => {
                        self.tracker.reset_error_counts();
                        debug!("rolling error window reset");
                    }
                    _ = shutdown.recv() => {
                        info!("scheduler stopped");
                        break;
                    }
                }
            }
        })
    }

    fn run_relation_refresh(&self) {
        if self.control.is_limited() || !self.control.stage_enabled(Stage::Swaps) {
            return;
        }
        let now = Utc::now().timestamp();
        for &network in &self.networks {
            let anchors = match self.events.recent_addresses(network, RELATION_ANCHOR_CAP) {
                Ok(a) => a,
                Err(e) => {
                    warn!(network = %network, error = %e, "anchor listing failed");
                    continue;
                }
            };
            if anchors.is_empty() {
                continue;
            }
            match self.relations.refresh_anchors(network, &anchors, now) {
                Ok(edges) => debug!(network = %network, anchors = anchors.len(), edges, "relations refreshed"),
                Err(e) => warn!(network = %network, error = %e, "relation refresh failed"),
            }
        }
    }

    fn run_node_refresh(&self) {
        if self.control.is_limited() || !self.control.stage_enabled(Stage::Pools) {
            return;
        }
        let now = Utc::now().timestamp();
        for &network in &self.networks {
            match self.nodes.refresh_network(network, now) {
                Ok(count) => debug!(network = %network, addresses = count, "node analytics refreshed"),
                Err(e) => warn!(network = %network, error = %e, "node analytics refresh failed"),
            }
        }
    }

    fn run_snapshots(&self) {
        if !self.control.stage_enabled(Stage::Liquidity) {
            return;
        }
        let now = Utc::now().timestamp();
        for window in SnapshotWindow::ALL {
            match self.snapshots.build_and_persist(window, now) {
                Ok(snap) => debug!(
                    window = window.as_str(),
                    actors = snap.stats.actor_count,
                    edges = snap.stats.edge_count,
                    "snapshot built"
                ),
                Err(e) => warn!(window = window.as_str(), error = %e, "snapshot build failed"),
            }
        }
    }
}
