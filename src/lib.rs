//! Chainlens ingestion and aggregation core.
//!
//! Pulls ERC-20 transfer events from the supported EVM networks through
//! pooled JSON-RPC endpoints, advances deterministic per-chain sync state,
//! and materializes the derived layers (relations, node analytics, entity
//! views, snapshots) that the read-only API surfaces consume. The admin
//! control plane and resolver surface are external collaborators; this
//! crate furnishes the behaviors behind them as plain APIs.

pub mod aggregate;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ingest;
pub mod labels;
pub mod models;
pub mod price;
pub mod rpc;
pub mod store;

pub use aggregate::{
    EntityAggregator, NodeAnalyticsBuilder, RelationAggregator, Scheduler, SnapshotBuilder,
};
pub use bootstrap::{BootstrapQueue, BootstrapWorker};
pub use config::Config;
pub use error::IngestError;
pub use ingest::{ChainSyncTracker, ControlHandle, HealthMonitor, Orchestrator};
pub use models::NetworkId;
pub use rpc::{ChainAdapter, HttpTransport, RpcPool};
pub use store::{Db, EventStore};
