pub mod entity;
pub mod node_analytics;
pub mod relations;
pub mod scheduler;
pub mod snapshot;

pub use entity::{BridgeActivity, BridgeDirection, EntityAggregator, EntityDef, TokenInfo};
pub use node_analytics::{NodeAnalytics, NodeAnalyticsBuilder};
pub use relations::{AggregatedRelation, ConfidenceLevel, Direction, RelationAggregator};
pub use scheduler::Scheduler;
pub use snapshot::{SignalSnapshot, SnapshotBuilder, SnapshotWindow};
