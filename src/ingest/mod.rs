pub mod health;
pub mod orchestrator;
pub mod sync_state;
pub mod window;

pub use health::{compute_health, HealthLevel, HealthMonitor, HealthReport, Severity};
pub use orchestrator::{
    ControlHandle, IngestionMode, IngestionStatus, Orchestrator, Stage, StageToggles,
};
pub use sync_state::ChainSyncTracker;
