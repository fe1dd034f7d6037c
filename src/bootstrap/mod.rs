pub mod queue;

pub use queue::{
    dedup_key, BootstrapQueue, BootstrapTask, BootstrapWorker, EnqueueOutcome, NoopResolver,
    ResolverSink, SubjectType, TaskStatus, TaskStatusView,
};
