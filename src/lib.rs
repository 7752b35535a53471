pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod web;

// Re-export commonly used types
pub use application::{ConsumeDecision, EventGate};
pub use domain::{ChatEvent, EventEnvelope, EventVersion, OutboxEvent, SagaState};
pub use infrastructure::{
    AppConfig, CdcHealthMonitor, DistributedLockManager, JobScheduler, OrphanedRecordReconciler,
    OutboxEventProcessor, ScheduledJob,
};
