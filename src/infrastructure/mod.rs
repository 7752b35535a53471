pub mod alerting;
pub mod cdc_health;
pub mod config;
pub mod distributed_lock;
pub mod kafka_abstraction;
pub mod logging;
pub mod memory;
pub mod outbox;
pub mod outbox_processor;
pub mod reconciliation;
pub mod redis_abstraction;
pub mod scheduler;

pub use alerting::{Alert, AlertPort, AlertSeverity};
pub use cdc_health::{CdcHealthMonitor, CdcStatus};
pub use config::AppConfig;
pub use distributed_lock::{DistributedLockManager, LeaseHandle, LockError};
pub use kafka_abstraction::{EventPublisher, KafkaConfig, KafkaEventPublisher};
pub use outbox::{OutboxRepository, PostgresOutboxRepository};
pub use outbox_processor::OutboxEventProcessor;
pub use reconciliation::OrphanedRecordReconciler;
pub use redis_abstraction::{RealRedisClient, RedisLockCommands};
pub use scheduler::{JobScheduler, ScheduledJob};
