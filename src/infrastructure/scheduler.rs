use crate::infrastructure::distributed_lock::{
    owner_token, DistributedLockManager, LeaseHandle, LockError,
};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type JobFn = Arc<dyn Fn(LeaseHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A fixed-interval job that must run on at most one instance at a time.
#[derive(Clone)]
pub struct ScheduledJob {
    name: String,
    interval: Duration,
    lease: Duration,
    run: JobFn,
}

impl ScheduledJob {
    /// `lease` should outlast one normal run but stay below the window in
    /// which a crashed holder has to be noticed.
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, lease: Duration, run: F) -> Self
    where
        F: Fn(LeaseHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            lease,
            run: Arc::new(move |lease| run(lease).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_resource(&self) -> String {
        format!("job:{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Another instance held the job lock.
    Skipped,
    Failed(String),
}

pub struct JobScheduler {
    lock_manager: Arc<DistributedLockManager>,
    instance_id: String,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        lock_manager: Arc<DistributedLockManager>,
        instance_id: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            lock_manager,
            instance_id: instance_id.into(),
            shutdown,
        }
    }

    /// Acquires the job lock, runs the job once and releases the lock.
    /// Never returns an error and never panics on a failing job.
    pub async fn run_once(&self, job: &ScheduledJob) -> JobOutcome {
        let resource = job.lock_resource();
        let owner = owner_token(&self.instance_id);
        let lease = LeaseHandle::new(
            self.lock_manager.clone(),
            &resource,
            owner.clone(),
            job.lease,
        );
        let run = job.run.clone();

        let result = self
            .lock_manager
            .with_lock(&resource, &owner, job.lease, 0, move || async move {
                match AssertUnwindSafe(run(lease)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("job panicked")),
                }
            })
            .await;

        match result {
            Ok(()) => {
                debug!(job = %job.name, "Scheduled job completed");
                JobOutcome::Completed
            }
            Err(LockError::Contended { .. }) => {
                debug!(job = %job.name, "Scheduled job skipped; another instance holds the lock");
                JobOutcome::Skipped
            }
            Err(e) => {
                error!(job = %job.name, error = %format!("{:#}", e), "Scheduled job failed");
                JobOutcome::Failed(e.to_string())
            }
        }
    }

    /// Runs `job` every `interval` until shutdown.
    pub fn spawn(self: &Arc<Self>, job: ScheduledJob) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(
                job = %job.name,
                interval_ms = job.interval.as_millis() as u64,
                lease_ms = job.lease.as_millis() as u64,
                "Scheduled job started"
            );
            let mut ticker = tokio::time::interval(job.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.run_once(&job).await;
                    }
                }
            }
            info!(job = %job.name, "Scheduled job stopped");
        })
    }
}
