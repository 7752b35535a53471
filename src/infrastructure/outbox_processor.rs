use anyhow::Result;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::events::{EventEnvelope, EventRegistry};
use crate::domain::outbox::{OutboxDeadLetter, OutboxEvent};
use crate::infrastructure::alerting::{raise, Alert, AlertPort, AlertSeverity};
use crate::infrastructure::distributed_lock::LeaseHandle;
use crate::infrastructure::kafka_abstraction::EventPublisher;
use crate::infrastructure::outbox::OutboxRepository;

const ALERT_SOURCE: &str = "outbox-processor";
const MAX_LISTED_FAILURES: usize = 50;

#[derive(Clone, Debug)]
pub struct OutboxProcessorConfig {
    pub max_retry_count: i32,
    pub retention_days: i64,
    /// Upper bound on rows read per poll; the rest wait for the next poll.
    pub fetch_limit: i64,
    /// Rows handled between lease renewals when running under a lease.
    pub lease_renewal_every: usize,
    /// Suppresses repeat failed-event alerts while the failed set is unchanged.
    pub failed_alert_cooldown: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 5,
            retention_days: 7,
            fetch_limit: 1000,
            lease_renewal_every: 25,
            failed_alert_cooldown: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingReport {
    pub published: usize,
    pub failed_attempts: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    /// The poll stopped early because the job lease could not be renewed.
    pub lease_lost: bool,
}

struct FailedAlertMark {
    fingerprint: Vec<Uuid>,
    sent_at: Instant,
}

/// Publishes staged outbox rows, retries failures and dead-letters rows
/// that run out of attempts.
///
/// Callers are expected to run each entry point under the job lock; the
/// processor itself assumes it is the only writer.
pub struct OutboxEventProcessor {
    outbox_repo: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn EventPublisher>,
    alerts: Arc<dyn AlertPort>,
    registry: &'static EventRegistry,
    config: OutboxProcessorConfig,
    last_failed_alert: Mutex<Option<FailedAlertMark>>,
}

impl OutboxEventProcessor {
    pub fn new(
        outbox_repo: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn EventPublisher>,
        alerts: Arc<dyn AlertPort>,
        config: OutboxProcessorConfig,
    ) -> Self {
        Self {
            outbox_repo,
            publisher,
            alerts,
            registry: EventRegistry::chat(),
            config,
            last_failed_alert: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    pub async fn process_outbox_events(&self) -> Result<ProcessingReport> {
        self.poll(None).await
    }

    /// Same as [`process_outbox_events`](Self::process_outbox_events), renewing
    /// `lease` every `lease_renewal_every` rows and leaving the remaining rows
    /// untouched once renewal fails.
    pub async fn process_outbox_events_with_lease(
        &self,
        lease: &LeaseHandle,
    ) -> Result<ProcessingReport> {
        self.poll(Some(lease)).await
    }

    async fn poll(&self, lease: Option<&LeaseHandle>) -> Result<ProcessingReport> {
        let events = self
            .outbox_repo
            .fetch_unprocessed(self.config.fetch_limit)
            .await?;
        let mut report = ProcessingReport::default();

        if !events.is_empty() {
            debug!("Fetched {} unprocessed outbox events", events.len());
        }

        let renew_every = self.config.lease_renewal_every.max(1);
        for (handled, event) in events.into_iter().enumerate() {
            if let Some(lease) = lease {
                if handled > 0 && handled % renew_every == 0 && !lease.extend().await {
                    warn!(key = lease.key(), handled, "Lost outbox processing lease; stopping poll");
                    report.lease_lost = true;
                    break;
                }
            }
            if event.is_exhausted(self.config.max_retry_count) {
                if self.escalate(&event).await {
                    report.dead_lettered += 1;
                }
                continue;
            }
            self.process_event(event, &mut report).await;
        }

        if report.published + report.failed_attempts + report.dead_lettered > 0 {
            info!(
                published = report.published,
                failed_attempts = report.failed_attempts,
                dead_lettered = report.dead_lettered,
                "Outbox poll finished"
            );
        }
        Ok(report)
    }

    async fn process_event(&self, event: OutboxEvent, report: &mut ProcessingReport) {
        let claimed = event.claimed();
        match self.outbox_repo.replace(event.version, &claimed).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(outbox_id = %event.id, "Outbox event changed underneath us; skipping");
                report.skipped += 1;
                return;
            }
            Err(e) => {
                error!(outbox_id = %event.id, error = %e, "Failed to claim outbox event");
                report.skipped += 1;
                return;
            }
        }

        match self.publish(&claimed).await {
            Ok(()) => {
                let completed = claimed.completed(Utc::now());
                match self.outbox_repo.replace(claimed.version, &completed).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        outbox_id = %claimed.id,
                        "Published outbox event was modified before completion was recorded"
                    ),
                    // Published but not marked: it will be published again, consumers are idempotent.
                    Err(e) => error!(
                        outbox_id = %claimed.id,
                        saga_id = %claimed.saga_id,
                        error = %e,
                        "Failed to mark outbox event as processed after publish"
                    ),
                }
                report.published += 1;
            }
            Err(reason) => {
                report.failed_attempts += 1;
                let failed = claimed.failed_attempt(reason.clone());
                warn!(
                    outbox_id = %claimed.id,
                    saga_id = %claimed.saga_id,
                    event_type = %claimed.event_type,
                    retry_count = failed.retry_count,
                    error = %reason,
                    "Outbox publish failed"
                );
                match self.outbox_repo.replace(claimed.version, &failed).await {
                    Ok(true) => {
                        if failed.is_exhausted(self.config.max_retry_count)
                            && self.escalate(&failed).await
                        {
                            report.dead_lettered += 1;
                        }
                    }
                    Ok(false) => warn!(
                        outbox_id = %claimed.id,
                        "Outbox event changed before failure could be recorded"
                    ),
                    Err(e) => error!(
                        outbox_id = %claimed.id,
                        error = %e,
                        "Failed to record outbox retry; will retry on next poll"
                    ),
                }
            }
        }
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<(), String> {
        let decoded = self
            .registry
            .decode(&event.event_type, event.payload.clone())
            .map_err(|e| e.to_string())?;
        let envelope = EventEnvelope::wrap(event.id, event.saga_id, &decoded, event.created_at)
            .map_err(|e| e.to_string())?;
        self.publisher
            .publish(decoded.topic(), &event.aggregate_id, &envelope)
            .await
            .map_err(|e| e.to_string())
    }

    /// Stores the dead letter, then moves the row to FAILED. Returns whether
    /// the row was escalated by this call.
    async fn escalate(&self, event: &OutboxEvent) -> bool {
        let letter = OutboxDeadLetter::for_exhausted(event, Utc::now());
        match self.outbox_repo.record_dead_letter(&letter).await {
            Ok(created) => {
                if !created {
                    debug!(outbox_id = %event.id, "Dead letter already recorded");
                }
            }
            Err(e) => {
                error!(outbox_id = %event.id, error = %e, "Failed to record dead letter; will retry on next poll");
                return false;
            }
        }

        let failed = event.exhausted();
        match self.outbox_repo.replace(event.version, &failed).await {
            Ok(true) => {
                error!(
                    outbox_id = %event.id,
                    saga_id = %event.saga_id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    last_error = ?event.last_error,
                    "Outbox event exhausted retries and was dead-lettered"
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(outbox_id = %event.id, error = %e, "Failed to mark outbox event FAILED");
                false
            }
        }
    }

    /// Deletes processed rows older than the retention window.
    pub async fn cleanup_old_events(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let deleted = self.outbox_repo.delete_processed_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Removed processed outbox events");
        }
        Ok(deleted)
    }

    /// Raises one aggregated alert for all FAILED rows. Read-only on the outbox.
    pub async fn monitor_failed_events(&self) -> Result<usize> {
        let failed = self.outbox_repo.find_failed().await?;
        if failed.is_empty() {
            self.forget_failed_alert();
            return Ok(0);
        }

        let mut fingerprint: Vec<Uuid> = failed.iter().map(|e| e.id).collect();
        fingerprint.sort();
        if self.in_cooldown(&fingerprint) {
            debug!(failed = failed.len(), "Failed outbox events unchanged; alert suppressed");
            return Ok(failed.len());
        }

        let unresolved = self
            .outbox_repo
            .list_dead_letters(Some(false))
            .await
            .map(|letters| letters.len())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Could not count unresolved dead letters");
                0
            });

        let listed: Vec<serde_json::Value> = failed
            .iter()
            .take(MAX_LISTED_FAILURES)
            .map(|e| {
                serde_json::json!({
                    "saga_id": e.saga_id,
                    "event_type": e.event_type,
                    "last_error": e.last_error,
                })
            })
            .collect();

        let alert = Alert::new(
            AlertSeverity::Critical,
            ALERT_SOURCE,
            format!("{} outbox events failed after exhausting retries", failed.len()),
            serde_json::json!({
                "failed_count": failed.len(),
                "unresolved_dead_letters": unresolved,
                "events": listed,
                "truncated": failed.len() > MAX_LISTED_FAILURES,
            }),
        );
        raise(self.alerts.as_ref(), alert).await;
        self.remember_failed_alert(fingerprint);
        Ok(failed.len())
    }

    fn in_cooldown(&self, fingerprint: &[Uuid]) -> bool {
        let guard = match self.last_failed_alert.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(mark) => {
                mark.fingerprint == fingerprint
                    && mark.sent_at.elapsed() < self.config.failed_alert_cooldown
            }
            None => false,
        }
    }

    fn remember_failed_alert(&self, fingerprint: Vec<Uuid>) {
        let mut guard = match self.last_failed_alert.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(FailedAlertMark {
            fingerprint,
            sent_at: Instant::now(),
        });
    }

    fn forget_failed_alert(&self) {
        let mut guard = match self.last_failed_alert.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }
}
