use crate::infrastructure::alerting::{raise, Alert, AlertPort, AlertSeverity};
use crate::infrastructure::distributed_lock::LeaseHandle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ALERT_SOURCE: &str = "orphaned-record-reconciler";

/// The parts of a stored message document the reconciler needs.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDocument {
    pub id: Uuid,
    pub chat_room_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Position after the last document of a page, ordered by `(created_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DocumentCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl From<&MessageDocument> for DocumentCursor {
    fn from(doc: &MessageDocument) -> Self {
        Self {
            created_at: doc.created_at,
            id: doc.id,
        }
    }
}

/// Document store holding message bodies.
#[async_trait]
pub trait MessageDocumentStore: Send + Sync {
    /// Documents created before `cutoff`, ordered by `(created_at, id)`,
    /// starting after `after`.
    async fn find_created_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<DocumentCursor>,
        limit: usize,
    ) -> Result<Vec<MessageDocument>>;

    /// Idempotent: deleting a missing id returns `Ok(false)`.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Relational store that owns chat rooms.
#[async_trait]
pub trait ChatRoomDirectory: Send + Sync {
    async fn exists(&self, chat_room_id: Uuid) -> Result<bool>;
}

/// Message documents kept as JSONB rows in a separate database, one row per
/// message. Table: `message_documents(id, chat_room_id, created_at, body)`.
#[derive(Clone)]
pub struct PostgresMessageDocumentStore {
    pool: PgPool,
}

impl PostgresMessageDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageDocumentRow {
    id: Uuid,
    chat_room_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<MessageDocumentRow> for MessageDocument {
    fn from(row: MessageDocumentRow) -> Self {
        Self {
            id: row.id,
            chat_room_id: row.chat_room_id,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl MessageDocumentStore for PostgresMessageDocumentStore {
    async fn find_created_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<DocumentCursor>,
        limit: usize,
    ) -> Result<Vec<MessageDocument>> {
        let rows: Vec<MessageDocumentRow> = match after {
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, chat_room_id, created_at
                    FROM message_documents
                    WHERE created_at < $1
                    ORDER BY created_at, id
                    LIMIT $2
                    "#,
                )
                .bind(cutoff)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            Some(cursor) => {
                sqlx::query_as(
                    r#"
                    SELECT id, chat_room_id, created_at
                    FROM message_documents
                    WHERE created_at < $1
                      AND (created_at, id) > ($2, $3)
                    ORDER BY created_at, id
                    LIMIT $4
                    "#,
                )
                .bind(cutoff)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to page message documents")?;

        Ok(rows.into_iter().map(MessageDocument::from).collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM message_documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete message document {}", id))?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PostgresChatRoomDirectory {
    pool: PgPool,
}

impl PostgresChatRoomDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRoomDirectory for PostgresChatRoomDirectory {
    async fn exists(&self, chat_room_id: Uuid) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM chat_rooms WHERE id = $1)")
                .bind(chat_room_id)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("Failed to look up chat room {}", chat_room_id))?;
        Ok(exists)
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub cleanup_age_days: i64,
    pub batch_size: usize,
    pub max_batches_per_run: u32,
    /// Share of a batch that may fail before a warning alert is raised.
    pub failure_alert_ratio: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            cleanup_age_days: 7,
            batch_size: 100,
            max_batches_per_run: 10,
            failure_alert_ratio: 0.10,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub batches: u32,
    pub scanned: usize,
    pub orphans_found: usize,
    pub reclaimed: usize,
    pub delete_failures: usize,
    pub lookup_failures: usize,
    pub lease_lost: bool,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    orphans: usize,
    reclaimed: usize,
    delete_failures: usize,
    lookup_failures: usize,
}

/// Deletes message documents whose chat room no longer exists.
///
/// These are left behind when a saga writes the document first and the
/// relational write or its compensation fails afterwards.
pub struct OrphanedRecordReconciler {
    documents: Arc<dyn MessageDocumentStore>,
    rooms: Arc<dyn ChatRoomDirectory>,
    alerts: Arc<dyn AlertPort>,
    config: ReconciliationConfig,
}

impl OrphanedRecordReconciler {
    pub fn new(
        documents: Arc<dyn MessageDocumentStore>,
        rooms: Arc<dyn ChatRoomDirectory>,
        alerts: Arc<dyn AlertPort>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            documents,
            rooms,
            alerts,
            config,
        }
    }

    pub async fn cleanup_orphaned_messages(&self) -> Result<ReconciliationReport> {
        self.run(None).await
    }

    /// Same as [`cleanup_orphaned_messages`](Self::cleanup_orphaned_messages),
    /// renewing `lease` between batches and stopping as soon as renewal fails.
    pub async fn cleanup_orphaned_messages_with_lease(
        &self,
        lease: &LeaseHandle,
    ) -> Result<ReconciliationReport> {
        self.run(Some(lease)).await
    }

    async fn run(&self, lease: Option<&LeaseHandle>) -> Result<ReconciliationReport> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.cleanup_age_days);
        let mut report = ReconciliationReport::default();
        let mut room_exists: HashMap<Uuid, bool> = HashMap::new();
        let mut cursor: Option<DocumentCursor> = None;

        info!(cutoff = %cutoff, "Starting orphaned message reconciliation");

        while report.batches < self.config.max_batches_per_run {
            let batch = self
                .documents
                .find_created_before(cutoff, cursor, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            report.scanned += batch.len();
            cursor = batch.last().map(DocumentCursor::from);

            let outcome = self.reconcile_batch(&batch, &mut room_exists).await;
            report.orphans_found += outcome.orphans;
            report.reclaimed += outcome.reclaimed;
            report.delete_failures += outcome.delete_failures;
            report.lookup_failures += outcome.lookup_failures;

            let failures = outcome.delete_failures + outcome.lookup_failures;
            let failure_ratio = failures as f64 / batch.len() as f64;
            if failure_ratio > self.config.failure_alert_ratio {
                warn!(
                    batch = report.batches,
                    failures,
                    batch_size = batch.len(),
                    "Orphan cleanup failure rate above threshold"
                );
                raise(
                    self.alerts.as_ref(),
                    Alert::new(
                        AlertSeverity::Warning,
                        ALERT_SOURCE,
                        format!(
                            "Orphan cleanup failed for {} of {} documents",
                            failures,
                            batch.len()
                        ),
                        serde_json::json!({
                            "delete_failures": outcome.delete_failures,
                            "lookup_failures": outcome.lookup_failures,
                            "batch_size": batch.len(),
                            "failure_ratio": failure_ratio,
                        }),
                    ),
                )
                .await;
            }

            if batch.len() < self.config.batch_size {
                break;
            }
            if let Some(lease) = lease {
                if !lease.extend().await {
                    warn!(key = lease.key(), "Lost reconciliation lease; stopping early");
                    report.lease_lost = true;
                    break;
                }
            }
        }

        info!(
            scanned = report.scanned,
            orphans = report.orphans_found,
            reclaimed = report.reclaimed,
            delete_failures = report.delete_failures,
            lookup_failures = report.lookup_failures,
            "Orphaned message reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_batch(
        &self,
        batch: &[MessageDocument],
        room_exists: &mut HashMap<Uuid, bool>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for doc in batch {
            let exists = match room_exists.get(&doc.chat_room_id) {
                Some(known) => *known,
                None => match self.rooms.exists(doc.chat_room_id).await {
                    Ok(found) => {
                        room_exists.insert(doc.chat_room_id, found);
                        found
                    }
                    Err(e) => {
                        error!(message_id = %doc.id, chat_room_id = %doc.chat_room_id, error = %e, "Chat room lookup failed");
                        outcome.lookup_failures += 1;
                        continue;
                    }
                },
            };
            if exists {
                continue;
            }

            outcome.orphans += 1;
            match self.documents.delete(doc.id).await {
                Ok(true) => {
                    debug!(message_id = %doc.id, chat_room_id = %doc.chat_room_id, "Deleted orphaned message");
                    outcome.reclaimed += 1;
                }
                Ok(false) => debug!(message_id = %doc.id, "Orphaned message already gone"),
                Err(e) => {
                    error!(message_id = %doc.id, error = %e, "Failed to delete orphaned message");
                    outcome.delete_failures += 1;
                }
            }
        }
        outcome
    }
}
