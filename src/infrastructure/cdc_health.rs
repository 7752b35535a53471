use crate::infrastructure::alerting::{raise, Alert, AlertPort, AlertSeverity};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const STATE_RUNNING: &str = "RUNNING";
pub const STATE_FAILED: &str = "FAILED";
pub const STATE_UNREACHABLE: &str = "UNREACHABLE";

const ALERT_SOURCE: &str = "cdc-health-monitor";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Body of `GET /connectors/{name}/status` on the Kafka Connect REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorStatusResponse {
    /// Absent from some proxies in front of Connect; the configured name is used then.
    #[serde(default)]
    pub name: String,
    pub connector: ConnectorState,
    #[serde(default)]
    pub tasks: Vec<TaskStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorState {
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: i32,
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Stack trace Kafka Connect attaches to failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorStatus {
    pub name: String,
    pub state: String,
    pub tasks: Vec<TaskStatus>,
    pub error: Option<String>,
}

impl ConnectorStatus {
    pub fn unreachable(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            state: STATE_UNREACHABLE.to_string(),
            tasks: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == STATE_RUNNING
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskStatus> {
        self.tasks.iter().filter(|t| t.state == STATE_FAILED)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationLagInfo {
    pub slot_name: String,
    pub active: bool,
    /// Bytes retained since the slot's restart LSN, in MB. `-1` when unknown.
    pub lag_mb: f64,
    pub error: Option<String>,
}

impl ReplicationLagInfo {
    fn unavailable(slot_name: &str, error: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.to_string(),
            active: false,
            lag_mb: -1.0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CdcStatus {
    pub healthy: bool,
    pub connector: ConnectorStatus,
    pub replication: ReplicationLagInfo,
    pub lag_threshold_mb: f64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotStats {
    pub active: bool,
    pub lag_bytes: Option<i64>,
}

/// Control-plane API of the CDC connector.
#[async_trait]
pub trait ConnectorStatusApi: Send + Sync {
    async fn fetch_status(&self, connector_name: &str) -> Result<ConnectorStatusResponse>;
}

/// Replication-slot catalog of the source database.
#[async_trait]
pub trait ReplicationSlotProbe: Send + Sync {
    /// `None` when no slot with that name exists.
    async fn slot_stats(&self, slot_name: &str) -> Result<Option<SlotStats>>;
}

pub struct KafkaConnectClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl KafkaConnectClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create Kafka Connect HTTP client")?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ConnectorStatusApi for KafkaConnectClient {
    async fn fetch_status(&self, connector_name: &str) -> Result<ConnectorStatusResponse> {
        let url = format!("{}/connectors/{}/status", self.base_url, connector_name);
        debug!("Fetching connector status from {}", url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Kafka Connect request to {} failed", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Kafka Connect returned {} for {}", response.status(), connector_name);
        }

        response
            .json::<ConnectorStatusResponse>()
            .await
            .context("Failed to parse connector status")
    }
}

#[derive(Clone)]
pub struct PostgresReplicationSlotProbe {
    pool: PgPool,
}

impl PostgresReplicationSlotProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReplicationSlotProbe for PostgresReplicationSlotProbe {
    async fn slot_stats(&self, slot_name: &str) -> Result<Option<SlotStats>> {
        let row: Option<(bool, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT active,
                   pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn)::BIGINT AS lag_bytes
            FROM pg_replication_slots
            WHERE slot_name = $1
            "#,
        )
        .bind(slot_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query pg_replication_slots")?;

        Ok(row.map(|(active, lag_bytes)| SlotStats { active, lag_bytes }))
    }
}

#[derive(Debug, Clone)]
pub struct CdcHealthConfig {
    pub connector_name: String,
    pub replication_slot: String,
    pub lag_threshold_mb: f64,
}

impl Default for CdcHealthConfig {
    fn default() -> Self {
        Self {
            connector_name: "chat-outbox-connector".to_string(),
            replication_slot: "chat_outbox_slot".to_string(),
            lag_threshold_mb: 10.0,
        }
    }
}

/// Watches the CDC connector and its replication slot.
///
/// None of the checks return errors: failures become degraded values so the
/// health path can't take anything down with it.
pub struct CdcHealthMonitor {
    connect_api: Arc<dyn ConnectorStatusApi>,
    slot_probe: Arc<dyn ReplicationSlotProbe>,
    alerts: Arc<dyn AlertPort>,
    config: CdcHealthConfig,
}

impl CdcHealthMonitor {
    pub fn new(
        connect_api: Arc<dyn ConnectorStatusApi>,
        slot_probe: Arc<dyn ReplicationSlotProbe>,
        alerts: Arc<dyn AlertPort>,
        config: CdcHealthConfig,
    ) -> Self {
        Self {
            connect_api,
            slot_probe,
            alerts,
            config,
        }
    }

    pub async fn check_connector_status(&self) -> ConnectorStatus {
        let name = &self.config.connector_name;
        match self.connect_api.fetch_status(name).await {
            Ok(response) => ConnectorStatus {
                name: if response.name.is_empty() {
                    name.clone()
                } else {
                    response.name
                },
                state: response.connector.state,
                tasks: response.tasks,
                error: None,
            },
            Err(e) => {
                warn!(connector = %name, error = %e, "CDC connector status unavailable");
                ConnectorStatus::unreachable(name, format!("{:#}", e))
            }
        }
    }

    pub async fn check_replication_lag(&self) -> ReplicationLagInfo {
        let slot = &self.config.replication_slot;
        match self.slot_probe.slot_stats(slot).await {
            Ok(Some(stats)) => ReplicationLagInfo {
                slot_name: slot.clone(),
                active: stats.active,
                lag_mb: stats
                    .lag_bytes
                    .map(|bytes| bytes as f64 / BYTES_PER_MB)
                    .unwrap_or(-1.0),
                error: None,
            },
            Ok(None) => ReplicationLagInfo::unavailable(slot, "not found"),
            Err(e) => {
                warn!(slot = %slot, error = %e, "Replication slot query failed");
                ReplicationLagInfo::unavailable(slot, format!("{:#}", e))
            }
        }
    }

    pub async fn get_cdc_status(&self) -> CdcStatus {
        let (connector, replication) =
            tokio::join!(self.check_connector_status(), self.check_replication_lag());
        let threshold = self.config.lag_threshold_mb;
        let healthy = connector.is_running()
            && replication.active
            && replication.lag_mb >= 0.0
            && replication.lag_mb < threshold;
        CdcStatus {
            healthy,
            connector,
            replication,
            lag_threshold_mb: threshold,
            checked_at: Utc::now(),
        }
    }

    /// Scheduled check: computes status and raises one alert per problem found.
    /// Alerts are not deduplicated across runs.
    pub async fn run_health_check(&self) -> CdcStatus {
        let status = self.get_cdc_status().await;

        if status.healthy {
            debug!(
                lag_mb = status.replication.lag_mb,
                "CDC pipeline healthy"
            );
            return status;
        }

        if !status.connector.is_running() {
            raise(
                self.alerts.as_ref(),
                Alert::new(
                    AlertSeverity::Critical,
                    ALERT_SOURCE,
                    format!(
                        "CDC connector '{}' is {}",
                        status.connector.name, status.connector.state
                    ),
                    serde_json::json!({
                        "connector": status.connector.name,
                        "state": status.connector.state,
                        "error": status.connector.error,
                        "tasks": status.connector.tasks,
                    }),
                ),
            )
            .await;
        } else if status.connector.failed_tasks().next().is_some() {
            let failed: Vec<&TaskStatus> = status.connector.failed_tasks().collect();
            raise(
                self.alerts.as_ref(),
                Alert::new(
                    AlertSeverity::Critical,
                    ALERT_SOURCE,
                    format!(
                        "CDC connector '{}' has {} failed task(s)",
                        status.connector.name,
                        failed.len()
                    ),
                    serde_json::json!({ "connector": status.connector.name, "tasks": failed }),
                ),
            )
            .await;
        }

        let replication = &status.replication;
        if !replication.active {
            raise(
                self.alerts.as_ref(),
                Alert::new(
                    AlertSeverity::Critical,
                    ALERT_SOURCE,
                    format!("Replication slot '{}' is not active", replication.slot_name),
                    serde_json::json!({
                        "slot": replication.slot_name,
                        "error": replication.error,
                    }),
                ),
            )
            .await;
        }
        if replication.lag_mb >= status.lag_threshold_mb {
            raise(
                self.alerts.as_ref(),
                Alert::new(
                    AlertSeverity::Warning,
                    ALERT_SOURCE,
                    format!(
                        "Replication lag {:.2} MB exceeds {:.2} MB",
                        replication.lag_mb, status.lag_threshold_mb
                    ),
                    serde_json::json!({
                        "slot": replication.slot_name,
                        "lag_mb": replication.lag_mb,
                        "threshold_mb": status.lag_threshold_mb,
                    }),
                ),
            )
            .await;
        }

        info!(
            connector_state = %status.connector.state,
            slot_active = status.replication.active,
            lag_mb = status.replication.lag_mb,
            "CDC pipeline degraded"
        );
        status
    }
}
