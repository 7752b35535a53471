use chat_consistency::domain::{
    ChatEvent, MessageSent, NewOutboxEvent, OutboxEvent, SagaState, CHAT_MESSAGE_TOPIC,
};
use chat_consistency::infrastructure::alerting::AlertSeverity;
use chat_consistency::infrastructure::distributed_lock::{
    lock_key, DistributedLockManager, LeaseHandle, LockConfig,
};
use chat_consistency::infrastructure::memory::{
    InMemoryEventPublisher, InMemoryOutboxRepository, InMemoryRedis, RecordingAlertPort,
};
use chat_consistency::infrastructure::outbox::OutboxRepository;
use chat_consistency::infrastructure::outbox_processor::{
    OutboxEventProcessor, OutboxProcessorConfig,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    repo: Arc<InMemoryOutboxRepository>,
    publisher: Arc<InMemoryEventPublisher>,
    alerts: Arc<RecordingAlertPort>,
    processor: OutboxEventProcessor,
}

fn harness_with(config: OutboxProcessorConfig) -> Harness {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let publisher = Arc::new(InMemoryEventPublisher::new());
    let alerts = Arc::new(RecordingAlertPort::default());
    let processor =
        OutboxEventProcessor::new(repo.clone(), publisher.clone(), alerts.clone(), config);
    Harness {
        repo,
        publisher,
        alerts,
        processor,
    }
}

fn harness() -> Harness {
    harness_with(OutboxProcessorConfig::default())
}

fn message_sent(chat_room_id: Uuid) -> ChatEvent {
    ChatEvent::from(MessageSent {
        message_id: Uuid::new_v4(),
        chat_room_id,
        sender_id: Uuid::new_v4(),
        content: "hello".to_string(),
        sent_at: Utc::now(),
        reply_to: None,
    })
}

fn stage_message(repo: &InMemoryOutboxRepository, chat_room_id: Uuid) -> OutboxEvent {
    let staged = NewOutboxEvent::for_event(Uuid::new_v4(), &message_sent(chat_room_id)).unwrap();
    repo.stage(staged)
}

#[tokio::test]
async fn test_publishes_pending_event_and_marks_completed() {
    let h = harness();
    let room = Uuid::new_v4();
    let staged = stage_message(&h.repo, room);

    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.published, 1);

    let stored = h.repo.get(staged.id).unwrap();
    assert!(stored.processed);
    assert!(stored.processed_at.is_some());
    assert_eq!(stored.saga_state, SagaState::Completed);
    assert_eq!(stored.retry_count, 0);

    let published = h.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, CHAT_MESSAGE_TOPIC);
    assert_eq!(published[0].key, room.to_string());
    assert_eq!(published[0].envelope.event_id, staged.id);
    assert_eq!(published[0].envelope.saga_id, staged.saga_id);
    assert_eq!(published[0].envelope.event_type, "chat.message.sent");

    // Completed rows are never fetched again.
    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(h.publisher.published().len(), 1);
}

#[tokio::test]
async fn test_failures_increment_retry_count_until_dead_lettered() {
    let h = harness();
    h.publisher.set_unavailable(true);
    let staged = stage_message(&h.repo, Uuid::new_v4());

    let mut last_retry = 0;
    for attempt in 1..=4 {
        let report = h.processor.process_outbox_events().await.unwrap();
        assert_eq!(report.failed_attempts, 1, "attempt {}", attempt);
        let stored = h.repo.get(staged.id).unwrap();
        assert!(stored.retry_count > last_retry);
        last_retry = stored.retry_count;
        assert_eq!(stored.saga_state, SagaState::Pending);
        assert!(!stored.processed);
        assert!(stored.last_error.as_deref().unwrap().contains("broker unreachable"));
        assert!(h.repo.dead_letters().is_empty());
    }

    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.failed_attempts, 1);
    assert_eq!(report.dead_lettered, 1);

    let stored = h.repo.get(staged.id).unwrap();
    assert_eq!(stored.retry_count, 5);
    assert_eq!(stored.saga_state, SagaState::Failed);
    assert!(!stored.processed);

    let letters = h.repo.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].outbox_event_id, staged.id);
    assert_eq!(letters[0].saga_id, staged.saga_id);
    assert!(letters[0].failure_reason.contains("broker unreachable"));
    assert!(!letters[0].resolved);

    // FAILED rows are left alone on later polls.
    for _ in 0..3 {
        let report = h.processor.process_outbox_events().await.unwrap();
        assert_eq!(report.failed_attempts, 0);
        assert_eq!(report.dead_lettered, 0);
    }
    assert_eq!(h.repo.get(staged.id).unwrap().retry_count, 5);
    assert_eq!(h.repo.dead_letters().len(), 1);
}

#[tokio::test]
async fn test_recovers_before_exhaustion() {
    let h = harness();
    h.publisher.set_unavailable(true);
    let staged = stage_message(&h.repo, Uuid::new_v4());

    for _ in 0..2 {
        h.processor.process_outbox_events().await.unwrap();
    }
    h.publisher.set_unavailable(false);
    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.published, 1);

    let stored = h.repo.get(staged.id).unwrap();
    assert!(stored.processed);
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.saga_state, SagaState::Completed);
    assert!(h.repo.dead_letters().is_empty());
}

#[tokio::test]
async fn test_unknown_event_type_counts_as_failed_attempt() {
    let h = harness();
    let staged = h.repo.stage(NewOutboxEvent {
        saga_id: Uuid::new_v4(),
        aggregate_id: Uuid::new_v4().to_string(),
        event_type: "chat.poll.created".to_string(),
        payload: serde_json::json!({}),
    });

    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.failed_attempts, 1);
    let stored = h.repo.get(staged.id).unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.unwrap().contains("chat.poll.created"));
    assert!(h.publisher.published().is_empty());
}

#[tokio::test]
async fn test_exhausted_row_without_dead_letter_is_escalated_once() {
    let h = harness();
    let staged = stage_message(&h.repo, Uuid::new_v4());
    let mut stuck = staged.clone();
    stuck.retry_count = 5;
    stuck.last_error = Some("timeout".to_string());
    h.repo.put(stuck);

    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.repo.get(staged.id).unwrap().saga_state, SagaState::Failed);

    // FAILED rows are no longer fetched at all.
    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(report.skipped, 0);
    assert_eq!(h.repo.dead_letters().len(), 1);
    assert!(h.publisher.published().is_empty());
}

#[tokio::test]
async fn test_dead_letter_write_failure_keeps_row_retryable() {
    let h = harness();
    h.publisher.set_unavailable(true);
    let staged = stage_message(&h.repo, Uuid::new_v4());
    for _ in 0..4 {
        h.processor.process_outbox_events().await.unwrap();
    }

    h.repo.fail_next_dead_letters(1);
    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.dead_lettered, 0);
    let stored = h.repo.get(staged.id).unwrap();
    assert_eq!(stored.retry_count, 5);
    assert_eq!(stored.saga_state, SagaState::Pending);
    assert!(h.repo.dead_letters().is_empty());

    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.repo.get(staged.id).unwrap().saga_state, SagaState::Failed);
    assert_eq!(h.repo.dead_letters().len(), 1);
}

#[tokio::test]
async fn test_retry_write_failure_does_not_abort_batch() {
    let h = harness();
    h.publisher.set_unavailable(true);
    let first = stage_message(&h.repo, Uuid::new_v4());
    let second = stage_message(&h.repo, Uuid::new_v4());

    // The claim of the first row fails; the second row is still attempted.
    h.repo.fail_next_replaces(1);
    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed_attempts, 1);
    assert_eq!(h.repo.get(first.id).unwrap().retry_count, 0);
    assert_eq!(h.repo.get(second.id).unwrap().retry_count, 1);
}

#[tokio::test]
async fn test_concurrent_modification_is_skipped() {
    let h = harness();
    let staged = stage_message(&h.repo, Uuid::new_v4());
    let rows = h.repo.fetch_unprocessed(10).await.unwrap();
    assert_eq!(rows.len(), 1);

    // Another writer moves the row on before our claim lands.
    assert!(h.repo.replace(staged.version, &staged.claimed()).await.unwrap());
    assert!(!h.repo.replace(staged.version, &staged.claimed()).await.unwrap());
}

#[tokio::test]
async fn test_cleanup_removes_only_old_processed_rows() {
    let h = harness();
    let old = Utc::now() - ChronoDuration::days(8);
    let recent = Utc::now() - ChronoDuration::days(6);

    let event = |created_at| {
        h.repo.stage_at(
            NewOutboxEvent::for_event(Uuid::new_v4(), &message_sent(Uuid::new_v4())).unwrap(),
            created_at,
        )
    };
    let old_processed = event(old);
    let old_pending = event(old);
    let recent_processed = event(recent);

    for row in [&old_processed, &recent_processed] {
        let done = row.claimed().completed(Utc::now());
        assert!(h.repo.replace(row.version, &done).await.unwrap());
    }

    let deleted = h.processor.cleanup_old_events().await.unwrap();
    assert_eq!(deleted, 1);
    assert!(h.repo.get(old_processed.id).is_none());
    assert!(h.repo.get(old_pending.id).is_some());
    assert!(h.repo.get(recent_processed.id).is_some());
}

#[tokio::test]
async fn test_failed_monitor_sends_one_aggregated_alert() {
    let h = harness();
    assert_eq!(h.processor.monitor_failed_events().await.unwrap(), 0);
    assert!(h.alerts.alerts().is_empty());

    h.publisher.set_unavailable(true);
    let first = stage_message(&h.repo, Uuid::new_v4());
    let second = stage_message(&h.repo, Uuid::new_v4());
    for _ in 0..5 {
        h.processor.process_outbox_events().await.unwrap();
    }
    let before = h.repo.events();

    let failed = h.processor.monitor_failed_events().await.unwrap();
    assert_eq!(failed, 2);

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(alerts[0].source, "outbox-processor");
    assert_eq!(alerts[0].details["failed_count"], 2);
    assert_eq!(alerts[0].details["unresolved_dead_letters"], 2);
    let listed: Vec<String> = alerts[0].details["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["saga_id"].as_str().unwrap().to_string())
        .collect();
    assert!(listed.contains(&first.saga_id.to_string()));
    assert!(listed.contains(&second.saga_id.to_string()));

    // Monitoring never modifies outbox rows.
    assert_eq!(h.repo.events(), before);
}

#[tokio::test]
async fn test_failed_monitor_cooldown_suppresses_unchanged_set() {
    let h = harness_with(OutboxProcessorConfig {
        failed_alert_cooldown: Duration::from_secs(3600),
        ..OutboxProcessorConfig::default()
    });
    h.publisher.set_unavailable(true);
    stage_message(&h.repo, Uuid::new_v4());
    for _ in 0..5 {
        h.processor.process_outbox_events().await.unwrap();
    }

    h.processor.monitor_failed_events().await.unwrap();
    h.processor.monitor_failed_events().await.unwrap();
    assert_eq!(h.alerts.alerts().len(), 1);

    // A new failure changes the set, so it alerts again.
    stage_message(&h.repo, Uuid::new_v4());
    for _ in 0..5 {
        h.processor.process_outbox_events().await.unwrap();
    }
    h.processor.monitor_failed_events().await.unwrap();
    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[1].details["failed_count"], 2);
}

#[tokio::test]
async fn test_failed_monitor_without_cooldown_alerts_every_run() {
    let h = harness_with(OutboxProcessorConfig {
        failed_alert_cooldown: Duration::ZERO,
        ..OutboxProcessorConfig::default()
    });
    h.publisher.set_unavailable(true);
    stage_message(&h.repo, Uuid::new_v4());
    for _ in 0..5 {
        h.processor.process_outbox_events().await.unwrap();
    }

    h.processor.monitor_failed_events().await.unwrap();
    h.processor.monitor_failed_events().await.unwrap();
    assert_eq!(h.alerts.alerts().len(), 2);
}

#[tokio::test]
async fn test_failed_rows_beyond_fetch_limit_do_not_block_new_events() {
    let h = harness_with(OutboxProcessorConfig {
        fetch_limit: 3,
        ..OutboxProcessorConfig::default()
    });
    h.publisher.set_unavailable(true);
    let stuck: Vec<OutboxEvent> = (0..3).map(|_| stage_message(&h.repo, Uuid::new_v4())).collect();
    for _ in 0..5 {
        h.processor.process_outbox_events().await.unwrap();
    }
    for row in &stuck {
        assert_eq!(h.repo.get(row.id).unwrap().saga_state, SagaState::Failed);
    }
    assert!(h.repo.fetch_unprocessed(10).await.unwrap().is_empty());

    h.publisher.set_unavailable(false);
    let fresh = stage_message(&h.repo, Uuid::new_v4());
    let report = h.processor.process_outbox_events().await.unwrap();
    assert_eq!(report.published, 1);
    assert!(h.repo.get(fresh.id).unwrap().processed);
    assert_eq!(h.publisher.published().len(), 1);
    assert_eq!(h.repo.dead_letters().len(), 3);
}

fn lease_for(redis: Arc<InMemoryRedis>, owner: &str) -> (Arc<DistributedLockManager>, LeaseHandle) {
    let manager = Arc::new(DistributedLockManager::new(redis, LockConfig::default()));
    let lease = LeaseHandle::new(
        manager.clone(),
        "job:outbox-processing",
        owner,
        Duration::from_secs(60),
    );
    (manager, lease)
}

#[tokio::test]
async fn test_lost_lease_stops_poll_partway() {
    let h = harness_with(OutboxProcessorConfig {
        lease_renewal_every: 2,
        ..OutboxProcessorConfig::default()
    });
    let staged: Vec<OutboxEvent> = (0..5).map(|_| stage_message(&h.repo, Uuid::new_v4())).collect();

    let redis = Arc::new(InMemoryRedis::new());
    // Our lease expired and another instance took the job over.
    redis.insert(&lock_key("job:outbox-processing"), "node-b:1", Duration::from_secs(60));
    let (_manager, lease) = lease_for(redis, "node-a:1");

    let report = h
        .processor
        .process_outbox_events_with_lease(&lease)
        .await
        .unwrap();
    assert!(report.lease_lost);
    assert_eq!(report.published, 2);
    assert_eq!(h.publisher.published().len(), 2);
    for row in &staged[2..] {
        let stored = h.repo.get(row.id).unwrap();
        assert!(!stored.processed);
        assert_eq!(stored.saga_state, SagaState::Pending);
        assert_eq!(stored.version, row.version);
    }
}

#[tokio::test]
async fn test_held_lease_is_renewed_through_the_poll() {
    let h = harness_with(OutboxProcessorConfig {
        lease_renewal_every: 2,
        ..OutboxProcessorConfig::default()
    });
    for _ in 0..5 {
        stage_message(&h.repo, Uuid::new_v4());
    }

    let redis = Arc::new(InMemoryRedis::new());
    let (manager, lease) = lease_for(redis, "node-a:1");
    assert!(manager
        .try_acquire("job:outbox-processing", "node-a:1", Duration::from_secs(60))
        .await
        .unwrap());

    let report = h
        .processor
        .process_outbox_events_with_lease(&lease)
        .await
        .unwrap();
    assert!(!report.lease_lost);
    assert_eq!(report.published, 5);
    assert_eq!(manager.metrics().extensions_refused, 0);
}
