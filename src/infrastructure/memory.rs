//! In-memory adapters for every port, for tests and infrastructure-free runs.
//!
//! They honour the same contracts as the real adapters (TTL expiry and
//! atomic compare-and-act for the lock store, optimistic versioning for the
//! outbox) and add failure injection hooks.

use crate::domain::events::EventEnvelope;
use crate::domain::outbox::{NewOutboxEvent, OutboxDeadLetter, OutboxEvent, SagaState};
use crate::infrastructure::alerting::{Alert, AlertPort};
use crate::infrastructure::kafka_abstraction::{EventPublisher, PublishError};
use crate::infrastructure::outbox::{DeadLetterResolution, OutboxRepository};
use crate::infrastructure::reconciliation::{
    ChatRoomDirectory, DocumentCursor, MessageDocument, MessageDocumentStore,
};
use crate::infrastructure::redis_abstraction::RedisLockCommands;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::{ErrorKind as RedisErrorKind, RedisError};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    value: String,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Lock store with per-key TTLs. Each operation is atomic per key.
#[derive(Debug, Default)]
pub struct InMemoryRedis {
    entries: DashMap<String, LeaseEntry>,
    failures: AtomicUsize,
}

impl InMemoryRedis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            LeaseEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Current live value of `key`.
    pub fn value_of(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Makes the next `count` commands fail with an I/O error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), RedisError> {
        if take_failure(&self.failures) {
            return Err(RedisError::from((
                RedisErrorKind::IoError,
                "injected failure",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RedisLockCommands for InMemoryRedis {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, RedisError> {
        self.check_failure()?;
        let now = Instant::now();
        let entry = LeaseEntry {
            value: value.to_string(),
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(entry);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, RedisError> {
        self.check_failure()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, e| e.is_live(now) && e.value == expected)
            .is_some())
    }

    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, RedisError> {
        self.check_failure()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.value == expected => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        self.check_failure()?;
        Ok(self.value_of(key))
    }
}

#[derive(Debug, Default)]
struct OutboxTables {
    events: Vec<OutboxEvent>,
    dead_letters: Vec<OutboxDeadLetter>,
}

#[derive(Debug, Default)]
pub struct InMemoryOutboxRepository {
    tables: Mutex<OutboxTables>,
    replace_failures: AtomicUsize,
    dead_letter_failures: AtomicUsize,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, event: NewOutboxEvent) -> OutboxEvent {
        self.stage_at(event, Utc::now())
    }

    pub fn stage_at(&self, event: NewOutboxEvent, created_at: DateTime<Utc>) -> OutboxEvent {
        let stored = event.into_event(Uuid::new_v4(), created_at);
        locked(&self.tables).events.push(stored.clone());
        stored
    }

    /// Stores a row exactly as given.
    pub fn put(&self, event: OutboxEvent) {
        let mut tables = locked(&self.tables);
        tables.events.retain(|e| e.id != event.id);
        tables.events.push(event);
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        locked(&self.tables).events.iter().find(|e| e.id == id).cloned()
    }

    pub fn events(&self) -> Vec<OutboxEvent> {
        locked(&self.tables).events.clone()
    }

    pub fn dead_letters(&self) -> Vec<OutboxDeadLetter> {
        locked(&self.tables).dead_letters.clone()
    }

    pub fn fail_next_replaces(&self, count: usize) {
        self.replace_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_dead_letters(&self, count: usize) {
        self.dead_letter_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut rows: Vec<OutboxEvent> = locked(&self.tables)
            .events
            .iter()
            .filter(|e| !e.processed && e.saga_state != SagaState::Failed)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn replace(&self, current_version: i64, next: &OutboxEvent) -> Result<bool> {
        if take_failure(&self.replace_failures) {
            anyhow::bail!("injected outbox write failure");
        }
        let mut tables = locked(&self.tables);
        match tables
            .events
            .iter_mut()
            .find(|e| e.id == next.id && e.version == current_version)
        {
            Some(row) => {
                *row = next.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = locked(&self.tables);
        let before = tables.events.len();
        tables
            .events
            .retain(|e| !(e.processed && e.created_at < cutoff));
        Ok((before - tables.events.len()) as u64)
    }

    async fn find_failed(&self) -> Result<Vec<OutboxEvent>> {
        let mut rows: Vec<OutboxEvent> = locked(&self.tables)
            .events
            .iter()
            .filter(|e| e.saga_state == SagaState::Failed)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }

    async fn record_dead_letter(&self, letter: &OutboxDeadLetter) -> Result<bool> {
        if take_failure(&self.dead_letter_failures) {
            anyhow::bail!("injected dead letter write failure");
        }
        let mut tables = locked(&self.tables);
        if tables
            .dead_letters
            .iter()
            .any(|d| d.outbox_event_id == letter.outbox_event_id)
        {
            return Ok(false);
        }
        tables.dead_letters.push(letter.clone());
        Ok(true)
    }

    async fn list_dead_letters(&self, resolved: Option<bool>) -> Result<Vec<OutboxDeadLetter>> {
        let mut letters: Vec<OutboxDeadLetter> = locked(&self.tables)
            .dead_letters
            .iter()
            .filter(|d| resolved.map_or(true, |r| d.resolved == r))
            .cloned()
            .collect();
        letters.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(letters)
    }

    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolved_by: &str,
        note: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<DeadLetterResolution> {
        let mut tables = locked(&self.tables);
        let Some(letter) = tables.dead_letters.iter_mut().find(|d| d.id == id) else {
            return Ok(DeadLetterResolution::NotFound);
        };
        if letter.resolved {
            return Ok(DeadLetterResolution::AlreadyResolved(letter.clone()));
        }
        letter.resolved = true;
        letter.resolved_by = Some(resolved_by.to_string());
        letter.resolved_at = Some(resolved_at);
        letter.resolution_note = note.map(str::to_string);
        Ok(DeadLetterResolution::Resolved(letter.clone()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub key: String,
    pub envelope: EventEnvelope,
}

/// Records publishes; can be switched into a failing broker.
#[derive(Debug, Default)]
pub struct InMemoryEventPublisher {
    published: Mutex<Vec<PublishedEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedEvent> {
        locked(&self.published).clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("broker unreachable".to_string()));
        }
        locked(&self.published).push(PublishedEvent {
            topic: topic.to_string(),
            key: key.to_string(),
            envelope: envelope.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    documents: Mutex<BTreeMap<(DateTime<Utc>, Uuid), Uuid>>,
    failing_deletes: Mutex<HashSet<Uuid>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc: MessageDocument) {
        locked(&self.documents).insert((doc.created_at, doc.id), doc.chat_room_id);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        locked(&self.documents).keys().any(|(_, doc_id)| *doc_id == id)
    }

    pub fn len(&self) -> usize {
        locked(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_deletes_of(&self, id: Uuid) {
        locked(&self.failing_deletes).insert(id);
    }
}

#[async_trait]
impl MessageDocumentStore for InMemoryMessageStore {
    async fn find_created_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<DocumentCursor>,
        limit: usize,
    ) -> Result<Vec<MessageDocument>> {
        let documents = locked(&self.documents);
        Ok(documents
            .iter()
            .filter(|((created_at, id), _)| {
                *created_at < cutoff
                    && after.map_or(true, |c| (*created_at, *id) > (c.created_at, c.id))
            })
            .take(limit)
            .map(|((created_at, id), chat_room_id)| MessageDocument {
                id: *id,
                chat_room_id: *chat_room_id,
                created_at: *created_at,
            })
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        if locked(&self.failing_deletes).contains(&id) {
            anyhow::bail!("injected delete failure for {}", id);
        }
        let mut documents = locked(&self.documents);
        let key = documents.keys().find(|(_, doc_id)| *doc_id == id).copied();
        Ok(key.and_then(|k| documents.remove(&k)).is_some())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryChatRoomDirectory {
    rooms: Mutex<HashSet<Uuid>>,
    unavailable: AtomicBool,
}

impl InMemoryChatRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, chat_room_id: Uuid) {
        locked(&self.rooms).insert(chat_room_id);
    }

    pub fn remove(&self, chat_room_id: Uuid) {
        locked(&self.rooms).remove(&chat_room_id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatRoomDirectory for InMemoryChatRoomDirectory {
    async fn exists(&self, chat_room_id: Uuid) -> Result<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("relational store unavailable");
        }
        Ok(locked(&self.rooms).contains(&chat_room_id))
    }
}

#[derive(Debug, Default)]
pub struct RecordingAlertPort {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertPort {
    pub fn alerts(&self) -> Vec<Alert> {
        locked(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertPort for RecordingAlertPort {
    async fn send(&self, alert: Alert) -> Result<()> {
        locked(&self.alerts).push(alert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_expires_after_ttl() {
        let redis = InMemoryRedis::new();
        assert!(redis
            .set_nx_px("lock:a", "one", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!redis
            .set_nx_px("lock:a", "two", Duration::from_secs(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(redis.value_of("lock:a"), None);
        assert!(redis
            .set_nx_px("lock:a", "two", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let redis = InMemoryRedis::new();
        redis.fail_next(1);
        assert!(redis.get("lock:a").await.is_err());
        assert!(redis.get("lock:a").await.is_ok());
    }

    #[tokio::test]
    async fn document_pages_follow_cursor() {
        let store = InMemoryMessageStore::new();
        let base = Utc::now() - chrono::Duration::days(30);
        for i in 0..5 {
            store.insert(MessageDocument {
                id: Uuid::new_v4(),
                chat_room_id: Uuid::new_v4(),
                created_at: base + chrono::Duration::minutes(i),
            });
        }
        let first = store.find_created_before(Utc::now(), None, 3).await.unwrap();
        let cursor = first.last().map(DocumentCursor::from);
        let second = store.find_created_before(Utc::now(), cursor, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|d| !first.contains(d)));
    }
}
