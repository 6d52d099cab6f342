//! Authoritative index of live objects
//!
//! Every mutation runs inside one async critical section that covers the
//! liveness check, content deletion, ledger write and event emission. Two
//! callers racing to remove the same object therefore produce exactly one
//! deletion and one `Removed` event; the loser sees a no-op.

use crate::broadcast::Broadcaster;
use crate::content::{ContentReader, ContentStore};
use crate::error::{Result, StoreError};
use crate::ledger::Ledger;
use crate::types::{ObjectId, ObjectRecord, RegistryEvent, RegistryStats};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Bounded retry with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        error = %e,
                        "{} failed, retrying in {:?} (attempt {}/{})",
                        what, delay, attempt, attempts
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cause {
    Deleted,
    Expired,
}

#[derive(Default)]
struct Inner {
    records: HashMap<ObjectId, ObjectRecord>,
    /// Live ids ordered by expiry time
    expiry: BTreeSet<(DateTime<Utc>, ObjectId)>,
    /// Arrival order, breaks ties between records created in the same millisecond
    arrival: HashMap<ObjectId, u64>,
    next_arrival: u64,
    durability_gap: bool,
    evicted: u64,
    deleted: u64,
    orphaned_content: u64,
}

impl Inner {
    fn insert(&mut self, record: ObjectRecord) {
        self.expiry.insert((record.expires_at(), record.id.clone()));
        self.arrival.insert(record.id.clone(), self.next_arrival);
        self.next_arrival += 1;
        self.records.insert(record.id.clone(), record);
    }

    fn take(&mut self, id: &ObjectId) -> Option<ObjectRecord> {
        let record = self.records.remove(id)?;
        self.arrival.remove(id);
        self.expiry.remove(&(record.expires_at(), record.id.clone()));
        Some(record)
    }

    fn sorted(&self) -> Vec<ObjectRecord> {
        let mut records: Vec<ObjectRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, self.arrival.get(&r.id).copied()));
        records
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<ObjectId> {
        self.expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.expiry.first().map(|(expires_at, _)| *expires_at)
    }
}

/// Live object registry backed by a ledger and a content store
pub struct Registry {
    inner: Mutex<Inner>,
    store: Arc<dyn ContentStore>,
    ledger: Ledger,
    events: Broadcaster,
    retry: RetryPolicy,
    schedule_changed: Notify,
}

impl Registry {
    /// Load the ledger and reconcile it with the content store.
    ///
    /// Records whose content is gone are dropped and content no record points
    /// at is deleted, so metadata and content agree before the first
    /// mutation. The ledger is rewritten if reconciliation changed anything.
    pub async fn open(
        ledger: Ledger,
        store: Arc<dyn ContentStore>,
        events: Broadcaster,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let loaded = ledger.load_all().await?;
        let stored: HashSet<String> = store.locations().await?.into_iter().collect();

        let mut inner = Inner::default();
        let mut changed = false;
        for record in loaded {
            if inner.records.contains_key(&record.id) {
                warn!(id = %record.id, "Dropping duplicate ledger record");
                changed = true;
            } else if record.checked_expires_at().is_none() {
                warn!(id = %record.id, ttl_ms = record.ttl_ms, "Dropping record whose expiry is out of range");
                changed = true;
            } else if !stored.contains(&record.content_location) {
                warn!(id = %record.id, location = %record.content_location, "Dropping record with missing content");
                changed = true;
            } else {
                inner.insert(record);
            }
        }

        let referenced: HashSet<&str> = inner
            .records
            .values()
            .map(|r| r.content_location.as_str())
            .collect();
        for location in stored.iter().filter(|l| !referenced.contains(l.as_str())) {
            match store.delete(location).await {
                Ok(_) => warn!(location = %location, "Deleted unreferenced content"),
                Err(e) => error!(location = %location, error = %e, "Failed to delete unreferenced content"),
            }
        }

        if changed {
            ledger.persist(&inner.sorted()).await?;
        }

        info!(
            live = inner.records.len(),
            next_deadline = ?inner.next_deadline(),
            "Registry opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            store,
            ledger,
            events,
            retry,
            schedule_changed: Notify::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Register a batch of objects whose content is already stored.
    ///
    /// All-or-nothing: on a ledger failure the batch is taken back out of
    /// memory and `Persistence` is returned; the caller owns the content.
    pub async fn add(&self, records: Vec<ObjectRecord>) -> Result<()> {
        if records.is_empty() {
            return Err(StoreError::Validation("empty batch".to_string()));
        }

        let mut inner = self.inner.lock().await;

        let mut batch_ids = HashSet::new();
        for record in &records {
            if inner.records.contains_key(&record.id) || !batch_ids.insert(&record.id) {
                return Err(StoreError::Validation(format!(
                    "object {} is already registered",
                    record.id
                )));
            }
            if record.checked_expires_at().is_none() {
                return Err(StoreError::Validation(format!(
                    "object {} has an out of range time-to-live",
                    record.id
                )));
            }
        }

        for record in &records {
            inner.insert(record.clone());
        }

        if let Err(e) = self.persist_locked(&mut inner).await {
            for record in &records {
                inner.take(&record.id);
            }
            error!(error = %e, count = records.len(), "Ledger write failed, batch not registered");
            return Err(e);
        }

        for record in &records {
            info!(id = %record.id, name = %record.display_name, size = record.size, expires_at = %record.expires_at(), "Object added");
        }
        self.events.emit(RegistryEvent::Added(records));
        self.schedule_changed.notify_one();
        Ok(())
    }

    /// Remove one object. Returns `true` iff it was live.
    pub async fn remove(&self, id: &ObjectId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let removed = self
            .remove_locked(&mut inner, std::slice::from_ref(id), Cause::Deleted)
            .await?;
        Ok(!removed.is_empty())
    }

    /// Remove every listed object that is live; unknown ids are ignored.
    pub async fn remove_many(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let mut inner = self.inner.lock().await;
        self.remove_locked(&mut inner, ids, Cause::Deleted).await
    }

    /// Remove everything. Always emits `RemovedAll`, even when already empty.
    pub async fn remove_all(&self) -> Result<Vec<ObjectRecord>> {
        let mut inner = self.inner.lock().await;

        let records = inner.sorted();
        for record in &records {
            inner.take(&record.id);
            self.delete_content(&mut inner, record).await;
            inner.deleted += 1;
        }

        let ids: Vec<ObjectId> = records.iter().map(|r| r.id.clone()).collect();
        let persisted = self.persist_after_removal(&mut inner, &ids).await;
        info!(count = records.len(), "All objects removed");
        self.events.emit(RegistryEvent::RemovedAll);
        persisted.map(|()| records)
    }

    /// Remove every object whose expiry time is at or before `now`.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> Result<Vec<ObjectId>> {
        let mut inner = self.inner.lock().await;
        let due = inner.due(now);
        if due.is_empty() {
            return Ok(Vec::new());
        }
        self.remove_locked(&mut inner, &due, Cause::Expired).await
    }

    /// Emit one `RemainingTimes` event covering every live object. Returns
    /// the number of objects announced.
    pub async fn announce_remaining(&self, now: DateTime<Utc>) -> usize {
        if self.events.observer_count() == 0 {
            return 0;
        }

        let inner = self.inner.lock().await;
        let remaining: Vec<(ObjectId, Duration)> = inner
            .sorted()
            .into_iter()
            .map(|record| {
                let left = record.remaining(now);
                (record.id, left)
            })
            .collect();
        if remaining.is_empty() {
            return 0;
        }

        let count = remaining.len();
        self.events.emit(RegistryEvent::RemainingTimes(remaining));
        count
    }

    pub async fn get(&self, id: &ObjectId) -> Option<ObjectRecord> {
        self.inner.lock().await.records.get(id).cloned()
    }

    /// Live objects ordered by creation time
    pub async fn list(&self) -> Vec<ObjectRecord> {
        self.inner.lock().await.sorted()
    }

    /// Open the content of a live object.
    ///
    /// The lookup and the open happen under the registry lock, so a returned
    /// reader always belongs to an object that was live at that instant.
    pub async fn open_content(&self, id: &ObjectId) -> Result<Option<(ObjectRecord, ContentReader)>> {
        let inner = self.inner.lock().await;
        let Some(record) = inner.records.get(id).cloned() else {
            return Ok(None);
        };
        let reader = self.store.open(&record.content_location).await?;
        Ok(reader.map(|reader| (record, reader)))
    }

    /// Current snapshot plus a receiver positioned right after it.
    pub async fn subscribe(&self) -> (Vec<ObjectRecord>, broadcast::Receiver<RegistryEvent>) {
        let inner = self.inner.lock().await;
        let rx = self.events.subscribe();
        (inner.sorted(), rx)
    }

    pub async fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.next_deadline()
    }

    /// Resolves once a mutation may have moved the earliest deadline.
    pub async fn schedule_changed(&self) {
        self.schedule_changed.notified().await
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            live_objects: inner.records.len(),
            live_bytes: inner.records.values().map(|r| r.size).sum(),
            evicted: inner.evicted,
            deleted: inner.deleted,
            orphaned_content: inner.orphaned_content,
            durability_gap: inner.durability_gap,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.events.observer_count()
    }

    async fn remove_locked(
        &self,
        inner: &mut Inner,
        ids: &[ObjectId],
        cause: Cause,
    ) -> Result<Vec<ObjectId>> {
        let mut removed = Vec::new();
        for id in ids {
            let Some(record) = inner.take(id) else {
                debug!(id = %id, "Object already gone, nothing to remove");
                continue;
            };
            self.delete_content(inner, &record).await;
            match cause {
                Cause::Deleted => {
                    inner.deleted += 1;
                    info!(id = %id, name = %record.display_name, "Object deleted");
                }
                Cause::Expired => {
                    inner.evicted += 1;
                    info!(id = %id, name = %record.display_name, "Object expired");
                }
            }
            removed.push(record.id);
        }

        if removed.is_empty() {
            return Ok(removed);
        }

        let persisted = self.persist_after_removal(inner, &removed).await;
        for id in &removed {
            self.events.emit(RegistryEvent::Removed(id.clone()));
        }
        persisted.map(|()| removed)
    }

    /// Delete content with bounded retries. A final failure leaves orphaned
    /// content behind; it is counted and logged for reconciliation, which
    /// also happens automatically on the next open.
    async fn delete_content(&self, inner: &mut Inner, record: &ObjectRecord) {
        let location = record.content_location.as_str();
        match self
            .retry
            .run("Content delete", || self.store.delete(location))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(id = %record.id, location, "Content was already missing"),
            Err(e) => {
                inner.orphaned_content += 1;
                error!(
                    id = %record.id,
                    location,
                    error = %e,
                    inconsistency = "orphaned_content",
                    "Content could not be deleted, manual reconciliation required"
                );
            }
        }
    }

    /// Persist after an irreversible removal. A failure flags a durability
    /// gap that stays open until a later write succeeds; the error still
    /// carries the ids that were removed.
    async fn persist_after_removal(&self, inner: &mut Inner, removed: &[ObjectId]) -> Result<()> {
        match self.persist_locked(inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.durability_gap = true;
                error!(
                    error = %e,
                    inconsistency = "durability_gap",
                    "Ledger is behind the live set until the next successful write"
                );
                Err(StoreError::DurabilityGap {
                    removed: removed.to_vec(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn persist_locked(&self, inner: &mut Inner) -> Result<()> {
        let records = inner.sorted();
        self.retry
            .run("Ledger write", || self.ledger.persist(&records))
            .await?;

        if inner.durability_gap {
            inner.durability_gap = false;
            info!("Ledger caught up with the live set");
        }
        Ok(())
    }
}
