//! In-memory implementations of the store, cache and publisher traits.
//!
//! Used by the test suites across the workspace. Each type has switches to
//! inject failures so the coordinator's fallback and rollback paths can be
//! exercised without Postgres, Redis or RabbitMQ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use herald_common::error::AppError;
use herald_common::types::{NewNotification, Notification, NotificationStatus};

use crate::cache::StatusCache;
use crate::publisher::NotificationPublisher;
use crate::store::StatusStore;

/// In-memory status store with sequential ids starting at 1.
#[derive(Default)]
pub struct InMemoryStatusStore {
    rows: Mutex<HashMap<i64, Notification>>,
    next_id: Mutex<i64>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_updates: AtomicBool,
    update_calls: AtomicUsize,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `get_status` fail with a transient error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `insert` / `update_status` fail with a transient error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail `update_status` only; inserts still succeed.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Start id assignment at `next` (the next insert receives this id).
    pub fn set_next_id(&self, next: i64) {
        *self.next_id.lock() = next - 1;
    }

    /// Snapshot of a stored row.
    pub fn get(&self, id: i64) -> Option<Notification> {
        self.rows.lock().get(&id).cloned()
    }

    /// Overwrite a row's status directly, bypassing every check.
    pub fn force_status(&self, id: i64, status: NotificationStatus) {
        if let Some(row) = self.rows.lock().get_mut(&id) {
            row.status = status;
        }
    }

    /// Number of `update_status` calls that reached the store.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn unavailable() -> AppError {
        AppError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get_status(&self, id: i64) -> Result<NotificationStatus, AppError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.rows
            .lock()
            .get(&id)
            .map(|row| row.status)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    async fn insert(&self, notification: &NewNotification) -> Result<i64, AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.rows
            .lock()
            .insert(id, Notification::from_new(id, notification.clone()));
        Ok(id)
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) || self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
        if row.status.is_terminal() && row.status != status {
            return Err(AppError::AlreadyTerminal {
                id,
                status: row.status,
            });
        }
        row.status = status;
        if sent_at.is_some() {
            row.sent_at = sent_at;
        }
        Ok(())
    }
}

/// In-memory status cache. TTLs are not modelled.
#[derive(Default)]
pub struct InMemoryStatusCache {
    entries: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Put a raw value in the cache, bypassing the failure switches.
    pub fn seed(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn unavailable() -> AppError {
        AppError::Internal("cache unavailable".to_string())
    }
}

#[async_trait]
impl StatusCache for InMemoryStatusCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.seed(key, value);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}

/// Publisher that records scheduled notifications instead of enqueuing them.
#[derive(Default)]
pub struct RecordingPublisher {
    scheduled: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn scheduled(&self) -> Vec<Notification> {
        self.scheduled.lock().clone()
    }
}

#[async_trait]
impl NotificationPublisher for RecordingPublisher {
    async fn schedule(&self, notification: &Notification) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Publish("broker unavailable".to_string()));
        }
        self.scheduled.lock().push(notification.clone());
        Ok(())
    }
}
