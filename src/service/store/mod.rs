//! Per-participant conversation memory.
//!
//! The [`ConversationStore`] owns the lifecycle of every conversation record:
//! it bounds stored history to `max_messages`, filters reads to the retention
//! window and `history_limit`, and serializes access per participant key.
//! Persistence is delegated to a [`GenericConversationBackend`], so the same
//! discipline holds for flat files, an in-memory map, or anything else that
//! can load and save a record by key.

pub mod file;
pub mod memory;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::base::{
    config::Config,
    events::{ErrorKind, EventBus, EventKind},
    types::{HistoryEntry, HistoryRole},
};

use self::{file::FileConversationBackend, memory::MemoryConversationBackend};

/// Storage failures. Reads never surface these to callers (they fail open).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted record for `{key}`: {detail}")]
    Corrupted { key: String, detail: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Traits.

/// Key-scoped persistence for conversation records.
///
/// Keys are already normalized by the store. Implementations do not need their
/// own locking for a single key; the store never runs two operations on the
/// same key at once.
#[async_trait]
pub trait GenericConversationBackend: Send + Sync + 'static {
    /// Load the full record; an unknown key yields an empty record.
    async fn load(&self, key: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Replace the record durably.
    async fn save(&self, key: &str, entries: &[HistoryEntry]) -> Result<(), StoreError>;

    /// Delete the record; deleting an unknown key succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All keys that currently have a record.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

// Structs.

/// Bounds applied by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Stored entries kept per participant.
    pub max_messages: usize,
    /// Entries returned by a read.
    pub history_limit: usize,
    /// How old an entry may be and still be returned by a read.
    pub retention: Duration,
}

impl StoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_messages: config.max_messages,
            history_limit: config.history_limit,
            retention: config.context_retention,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_messages: 25,
            history_limit: 5,
            retention: Duration::from_secs(3600),
        }
    }
}

/// Conversation store for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Arc<dyn GenericConversationBackend>,
    settings: StoreSettings,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: EventBus,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn GenericConversationBackend>, settings: StoreSettings, events: EventBus) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                settings,
                locks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// A store persisting one JSON file per participant under `config.data_dir`.
    pub fn file(config: &Config, events: EventBus) -> Self {
        let backend = FileConversationBackend::new(config.data_dir.clone());
        Self::new(Arc::new(backend), StoreSettings::from_config(config), events)
    }

    /// A store that keeps everything in process memory.
    pub fn memory(settings: StoreSettings, events: EventBus) -> Self {
        Self::new(Arc::new(MemoryConversationBackend::default()), settings, events)
    }

    pub fn settings(&self) -> StoreSettings {
        self.inner.settings
    }

    /// Recent history for a participant: entries within the retention window
    /// ending at `now`, at most `history_limit` of them, oldest first.
    ///
    /// Unknown participants and unreadable records both yield an empty history.
    #[instrument(name = "ConversationStore::read", skip(self))]
    pub async fn read(&self, participant_id: &str, now: DateTime<Utc>) -> Vec<HistoryEntry> {
        let key = normalize_participant(participant_id);
        let lock = self.lock_for(&key);

        let loaded = {
            let _guard = lock.lock().await;
            self.inner.backend.load(&key).await
        };
        drop(lock);
        self.release(&key);

        match loaded {
            Ok(entries) => window(entries, now, &self.inner.settings),
            Err(err) => {
                warn!("Unreadable history for `{key}`, continuing without it: {err}");
                self.report(participant_id, &err);
                Vec::new()
            }
        }
    }

    /// Append one entry and persist the truncated record before returning.
    ///
    /// Timestamps never go backwards: an entry older than the last stored one is
    /// stamped with the last stored timestamp instead.
    #[instrument(name = "ConversationStore::append", skip(self, content))]
    pub async fn append(&self, participant_id: &str, role: HistoryRole, content: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let key = normalize_participant(participant_id);
        let lock = self.lock_for(&key);

        let result = {
            let _guard = lock.lock().await;
            self.append_locked(participant_id, &key, role, content, now).await
        };
        drop(lock);
        self.release(&key);

        if let Err(err) = &result {
            warn!("Failed to persist history for `{key}`: {err}");
            self.report(participant_id, err);
        }

        result
    }

    async fn append_locked(&self, participant_id: &str, key: &str, role: HistoryRole, content: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entries = match self.inner.backend.load(key).await {
            Ok(entries) => entries,
            Err(err @ StoreError::Corrupted { .. }) => {
                warn!("Replacing corrupted history for `{key}`: {err}");
                self.report(participant_id, &err);
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let timestamp = entries.last().map_or(now, |last| now.max(last.timestamp));
        entries.push(HistoryEntry::new(role, content, timestamp));

        let max = self.inner.settings.max_messages;
        if entries.len() > max {
            let excess = entries.len() - max;
            entries.drain(..excess);
        }

        self.inner.backend.save(key, &entries).await?;
        debug!("Stored {} entries for `{key}`", entries.len());

        Ok(())
    }

    /// Forget everything stored for a participant. Idempotent.
    #[instrument(name = "ConversationStore::reset", skip(self))]
    pub async fn reset(&self, participant_id: &str) -> Result<(), StoreError> {
        let key = normalize_participant(participant_id);
        let lock = self.lock_for(&key);

        let result = {
            let _guard = lock.lock().await;
            self.inner.backend.remove(&key).await
        };
        drop(lock);
        self.release(&key);

        if let Err(err) = &result {
            self.report(participant_id, err);
        }

        result
    }

    /// Normalized ids of every participant with stored history.
    pub async fn participants(&self) -> Result<Vec<String>, StoreError> {
        self.inner.backend.keys().await
    }

    /// Number of stored entries (ignoring the read window); 0 when unreadable.
    pub async fn message_count(&self, participant_id: &str) -> usize {
        let key = normalize_participant(participant_id);
        self.inner.backend.load(&key).await.map(|entries| entries.len()).unwrap_or(0)
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the key lock once nobody else holds or waits on it.
    fn release(&self, key: &str) {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    fn report(&self, participant_id: &str, err: &StoreError) {
        self.inner.events.emit(
            Some(participant_id),
            EventKind::Error {
                kind: ErrorKind::Storage,
                detail: err.to_string(),
            },
        );
    }
}

/// Case-fold a participant id and keep only filesystem-safe characters.
///
/// Leading dots are dropped so no key names a hidden file.
pub fn normalize_participant(participant_id: &str) -> String {
    let key: String = participant_id
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let key = key.trim_start_matches('.');

    if key.is_empty() { "_".to_string() } else { key.to_string() }
}

fn window(entries: Vec<HistoryEntry>, now: DateTime<Utc>, settings: &StoreSettings) -> Vec<HistoryEntry> {
    let cutoff = TimeDelta::from_std(settings.retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let recent: Vec<HistoryEntry> = entries.into_iter().filter(|entry| entry.timestamp >= cutoff && entry.timestamp <= now).collect();

    let skip = recent.len().saturating_sub(settings.history_limit);
    recent.into_iter().skip(skip).collect()
}
