//! File-per-participant conversation backend.
//!
//! Each record is a pretty-printed JSON array at `<data_dir>/<key>.json`.
//! Writes go to a hidden temp file that is fsynced and then renamed over the
//! record, so a crash mid-write leaves the previous record intact.

use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{instrument, warn};

use crate::base::types::HistoryEntry;

use super::{GenericConversationBackend, StoreError};

pub struct FileConversationBackend {
    dir: PathBuf,
}

impl FileConversationBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{key}.json.tmp"))
    }
}

/// Parse a stored record, skipping individual entries that no longer deserialize.
fn parse_record(key: &str, content: &str) -> Result<Vec<HistoryEntry>, StoreError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let values: Vec<Value> = serde_json::from_str(content).map_err(|err| StoreError::Corrupted {
        key: key.to_string(),
        detail: err.to_string(),
    })?;

    let entries = values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<HistoryEntry>(value) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Skipping malformed history entry for `{key}`: {err}");
                None
            }
        })
        .collect();

    Ok(entries)
}

#[async_trait]
impl GenericConversationBackend for FileConversationBackend {
    #[instrument(name = "FileConversationBackend::load", skip(self))]
    async fn load(&self, key: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        match fs::read_to_string(self.record_path(key)).await {
            Ok(content) => parse_record(key, &content),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(name = "FileConversationBackend::save", skip(self, entries))]
    async fn save(&self, key: &str, entries: &[HistoryEntry]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;

        let content = serde_json::to_vec_pretty(entries)?;
        let temp = self.temp_path(key);

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, self.record_path(key)).await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !stem.starts_with('.')
            {
                keys.push(stem.to_string());
            }
        }

        keys.sort();
        Ok(keys)
    }
}
