//! Durable per-(competitor, stage) checkpoints.
//!
//! Layout: `<root>/<slug>/<stage>.json`. Every write goes to a uniquely named
//! temp file in the same directory, is synced, and is then renamed over the
//! target, so a reader only ever sees the old or the new complete snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use compintel_shared::{
    CheckpointRecord, CheckpointStatus, CompIntelError, Result, Stage, UnitKey,
};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// File-backed checkpoint store, safe to share across concurrent workers.
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    locks: Mutex<HashMap<(UnitKey, Stage), KeyLock>>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the checkpoint file for `(key, stage)`.
    pub fn path_for(&self, key: &UnitKey, stage: Stage) -> PathBuf {
        self.root.join(key.as_str()).join(format!("{stage}.json"))
    }

    /// Writers for the same (key, stage) serialize; different keys never contend.
    fn lock_for(&self, key: &UnitKey, stage: Stage) -> KeyLock {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry((key.clone(), stage))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Load the authoritative record for `(key, stage)`, if any.
    pub async fn load(&self, key: &UnitKey, stage: Stage) -> Result<Option<CheckpointRecord>> {
        read_record(&self.path_for(key, stage)).await
    }

    /// Persist `record` as the new snapshot and return what is now authoritative.
    ///
    /// The store assigns the version. A record older than the stored one is
    /// dropped, and a stored `complete` record is never replaced by a
    /// non-complete one; use [`CheckpointStore::reset`] to discard it first.
    pub async fn save(&self, mut record: CheckpointRecord) -> Result<CheckpointRecord> {
        let lock = self.lock_for(&record.key, record.stage);
        let _guard = lock.lock().await;

        let path = self.path_for(&record.key, record.stage);
        let existing = read_record(&path).await?;

        if let Some(current) = existing.as_ref() {
            if current.status == CheckpointStatus::Complete
                && record.status != CheckpointStatus::Complete
            {
                tracing::warn!(
                    key = %record.key,
                    stage = %record.stage,
                    incoming = record.status.as_str(),
                    "refusing to overwrite complete checkpoint"
                );
                return Ok(current.clone());
            }
            if record.timestamp < current.timestamp {
                tracing::debug!(
                    key = %record.key,
                    stage = %record.stage,
                    "dropping stale checkpoint write"
                );
                return Ok(current.clone());
            }
        }

        record.version = existing.map_or(1, |r| r.version + 1);
        write_atomic(&path, &record).await?;

        tracing::debug!(
            key = %record.key,
            stage = %record.stage,
            status = record.status.as_str(),
            version = record.version,
            "checkpoint saved"
        );
        Ok(record)
    }

    /// Delete the record for `(key, stage)`. Returns whether one existed.
    pub async fn reset(&self, key: &UnitKey, stage: Stage) -> Result<bool> {
        let lock = self.lock_for(key, stage);
        let _guard = lock.lock().await;

        let path = self.path_for(key, stage);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CompIntelError::io(&path, e)),
        }
    }

    /// All readable records, optionally restricted to one key, sorted by key
    /// then stage. Unparseable files are logged and skipped.
    pub async fn list(&self, key: Option<&UnitKey>) -> Result<Vec<CheckpointRecord>> {
        let mut records = Vec::new();
        for path in self.checkpoint_files(key).await? {
            match read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e @ CompIntelError::Parse { .. }) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid checkpoint");
                }
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key).then(a.stage.cmp(&b.stage)));
        Ok(records)
    }

    /// Remove every checkpoint file, or only those for `key`, whether or not
    /// it parses. Returns the number of files removed.
    pub async fn clear(&self, key: Option<&UnitKey>) -> Result<usize> {
        let mut removed = 0;
        for path in self.checkpoint_files(key).await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CompIntelError::io(&path, e)),
            }
        }
        tracing::info!(removed, "checkpoints cleared");
        Ok(removed)
    }

    /// `*.json` files under each key directory.
    async fn checkpoint_files(&self, key: Option<&UnitKey>) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in self.key_dirs(key).await? {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CompIntelError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| CompIntelError::io(&dir, e))?
            {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    async fn key_dirs(&self, key: Option<&UnitKey>) -> Result<Vec<PathBuf>> {
        if let Some(key) = key {
            return Ok(vec![self.root.join(key.as_str())]);
        }
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(CompIntelError::io(&self.root, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CompIntelError::io(&self.root, e))?
        {
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

async fn read_record(path: &Path) -> Result<Option<CheckpointRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CompIntelError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| CompIntelError::parse(format!("checkpoint {}: {e}", path.display())))
}

/// Write `value` as pretty JSON to `path` via temp file + fsync + rename.
pub(crate) async fn write_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CompIntelError::validation(format!("no parent for {}", path.display())))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| CompIntelError::io(dir, e))?;

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| CompIntelError::parse(format!("serialize {}: {e}", path.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    let result = async {
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| CompIntelError::io(&temp, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| CompIntelError::io(&temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| CompIntelError::io(&temp, e))?;
        drop(file);
        // Atomic rename
        tokio::fs::rename(&temp, path)
            .await
            .map_err(|e| CompIntelError::io(path, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("ci_ckpt_{}", Uuid::now_v7()))
    }

    fn key() -> UnitKey {
        UnitKey::from_name("EFM Logistics")
    }

    #[tokio::test]
    async fn save_and_load_assigns_versions() {
        let root = temp_root();
        let store = CheckpointStore::new(&root);

        assert!(store.load(&key(), Stage::Research).await.expect("load").is_none());

        let first = store
            .save(CheckpointRecord::new(key(), Stage::Research, CheckpointStatus::InProgress))
            .await
            .expect("save");
        assert_eq!(first.version, 1);

        let second = store
            .save(
                CheckpointRecord::new(key(), Stage::Research, CheckpointStatus::Complete)
                    .with_payload(serde_json::json!({"claims": 2})),
            )
            .await
            .expect("save");
        assert_eq!(second.version, 2);

        let loaded = store
            .load(&key(), Stage::Research)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.status, CheckpointStatus::Complete);
        assert_eq!(loaded.payload, Some(serde_json::json!({"claims": 2})));
        assert!(root.join("efm_logistics").join("research.json").exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn complete_is_never_downgraded() {
        let root = temp_root();
        let store = CheckpointStore::new(&root);
        store
            .save(CheckpointRecord::new(key(), Stage::Research, CheckpointStatus::Complete))
            .await
            .expect("save complete");

        let kept = store
            .save(
                CheckpointRecord::new(key(), Stage::Research, CheckpointStatus::Failed)
                    .with_error("late failure"),
            )
            .await
            .expect("save failed");
        assert_eq!(kept.status, CheckpointStatus::Complete);
        assert_eq!(kept.version, 1);

        assert!(store.reset(&key(), Stage::Research).await.expect("reset"));
        assert!(store.load(&key(), Stage::Research).await.expect("load").is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn stale_write_loses_to_latest_timestamp() {
        let root = temp_root();
        let store = CheckpointStore::new(&root);

        let mut older = CheckpointRecord::new(key(), Stage::Research, CheckpointStatus::Failed);
        older.timestamp = Utc::now() - Duration::seconds(30);
        let newer = CheckpointRecord::new(key(), Stage::Research, CheckpointStatus::InProgress);

        store.save(newer).await.expect("save newer");
        let kept = store.save(older).await.expect("save older");
        assert_eq!(kept.status, CheckpointStatus::InProgress);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn no_temp_files_survive_writes() {
        let root = temp_root();
        let store = CheckpointStore::new(&root);
        for status in [CheckpointStatus::InProgress, CheckpointStatus::Complete] {
            store
                .save(CheckpointRecord::new(key(), Stage::Research, status))
                .await
                .expect("save");
        }
        let leftovers: Vec<_> = std::fs::read_dir(root.join("efm_logistics"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn concurrent_writers_on_distinct_keys() {
        let root = temp_root();
        let store = Arc::new(CheckpointStore::new(&root));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let key = UnitKey::from_name(&format!("Competitor {i}"));
                for status in [CheckpointStatus::InProgress, CheckpointStatus::Complete] {
                    store
                        .save(CheckpointRecord::new(key.clone(), Stage::Research, status))
                        .await
                        .expect("save");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let records = store.list(None).await.expect("list");
        assert_eq!(records.len(), 8);
        assert!(records.iter().all(|r| r.status == CheckpointStatus::Complete && r.version == 2));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn list_and_clear_by_key() {
        let root = temp_root();
        let store = CheckpointStore::new(&root);
        let other = UnitKey::from_name("Acme");
        for (k, stage) in [
            (key(), Stage::Research),
            (key(), Stage::Profiling),
            (other.clone(), Stage::Research),
        ] {
            store
                .save(CheckpointRecord::new(k, stage, CheckpointStatus::Pending))
                .await
                .expect("save");
        }

        assert_eq!(store.list(Some(&key())).await.expect("list").len(), 2);
        assert_eq!(store.clear(Some(&key())).await.expect("clear"), 2);
        let remaining = store.list(None).await.expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, other);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn unreadable_file_is_skipped_by_list_and_removed_by_clear() {
        let root = temp_root();
        let store = CheckpointStore::new(&root);
        let acme = UnitKey::from_name("Acme");
        store
            .save(CheckpointRecord::new(key(), Stage::Research, CheckpointStatus::Complete))
            .await
            .expect("save");
        let corrupt = store.path_for(&acme, Stage::Research);
        std::fs::create_dir_all(corrupt.parent().expect("parent")).expect("mkdir");
        std::fs::write(&corrupt, "{not json").expect("write corrupt");

        let records = store.list(None).await.expect("list survives corrupt file");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, key());

        assert_eq!(store.clear(None).await.expect("clear"), 2);
        assert!(!corrupt.exists());
        assert!(store.list(None).await.expect("list").is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let store = CheckpointStore::new(temp_root());
        assert!(store.list(None).await.expect("list").is_empty());
        assert_eq!(store.clear(None).await.expect("clear"), 0);
    }
}
