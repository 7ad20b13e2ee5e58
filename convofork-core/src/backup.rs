//! Branch backups
//!
//! A [`BranchBackup`] is written before any mutating action. It holds a full
//! copy of the branch, the branch's original log lines, the log it came from,
//! and a SHA-256 digest of the log content it was taken against. Backups are
//! kept until restored.
//!
//! The store also keeps the deactivation ledger: the starting message ids of
//! branches that are currently deactivated.

use crate::advisor::ActionKind;
use crate::branch::ConversationBranch;
use crate::error::{Error, Result};
use crate::ingest::record_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

const LEDGER_FILE: &str = "deactivated.json";

/// Snapshot of a branch taken before a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchBackup {
    /// `<branch start id>-<timestamp>`
    pub id: String,
    /// Reference of the log the branch belongs to
    pub log_ref: String,
    /// Action the backup was taken for
    pub action: ActionKind,
    pub branch: ConversationBranch,
    /// Log line of each branch message, in branch order
    pub records: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    /// SHA-256 of the log content at backup time
    pub log_digest: String,
}

impl BranchBackup {
    pub fn new(
        log_ref: impl Into<String>,
        action: ActionKind,
        branch: &ConversationBranch,
        reason: impl Into<String>,
        log_lines: &[String],
    ) -> Self {
        let created_at = Utc::now();
        let mut by_id: HashMap<String, &String> = HashMap::new();
        for line in log_lines {
            if let Some(id) = record_id(line) {
                by_id.entry(id).or_insert(line);
            }
        }
        // Messages no longer in the log fall back to their parsed record
        let records = branch
            .messages
            .iter()
            .map(|m| match by_id.get(&m.id) {
                Some(line) => (*line).clone(),
                None => m.raw.to_string(),
            })
            .collect();

        Self {
            id: backup_id(&branch.start_id, created_at),
            log_ref: log_ref.into(),
            action,
            branch: branch.clone(),
            records,
            created_at,
            reason: reason.into(),
            log_digest: digest_lines(log_lines),
        }
    }

    /// Message ids paired with the log lines that restore them
    pub fn restorable(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.branch
            .message_ids()
            .zip(self.records.iter().map(String::as_str))
    }
}

fn backup_id(start_id: &str, created_at: DateTime<Utc>) -> String {
    let safe: String = start_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", safe, created_at.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Hex SHA-256 of log lines joined by newlines
pub fn digest_lines(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Durable storage for backups and the deactivation ledger
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persist a backup; must not return until it is durable
    async fn save(&self, backup: &BranchBackup) -> Result<()>;

    /// Load one backup by id
    async fn load(&self, id: &str) -> Result<BranchBackup>;

    /// All backups, newest first
    async fn list(&self) -> Result<Vec<BranchBackup>>;

    /// Delete a backup
    async fn remove(&self, id: &str) -> Result<()>;

    /// Start ids of deactivated branches
    async fn deactivated(&self) -> Result<BTreeSet<String>>;

    /// Replace the deactivation ledger
    async fn set_deactivated(&self, start_ids: &BTreeSet<String>) -> Result<()>;

    /// Backups for one branch, newest first
    async fn list_for_branch(&self, start_id: &str) -> Result<Vec<BranchBackup>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|b| b.branch.start_id == start_id)
            .collect())
    }
}

/// Backups as JSON files in a directory
#[derive(Debug, Clone)]
pub struct DirBackupStore {
    dir: PathBuf,
}

impl DirBackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a backup file. Ids are only ever `[A-Za-z0-9_-]`, so anything
    /// else (a path separator, `..`) is rejected before touching the disk.
    fn backup_path(&self, id: &str) -> Result<PathBuf> {
        let well_formed = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let file_name = format!("{}.json", id);
        if !well_formed || file_name == LEDGER_FILE {
            return Err(Error::InvalidAction(format!("invalid backup id '{}'", id)));
        }
        Ok(self.dir.join(file_name))
    }

    async fn write_durable(&self, path: &Path, content: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let temp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl BackupStore for DirBackupStore {
    async fn save(&self, backup: &BranchBackup) -> Result<()> {
        let content = serde_json::to_vec_pretty(backup)?;
        self.write_durable(&self.backup_path(&backup.id)?, &content)
            .await?;
        tracing::info!(
            backup_id = %backup.id,
            branch = %backup.branch.start_id,
            messages = backup.branch.messages.len(),
            "Saved branch backup"
        );
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<BranchBackup> {
        let path = self.backup_path(id)?;
        let content = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BackupNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    async fn list(&self) -> Result<Vec<BranchBackup>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_backup = path.extension().map_or(false, |ext| ext == "json")
                && path.file_name().map_or(false, |name| name != LEDGER_FILE);
            if !is_backup {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<BranchBackup>(&content) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable backup");
                }
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.backup_path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BackupNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deactivated(&self) -> Result<BTreeSet<String>> {
        match tokio::fs::read(self.dir.join(LEDGER_FILE)).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_deactivated(&self, start_ids: &BTreeSet<String>) -> Result<()> {
        let content = serde_json::to_vec_pretty(start_ids)?;
        self.write_durable(&self.dir.join(LEDGER_FILE), &content)
            .await
    }
}

/// In-memory backups, for callers that manage persistence themselves
#[derive(Debug, Default)]
pub struct MemoryBackupStore {
    backups: Mutex<Vec<BranchBackup>>,
    deactivated: Mutex<BTreeSet<String>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn save(&self, backup: &BranchBackup) -> Result<()> {
        let mut backups = self.backups.lock().unwrap_or_else(|p| p.into_inner());
        backups.retain(|b| b.id != backup.id);
        backups.push(backup.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<BranchBackup> {
        self.backups
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| Error::BackupNotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<BranchBackup>> {
        let mut backups = self
            .backups
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut backups = self.backups.lock().unwrap_or_else(|p| p.into_inner());
        let before = backups.len();
        backups.retain(|b| b.id != id);
        if backups.len() == before {
            return Err(Error::BackupNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn deactivated(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .deactivated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone())
    }

    async fn set_deactivated(&self, start_ids: &BTreeSet<String>) -> Result<()> {
        *self.deactivated.lock().unwrap_or_else(|p| p.into_inner()) = start_ids.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::build_branches;
    use crate::fork::detect_forks;
    use crate::tokens::TokenEstimator;
    use crate::tree::tests::{build, msg};
    use tempfile::TempDir;

    fn sample_branch() -> ConversationBranch {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("1"), 2),
            msg("4", Some("3"), 3),
        ]);
        let forks = detect_forks(&tree);
        build_branches(&tree, &forks, &TokenEstimator::default())
            .into_iter()
            .find(|b| b.start_id == "3")
            .unwrap()
    }

    #[test]
    fn test_backup_keeps_original_lines() {
        let lines = vec![
            r#"{"uuid":"3", "parentUuid":"1", "note":"spaced"}"#.to_string(),
            "not json".to_string(),
        ];
        let backup = BranchBackup::new("log.jsonl", ActionKind::Prune, &sample_branch(), "stale", &lines);

        assert!(backup.id.starts_with("3-"));
        assert_eq!(backup.log_digest, digest_lines(&lines));
        assert_ne!(backup.log_digest, digest_lines(&lines[..1]));
        assert_eq!(backup.log_digest.len(), 64);

        let records: Vec<(&str, &str)> = backup.restorable().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], ("3", lines[0].as_str()));
        // "4" is not in the log; its parsed record is used
        assert_eq!(records[1].0, "4");
        assert!(records[1].1.contains("\"uuid\":\"4\""));
    }

    #[test]
    fn test_backup_id_is_filename_safe() {
        let id = backup_id("../evil/id", Utc::now());
        assert!(id.starts_with("___evil_id-"));
    }

    #[tokio::test]
    async fn test_dir_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DirBackupStore::new(dir.path().join("backups"));
        assert!(store.list().await.unwrap().is_empty());

        let backup = BranchBackup::new("log", ActionKind::Prune, &sample_branch(), "r", &[]);
        store.save(&backup).await.unwrap();

        let loaded = store.load(&backup.id).await.unwrap();
        assert_eq!(loaded, backup);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.list_for_branch("3").await.unwrap().len(), 1);
        assert!(store.list_for_branch("2").await.unwrap().is_empty());

        store.remove(&backup.id).await.unwrap();
        assert!(matches!(
            store.load(&backup.id).await,
            Err(Error::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dir_store_rejects_ids_outside_its_dir() {
        let root = TempDir::new().unwrap();
        let store = DirBackupStore::new(root.path().join("backups"));
        std::fs::create_dir_all(store.dir()).unwrap();
        let outside = BranchBackup::new("log", ActionKind::Prune, &sample_branch(), "r", &[]);
        std::fs::write(
            root.path().join("x.json"),
            serde_json::to_vec(&outside).unwrap(),
        )
        .unwrap();

        for id in ["../x", "..", "a/b", "a\\b", "", "deactivated"] {
            assert!(
                matches!(store.load(id).await, Err(Error::InvalidAction(_))),
                "{id:?} should be rejected"
            );
            assert!(matches!(store.remove(id).await, Err(Error::InvalidAction(_))));
        }
        assert!(root.path().join("x.json").exists());
    }

    #[tokio::test]
    async fn test_dir_store_ledger() {
        let dir = TempDir::new().unwrap();
        let store = DirBackupStore::new(dir.path());
        assert!(store.deactivated().await.unwrap().is_empty());

        let ids: BTreeSet<String> = ["x".to_string(), "y".to_string()].into();
        store.set_deactivated(&ids).await.unwrap();
        assert_eq!(store.deactivated().await.unwrap(), ids);

        // The ledger is not a backup
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dir_store_save_fails_when_dir_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();

        let store = DirBackupStore::new(&blocker);
        let backup = BranchBackup::new("log", ActionKind::Prune, &sample_branch(), "r", &[]);
        assert!(store.save(&backup).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBackupStore::new();
        let backup = BranchBackup::new("log", ActionKind::Deactivate, &sample_branch(), "r", &[]);
        store.save(&backup).await.unwrap();

        assert_eq!(store.load(&backup.id).await.unwrap().action, ActionKind::Deactivate);
        store.remove(&backup.id).await.unwrap();
        assert!(store.remove(&backup.id).await.is_err());
    }
}
