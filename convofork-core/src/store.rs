//! Conversation log storage
//!
//! The core reads and writes logs only through [`LogHandle`]: read all
//! lines, write all lines. A file, an in-memory buffer, or a remote store
//! all satisfy it.
//!
//! Log files are read as bytes. A line that is not valid UTF-8 is carried
//! as [`UNDECODABLE_LINE_PREFIX`] followed by its bytes in hex, which the
//! parser reports as malformed and [`FileLog`] writes back unchanged.
//!
//! No locking is done here. Callers must not run two mutations against the
//! same log at once.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Marks a line whose bytes are not valid UTF-8
pub const UNDECODABLE_LINE_PREFIX: &str = "\u{0}undecodable:";

/// Decode one line, hex-encoding it behind the marker if it is not UTF-8
pub fn decode_line(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("{}{}", UNDECODABLE_LINE_PREFIX, hex::encode(bytes)),
    }
}

/// Original bytes of a line produced by [`decode_line`]
pub fn encode_line(line: &str) -> Vec<u8> {
    line.strip_prefix(UNDECODABLE_LINE_PREFIX)
        .and_then(|encoded| hex::decode(encoded).ok())
        .unwrap_or_else(|| line.as_bytes().to_vec())
}

/// Split on `\n` like [`str::lines`]: a trailing `\r` is dropped and a
/// final newline does not start an empty line.
fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = bytes
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        lines.pop();
    }
    lines
}

/// Read/write access to one conversation log
#[async_trait]
pub trait LogHandle: Send + Sync {
    /// Human-readable reference stored in backups (e.g. the file path)
    fn reference(&self) -> String;

    /// Session id to use when no record carries one
    fn session_hint(&self) -> String {
        self.reference()
    }

    /// Read every line of the log
    async fn read_lines(&self) -> std::io::Result<Vec<String>>;

    /// Replace the log's content with `lines`
    async fn write_lines(&self, lines: &[String]) -> std::io::Result<()>;
}

/// A JSONL log file on disk
#[derive(Debug, Clone)]
pub struct FileLog {
    path: PathBuf,
}

impl FileLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "log".to_string());
        self.path.with_file_name(format!(".{}.convofork.tmp", name))
    }
}

#[async_trait]
impl LogHandle for FileLog {
    fn reference(&self) -> String {
        self.path.display().to_string()
    }

    fn session_hint(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.reference())
    }

    async fn read_lines(&self) -> std::io::Result<Vec<String>> {
        let bytes = tokio::fs::read(&self.path).await?;
        let lines: Vec<String> = split_lines(&bytes).into_iter().map(decode_line).collect();
        let undecodable = lines
            .iter()
            .filter(|line| line.starts_with(UNDECODABLE_LINE_PREFIX))
            .count();
        if undecodable > 0 {
            tracing::warn!(
                path = %self.path.display(),
                lines = undecodable,
                "Log has lines that are not valid UTF-8"
            );
        }
        Ok(lines)
    }

    /// Writes a sibling temp file and renames it over the log.
    async fn write_lines(&self, lines: &[String]) -> std::io::Result<()> {
        let mut content = Vec::new();
        for line in lines {
            content.extend_from_slice(&encode_line(line));
            content.push(b'\n');
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, content).await?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(())
    }
}

/// An in-memory log
#[derive(Debug, Default)]
pub struct MemoryLog {
    name: String,
    lines: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new(name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            name: name.into(),
            lines: Mutex::new(lines),
        }
    }

    /// Current content
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LogHandle for MemoryLog {
    fn reference(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn session_hint(&self) -> String {
        self.name.clone()
    }

    async fn read_lines(&self) -> std::io::Result<Vec<String>> {
        Ok(self.snapshot())
    }

    async fn write_lines(&self, lines: &[String]) -> std::io::Result<()> {
        let mut guard = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = lines.to_vec();
        Ok(())
    }
}

/// A session log found on disk
#[derive(Debug, Clone, Serialize)]
pub struct SessionLog {
    pub path: PathBuf,
    /// File stem (Claude Code names logs by session id)
    pub session_id: String,
    /// Encoded project directory name
    pub project: String,
    pub modified_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Find Claude Code session logs (`*/*.jsonl`) under a projects directory,
/// newest first.
pub fn discover_sessions(projects_dir: &Path) -> Result<Vec<SessionLog>> {
    if !projects_dir.exists() {
        return Ok(Vec::new());
    }

    let pattern = projects_dir.join("*").join("*.jsonl");
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern)
        .map_err(|e| Error::Config(format!("invalid session glob pattern: {}", e)))?;

    let mut sessions = Vec::new();
    for path in entries.flatten() {
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable log");
                continue;
            }
        };
        let modified_at = metadata
            .modified()
            .ok()
            .map(DateTime::from)
            .unwrap_or_else(Utc::now);
        let session_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let project = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        sessions.push(SessionLog {
            path,
            session_id,
            project,
            modified_at,
            size_bytes: metadata.len(),
        });
    }

    sessions.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_log_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session-1.jsonl");
        std::fs::write(&path, "{\"a\":1}\n{\"b\":2}\n").unwrap();

        let log = FileLog::new(&path);
        assert_eq!(log.session_hint(), "session-1");

        let lines = log.read_lines().await.unwrap();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);

        log.write_lines(&lines[..1]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}\n");
        assert!(!log.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_log_keeps_undecodable_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session-2.jsonl");
        let original: &[u8] = b"{\"uuid\":\"r\"}\n{\"junk\":\"\xff\xfe\"}\n{\"uuid\":\"c\"}\n";
        std::fs::write(&path, original).unwrap();

        let log = FileLog::new(&path);
        let lines = log.read_lines().await.unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "{\"uuid\":\"r\"}");
        assert!(lines[1].starts_with(UNDECODABLE_LINE_PREFIX));

        log.write_lines(&lines).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), original);

        log.write_lines(&lines[1..2]).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"junk\":\"\xff\xfe\"}\n");
    }

    #[test]
    fn test_line_splitting_matches_str_lines() {
        let expected: [&[u8]; 3] = [b"a", b"", b"b"];
        assert!(split_lines(b"").is_empty());
        assert_eq!(split_lines(b"a\r\n\nb"), expected);
        assert_eq!(split_lines(b"a\n"), expected[..1].to_vec());
        assert_eq!(encode_line("plain"), b"plain".to_vec());
    }

    #[tokio::test]
    async fn test_file_log_missing_file() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(dir.path().join("missing.jsonl"));
        assert!(log.read_lines().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_log() {
        let log = MemoryLog::new("s", vec!["x".to_string()]);
        assert_eq!(log.reference(), "memory:s");

        log.write_lines(&["y".to_string(), "z".to_string()])
            .await
            .unwrap();
        assert_eq!(log.read_lines().await.unwrap(), vec!["y", "z"]);
    }

    #[test]
    fn test_discover_sessions() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("-home-me-dev-app");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("abc-123.jsonl"), "{}\n").unwrap();
        std::fs::write(project.join("notes.txt"), "ignored").unwrap();

        let sessions = discover_sessions(dir.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "abc-123");
        assert_eq!(sessions[0].project, "-home-me-dev-app");
        assert_eq!(sessions[0].size_bytes, 3);

        assert!(discover_sessions(&dir.path().join("nope")).unwrap().is_empty());
    }
}
