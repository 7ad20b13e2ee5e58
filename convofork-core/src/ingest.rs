//! Claude Code JSONL record parsing
//!
//! Turns the lines of a session log into [`Message`] values.
//!
//! # Error Handling
//!
//! Parsing never fails as a whole; one bad record must not block the rest:
//!
//! - **Malformed JSON lines**: recorded as [`LogWarning::Malformed`], line skipped.
//!   Lines that are not valid UTF-8 are reported the same way.
//! - **Unreadable content blocks or usage**: the message is kept with the
//!   block as [`ContentBlock::Unknown`] (or without usage) and a
//!   [`LogWarning::Malformed`] is recorded, so its id and parent still attach.
//! - **Records without a `uuid`** (`summary`, `file-history-snapshot`, …):
//!   not conversation turns, counted in [`ParsedLog::skipped_records`].
//! - **Sidechain records**: sub-agent transcripts interleaved into the main
//!   log, counted in [`ParsedLog::sidechain_records`] and skipped.
//! - **Missing or invalid `timestamp`**: the previous record's timestamp is
//!   reused (parse time for the first record) and a warning is recorded.

use crate::store::UNDECODABLE_LINE_PREFIX;
use crate::types::{ContentBlock, Message, MessageContent, Role, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recoverable problem found while reading a log or building its tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogWarning {
    /// A line could not be used as a record
    Malformed { line: usize, message: String },
    /// A message whose parent is not part of the tree
    Orphan {
        id: String,
        parent_id: Option<String>,
    },
    /// A second parentless message; only the first root is kept
    MultipleRoots { id: String, root_id: String },
    /// The same id was recorded under different parents; all copies dropped
    ConflictingParent {
        id: String,
        parents: Vec<Option<String>>,
    },
    /// The same record appeared twice; the first copy is kept
    DuplicateMessage { id: String, line: usize },
}

impl LogWarning {
    pub fn kind(&self) -> &'static str {
        match self {
            LogWarning::Malformed { .. } => "malformed",
            LogWarning::Orphan { .. } => "orphan",
            LogWarning::MultipleRoots { .. } => "multiple_roots",
            LogWarning::ConflictingParent { .. } => "conflicting_parent",
            LogWarning::DuplicateMessage { .. } => "duplicate_message",
        }
    }
}

impl std::fmt::Display for LogWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogWarning::Malformed { line, message } => write!(f, "line {}: {}", line, message),
            LogWarning::Orphan { id, parent_id } => match parent_id {
                Some(parent) => write!(f, "message {} has unknown parent {}", id, parent),
                None => write!(f, "message {} is not reachable from the root", id),
            },
            LogWarning::MultipleRoots { id, root_id } => {
                write!(f, "extra root {} ignored (root is {})", id, root_id)
            }
            LogWarning::ConflictingParent { id, parents } => {
                let parents: Vec<&str> = parents
                    .iter()
                    .map(|p| p.as_deref().unwrap_or("<none>"))
                    .collect();
                write!(
                    f,
                    "message {} claimed by parents [{}], dropped",
                    id,
                    parents.join(", ")
                )
            }
            LogWarning::DuplicateMessage { id, line } => {
                write!(f, "duplicate record for {} on line {} ignored", id, line)
            }
        }
    }
}

/// Result of parsing a log's lines
#[derive(Debug, Default)]
pub struct ParsedLog {
    /// `sessionId` of the first conversation record
    pub session_id: Option<String>,
    /// Conversation records, in log order
    pub messages: Vec<Message>,
    /// Recoverable problems (non-fatal)
    pub warnings: Vec<LogWarning>,
    /// Non-conversation records skipped
    pub skipped_records: usize,
    /// Sidechain records skipped
    pub sidechain_records: usize,
}

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    uuid: Option<String>,
    parent_uuid: Option<String>,
    session_id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<serde_json::Value>,
    is_sidechain: Option<bool>,
    message: Option<RawMessage>,
}

/// Payload fields are kept as JSON and converted piece by piece
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    model: Option<serde_json::Value>,
    content: Option<serde_json::Value>,
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

impl From<RawUsage> for Usage {
    fn from(raw: RawUsage) -> Self {
        Usage {
            input_tokens: raw.input_tokens.unwrap_or(0),
            output_tokens: raw.output_tokens.unwrap_or(0),
            cache_write_tokens: raw.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: raw.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

/// Parse all lines of a log.
pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> ParsedLog {
    let mut result = ParsedLog::default();
    let observed_at = Utc::now();
    let mut last_timestamp: Option<DateTime<Utc>> = None;

    for (index, line) in lines.iter().enumerate() {
        let line_number = index + 1;
        let line = line.as_ref();

        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with(UNDECODABLE_LINE_PREFIX) {
            result.warnings.push(LogWarning::Malformed {
                line: line_number,
                message: "line is not valid UTF-8".to_string(),
            });
            continue;
        }

        let raw_json: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                result.warnings.push(LogWarning::Malformed {
                    line: line_number,
                    message: format!("JSON parse error: {}", e),
                });
                continue;
            }
        };

        let record: RawRecord = match serde_json::from_value(raw_json.clone()) {
            Ok(r) => r,
            Err(e) => {
                result.warnings.push(LogWarning::Malformed {
                    line: line_number,
                    message: format!("deserialization error: {}", e),
                });
                continue;
            }
        };

        let Some(id) = record.uuid else {
            result.skipped_records += 1;
            continue;
        };

        if record.is_sidechain.unwrap_or(false) {
            result.sidechain_records += 1;
            continue;
        }

        if result.session_id.is_none() {
            result.session_id = record.session_id;
        }

        let parsed_timestamp = record
            .timestamp
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let timestamp = match parsed_timestamp {
            Some(ts) => ts,
            None => {
                result.warnings.push(LogWarning::Malformed {
                    line: line_number,
                    message: format!("message {} has no valid timestamp", id),
                });
                last_timestamp.unwrap_or(observed_at)
            }
        };
        last_timestamp = Some(timestamp);

        let (content, usage, model) = match record.message {
            Some(msg) => (
                read_content(msg.content, &id, line_number, &mut result.warnings),
                read_usage(msg.usage, &id, line_number, &mut result.warnings),
                msg.model.and_then(|m| m.as_str().map(str::to_string)),
            ),
            None => (MessageContent::default(), None, None),
        };

        result.messages.push(Message {
            id,
            parent_id: record.parent_uuid,
            role: Role::from_record_type(record.record_type.as_deref().unwrap_or("unknown")),
            timestamp,
            content,
            usage,
            model,
            line: line_number,
            raw: raw_json,
        });
    }

    if !result.warnings.is_empty() {
        tracing::warn!(
            warnings = result.warnings.len(),
            messages = result.messages.len(),
            "Recovered from malformed log records"
        );
    }
    tracing::debug!(
        messages = result.messages.len(),
        skipped = result.skipped_records,
        sidechain = result.sidechain_records,
        "Parsed log"
    );

    result
}

/// Convert message content block by block; unreadable blocks become
/// [`ContentBlock::Unknown`].
fn read_content(
    value: Option<serde_json::Value>,
    id: &str,
    line: usize,
    warnings: &mut Vec<LogWarning>,
) -> MessageContent {
    match value {
        None | Some(serde_json::Value::Null) => MessageContent::default(),
        Some(serde_json::Value::String(text)) => MessageContent::Text(text),
        Some(serde_json::Value::Array(items)) => {
            let mut blocks = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                match serde_json::from_value::<ContentBlock>(item) {
                    Ok(block) => blocks.push(block),
                    Err(e) => {
                        warnings.push(LogWarning::Malformed {
                            line,
                            message: format!("message {} content block {}: {}", id, index, e),
                        });
                        blocks.push(ContentBlock::Unknown);
                    }
                }
            }
            MessageContent::Blocks(blocks)
        }
        Some(other) => {
            warnings.push(LogWarning::Malformed {
                line,
                message: format!("message {} has unsupported content: {}", id, other),
            });
            MessageContent::default()
        }
    }
}

fn read_usage(
    value: Option<serde_json::Value>,
    id: &str,
    line: usize,
    warnings: &mut Vec<LogWarning>,
) -> Option<Usage> {
    let value = value.filter(|v| !v.is_null())?;
    match serde_json::from_value::<RawUsage>(value) {
        Ok(raw) => Some(Usage::from(raw)),
        Err(e) => {
            warnings.push(LogWarning::Malformed {
                line,
                message: format!("message {} has unreadable usage: {}", id, e),
            });
            None
        }
    }
}

/// Message id (`uuid`) of a raw log line, if the line is a conversation record
pub fn record_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get("uuid")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records() {
        let lines = vec![
            r#"{"type":"summary","summary":"Fixing the parser","leafUuid":"b"}"#,
            r#"{"uuid":"a","parentUuid":null,"sessionId":"s1","type":"user","timestamp":"2025-01-01T10:00:00Z","message":{"role":"user","content":"hi"}}"#,
            r#"{"uuid":"b","parentUuid":"a","sessionId":"s1","type":"assistant","timestamp":"2025-01-01T10:00:05Z","message":{"role":"assistant","model":"claude-sonnet-4","content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":12,"output_tokens":3}}}"#,
        ];
        let parsed = parse_lines(&lines);

        assert_eq!(parsed.session_id.as_deref(), Some("s1"));
        assert_eq!(parsed.skipped_records, 1);
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.messages.len(), 2);

        let root = &parsed.messages[0];
        assert_eq!(root.id, "a");
        assert_eq!(root.parent_id, None);
        assert_eq!(root.role, Role::User);
        assert_eq!(root.line, 2);
        assert!(root.usage.is_none());

        let reply = &parsed.messages[1];
        assert_eq!(reply.parent_id.as_deref(), Some("a"));
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(reply.usage.unwrap().input_tokens, 12);
        assert_eq!(reply.raw["uuid"], "b");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let lines = vec![
            "{not json".to_string(),
            String::new(),
            r#"{"uuid":"a","type":"user","timestamp":"2025-01-01T10:00:00Z","message":{"content":"ok"}}"#.to_string(),
            crate::store::decode_line(b"{\"uuid\":\"z\",\"junk\":\"\xff\"}"),
        ];
        let parsed = parse_lines(&lines);

        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.warnings.len(), 2);
        assert!(matches!(parsed.warnings[0], LogWarning::Malformed { line: 1, .. }));
        assert_eq!(
            parsed.warnings[1],
            LogWarning::Malformed {
                line: 4,
                message: "line is not valid UTF-8".to_string()
            }
        );
    }

    #[test]
    fn test_bad_content_block_keeps_message() {
        let lines = vec![
            r#"{"uuid":"r","type":"user","timestamp":"2025-01-01T10:00:00Z","message":{"content":"go"}}"#,
            r#"{"uuid":"a","parentUuid":"r","type":"assistant","timestamp":"2025-01-01T10:00:01Z","message":{"content":[{"type":"text","text":"running"},{"type":"tool_use","name":"Bash","input":{}}]}}"#,
            r#"{"uuid":"b","parentUuid":"a","type":"user","timestamp":"2025-01-01T10:00:02Z","message":{"content":[{"type":"text"}],"usage":{"input_tokens":"many"}}}"#,
        ];
        let parsed = parse_lines(&lines);

        let ids: Vec<&str> = parsed.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["r", "a", "b"]);
        assert_eq!(parsed.messages[2].parent_id.as_deref(), Some("a"));

        let a = &parsed.messages[1];
        assert_eq!(a.content.plain_text(), "running");
        assert_eq!(
            a.content,
            MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "running".to_string()
                },
                ContentBlock::Unknown,
            ])
        );
        assert!(parsed.messages[2].usage.is_none());

        // One for a's tool block, two for b's text block and usage
        let lines_warned: Vec<usize> = parsed
            .warnings
            .iter()
            .map(|w| match w {
                LogWarning::Malformed { line, .. } => *line,
                other => panic!("unexpected warning {other:?}"),
            })
            .collect();
        assert_eq!(lines_warned, vec![2, 3, 3]);
    }

    #[test]
    fn test_sidechain_records_skipped() {
        let lines = vec![
            r#"{"uuid":"a","type":"user","timestamp":"2025-01-01T10:00:00Z","message":{"content":"main"}}"#,
            r#"{"uuid":"x","parentUuid":null,"isSidechain":true,"type":"user","timestamp":"2025-01-01T10:00:01Z","message":{"content":"agent"}}"#,
        ];
        let parsed = parse_lines(&lines);

        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.sidechain_records, 1);
    }

    #[test]
    fn test_missing_timestamp_inherits_previous() {
        let lines = vec![
            r#"{"uuid":"a","type":"user","timestamp":"2025-01-01T10:00:00Z","message":{"content":"one"}}"#,
            r#"{"uuid":"b","parentUuid":"a","type":"assistant","message":{"content":"two"}}"#,
        ];
        let parsed = parse_lines(&lines);

        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[1].timestamp, parsed.messages[0].timestamp);
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn test_record_id() {
        assert_eq!(
            record_id(r#"{"uuid":"abc","type":"user"}"#).as_deref(),
            Some("abc")
        );
        assert_eq!(record_id(r#"{"type":"summary"}"#), None);
        assert_eq!(record_id("garbage"), None);
    }

    #[test]
    fn test_warning_display() {
        let warning = LogWarning::Orphan {
            id: "c".to_string(),
            parent_id: Some("zz".to_string()),
        };
        assert_eq!(warning.to_string(), "message c has unknown parent zz");
        assert_eq!(warning.kind(), "orphan");
    }
}
