//! Core domain types for convofork
//!
//! A conversation log is a flat, append-ordered list of records. Each
//! conversation record becomes a [`Message`] that points at its parent by id;
//! the tree is reconstructed from those pointers on every analysis.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Message** | One turn in a conversation, identified by its record `uuid` |
//! | **Fork** | A message with two or more direct children |
//! | **Branch** | A maximal single-child chain starting right after a fork |
//! | **Trunk** | The single-child chain starting right after the root |
//! | **Main path** | The first child (by log order) at a fork |
//! | **Token weight** | Usage-derived or estimated context cost of a message |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Roles
// ============================================

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human prompt or tool results fed back to the model
    User,
    /// Model response
    Assistant,
    /// Anything else that participates in the parent chain
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Map a record `type` tag to a role. Unknown tags are system records.
    pub fn from_record_type(record_type: &str) -> Self {
        match record_type {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Content
// ============================================

/// Message payload: either a plain string or a list of content blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// A structured content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    /// Image payloads are not kept here; the raw record still has them.
    #[serde(rename = "image")]
    Image {},
    #[serde(other)]
    Unknown,
}

impl MessageContent {
    /// Plain-text spans, in order. Separate text blocks are not joined here.
    pub fn text_spans(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(text) => vec![text.as_str()],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// All text spans joined with a newline
    pub fn plain_text(&self) -> String {
        self.text_spans().join("\n")
    }

    /// Whether any block is a tool invocation
    pub fn has_tool_use(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .any(|block| matches!(block, ContentBlock::ToolUse { .. })),
        }
    }

    /// Names of invoked tools, in order
    pub fn tool_names(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, .. } => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

// ============================================
// Usage
// ============================================

/// Usage counters recorded by the API for one response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(rename = "cache_creation_input_tokens")]
    pub cache_write_tokens: u64,
    #[serde(rename = "cache_read_input_tokens")]
    pub cache_read_tokens: u64,
}

// ============================================
// Messages
// ============================================

/// One conversation turn.
///
/// `raw` keeps the complete source record, including fields this crate does
/// not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id (`uuid` of the record)
    pub id: String,
    /// Parent message id; `None` only for the root
    pub parent_id: Option<String>,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub content: MessageContent,
    /// Recorded usage counters, if any
    pub usage: Option<Usage>,
    /// Model that produced an assistant message
    pub model: Option<String>,
    /// 1-based line number in the log the message was read from
    pub line: usize,
    /// Original record
    pub raw: serde_json::Value,
}

impl Message {
    /// Short preview of the message's text for display
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.content.plain_text();
        let text = text.trim();
        if text.is_empty() {
            let tools = self.content.tool_names();
            if !tools.is_empty() {
                return format!("[tool: {}]", tools.join(", "));
            }
            return String::new();
        }
        let mut preview: String = text
            .chars()
            .take(max_chars)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();
        if text.chars().count() > max_chars {
            preview.push('…');
        }
        preview
    }
}
