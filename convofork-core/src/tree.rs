//! Conversation tree reconstruction
//!
//! Messages are stored in an arena (`Vec<Message>`, sorted by timestamp)
//! with an id → slot index and an id → ordered child ids adjacency map.
//! Nothing holds references into other messages, so the tree can be rebuilt
//! or serialized freely.
//!
//! Messages that cannot be attached to the single root are excluded and
//! reported as warnings instead of failing the build:
//!
//! - extra parentless messages ([`LogWarning::MultipleRoots`])
//! - the same id claimed by different parents ([`LogWarning::ConflictingParent`])
//! - anything not reachable from the root ([`LogWarning::Orphan`])

use crate::fork::ConversationFork;
use crate::ingest::LogWarning;
use crate::tokens::TokenEstimator;
use crate::types::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A conversation reconstructed from parent pointers
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTree {
    pub session_id: String,
    /// Id of the root message; `None` when the log has no usable root
    pub root_id: Option<String>,
    /// Messages in the tree, sorted by timestamp
    messages: Vec<Message>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// Parent id → child ids in log order
    children: BTreeMap<String, Vec<String>>,
    /// Parent ids in order of their first recorded child
    #[serde(skip)]
    parent_order: Vec<String>,
    /// Forks with their branches, filled in by aggregation
    pub forks: Vec<ConversationFork>,
    /// Sum of token weights of every message in the tree
    pub total_tokens: u64,
    /// Longest root-to-leaf path, in edges
    pub max_depth: usize,
    /// Ids of messages excluded from the tree
    pub orphans: Vec<String>,
    /// Problems recovered from while reading and building
    pub warnings: Vec<LogWarning>,
}

impl ConversationTree {
    /// Look up a message by id
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&slot| &self.messages[slot])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All messages in timestamp order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn root(&self) -> Option<&Message> {
        self.root_id.as_deref().and_then(|id| self.message(id))
    }

    /// Child ids of a message, in log order
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parents that have at least one child, in order of first appearance
    pub fn parents(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.parent_order
            .iter()
            .map(move |parent| (parent.as_str(), self.children(parent)))
    }

    /// Timestamp of the newest message at or below `id`
    pub fn latest_in_subtree(&self, id: &str) -> Option<DateTime<Utc>> {
        let mut latest = self.message(id)?.timestamp;
        let mut stack: Vec<&str> = self.children(id).iter().map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if let Some(message) = self.message(current) {
                latest = latest.max(message.timestamp);
            }
            stack.extend(self.children(current).iter().map(String::as_str));
        }
        Some(latest)
    }

    /// Number of parent hops from the root to `id`.
    ///
    /// Walks parent pointers upward; returns `None` for ids not in the tree.
    pub fn depth_of(&self, id: &str) -> Option<usize> {
        let mut current = self.message(id)?;
        let mut depth = 0;
        while let Some(parent_id) = current.parent_id.as_deref() {
            current = self.message(parent_id)?;
            depth += 1;
        }
        Some(depth)
    }
}

/// Build a conversation tree from messages in log order.
pub fn build_tree(
    session_id: impl Into<String>,
    mut messages: Vec<Message>,
    estimator: &TokenEstimator,
) -> ConversationTree {
    let session_id = session_id.into();
    let mut warnings = Vec::new();
    let mut orphans = Vec::new();

    // Stable: equal timestamps keep log order
    messages.sort_by_key(|m| m.timestamp);

    // Every id the log records, including copies dropped below
    let logged: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
    let messages = dedupe_ids(messages, &mut warnings, &mut orphans);

    let mut root_id: Option<String> = None;
    let mut extra_roots: HashSet<String> = HashSet::new();
    for msg in messages.iter().filter(|m| m.parent_id.is_none()) {
        match &root_id {
            None => root_id = Some(msg.id.clone()),
            Some(root) => {
                warnings.push(LogWarning::MultipleRoots {
                    id: msg.id.clone(),
                    root_id: root.clone(),
                });
                extra_roots.insert(msg.id.clone());
            }
        }
    }

    let known: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    let mut all_children: HashMap<&str, Vec<&str>> = HashMap::new();
    for msg in &messages {
        if let Some(parent) = msg.parent_id.as_deref() {
            if known.contains(parent) {
                all_children.entry(parent).or_default().push(&msg.id);
            }
        }
    }

    let mut reachable: HashSet<String> = HashSet::new();
    if let Some(root) = root_id.as_deref() {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id.to_string()) {
                continue;
            }
            if let Some(kids) = all_children.get(id) {
                stack.extend(kids.iter().copied());
            }
        }
    }

    let mut kept = Vec::with_capacity(reachable.len());
    for msg in messages {
        if reachable.contains(&msg.id) {
            kept.push(msg);
            continue;
        }
        if !extra_roots.contains(&msg.id) {
            // A parent that is in the log but detached is not "unknown"
            warnings.push(LogWarning::Orphan {
                id: msg.id.clone(),
                parent_id: msg.parent_id.clone().filter(|p| !logged.contains(p)),
            });
        }
        orphans.push(msg.id);
    }

    let mut index = HashMap::with_capacity(kept.len());
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut parent_order = Vec::new();
    for (slot, msg) in kept.iter().enumerate() {
        index.insert(msg.id.clone(), slot);
        if let Some(parent) = &msg.parent_id {
            let kids = children.entry(parent.clone()).or_default();
            if kids.is_empty() {
                parent_order.push(parent.clone());
            }
            kids.push(msg.id.clone());
        }
    }

    let max_depth = root_id
        .as_deref()
        .map(|root| longest_path(root, &children))
        .unwrap_or(0);
    let total_tokens = estimator.estimate_all(&kept);

    if !orphans.is_empty() {
        tracing::warn!(
            session_id = %session_id,
            orphans = orphans.len(),
            "Excluded messages that do not attach to the root"
        );
    }
    tracing::debug!(
        session_id = %session_id,
        messages = kept.len(),
        max_depth,
        total_tokens,
        "Built conversation tree"
    );

    ConversationTree {
        session_id,
        root_id,
        messages: kept,
        index,
        children,
        parent_order,
        forks: Vec::new(),
        total_tokens,
        max_depth,
        orphans,
        warnings,
    }
}

/// Resolve repeated ids: exact repeats keep the first record, repeats that
/// disagree about the parent are dropped entirely.
fn dedupe_ids(
    messages: Vec<Message>,
    warnings: &mut Vec<LogWarning>,
    orphans: &mut Vec<String>,
) -> Vec<Message> {
    let mut parents_by_id: HashMap<&str, Vec<Option<&str>>> = HashMap::new();
    for msg in &messages {
        parents_by_id
            .entry(msg.id.as_str())
            .or_default()
            .push(msg.parent_id.as_deref());
    }

    let conflicting: HashMap<String, Vec<Option<String>>> = parents_by_id
        .into_iter()
        .filter(|(_, parents)| parents.iter().any(|p| *p != parents[0]))
        .map(|(id, parents)| {
            (
                id.to_string(),
                parents.into_iter().map(|p| p.map(str::to_string)).collect(),
            )
        })
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(parents) = conflicting.get(&msg.id) {
            if seen.insert(msg.id.clone()) {
                warnings.push(LogWarning::ConflictingParent {
                    id: msg.id.clone(),
                    parents: parents.clone(),
                });
                orphans.push(msg.id);
            }
            continue;
        }
        if !seen.insert(msg.id.clone()) {
            warnings.push(LogWarning::DuplicateMessage {
                id: msg.id.clone(),
                line: msg.line,
            });
            continue;
        }
        kept.push(msg);
    }
    kept
}

fn longest_path(root: &str, children: &BTreeMap<String, Vec<String>>) -> usize {
    let mut max_depth = 0;
    let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
    while let Some((id, depth)) = stack.pop() {
        max_depth = max_depth.max(depth);
        if let Some(kids) = children.get(id) {
            stack.extend(kids.iter().map(|kid| (kid.as_str(), depth + 1)));
        }
    }
    max_depth
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{MessageContent, Role};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    pub(crate) fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    /// Message `id` under `parent`, `minute` minutes after the base time
    pub(crate) fn msg(id: &str, parent: Option<&str>, minute: i64) -> Message {
        Message {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            role: if minute % 2 == 0 {
                Role::User
            } else {
                Role::Assistant
            },
            timestamp: base_time() + Duration::minutes(minute),
            content: MessageContent::Text(format!("message {}", id)),
            usage: None,
            model: None,
            line: minute as usize + 1,
            raw: serde_json::json!({ "uuid": id, "parentUuid": parent }),
        }
    }

    pub(crate) fn build(messages: Vec<Message>) -> ConversationTree {
        build_tree("session", messages, &TokenEstimator::default())
    }

    #[test]
    fn test_simple_fork_structure() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("1"), 2),
            msg("4", Some("2"), 3),
        ]);

        assert_eq!(tree.root_id.as_deref(), Some("1"));
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.children("1"), ["2".to_string(), "3".to_string()]);
        assert_eq!(tree.children("2"), ["4".to_string()]);
        assert!(tree.children("4").is_empty());
        assert_eq!(tree.max_depth, 2);
        assert!(tree.warnings.is_empty());
        assert!(tree.orphans.is_empty());
    }

    #[test]
    fn test_sorts_by_timestamp_with_stable_ties() {
        // Log order has the later child first
        let tree = build(vec![
            msg("root", None, 0),
            msg("late", Some("root"), 5),
            msg("tie-a", Some("root"), 2),
            msg("tie-b", Some("root"), 2),
        ]);

        assert_eq!(
            tree.children("root"),
            [
                "tie-a".to_string(),
                "tie-b".to_string(),
                "late".to_string()
            ]
        );
        let ids: Vec<_> = tree.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["root", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn test_orphans_are_excluded() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("missing"), 2),
            msg("4", Some("3"), 3),
        ]);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.orphans, vec!["3".to_string(), "4".to_string()]);
        assert_eq!(
            tree.warnings[0],
            LogWarning::Orphan {
                id: "3".to_string(),
                parent_id: Some("missing".to_string())
            }
        );
        assert!(!tree.contains("4"));
    }

    #[test]
    fn test_first_root_wins() {
        let tree = build(vec![
            msg("a", None, 0),
            msg("b", None, 1),
            msg("c", Some("b"), 2),
        ]);

        assert_eq!(tree.root_id.as_deref(), Some("a"));
        assert_eq!(tree.len(), 1);
        assert!(tree.warnings.contains(&LogWarning::MultipleRoots {
            id: "b".to_string(),
            root_id: "a".to_string()
        }));
        assert_eq!(tree.orphans, vec!["b".to_string(), "c".to_string()]);

        // c's parent is in the log, just not attached to the root
        let orphan = LogWarning::Orphan {
            id: "c".to_string(),
            parent_id: None,
        };
        assert!(tree.warnings.contains(&orphan));
        assert_eq!(orphan.to_string(), "message c is not reachable from the root");
    }

    #[test]
    fn test_children_of_detached_messages_name_no_unknown_parent() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("3", Some("missing"), 1),
            msg("4", Some("3"), 2),
        ]);

        assert_eq!(
            tree.warnings,
            vec![
                LogWarning::Orphan {
                    id: "3".to_string(),
                    parent_id: Some("missing".to_string())
                },
                LogWarning::Orphan {
                    id: "4".to_string(),
                    parent_id: None
                },
            ]
        );
    }

    #[test]
    fn test_latest_in_subtree() {
        // 1 -> 2 -> {3, 4}; 4 is the newest
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("2"), 2),
            msg("4", Some("2"), 90),
        ]);

        assert_eq!(
            tree.latest_in_subtree("2"),
            Some(base_time() + Duration::minutes(90))
        );
        assert_eq!(
            tree.latest_in_subtree("3"),
            Some(base_time() + Duration::minutes(2))
        );
        assert_eq!(tree.latest_in_subtree("nope"), None);
    }

    #[test]
    fn test_conflicting_parents_are_rejected() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("1"), 2),
            msg("4", Some("2"), 3),
            msg("4", Some("3"), 4),
            msg("5", Some("4"), 5),
        ]);

        assert!(!tree.contains("4"));
        assert!(!tree.contains("5"));
        assert!(tree.children("2").is_empty());
        assert!(matches!(
            &tree.warnings[0],
            LogWarning::ConflictingParent { id, parents } if id == "4" && parents.len() == 2
        ));
        assert_eq!(tree.orphans, vec!["4".to_string(), "5".to_string()]);
    }

    #[test]
    fn test_exact_duplicate_keeps_first() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("2", Some("1"), 2),
        ]);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.children("1").len(), 1);
        assert!(matches!(
            tree.warnings[0],
            LogWarning::DuplicateMessage { .. }
        ));
    }

    #[test]
    fn test_cycle_without_root_is_orphaned() {
        let tree = build(vec![msg("a", Some("b"), 0), msg("b", Some("a"), 1)]);

        assert!(tree.root_id.is_none());
        assert!(tree.is_empty());
        assert_eq!(tree.orphans.len(), 2);
        assert_eq!(tree.max_depth, 0);
    }

    #[test]
    fn test_depth_of_walks_parents() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("2"), 2),
            msg("4", Some("3"), 3),
        ]);

        assert_eq!(tree.depth_of("1"), Some(0));
        assert_eq!(tree.depth_of("3"), Some(2));
        assert_eq!(tree.depth_of("nope"), None);
        assert_eq!(tree.max_depth, 3);
    }

    #[test]
    fn test_total_tokens() {
        // "message 1" is 9 chars -> 3 tokens each
        let tree = build(vec![msg("1", None, 0), msg("2", Some("1"), 1)]);
        assert_eq!(tree.total_tokens, 6);
    }
}
