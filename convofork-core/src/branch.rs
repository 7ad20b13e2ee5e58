//! Branch construction
//!
//! Each child of a fork starts a branch that follows single-child links until
//! it reaches a leaf or another fork. The branch includes that last message;
//! a nested fork's children start branches of their own. The single-child
//! chain after the root, when the root is not itself a fork, becomes the
//! trunk: a main-path branch with no fork parent.
//!
//! Ids are tracked across all walks so no message lands in two branches.

use crate::fork::ConversationFork;
use crate::tokens::TokenEstimator;
use crate::tree::ConversationTree;
use crate::types::Message;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A linear run of messages after a fork (or after the root)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationBranch {
    /// Id of the first message; stable identity across re-analysis
    pub start_id: String,
    /// Fork the branch leaves from; `None` for the trunk
    pub fork_parent_id: Option<String>,
    /// Messages in order
    pub messages: Vec<Message>,
    /// Sum of the messages' token weights
    pub token_weight: u64,
    /// Cleared when the branch has been deactivated
    pub active: bool,
    /// First child (by log order) at its fork, or the trunk
    pub is_main_path: bool,
    /// Number of messages
    pub depth: usize,
    /// Timestamp of the last message
    pub last_activity: DateTime<Utc>,
}

impl ConversationBranch {
    pub fn is_trunk(&self) -> bool {
        self.fork_parent_id.is_none()
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.messages.iter().map(|m| m.id.as_str())
    }

    /// Time since the branch's last message
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_activity)
    }

    /// Whether the last message is older than `window`
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.age(now) > window
    }
}

/// Build the trunk and every fork branch.
///
/// The trunk, if any, comes first; fork branches follow in fork order and,
/// within a fork, in child order.
pub fn build_branches(
    tree: &ConversationTree,
    forks: &[ConversationFork],
    estimator: &TokenEstimator,
) -> Vec<ConversationBranch> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut branches = Vec::new();
    let now = Utc::now();

    if let Some(root) = tree.root_id.as_deref() {
        visited.insert(root.to_string());
        if let [only_child] = tree.children(root) {
            branches.push(walk(tree, only_child, None, true, &mut visited, estimator, now));
        }
    }

    for fork in forks {
        for (position, child) in tree.children(&fork.parent_id).iter().enumerate() {
            branches.push(walk(
                tree,
                child,
                Some(fork.parent_id.as_str()),
                position == 0,
                &mut visited,
                estimator,
                now,
            ));
        }
    }

    tracing::debug!(
        session_id = %tree.session_id,
        branches = branches.len(),
        "Built branches"
    );

    branches
}

fn walk(
    tree: &ConversationTree,
    start_id: &str,
    fork_parent_id: Option<&str>,
    is_main_path: bool,
    visited: &mut HashSet<String>,
    estimator: &TokenEstimator,
    now: DateTime<Utc>,
) -> ConversationBranch {
    let mut messages: Vec<Message> = Vec::new();
    let mut current = start_id;

    loop {
        if !visited.insert(current.to_string()) {
            break;
        }
        let Some(message) = tree.message(current) else {
            break;
        };
        messages.push(message.clone());

        match tree.children(current) {
            [next] => current = next.as_str(),
            _ => break,
        }
    }

    let token_weight = estimator.estimate_all(&messages);
    let last_activity = messages.last().map(|m| m.timestamp).unwrap_or(now);

    ConversationBranch {
        start_id: start_id.to_string(),
        fork_parent_id: fork_parent_id.map(str::to_string),
        depth: messages.len(),
        messages,
        token_weight,
        active: true,
        is_main_path,
        last_activity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::detect_forks;
    use crate::tree::tests::{base_time, build, msg};

    fn ids(branch: &ConversationBranch) -> Vec<&str> {
        branch.message_ids().collect()
    }

    #[test]
    fn test_fork_at_root() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("1"), 2),
            msg("4", Some("2"), 3),
        ]);
        let forks = detect_forks(&tree);
        let branches = build_branches(&tree, &forks, &TokenEstimator::default());

        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].start_id, "2");
        assert_eq!(ids(&branches[0]), vec!["2", "4"]);
        assert!(branches[0].is_main_path);
        assert_eq!(branches[0].depth, 2);
        assert_eq!(branches[0].fork_parent_id.as_deref(), Some("1"));
        assert_eq!(
            branches[0].last_activity,
            base_time() + Duration::minutes(3)
        );

        assert_eq!(branches[1].start_id, "3");
        assert_eq!(ids(&branches[1]), vec!["3"]);
        assert!(!branches[1].is_main_path);
        assert!(branches.iter().all(|b| b.active));
    }

    #[test]
    fn test_trunk_and_nested_forks() {
        // 1 -> 2 -> 3 -> {4, 5}; 4 -> 6 -> {7, 8}; 5 -> 9
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("2"), 2),
            msg("4", Some("3"), 3),
            msg("5", Some("3"), 4),
            msg("6", Some("4"), 5),
            msg("7", Some("6"), 6),
            msg("8", Some("6"), 7),
            msg("9", Some("5"), 8),
        ]);
        let forks = detect_forks(&tree);
        let branches = build_branches(&tree, &forks, &TokenEstimator::default());

        let trunk = &branches[0];
        assert!(trunk.is_trunk());
        assert!(trunk.is_main_path);
        assert_eq!(ids(trunk), vec!["2", "3"]);

        let shapes: Vec<(Option<&str>, Vec<&str>, bool)> = branches[1..]
            .iter()
            .map(|b| (b.fork_parent_id.as_deref(), ids(b), b.is_main_path))
            .collect();
        assert_eq!(
            shapes,
            vec![
                (Some("3"), vec!["4", "6"], true),
                (Some("3"), vec!["5", "9"], false),
                (Some("6"), vec!["7"], true),
                (Some("6"), vec!["8"], false),
            ]
        );

        // Every non-root message appears exactly once
        let mut all: Vec<&str> = branches.iter().flat_map(|b| b.message_ids()).collect();
        all.sort_unstable();
        assert_eq!(all, vec!["2", "3", "4", "5", "6", "7", "8", "9"]);
    }

    #[test]
    fn test_linear_conversation_is_all_trunk() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("2"), 2),
        ]);
        let branches = build_branches(&tree, &[], &TokenEstimator::default());

        assert_eq!(branches.len(), 1);
        assert_eq!(ids(&branches[0]), vec!["2", "3"]);
    }

    #[test]
    fn test_token_weight_sums_messages() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("1"), 2),
            msg("4", Some("2"), 3),
        ]);
        let forks = detect_forks(&tree);
        let branches = build_branches(&tree, &forks, &TokenEstimator::default());

        // "message N" is 9 chars -> 3 tokens
        assert_eq!(branches[0].token_weight, 6);
        assert_eq!(branches[1].token_weight, 3);
    }

    #[test]
    fn test_staleness() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("1"), 2),
        ]);
        let forks = detect_forks(&tree);
        let branches = build_branches(&tree, &forks, &TokenEstimator::default());
        let now = base_time() + Duration::hours(30);

        assert!(branches[1].is_stale(now, Duration::days(1)));
        assert!(!branches[1].is_stale(now, Duration::days(2)));
        assert_eq!(branches[1].age(now), Duration::hours(30) - Duration::minutes(2));
    }
}
