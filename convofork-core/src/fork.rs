//! Fork detection
//!
//! A fork is any message with two or more children in the tree.

use crate::branch::ConversationBranch;
use crate::tree::ConversationTree;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A point where the conversation diverged
#[derive(Debug, Clone, Serialize)]
pub struct ConversationFork {
    /// The message with multiple children
    pub parent_id: String,
    /// Parent hops from the root to the fork message
    pub depth: usize,
    /// Timestamp of the fork message
    pub created_at: DateTime<Utc>,
    /// Branches leaving this fork, main path first
    pub branches: Vec<ConversationBranch>,
    /// Sum of the branches' token weights
    pub total_tokens: u64,
}

impl ConversationFork {
    /// The branch flagged as the main path
    pub fn main_branch(&self) -> Option<&ConversationBranch> {
        self.branches.iter().find(|b| b.is_main_path)
    }

    /// Branches other than `start_id`
    pub fn siblings_of<'a>(
        &'a self,
        start_id: &'a str,
    ) -> impl Iterator<Item = &'a ConversationBranch> + 'a {
        self.branches.iter().filter(move |b| b.start_id != start_id)
    }
}

/// Find every fork in the tree, in order of first appearance in the child index.
///
/// Returned forks have no branches yet; see [`crate::branch::build_branches`].
pub fn detect_forks(tree: &ConversationTree) -> Vec<ConversationFork> {
    let mut forks = Vec::new();

    for (parent_id, children) in tree.parents() {
        if children.len() < 2 {
            continue;
        }
        let Some(parent) = tree.message(parent_id) else {
            continue;
        };
        let depth = tree.depth_of(parent_id).unwrap_or(0);

        forks.push(ConversationFork {
            parent_id: parent_id.to_string(),
            depth,
            created_at: parent.timestamp,
            branches: Vec::new(),
            total_tokens: 0,
        });
    }

    tracing::debug!(
        session_id = %tree.session_id,
        forks = forks.len(),
        "Detected forks"
    );

    forks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{base_time, build, msg};
    use chrono::Duration;

    #[test]
    fn test_single_fork_at_root() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("1"), 2),
            msg("4", Some("2"), 3),
        ]);
        let forks = detect_forks(&tree);

        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].parent_id, "1");
        assert_eq!(forks[0].depth, 0);
        assert_eq!(forks[0].created_at, base_time());
        assert!(forks[0].branches.is_empty());
    }

    #[test]
    fn test_nested_forks_in_order() {
        // 1 -> 2 -> {3, 4}; 3 -> {5, 6}
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("2"), 2),
            msg("4", Some("2"), 3),
            msg("5", Some("3"), 4),
            msg("6", Some("3"), 5),
        ]);
        let forks = detect_forks(&tree);

        let parents: Vec<_> = forks.iter().map(|f| f.parent_id.as_str()).collect();
        assert_eq!(parents, vec!["2", "3"]);
        assert_eq!(forks[0].depth, 1);
        assert_eq!(forks[1].depth, 2);
        assert_eq!(forks[1].created_at, base_time() + Duration::minutes(2));
    }

    #[test]
    fn test_linear_conversation_has_no_forks() {
        let tree = build(vec![
            msg("1", None, 0),
            msg("2", Some("1"), 1),
            msg("3", Some("2"), 2),
        ]);
        assert!(detect_forks(&tree).is_empty());
    }
}
