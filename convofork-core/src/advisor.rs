//! Pruning recommendations
//!
//! Each fork branch that is not a main path is checked against these rules;
//! the first match wins:
//!
//! 1. **Abandoned**: deactivated or older than the freshness window → prune.
//!    Low risk and no confirmation once older than `stale_days`.
//!
//! Age is measured from the newest message in the branch or in any branch
//! that continues from it. Pruning a branch that ends at a nested fork
//! detaches those later branches, so it always needs confirmation.
//! 2. **Large inactive**: stale but still active, and heavier than
//!    `large_branch_tokens` → deactivate. Only reachable when prune
//!    suggestions are turned off (`suggest_prune = false`).
//! 3. **Near-duplicate**: a sibling within `duplicate_token_ratio` of its
//!    token weight and `duplicate_message_delta` of its message count →
//!    merge, credited with half the branch's weight.
//!
//! Actions are returned sorted by estimated savings, largest first.

use crate::analysis::ForkAnalysisResult;
use crate::branch::ConversationBranch;
use crate::config::{AdvisorConfig, Config};
use crate::fork::ConversationFork;
use crate::tree::ConversationTree;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What to do with a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Remove the branch's messages from the log
    Prune,
    /// Exclude the branch from accounting without touching the log
    Deactivate,
    /// Fold the branch into a sibling by hand
    Merge,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Prune => "prune",
            ActionKind::Deactivate => "deactivate",
            ActionKind::Merge => "merge",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prune" => Ok(ActionKind::Prune),
            "deactivate" => Ok(ActionKind::Deactivate),
            "merge" => Ok(ActionKind::Merge),
            _ => Err(format!("unknown action: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recommended change to one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningAction {
    pub kind: ActionKind,
    /// Snapshot of the branch the action targets
    pub branch: ConversationBranch,
    /// Sibling a merge is proposed against
    pub related_branch: Option<String>,
    pub reason: String,
    pub tokens_saved: u64,
    pub risk: RiskLevel,
    pub requires_confirmation: bool,
}

/// Proposes pruning actions for an analysis result
#[derive(Debug, Clone)]
pub struct PruningAdvisor {
    config: AdvisorConfig,
    freshness: Duration,
}

impl PruningAdvisor {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.advisor.clone(),
            freshness: config.analysis.freshness_window(),
        }
    }

    /// Ranked actions for every fork branch, judged at the result's analysis time
    pub fn suggest_actions(&self, result: &ForkAnalysisResult) -> Vec<PruningAction> {
        let now = result.analyzed_at;
        let mut actions: Vec<PruningAction> = result
            .tree
            .forks
            .iter()
            .flat_map(|fork| {
                fork.branches
                    .iter()
                    .filter_map(move |branch| self.evaluate(branch, fork, &result.tree, now))
            })
            .collect();

        // Stable: equal savings keep fork order
        actions.sort_by(|a, b| b.tokens_saved.cmp(&a.tokens_saved));

        tracing::debug!(
            session_id = %result.tree.session_id,
            actions = actions.len(),
            tokens_saved = total_savings(&actions),
            "Suggested pruning actions"
        );

        actions
    }

    /// First matching rule for one branch
    pub fn evaluate(
        &self,
        branch: &ConversationBranch,
        fork: &ConversationFork,
        tree: &ConversationTree,
        now: DateTime<Utc>,
    ) -> Option<PruningAction> {
        if branch.is_main_path {
            return None;
        }

        let tail = branch.messages.last().map(|m| m.id.as_str());
        let continuations = tail.map_or(0, |id| tree.children(id).len());
        let last_activity = tail
            .and_then(|id| tree.latest_in_subtree(id))
            .map_or(branch.last_activity, |latest| latest.max(branch.last_activity));

        let age = now.signed_duration_since(last_activity);
        let stale = age > self.freshness;
        let inactive = !branch.active || stale;

        if self.config.suggest_prune && inactive {
            let very_old = age > self.config.stale_after() && continuations == 0;
            let mut reason = if branch.active {
                format!("Abandoned branch: no activity for {}", describe_age(age))
            } else {
                format!("Deactivated branch, last activity {} ago", describe_age(age))
            };
            if continuations > 0 {
                reason.push_str(&format!(
                    "; continues into {} later branches that pruning detaches",
                    continuations
                ));
            }
            return Some(PruningAction {
                kind: ActionKind::Prune,
                branch: branch.clone(),
                related_branch: None,
                reason,
                tokens_saved: branch.token_weight,
                risk: if very_old {
                    RiskLevel::Low
                } else {
                    RiskLevel::Medium
                },
                requires_confirmation: !very_old,
            });
        }

        // Deactivating an already deactivated branch changes nothing
        if stale && branch.active && branch.token_weight > self.config.large_branch_tokens {
            return Some(PruningAction {
                kind: ActionKind::Deactivate,
                branch: branch.clone(),
                related_branch: None,
                reason: format!(
                    "Large inactive branch ({} tokens, idle for {})",
                    branch.token_weight,
                    describe_age(age)
                ),
                tokens_saved: branch.token_weight,
                risk: RiskLevel::Medium,
                requires_confirmation: true,
            });
        }

        if let Some(sibling) = fork
            .siblings_of(&branch.start_id)
            .find(|sibling| self.is_near_duplicate(branch, sibling))
        {
            return Some(PruningAction {
                kind: ActionKind::Merge,
                branch: branch.clone(),
                related_branch: Some(sibling.start_id.clone()),
                reason: format!(
                    "Similar to sibling branch {} ({} vs {} tokens, {} vs {} messages)",
                    sibling.start_id,
                    branch.token_weight,
                    sibling.token_weight,
                    branch.depth,
                    sibling.depth
                ),
                tokens_saved: branch.token_weight / 2,
                risk: RiskLevel::High,
                requires_confirmation: true,
            });
        }

        None
    }

    fn is_near_duplicate(&self, a: &ConversationBranch, b: &ConversationBranch) -> bool {
        let larger = a.token_weight.max(b.token_weight) as f64;
        let diff = a.token_weight.abs_diff(b.token_weight) as f64;
        diff <= larger * self.config.duplicate_token_ratio
            && a.depth.abs_diff(b.depth) <= self.config.duplicate_message_delta
    }
}

/// Sum of estimated savings
pub fn total_savings(actions: &[PruningAction]) -> u64 {
    actions
        .iter()
        .fold(0u64, |total, a| total.saturating_add(a.tokens_saved))
}

fn describe_age(age: Duration) -> String {
    if age.num_days() > 0 {
        format!("{} days", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{} hours", age.num_hours())
    } else {
        format!("{} minutes", age.num_minutes().max(0))
    }
}
