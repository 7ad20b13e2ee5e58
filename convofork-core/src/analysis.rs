//! Fork analysis
//!
//! Combines the tree, its forks, and their branches into a
//! [`ForkAnalysisResult`], and drives the whole pipeline through
//! [`ForkAnalyzer`]:
//!
//! ```text
//! log lines ─► parse ─► build_tree ─► detect_forks ─► build_branches ─► aggregate
//! ```
//!
//! Every analysis is a full rebuild from the complete log. A result is a
//! snapshot; re-analyze after the log changes instead of patching it.
//!
//! ## Token distribution
//!
//! Only branches that leave a fork are distributed. The trunk (the chain
//! right after an unforked root) is reported separately and is not part of
//! any bucket.

use crate::branch::{build_branches, ConversationBranch};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fork::{detect_forks, ConversationFork};
use crate::ingest::parse_lines;
use crate::store::LogHandle;
use crate::tokens::TokenEstimator;
use crate::tree::{build_tree, ConversationTree};
use crate::types::Message;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// Token weight split across branch classes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenDistribution {
    /// Branches flagged as the main path at their fork
    pub main_path: u64,
    /// Non-main branches active within the freshness window
    pub alternative_branches: u64,
    /// Non-main branches that are stale or deactivated
    pub abandoned_branches: u64,
}

impl TokenDistribution {
    pub fn total(&self) -> u64 {
        self.main_path + self.alternative_branches + self.abandoned_branches
    }
}

/// Classification of a single branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchClass {
    MainPath,
    Alternative,
    Abandoned,
}

impl BranchClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchClass::MainPath => "main",
            BranchClass::Alternative => "alternative",
            BranchClass::Abandoned => "abandoned",
        }
    }

    /// Classify a branch at `now`
    pub fn of(branch: &ConversationBranch, now: DateTime<Utc>, freshness: Duration) -> Self {
        if branch.is_main_path {
            BranchClass::MainPath
        } else if !branch.active || branch.is_stale(now, freshness) {
            BranchClass::Abandoned
        } else {
            BranchClass::Alternative
        }
    }
}

/// Everything known about a conversation's forks
#[derive(Debug, Clone, Serialize)]
pub struct ForkAnalysisResult {
    /// The tree, with forks and their branches attached
    pub tree: ConversationTree,
    pub fork_count: usize,
    /// Branches leaving forks (the trunk is not counted)
    pub branch_count: usize,
    /// Fork branch with the most messages; first found wins ties
    pub largest_branch: Option<ConversationBranch>,
    pub token_distribution: TokenDistribution,
    /// Chain after an unforked root
    pub trunk: Option<ConversationBranch>,
    /// Reference time for freshness classification
    pub analyzed_at: DateTime<Utc>,
    /// Freshness window used, in hours
    pub freshness_hours: i64,
    /// Non-conversation records skipped while reading
    pub skipped_records: usize,
    /// Sidechain records skipped while reading
    pub sidechain_records: usize,
}

impl ForkAnalysisResult {
    /// All fork branches, fork by fork
    pub fn branches(&self) -> impl Iterator<Item = &ConversationBranch> + '_ {
        self.tree.forks.iter().flat_map(|f| f.branches.iter())
    }

    /// Find a fork branch (or the trunk) by its starting message id
    pub fn find_branch(&self, start_id: &str) -> Option<&ConversationBranch> {
        self.branches()
            .chain(self.trunk.iter())
            .find(|b| b.start_id == start_id)
    }

    /// The fork a branch leaves from
    pub fn fork_of(&self, branch: &ConversationBranch) -> Option<&ConversationFork> {
        let parent = branch.fork_parent_id.as_deref()?;
        self.tree.forks.iter().find(|f| f.parent_id == parent)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::hours(self.freshness_hours)
    }

    pub fn classify(&self, branch: &ConversationBranch) -> BranchClass {
        BranchClass::of(branch, self.analyzed_at, self.freshness_window())
    }
}

/// Attach branches to their forks and compute the summary figures.
pub fn aggregate(
    mut tree: ConversationTree,
    mut forks: Vec<ConversationFork>,
    branches: Vec<ConversationBranch>,
    freshness: Duration,
    now: DateTime<Utc>,
) -> ForkAnalysisResult {
    let mut trunk = None;
    let mut distribution = TokenDistribution::default();
    let mut largest_branch: Option<ConversationBranch> = None;
    let mut branch_count = 0;

    for branch in branches {
        let Some(parent) = branch.fork_parent_id.clone() else {
            trunk = Some(branch);
            continue;
        };
        let Some(fork) = forks.iter_mut().find(|f| f.parent_id == parent) else {
            tracing::warn!(branch = %branch.start_id, fork = %parent, "Branch without a fork");
            continue;
        };

        match BranchClass::of(&branch, now, freshness) {
            BranchClass::MainPath => {
                distribution.main_path =
                    distribution.main_path.saturating_add(branch.token_weight)
            }
            BranchClass::Alternative => {
                distribution.alternative_branches =
                    distribution.alternative_branches.saturating_add(branch.token_weight)
            }
            BranchClass::Abandoned => {
                distribution.abandoned_branches =
                    distribution.abandoned_branches.saturating_add(branch.token_weight)
            }
        }

        let is_larger = largest_branch
            .as_ref()
            .map_or(true, |largest| branch.depth > largest.depth);
        if is_larger {
            largest_branch = Some(branch.clone());
        }

        branch_count += 1;
        fork.total_tokens = fork.total_tokens.saturating_add(branch.token_weight);
        fork.branches.push(branch);
    }

    let fork_count = forks.len();
    tree.forks = forks;

    tracing::debug!(
        session_id = %tree.session_id,
        fork_count,
        branch_count,
        main_path = distribution.main_path,
        alternative = distribution.alternative_branches,
        abandoned = distribution.abandoned_branches,
        "Aggregated fork analysis"
    );

    ForkAnalysisResult {
        tree,
        fork_count,
        branch_count,
        largest_branch,
        token_distribution: distribution,
        trunk,
        analyzed_at: now,
        freshness_hours: freshness.num_hours(),
        skipped_records: 0,
        sidechain_records: 0,
    }
}

/// Runs the full analysis pipeline for one session.
///
/// Construct one per analysis session; it holds no process-wide state.
#[derive(Debug, Clone)]
pub struct ForkAnalyzer {
    estimator: TokenEstimator,
    freshness: Duration,
    inactive: HashSet<String>,
}

impl ForkAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            estimator: TokenEstimator::new(config.estimate),
            freshness: config.analysis.freshness_window(),
            inactive: HashSet::new(),
        }
    }

    /// Mark branches starting at these ids as deactivated
    pub fn with_inactive<I>(mut self, start_ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.inactive.extend(start_ids);
        self
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Analyze already-parsed messages
    pub fn analyze_messages(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        now: DateTime<Utc>,
    ) -> ForkAnalysisResult {
        let tree = build_tree(session_id, messages, &self.estimator);
        let forks = detect_forks(&tree);
        let mut branches = build_branches(&tree, &forks, &self.estimator);
        for branch in &mut branches {
            if self.inactive.contains(&branch.start_id) {
                branch.active = false;
            }
        }
        aggregate(tree, forks, branches, self.freshness, now)
    }

    /// Analyze raw log lines
    pub fn analyze_lines<S: AsRef<str>>(
        &self,
        lines: &[S],
        fallback_session_id: &str,
        now: DateTime<Utc>,
    ) -> ForkAnalysisResult {
        let parsed = parse_lines(lines);
        let session_id = parsed
            .session_id
            .unwrap_or_else(|| fallback_session_id.to_string());

        let mut result = self.analyze_messages(&session_id, parsed.messages, now);
        let mut warnings = parsed.warnings;
        warnings.append(&mut result.tree.warnings);
        result.tree.warnings = warnings;
        result.skipped_records = parsed.skipped_records;
        result.sidechain_records = parsed.sidechain_records;

        if !result.tree.warnings.is_empty() {
            tracing::warn!(
                session_id = %session_id,
                warnings = result.tree.warnings.len(),
                orphans = result.tree.orphans.len(),
                "Analysis recovered from log problems"
            );
        }

        result
    }

    /// Read a log and analyze it as of now
    pub async fn analyze_log<L>(&self, log: &L) -> Result<ForkAnalysisResult>
    where
        L: LogHandle + ?Sized,
    {
        let lines = log.read_lines().await.map_err(|e| Error::LogRead {
            log: log.reference(),
            message: e.to_string(),
        })?;
        Ok(self.analyze_lines(&lines, &log.session_hint(), Utc::now()))
    }
}
