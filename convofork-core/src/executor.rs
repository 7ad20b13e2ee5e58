//! Branch mutation
//!
//! [`BranchMutationExecutor`] applies a [`PruningAction`] to a log. Every
//! mutating action follows the same sequence:
//!
//! ```text
//! pending ─► backed-up ─► applied
//!                     └─► failed   (backup kept for recovery)
//! ```
//!
//! The backup is always saved before the log or the deactivation ledger is
//! touched. If the backup cannot be saved the action stops with
//! [`Error::BackupWrite`] and nothing is modified.
//!
//! Callers must serialize executions against the same log.

use crate::advisor::{ActionKind, PruningAction};
use crate::backup::{BackupStore, BranchBackup};
use crate::branch::ConversationBranch;
use crate::error::{Error, Result};
use crate::ingest::record_id;
use crate::store::LogHandle;
use serde::Serialize;
use std::collections::HashSet;

/// Progress of one mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    BackedUp,
    Applied,
    Failed,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Pending => "pending",
            MutationState::BackedUp => "backed_up",
            MutationState::Applied => "applied",
            MutationState::Failed => "failed",
        }
    }
}

/// Instructions for merging a branch into its sibling by hand.
///
/// Nothing is changed by a merge. Once the content has been combined, prune
/// the superseded branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeGuidance {
    pub fork_parent_id: Option<String>,
    /// Branch proposed for merging
    pub branch_id: String,
    /// Sibling it resembles
    pub related_branch_id: Option<String>,
    pub branch_messages: usize,
    pub branch_tokens: u64,
    pub instructions: String,
}

impl MergeGuidance {
    fn for_action(action: &PruningAction) -> Self {
        let branch = &action.branch;
        let target = action
            .related_branch
            .as_deref()
            .unwrap_or("the sibling branch");
        let instructions = format!(
            "Combine the useful content of branch {} ({} messages, {} tokens) into {}, \
             then prune branch {}.",
            branch.start_id, branch.depth, branch.token_weight, target, branch.start_id
        );

        Self {
            fork_parent_id: branch.fork_parent_id.clone(),
            branch_id: branch.start_id.clone(),
            related_branch_id: action.related_branch.clone(),
            branch_messages: branch.depth,
            branch_tokens: branch.token_weight,
            instructions,
        }
    }
}

/// Result of [`BranchMutationExecutor::execute`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Confirmation was required and not given; nothing happened
    Declined,
    Pruned { backup_id: String, removed: usize },
    Deactivated { backup_id: String },
    MergeGuidance(MergeGuidance),
}

impl ExecutionOutcome {
    /// Whether the log or ledger was changed
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Pruned { .. } | ExecutionOutcome::Deactivated { .. }
        )
    }

    pub fn backup_id(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Pruned { backup_id, .. }
            | ExecutionOutcome::Deactivated { backup_id } => Some(backup_id),
            _ => None,
        }
    }
}

/// Result of [`BranchMutationExecutor::restore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub backup_id: String,
    /// Records appended to the log
    pub restored: usize,
    /// Whether the branch was removed from the deactivation ledger
    pub reactivated: bool,
}

/// Applies pruning actions and restores backups
#[derive(Debug)]
pub struct BranchMutationExecutor<B: BackupStore> {
    backups: B,
}

impl<B: BackupStore> BranchMutationExecutor<B> {
    pub fn new(backups: B) -> Self {
        Self { backups }
    }

    pub fn backups(&self) -> &B {
        &self.backups
    }

    /// Apply `action` to `log`.
    ///
    /// `confirmed` grants confirmation for actions that require it.
    pub async fn execute<L>(
        &self,
        action: &PruningAction,
        log: &L,
        confirmed: bool,
    ) -> Result<ExecutionOutcome>
    where
        L: LogHandle + ?Sized,
    {
        let branch = &action.branch;

        if action.requires_confirmation && !confirmed {
            tracing::info!(
                branch = %branch.start_id,
                action = %action.kind,
                "Confirmation not granted, skipping"
            );
            return Ok(ExecutionOutcome::Declined);
        }

        validate_target(branch)?;

        match action.kind {
            ActionKind::Merge => {
                let guidance = MergeGuidance::for_action(action);
                tracing::info!(
                    branch = %branch.start_id,
                    related = ?action.related_branch,
                    "Produced merge guidance"
                );
                Ok(ExecutionOutcome::MergeGuidance(guidance))
            }
            ActionKind::Prune => self.prune(action, log).await,
            ActionKind::Deactivate => self.deactivate(action, log).await,
        }
    }

    async fn prune<L>(&self, action: &PruningAction, log: &L) -> Result<ExecutionOutcome>
    where
        L: LogHandle + ?Sized,
    {
        let branch = &action.branch;
        trace_state(action, MutationState::Pending);

        let lines = read_log(log).await?;
        let backup = self.back_up(action, log, &lines).await?;

        let ids: HashSet<&str> = branch.message_ids().collect();
        let kept: Vec<String> = lines
            .iter()
            .filter(|line| record_id(line).map_or(true, |id| !ids.contains(id.as_str())))
            .cloned()
            .collect();
        let removed = lines.len() - kept.len();
        if removed == 0 {
            tracing::warn!(
                branch = %branch.start_id,
                log = %log.reference(),
                "None of the branch's messages are in the log"
            );
        }

        if let Err(e) = log.write_lines(&kept).await {
            trace_state(action, MutationState::Failed);
            tracing::warn!(
                backup_id = %backup.id,
                log = %log.reference(),
                error = %e,
                "Log write failed after backup"
            );
            return Err(Error::MutationIo {
                backup_id: backup.id,
                message: e.to_string(),
            });
        }

        trace_state(action, MutationState::Applied);
        tracing::info!(
            branch = %branch.start_id,
            backup_id = %backup.id,
            removed,
            "Pruned branch"
        );
        Ok(ExecutionOutcome::Pruned {
            backup_id: backup.id,
            removed,
        })
    }

    async fn deactivate<L>(&self, action: &PruningAction, log: &L) -> Result<ExecutionOutcome>
    where
        L: LogHandle + ?Sized,
    {
        let branch = &action.branch;
        trace_state(action, MutationState::Pending);

        let lines = read_log(log).await?;
        let backup = self.back_up(action, log, &lines).await?;

        if let Err(e) = self.mark_inactive(&branch.start_id).await {
            trace_state(action, MutationState::Failed);
            tracing::warn!(backup_id = %backup.id, error = %e, "Ledger update failed after backup");
            return Err(Error::MutationIo {
                backup_id: backup.id,
                message: e.to_string(),
            });
        }

        trace_state(action, MutationState::Applied);
        tracing::info!(branch = %branch.start_id, backup_id = %backup.id, "Deactivated branch");
        Ok(ExecutionOutcome::Deactivated {
            backup_id: backup.id,
        })
    }

    async fn mark_inactive(&self, start_id: &str) -> Result<()> {
        let mut ledger = self.backups.deactivated().await?;
        ledger.insert(start_id.to_string());
        self.backups.set_deactivated(&ledger).await
    }

    async fn back_up<L>(
        &self,
        action: &PruningAction,
        log: &L,
        lines: &[String],
    ) -> Result<BranchBackup>
    where
        L: LogHandle + ?Sized,
    {
        let backup = BranchBackup::new(
            log.reference(),
            action.kind,
            &action.branch,
            action.reason.clone(),
            lines,
        );
        if let Err(e) = self.backups.save(&backup).await {
            trace_state(action, MutationState::Failed);
            tracing::warn!(
                branch = %action.branch.start_id,
                error = %e,
                "Backup failed, log left unmodified"
            );
            return Err(Error::BackupWrite {
                branch_id: action.branch.start_id.clone(),
                message: e.to_string(),
            });
        }
        trace_state(action, MutationState::BackedUp);
        Ok(backup)
    }

    /// Undo the action a backup was taken for.
    ///
    /// Prune backups append the branch's original records that are missing
    /// from `log`, at the end. Deactivate backups remove the branch from the
    /// ledger. The backup is deleted once the restore succeeds.
    pub async fn restore<L>(&self, backup_id: &str, log: &L) -> Result<RestoreOutcome>
    where
        L: LogHandle + ?Sized,
    {
        let backup = self.backups.load(backup_id).await?;

        let outcome = match backup.action {
            ActionKind::Prune => {
                let mut lines = read_log(log).await?;
                let present: HashSet<String> =
                    lines.iter().filter_map(|line| record_id(line)).collect();

                let mut restored = 0;
                for (id, record) in backup.restorable() {
                    if present.contains(id) {
                        tracing::debug!(id, "Message already in log, not restoring");
                        continue;
                    }
                    lines.push(record.to_string());
                    restored += 1;
                }

                log.write_lines(&lines)
                    .await
                    .map_err(|e| Error::MutationIo {
                        backup_id: backup.id.clone(),
                        message: e.to_string(),
                    })?;

                RestoreOutcome {
                    backup_id: backup.id.clone(),
                    restored,
                    reactivated: false,
                }
            }
            ActionKind::Deactivate => {
                let mut ledger = self.backups.deactivated().await?;
                let reactivated = ledger.remove(&backup.branch.start_id);
                self.backups.set_deactivated(&ledger).await?;

                RestoreOutcome {
                    backup_id: backup.id.clone(),
                    restored: 0,
                    reactivated,
                }
            }
            ActionKind::Merge => {
                return Err(Error::InvalidAction(format!(
                    "backup {} is for a merge, which changes nothing",
                    backup.id
                )))
            }
        };

        self.backups.remove(&backup.id).await?;
        tracing::info!(
            backup_id = %backup.id,
            branch = %backup.branch.start_id,
            restored = outcome.restored,
            reactivated = outcome.reactivated,
            "Restored backup"
        );
        Ok(outcome)
    }
}

fn validate_target(branch: &ConversationBranch) -> Result<()> {
    if branch.is_trunk() {
        return Err(Error::InvalidAction(format!(
            "branch {} is the conversation trunk",
            branch.start_id
        )));
    }
    if branch.messages.is_empty() {
        return Err(Error::InvalidAction(format!(
            "branch {} has no messages",
            branch.start_id
        )));
    }
    Ok(())
}

async fn read_log<L>(log: &L) -> Result<Vec<String>>
where
    L: LogHandle + ?Sized,
{
    log.read_lines().await.map_err(|e| Error::LogRead {
        log: log.reference(),
        message: e.to_string(),
    })
}

fn trace_state(action: &PruningAction, state: MutationState) {
    tracing::debug!(
        branch = %action.branch.start_id,
        action = %action.kind,
        state = state.as_str(),
        "Mutation state"
    );
}
