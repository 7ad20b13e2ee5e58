//! convofork - analyze and prune forked Claude Code conversations
//!
//! Commands:
//! - `sessions`: list session logs under the Claude Code projects directory
//! - `analyze` / `suggest`: fork analysis and pruning suggestions for one log
//! - `apply`: execute the suggested action for a branch (backup first)
//! - `backups` / `restore`: inspect and undo applied actions
//!
//! Uses XDG Base Directory specification for file locations:
//! - Backups: $XDG_DATA_HOME/convofork/backups (~/.local/share/convofork/backups)
//! - Config: $XDG_CONFIG_HOME/convofork/config.toml (~/.config/convofork/config.toml)
//! - Logs: $XDG_STATE_HOME/convofork/ (~/.local/state/convofork/)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convofork_core::{
    discover_sessions, ActionKind, BackupStore, BranchMutationExecutor, Config,
    ConversationBranch, DirBackupStore, ExecutionOutcome, FileLog, ForkAnalysisResult,
    ForkAnalyzer, PruningAction, PruningAdvisor,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "convofork")]
#[command(about = "Analyze and prune forked Claude Code conversations")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List Claude Code session logs, newest first
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the fork structure and token distribution of a log
    Analyze {
        /// Path to a session log (.jsonl)
        log: PathBuf,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Suggest pruning actions for a log
    Suggest {
        /// Path to a session log (.jsonl)
        log: PathBuf,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Execute the suggested action for one branch
    Apply {
        /// Path to a session log (.jsonl)
        log: PathBuf,

        /// Starting message id of the branch
        #[arg(short, long)]
        branch: String,

        /// Only apply if the suggestion is this action (prune, deactivate, merge)
        #[arg(short, long)]
        action: Option<ActionKind>,

        /// Confirm actions that require confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List saved backups
    Backups {
        /// Only backups of this branch
        #[arg(short, long)]
        branch: Option<String>,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Undo the action a backup was taken for
    Restore {
        /// Backup id (see `convofork backups`)
        backup_id: String,

        /// Log to restore into (default: the log the backup was taken from)
        #[arg(short, long)]
        log: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        convofork_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let executor = BranchMutationExecutor::new(DirBackupStore::new(config.backup_dir()));

    match args.command {
        Command::Sessions { limit } => list_sessions(&config, limit),
        Command::Analyze { log, format } => {
            let result = analyze(&config, &executor, &log).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_analysis(&result);
            }
            Ok(())
        }
        Command::Suggest { log, format } => {
            let result = analyze(&config, &executor, &log).await?;
            let actions = PruningAdvisor::new(&config).suggest_actions(&result);
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&actions)?);
            } else {
                print_actions(&actions);
            }
            Ok(())
        }
        Command::Apply {
            log,
            branch,
            action,
            yes,
        } => apply(&config, &executor, &log, &branch, action, yes).await,
        Command::Backups { branch, format } => list_backups(&executor, branch, &format).await,
        Command::Restore { backup_id, log } => restore(&executor, &backup_id, log).await,
    }
}

fn list_sessions(config: &Config, limit: usize) -> Result<()> {
    let projects_dir = config.claude_projects_dir();
    let sessions = discover_sessions(&projects_dir).context("failed to discover sessions")?;

    if sessions.is_empty() {
        println!("No sessions found in {}", projects_dir.display());
        return Ok(());
    }

    println!("{} session(s) in {}\n", sessions.len(), projects_dir.display());
    for session in sessions.iter().take(limit) {
        println!(
            "  {}  {}  {:>8} bytes  {}",
            session.modified_at.format("%Y-%m-%d %H:%M"),
            short_id(&session.session_id),
            session.size_bytes,
            session.project
        );
        println!("      {}", session.path.display());
    }
    Ok(())
}

/// Analyze a log with the deactivation ledger applied
async fn analyze(
    config: &Config,
    executor: &BranchMutationExecutor<DirBackupStore>,
    path: &Path,
) -> Result<ForkAnalysisResult> {
    let inactive = executor
        .backups()
        .deactivated()
        .await
        .context("failed to read deactivation ledger")?;

    let log = FileLog::new(path);
    let result = ForkAnalyzer::new(config)
        .with_inactive(inactive)
        .analyze_log(&log)
        .await
        .with_context(|| format!("failed to analyze {}", path.display()))?;

    tracing::info!(
        session_id = %result.tree.session_id,
        forks = result.fork_count,
        branches = result.branch_count,
        "Analyzed log"
    );
    Ok(result)
}

async fn apply(
    config: &Config,
    executor: &BranchMutationExecutor<DirBackupStore>,
    path: &Path,
    branch_id: &str,
    kind: Option<ActionKind>,
    confirmed: bool,
) -> Result<()> {
    let result = analyze(config, executor, path).await?;
    if result.find_branch(branch_id).is_none() {
        anyhow::bail!("No branch starting at '{}' in {}", branch_id, path.display());
    }

    let actions = PruningAdvisor::new(config).suggest_actions(&result);
    let Some(action) = actions
        .iter()
        .find(|a| a.branch.start_id == branch_id && kind.map_or(true, |k| a.kind == k))
    else {
        match kind {
            Some(kind) => anyhow::bail!("No {} suggested for branch '{}'", kind, branch_id),
            None => anyhow::bail!("No action suggested for branch '{}'", branch_id),
        }
    };

    let log = FileLog::new(path);
    let outcome = executor
        .execute(action, &log, confirmed)
        .await
        .with_context(|| format!("failed to {} branch {}", action.kind, branch_id))?;

    match outcome {
        ExecutionOutcome::Declined => {
            println!(
                "{} of branch {} requires confirmation ({} risk): {}",
                action.kind,
                branch_id,
                action.risk,
                action.reason
            );
            println!("Re-run with --yes to apply.");
        }
        ExecutionOutcome::Pruned { backup_id, removed } => {
            println!("Pruned branch {}: removed {} message(s)", branch_id, removed);
            println!("Backup: {}", backup_id);
        }
        ExecutionOutcome::Deactivated { backup_id } => {
            println!("Deactivated branch {}", branch_id);
            println!("Backup: {}", backup_id);
        }
        ExecutionOutcome::MergeGuidance(guidance) => {
            println!("Merge guidance for branch {}:", guidance.branch_id);
            println!("  {}", guidance.instructions);
        }
    }
    Ok(())
}

async fn list_backups(
    executor: &BranchMutationExecutor<DirBackupStore>,
    branch: Option<String>,
    format: &str,
) -> Result<()> {
    let backups = match branch {
        Some(ref branch) => executor.backups().list_for_branch(branch).await,
        None => executor.backups().list().await,
    }
    .context("failed to list backups")?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups in {}", executor.backups().dir().display());
        return Ok(());
    }

    for backup in &backups {
        println!(
            "{}  {:<10}  {} message(s)  {}",
            backup.id,
            backup.action.as_str(),
            backup.branch.messages.len(),
            backup.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!("    {}", backup.log_ref);
        println!("    {}", backup.reason);
    }
    Ok(())
}

async fn restore(
    executor: &BranchMutationExecutor<DirBackupStore>,
    backup_id: &str,
    log: Option<PathBuf>,
) -> Result<()> {
    let backup = executor
        .backups()
        .load(backup_id)
        .await
        .with_context(|| format!("failed to load backup {}", backup_id))?;
    let path = log.unwrap_or_else(|| PathBuf::from(&backup.log_ref));

    let outcome = executor
        .restore(backup_id, &FileLog::new(&path))
        .await
        .with_context(|| format!("failed to restore backup {}", backup_id))?;

    if outcome.reactivated {
        println!("Reactivated branch {}", backup.branch.start_id);
    } else {
        println!(
            "Restored {} message(s) of branch {} to {}",
            outcome.restored,
            backup.branch.start_id,
            path.display()
        );
    }
    Ok(())
}

fn print_analysis(result: &ForkAnalysisResult) {
    let tree = &result.tree;
    let dist = &result.token_distribution;

    println!("Session: {}", tree.session_id);
    println!(
        "Messages: {} ({} orphaned), depth {}",
        tree.len(),
        tree.orphans.len(),
        tree.max_depth
    );
    println!("Forks: {}  Branches: {}", result.fork_count, result.branch_count);
    println!("Tokens: {}", tree.total_tokens);
    println!("  main path:    {}", dist.main_path);
    println!("  alternatives: {}", dist.alternative_branches);
    println!("  abandoned:    {}", dist.abandoned_branches);

    if let Some(trunk) = &result.trunk {
        println!(
            "Trunk: {} message(s), {} tokens",
            trunk.depth, trunk.token_weight
        );
    }
    if let Some(largest) = &result.largest_branch {
        println!(
            "Largest branch: {} ({} messages)",
            largest.start_id, largest.depth
        );
    }

    for fork in &tree.forks {
        println!(
            "\nFork at {} (depth {}, {} tokens, {})",
            fork.parent_id,
            fork.depth,
            fork.total_tokens,
            fork.created_at.format("%Y-%m-%d %H:%M")
        );
        for branch in &fork.branches {
            print_branch(result, branch);
        }
    }

    if !tree.warnings.is_empty() {
        println!("\nWarnings: {}", tree.warnings.len());
        for warning in &tree.warnings {
            println!("  [{}] {}", warning.kind(), warning);
        }
    }
    if result.skipped_records > 0 || result.sidechain_records > 0 {
        println!(
            "Skipped {} non-message and {} sidechain record(s)",
            result.skipped_records, result.sidechain_records
        );
    }
}

fn print_branch(result: &ForkAnalysisResult, branch: &ConversationBranch) {
    let preview = branch
        .messages
        .first()
        .map(|m| m.preview(50))
        .unwrap_or_default();
    println!(
        "  [{:<11}] {}  {} msg(s)  {} tokens  last {}{}",
        result.classify(branch).as_str(),
        branch.start_id,
        branch.depth,
        branch.token_weight,
        branch.last_activity.format("%Y-%m-%d %H:%M"),
        if branch.active { "" } else { "  (inactive)" }
    );
    if !preview.is_empty() {
        println!("                {}", preview);
    }
}

fn print_actions(actions: &[PruningAction]) {
    if actions.is_empty() {
        println!("No actions suggested.");
        return;
    }

    for action in actions {
        println!(
            "{:<10} {}  saves ~{} tokens  risk {}{}",
            action.kind.as_str(),
            action.branch.start_id,
            action.tokens_saved,
            action.risk,
            if action.requires_confirmation {
                "  (needs --yes)"
            } else {
                ""
            }
        );
        println!("    {}", action.reason);
    }
    println!(
        "\nTotal: ~{} tokens",
        convofork_core::advisor::total_savings(actions)
    );
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
