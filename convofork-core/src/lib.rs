//! # convofork-core
//!
//! Core library for convofork - a conversation fork analyzer for Claude Code
//! session logs.
//!
//! This library provides:
//! - Tree reconstruction from parent-pointer JSONL logs
//! - Fork detection, branch building and token accounting
//! - Pruning recommendations for abandoned or duplicated branches
//! - Backup-first branch mutation (prune, deactivate, merge guidance, restore)
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Analysis is a pure pipeline over the full log, rebuilt on every run:
//! - **Ingest:** log lines → [`Message`]s (bad records become warnings)
//! - **Tree:** messages → [`ConversationTree`] (arena + id index)
//! - **Forks/branches:** tree → [`ConversationFork`]s and [`ConversationBranch`]es
//! - **Aggregate:** → [`ForkAnalysisResult`], then [`PruningAdvisor`] suggestions
//!
//! Mutation goes through [`BranchMutationExecutor`], which always saves a
//! [`BranchBackup`] before changing anything.
//!
//! ## Example
//!
//! ```rust,no_run
//! use convofork_core::{
//!     BackupStore, BranchMutationExecutor, Config, DirBackupStore, FileLog, ForkAnalyzer,
//!     PruningAdvisor,
//! };
//!
//! # async fn run() -> convofork_core::Result<()> {
//! let config = Config::load()?;
//! let log = FileLog::new("session.jsonl");
//!
//! let executor = BranchMutationExecutor::new(DirBackupStore::new(config.backup_dir()));
//! let inactive = executor.backups().deactivated().await?;
//!
//! let result = ForkAnalyzer::new(&config)
//!     .with_inactive(inactive)
//!     .analyze_log(&log)
//!     .await?;
//!
//! for action in PruningAdvisor::new(&config).suggest_actions(&result) {
//!     println!("{} {}: {}", action.kind, action.branch.start_id, action.reason);
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use advisor::{ActionKind, PruningAction, PruningAdvisor, RiskLevel};
pub use analysis::{BranchClass, ForkAnalysisResult, ForkAnalyzer, TokenDistribution};
pub use backup::{BackupStore, BranchBackup, DirBackupStore, MemoryBackupStore};
pub use branch::ConversationBranch;
pub use config::Config;
pub use error::{Error, Result};
pub use executor::{BranchMutationExecutor, ExecutionOutcome, MergeGuidance, RestoreOutcome};
pub use fork::ConversationFork;
pub use ingest::{LogWarning, ParsedLog};
pub use store::{discover_sessions, FileLog, LogHandle, MemoryLog, SessionLog};
pub use tokens::TokenEstimator;
pub use tree::ConversationTree;
pub use types::*;

// Public modules
pub mod advisor;
pub mod analysis;
pub mod backup;
pub mod branch;
pub mod config;
pub mod error;
pub mod executor;
pub mod fork;
pub mod ingest;
pub mod logging;
pub mod store;
pub mod tokens;
pub mod tree;
pub mod types;
