// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Keepwarden Access Module
//!
//! Keeps platform roles in line with billing state.
//!
//! ## Features
//!
//! - **Role Assignment**: Retried add/remove/swap calls against the platform API
//! - **Task Queue**: Fire-and-forget role work for webhook and claim handlers
//! - **Drift Detection**: Compares expected roles with what members actually hold
//! - **Auto-Fix**: Rate-limited corrective actions behind a feature flag
//! - **Reconciliation**: Daily detect, fix, and report pipeline
//! - **Scheduler**: Clock-driven job runner with time zone aware daily schedules

pub mod autofix;
pub mod claim;
pub mod drift;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod platform;
pub mod reconcile;
pub mod roles;
pub mod scheduler;
pub mod services;
pub mod tasks;

#[cfg(test)]
mod scenario_tests;

pub use autofix::{AutoFixer, FixPlan, FIX_BATCH_DELAY, FIX_BATCH_SIZE};
pub use claim::{Claim, ClaimService};
pub use drift::{DriftDetector, DriftIssue, IssueType, Severity};
pub use error::{AccessError, AccessResult};
pub use jobs::{GraceExpiryJob, HeartbeatJob, ReconciliationJob};
pub use notify::{ChannelEmailNotifier, PlatformMemberNotifier};
pub use platform::{
    DiscordClient, InMemoryPlatform, PlatformCall, PlatformClient, PlatformError, PlatformOp,
};
pub use reconcile::{
    build_summary, AdminNotifier, ReconciliationResult, Reconciler, RunTrigger, ScheduledRun,
    SkipReason,
};
pub use roles::{KickOutcome, MutationBudget, RetryPolicy, RoleAssignmentService};
pub use scheduler::{
    Clock, DailySchedule, ManualClock, Schedule, ScheduledJob, Scheduler, SystemClock,
};
pub use services::Services;
pub use tasks::{RoleTask, TaskExecutor, TaskHandle, TaskOutcome, TaskQueue};
