//! Reconciliation pipeline: detect, optionally fix, report
//!
//! Scheduled runs honour the `RECONCILIATION_PAUSED` environment override and
//! the `maintenance_mode` flag, both read when the run starts. Manual runs
//! ignore them. Admins are notified only when a run found issues.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepwarden_shared::flags::{AUTO_FIX_RECONCILIATION, MAINTENANCE_MODE};
use keepwarden_shared::FlagCache;
use serde::Serialize;
use uuid::Uuid;

use crate::autofix::AutoFixer;
use crate::drift::{DriftDetector, DriftIssue, IssueType};
use crate::error::AccessResult;

/// Examples listed per issue type in the admin summary
pub const SUMMARY_EXAMPLES_PER_TYPE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub issues_found: usize,
    pub issues_fixed: usize,
    pub issues: Vec<DriftIssue>,
    pub auto_fix_enabled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Admin notification was delivered
    pub notified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Paused,
    MaintenanceMode,
}

#[derive(Debug, Clone)]
pub enum ScheduledRun {
    Skipped(SkipReason),
    Completed(ReconciliationResult),
}

/// Admin-facing report delivery (chat channel and email)
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify_admins(&self, subject: &str, body: &str) -> AccessResult<()>;
}

pub type PauseCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct Reconciler {
    detector: DriftDetector,
    fixer: AutoFixer,
    flags: FlagCache,
    notifier: Arc<dyn AdminNotifier>,
    paused: PauseCheck,
}

impl Reconciler {
    pub fn new(
        detector: DriftDetector,
        fixer: AutoFixer,
        flags: FlagCache,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Self {
        Self {
            detector,
            fixer,
            flags,
            notifier,
            paused: Arc::new(keepwarden_shared::reconciliation_paused),
        }
    }

    /// Replace the environment pause lookup
    pub fn with_pause_check(mut self, paused: PauseCheck) -> Self {
        self.paused = paused;
        self
    }

    pub async fn run_scheduled(&self) -> AccessResult<ScheduledRun> {
        if (self.paused)() {
            tracing::warn!("Reconciliation paused by RECONCILIATION_PAUSED, skipping scheduled run");
            return Ok(ScheduledRun::Skipped(SkipReason::Paused));
        }
        if self.flags.is_enabled(MAINTENANCE_MODE).await {
            tracing::warn!("Maintenance mode enabled, skipping scheduled reconciliation");
            return Ok(ScheduledRun::Skipped(SkipReason::MaintenanceMode));
        }
        self.run(RunTrigger::Scheduled)
            .await
            .map(ScheduledRun::Completed)
    }

    /// Same pipeline, ignores the pause override
    pub async fn run_manual(&self) -> AccessResult<ReconciliationResult> {
        self.run(RunTrigger::Manual).await
    }

    async fn run(&self, trigger: RunTrigger) -> AccessResult<ReconciliationResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(run_id = %run_id, trigger = ?trigger, "Reconciliation started");

        let issues = self.detector.detect().await?;
        let auto_fix_enabled = self.flags.is_enabled(AUTO_FIX_RECONCILIATION).await;

        let issues_fixed = if auto_fix_enabled && !issues.is_empty() {
            self.fixer.fix_all(&issues).await
        } else {
            0
        };

        let mut result = ReconciliationResult {
            run_id,
            trigger,
            issues_found: issues.len(),
            issues_fixed,
            issues,
            auto_fix_enabled,
            started_at,
            finished_at: Utc::now(),
            notified: false,
        };

        if result.issues_found > 0 {
            let subject = format!(
                "Membership reconciliation: {} issue{} found",
                result.issues_found,
                if result.issues_found == 1 { "" } else { "s" }
            );
            match self
                .notifier
                .notify_admins(&subject, &build_summary(&result))
                .await
            {
                Ok(()) => result.notified = true,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Failed to notify admins of reconciliation results");
                }
            }
        }

        tracing::info!(
            run_id = %run_id,
            issues_found = result.issues_found,
            issues_fixed = result.issues_fixed,
            auto_fix = result.auto_fix_enabled,
            notified = result.notified,
            "Reconciliation finished"
        );
        Ok(result)
    }
}

/// Human-readable report grouped by issue type
pub fn build_summary(result: &ReconciliationResult) -> String {
    let mut lines = vec![
        format!("Reconciliation run {}", result.run_id),
        format!("Issues found: {}", result.issues_found),
        if result.auto_fix_enabled {
            format!("Issues fixed: {}", result.issues_fixed)
        } else {
            "Auto-fix disabled; no changes applied".to_string()
        },
    ];

    for issue_type in IssueType::ALL {
        let matching: Vec<&DriftIssue> = result
            .issues
            .iter()
            .filter(|i| i.issue_type == issue_type)
            .collect();
        if matching.is_empty() {
            continue;
        }

        lines.push(String::new());
        lines.push(format!("{} ({})", issue_type, matching.len()));
        for issue in matching.iter().take(SUMMARY_EXAMPLES_PER_TYPE) {
            lines.push(format!(
                "- {} ({}): {}",
                issue.display_name, issue.platform_user_id, issue.description
            ));
        }
        if matching.len() > SUMMARY_EXAMPLES_PER_TYPE {
            lines.push(format!(
                "...and {} more",
                matching.len() - SUMMARY_EXAMPLES_PER_TYPE
            ));
        }
    }

    lines.join("\n")
}
