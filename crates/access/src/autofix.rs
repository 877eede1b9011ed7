//! Corrective role actions for detected drift
//!
//! Issues are fixed in batches of five, concurrently within a batch, with a
//! fixed two second pause between batches. A fix can need several role
//! calls, so the individual add and remove attempts also draw on a shared
//! [`MutationBudget`] of five per two seconds. That keeps role mutations
//! under the platform's 10 per 10 seconds quota in a single-process
//! deployment. The correct role is always re-derived from a fresh read of
//! the member.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use keepwarden_billing::{AuditAction, AuditEntry, MembershipStore, PERFORMED_BY_RECONCILIATION};
use keepwarden_shared::ManagedRole;
use serde::Serialize;

use crate::drift::{DriftIssue, IssueType};
use crate::roles::{MutationBudget, RetryPolicy, RoleAssignmentService};

pub const FIX_BATCH_SIZE: usize = 5;
pub const FIX_BATCH_DELAY: Duration = Duration::from_secs(2);
/// Role add/remove calls allowed per `FIX_BATCH_DELAY` window
pub const FIX_MUTATIONS_PER_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "role", rename_all = "snake_case")]
pub enum FixPlan {
    /// Add the expected role
    Assign(ManagedRole),
    /// Strip every managed role
    RemoveAll,
    /// Strip every managed role except the expected one, then add it
    Replace(ManagedRole),
}

impl FixPlan {
    fn audit_action(&self) -> AuditAction {
        match self {
            FixPlan::Assign(_) => AuditAction::RoleAssigned,
            FixPlan::RemoveAll => AuditAction::RolesRemoved,
            FixPlan::Replace(_) => AuditAction::RoleCorrected,
        }
    }
}

/// Corrective action for an issue given the freshly derived expected role.
///
/// A fresh record that no longer supports the issue's action converges on
/// the fresh expectation instead.
pub fn plan_fix(issue_type: IssueType, expected: Option<ManagedRole>) -> FixPlan {
    match (issue_type, expected) {
        (_, None) => FixPlan::RemoveAll,
        (IssueType::MissingAccess, Some(role)) => FixPlan::Assign(role),
        (
            IssueType::UnauthorizedAccess | IssueType::RoleMismatch | IssueType::DebtorMismatch,
            Some(role),
        ) => FixPlan::Replace(role),
    }
}

pub struct AutoFixer {
    store: Arc<dyn MembershipStore>,
    roles: Arc<RoleAssignmentService>,
    policy: RetryPolicy,
    budget: MutationBudget,
    batch_size: usize,
    batch_delay: Duration,
}

impl AutoFixer {
    pub fn new(store: Arc<dyn MembershipStore>, roles: Arc<RoleAssignmentService>) -> Self {
        Self {
            store,
            roles,
            policy: RetryPolicy::fix(),
            budget: MutationBudget::new(FIX_MUTATIONS_PER_WINDOW, FIX_BATCH_DELAY),
            batch_size: FIX_BATCH_SIZE,
            batch_delay: FIX_BATCH_DELAY,
        }
    }

    /// Apply fixes for `issues`, returning how many succeeded
    pub async fn fix_all(&self, issues: &[DriftIssue]) -> usize {
        let mut fixed = 0;
        let batches = issues.chunks(self.batch_size.max(1));
        let total_batches = batches.len();

        for (index, batch) in batches.enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }

            let results = join_all(batch.iter().map(|issue| self.fix_one(issue))).await;
            let batch_fixed = results.into_iter().filter(|ok| *ok).count();
            fixed += batch_fixed;

            tracing::debug!(
                batch = index + 1,
                batches = total_batches,
                fixed = batch_fixed,
                size = batch.len(),
                "Auto-fix batch complete"
            );
        }

        tracing::info!(issues = issues.len(), fixed = fixed, "Auto-fix complete");
        fixed
    }

    async fn fix_one(&self, issue: &DriftIssue) -> bool {
        let member = match self.store.get_member(issue.member_id).await {
            Ok(Some(member)) => member,
            Ok(None) => {
                tracing::warn!(member_id = %issue.member_id, "Member no longer exists, skipping fix");
                return false;
            }
            Err(e) => {
                tracing::error!(member_id = %issue.member_id, error = %e, "Failed to load member for fix");
                return false;
            }
        };

        let Some(platform_user_id) = member.platform_user_id.clone() else {
            tracing::warn!(member_id = %member.id, "Member is no longer platform-linked, skipping fix");
            return false;
        };

        let team = match member.team_id {
            Some(team_id) => match self.store.get_team(team_id).await {
                Ok(team) => team,
                Err(e) => {
                    tracing::error!(member_id = %member.id, error = %e, "Failed to load team for fix");
                    return false;
                }
            },
            None => None,
        };
        let expected = member.expected_role(member.effective_status(team.as_ref()));
        let plan = plan_fix(issue.issue_type, expected);

        let applied = match plan {
            FixPlan::Assign(role) => {
                self.roles
                    .assign_with(&platform_user_id, role, self.policy, Some(&self.budget))
                    .await
            }
            FixPlan::RemoveAll => {
                self.roles
                    .remove_managed_with(&platform_user_id, None, self.policy, Some(&self.budget))
                    .await
            }
            FixPlan::Replace(role) => {
                self.roles
                    .apply_expected(&platform_user_id, Some(role), self.policy, Some(&self.budget))
                    .await
            }
        };

        if !applied {
            tracing::error!(
                member_id = %member.id,
                issue = issue.issue_type.as_str(),
                plan = ?plan,
                "Fix failed"
            );
            return false;
        }

        let audit = AuditEntry::member(plan.audit_action(), member.id)
            .details(serde_json::json!({
                "issue_type": issue.issue_type,
                "description": issue.description,
                "platform_user_id": platform_user_id,
                "previous_roles": issue.platform_roles,
                "expected_role": expected,
                "plan": plan,
            }))
            .performed_by(PERFORMED_BY_RECONCILIATION);
        if let Err(e) = self.store.append_audit(audit).await {
            tracing::warn!(member_id = %member.id, error = %e, "Failed to write audit entry for fix");
        }

        tracing::info!(
            member_id = %member.id,
            issue = issue.issue_type.as_str(),
            plan = ?plan,
            "Drift fixed"
        );
        true
    }
}
