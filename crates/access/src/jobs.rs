//! Jobs registered with the worker's scheduler

use std::sync::Arc;

use async_trait::async_trait;
use keepwarden_billing::BillingFailureHandler;
use time::OffsetDateTime;

use crate::error::{AccessError, AccessResult};
use crate::reconcile::{Reconciler, ScheduledRun};
use crate::scheduler::{Clock, ScheduledJob};
use crate::tasks::{RoleTask, TaskQueue};

pub struct ReconciliationJob {
    reconciler: Arc<Reconciler>,
}

impl ReconciliationJob {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl ScheduledJob for ReconciliationJob {
    fn name(&self) -> &str {
        "daily_reconciliation"
    }

    async fn run(&self) -> AccessResult<()> {
        match self.reconciler.run_scheduled().await? {
            ScheduledRun::Skipped(reason) => {
                tracing::info!(reason = ?reason, "Scheduled reconciliation skipped");
            }
            ScheduledRun::Completed(result) => {
                tracing::info!(
                    run_id = %result.run_id,
                    issues_found = result.issues_found,
                    issues_fixed = result.issues_fixed,
                    "Scheduled reconciliation completed"
                );
            }
        }
        Ok(())
    }
}

/// Moves members whose grace window ended onto the Debtor role
pub struct GraceExpiryJob {
    billing: Arc<BillingFailureHandler>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl GraceExpiryJob {
    pub fn new(
        billing: Arc<BillingFailureHandler>,
        queue: Arc<TaskQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            billing,
            queue,
            clock,
        }
    }
}

#[async_trait]
impl ScheduledJob for GraceExpiryJob {
    fn name(&self) -> &str {
        "grace_expiry"
    }

    async fn run(&self) -> AccessResult<()> {
        let now = OffsetDateTime::from_unix_timestamp(self.clock.now().timestamp())
            .map_err(|e| AccessError::Scheduler(format!("clock out of range: {}", e)))?;

        let restricted = self.billing.restrict_expired(now).await?;
        for member in restricted.iter().filter(|m| m.is_platform_linked()) {
            self.queue.submit(RoleTask::RestoreAccess {
                member_id: member.id,
            })?;
        }
        Ok(())
    }
}

/// Logs that the worker is alive
pub struct HeartbeatJob;

#[async_trait]
impl ScheduledJob for HeartbeatJob {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(&self) -> AccessResult<()> {
        tracing::info!("Worker heartbeat");
        Ok(())
    }
}
