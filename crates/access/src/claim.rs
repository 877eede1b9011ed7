//! Platform account claim flow
//!
//! Links a member row to a platform user id, then hands the role grant to
//! the task queue so the caller returns without waiting on the platform.

use std::sync::Arc;

use keepwarden_billing::{AuditAction, AuditEntry, BillingError, MembershipStore, PERFORMED_BY_CLAIM};
use keepwarden_shared::{ManagedRole, Member};
use uuid::Uuid;

use crate::error::{AccessError, AccessResult};
use crate::tasks::{RoleTask, TaskHandle, TaskQueue};

pub struct Claim {
    pub member: Member,
    pub expected_role: Option<ManagedRole>,
    /// Pending role grant, if the member is entitled to one
    pub task: Option<TaskHandle>,
}

pub struct ClaimService {
    store: Arc<dyn MembershipStore>,
    queue: Arc<TaskQueue>,
}

impl ClaimService {
    pub fn new(store: Arc<dyn MembershipStore>, queue: Arc<TaskQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn claim(&self, member_id: Uuid, platform_user_id: &str) -> AccessResult<Claim> {
        let member = self
            .store
            .get_member(member_id)
            .await?
            .ok_or_else(|| BillingError::member_not_found(member_id))?;

        if let Some(existing) = member.platform_user_id.as_deref() {
            if existing != platform_user_id {
                return Err(AccessError::AlreadyClaimed { member_id });
            }
        }

        let audit = AuditEntry::member(AuditAction::PlatformAccountClaimed, member_id)
            .details(serde_json::json!({ "platform_user_id": platform_user_id }))
            .performed_by(PERFORMED_BY_CLAIM);
        let member = self
            .store
            .set_platform_user_id(member_id, platform_user_id, audit)
            .await?;

        let team = match member.team_id {
            Some(team_id) => self.store.get_team(team_id).await?,
            None => None,
        };
        let expected_role = member.expected_role(member.effective_status(team.as_ref()));

        let task = match expected_role {
            Some(role) => Some(self.queue.submit(RoleTask::Assign {
                platform_user_id: platform_user_id.to_string(),
                role,
            })?),
            None => None,
        };

        tracing::info!(
            member_id = %member_id,
            platform_user_id = %platform_user_id,
            expected_role = ?expected_role,
            "Platform account claimed"
        );

        Ok(Claim {
            member,
            expected_role,
            task,
        })
    }
}
