//! Append-only audit trail
//!
//! Every billing-state transition and every corrective role action produces an
//! [`AuditEntry`]. Entries are written through the membership store, inside
//! the same transaction as the state change where one exists.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Actor recorded for webhook-driven transitions
pub const PERFORMED_BY_BILLING_WEBHOOK: &str = "system:billing_webhook";
/// Actor recorded for the grace-expiry restriction pass
pub const PERFORMED_BY_GRACE_EXPIRY: &str = "system:grace_expiry";
/// Actor recorded for reconciliation fixes
pub const PERFORMED_BY_RECONCILIATION: &str = "system:reconciliation";
/// Actor recorded for the claim flow
pub const PERFORMED_BY_CLAIM: &str = "system:claim";

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    GracePeriodStarted,
    PaymentRecovered,
    SubscriptionCancelled,
    AccessRestricted,
    MembershipCancelled,
    PlatformAccountClaimed,
    RoleAssigned,
    RolesRemoved,
    RoleCorrected,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::GracePeriodStarted => "grace_period_started",
            AuditAction::PaymentRecovered => "payment_recovered",
            AuditAction::SubscriptionCancelled => "subscription_cancelled",
            AuditAction::AccessRestricted => "access_restricted",
            AuditAction::MembershipCancelled => "membership_cancelled",
            AuditAction::PlatformAccountClaimed => "platform_account_claimed",
            AuditAction::RoleAssigned => "role_assigned",
            AuditAction::RolesRemoved => "roles_removed",
            AuditAction::RoleCorrected => "role_corrected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Member,
    Team,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Member => "member",
            EntityType::Team => "team",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub details: serde_json::Value,
    pub performed_by: String,
    pub created_at: OffsetDateTime,
}

impl AuditEntry {
    pub fn member(action: AuditAction, member_id: Uuid) -> Self {
        Self::new(action, EntityType::Member, member_id)
    }

    pub fn team(action: AuditAction, team_id: Uuid) -> Self {
        Self::new(action, EntityType::Team, team_id)
    }

    fn new(action: AuditAction, entity_type: EntityType, entity_id: Uuid) -> Self {
        Self {
            action,
            entity_type,
            entity_id,
            details: serde_json::json!({}),
            performed_by: PERFORMED_BY_BILLING_WEBHOOK.to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn performed_by(mut self, actor: &str) -> Self {
        self.performed_by = actor.to_string();
        self
    }

    pub fn at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = created_at;
        self
    }

    /// Same entry recorded against one member of a team transition
    pub fn for_member(&self, member_id: Uuid) -> Self {
        let mut entry = self.clone();
        entry.entity_type = EntityType::Member;
        entry.entity_id = member_id;
        entry
    }
}
