//! Drift detection between billing, the relational store and platform roles
//!
//! Read-only. For every platform-linked member the expected managed role is
//! derived from the stored state and compared with the roles the platform
//! reports. Each member yields at most one issue, classified in this order:
//!
//! 1. managed role held but no entitlement: `UNAUTHORIZED_ACCESS`
//! 2. entitled but nothing held: `MISSING_ACCESS` (or `DEBTOR_MISMATCH` when
//!    the expected role is Debtor)
//! 3. debtor flag and Debtor role disagree: `DEBTOR_MISMATCH`
//! 4. held set is not exactly the expected role: `ROLE_MISMATCH`

use std::collections::HashMap;
use std::sync::Arc;

use keepwarden_billing::{BillingStatusSource, MembershipStore};
use keepwarden_shared::{ManagedRole, Member, SubscriptionStatus, Team};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AccessResult;
use crate::platform::PlatformClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    MissingAccess,
    UnauthorizedAccess,
    RoleMismatch,
    DebtorMismatch,
}

impl IssueType {
    pub const ALL: [IssueType; 4] = [
        IssueType::MissingAccess,
        IssueType::UnauthorizedAccess,
        IssueType::RoleMismatch,
        IssueType::DebtorMismatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::MissingAccess => "MISSING_ACCESS",
            IssueType::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            IssueType::RoleMismatch => "ROLE_MISMATCH",
            IssueType::DebtorMismatch => "DEBTOR_MISMATCH",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IssueType::MissingAccess | IssueType::UnauthorizedAccess => Severity::High,
            IssueType::RoleMismatch => Severity::Medium,
            IssueType::DebtorMismatch => Severity::Low,
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftIssue {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub member_id: Uuid,
    pub platform_user_id: String,
    pub display_name: String,
    pub description: String,
    /// Status reported by the payment processor; `None` if it was not queried or failed
    pub billing_status: Option<SubscriptionStatus>,
    /// Effective status in the store (the team's status for team seats)
    pub db_status: SubscriptionStatus,
    pub platform_roles: Vec<String>,
    pub expected_role: Option<ManagedRole>,
}

fn role_list(roles: &[ManagedRole]) -> String {
    roles
        .iter()
        .map(ManagedRole::name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Classify one member given the roles the platform reports
pub fn classify(
    member: &Member,
    effective_status: SubscriptionStatus,
    platform_roles: &[String],
) -> Option<(IssueType, String)> {
    let expected = member.expected_role(effective_status);
    let held = ManagedRole::managed_in(platform_roles);
    let has_debtor = held.contains(&ManagedRole::Debtor);

    match expected {
        None if held.is_empty() => None,
        None => Some((
            IssueType::UnauthorizedAccess,
            format!(
                "Holds {} but subscription is {} with no open grace period",
                role_list(&held),
                effective_status
            ),
        )),
        Some(ManagedRole::Debtor) if held.is_empty() => Some((
            IssueType::DebtorMismatch,
            "In debtor state but has no Debtor role".to_string(),
        )),
        Some(role) if held.is_empty() => Some((
            IssueType::MissingAccess,
            format!("Subscription is {} but {} is missing", effective_status, role),
        )),
        Some(_) if member.is_in_debtor_state && !has_debtor => Some((
            IssueType::DebtorMismatch,
            format!("In debtor state but holds {} instead of Debtor", role_list(&held)),
        )),
        Some(_) if !member.is_in_debtor_state && has_debtor => Some((
            IssueType::DebtorMismatch,
            "Holds Debtor but is not in debtor state".to_string(),
        )),
        Some(role) if held.as_slice() != [role] => Some((
            IssueType::RoleMismatch,
            format!("Holds {} but should hold {}", role_list(&held), role),
        )),
        Some(_) => None,
    }
}

pub struct DriftDetector {
    store: Arc<dyn MembershipStore>,
    platform: Arc<dyn PlatformClient>,
    billing: Option<Arc<dyn BillingStatusSource>>,
}

impl DriftDetector {
    pub fn new(store: Arc<dyn MembershipStore>, platform: Arc<dyn PlatformClient>) -> Self {
        Self {
            store,
            platform,
            billing: None,
        }
    }

    /// Record the processor's view of each customer alongside the issue
    pub fn with_billing_source(mut self, billing: Arc<dyn BillingStatusSource>) -> Self {
        self.billing = Some(billing);
        self
    }

    /// Scan every platform-linked member.
    ///
    /// Only a failure to list members or teams is an error; per-member
    /// platform failures are logged and the member is skipped.
    pub async fn detect(&self) -> AccessResult<Vec<DriftIssue>> {
        let members = self.store.list_linked_members().await?;
        let teams: HashMap<Uuid, Team> = self
            .store
            .list_teams()
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let mut billing_cache: HashMap<String, Option<SubscriptionStatus>> = HashMap::new();
        let mut issues = Vec::new();
        let mut skipped = 0usize;

        for member in &members {
            let Some(platform_user_id) = member.platform_user_id.as_deref() else {
                continue;
            };

            let roles = match self.platform.member_roles(platform_user_id).await {
                Ok(Some(roles)) => roles,
                Ok(None) => {
                    tracing::debug!(member_id = %member.id, user_id = %platform_user_id, "Member not in guild, skipping");
                    skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(member_id = %member.id, error = %e, "Failed to fetch platform roles, skipping member");
                    skipped += 1;
                    continue;
                }
            };

            let team = member.team_id.and_then(|id| teams.get(&id));
            let effective_status = member.effective_status(team);

            let Some((issue_type, description)) = classify(member, effective_status, &roles)
            else {
                continue;
            };

            let customer_ref = match team {
                Some(team) => Some(team.billing_customer_ref.as_str()),
                None => member.billing_customer_ref.as_deref(),
            };
            let billing_status = match customer_ref {
                Some(customer) => self.billing_status(customer, &mut billing_cache).await,
                None => None,
            };

            tracing::debug!(
                member_id = %member.id,
                issue = issue_type.as_str(),
                description = %description,
                "Drift detected"
            );

            issues.push(DriftIssue {
                issue_type,
                severity: issue_type.severity(),
                member_id: member.id,
                platform_user_id: platform_user_id.to_string(),
                display_name: member.display_name.clone(),
                description,
                billing_status,
                db_status: effective_status,
                platform_roles: roles,
                expected_role: member.expected_role(effective_status),
            });
        }

        tracing::info!(
            members = members.len(),
            issues = issues.len(),
            skipped = skipped,
            "Drift scan complete"
        );
        Ok(issues)
    }

    async fn billing_status(
        &self,
        customer_ref: &str,
        cache: &mut HashMap<String, Option<SubscriptionStatus>>,
    ) -> Option<SubscriptionStatus> {
        let billing = self.billing.as_ref()?;
        if let Some(cached) = cache.get(customer_ref) {
            return *cached;
        }
        let status = match billing.subscription_status(customer_ref).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(customer = %customer_ref, error = %e, "Billing status lookup failed");
                None
            }
        };
        cache.insert(customer_ref.to_string(), status);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{InMemoryPlatform, PlatformError, PlatformOp};
    use keepwarden_billing::{InMemoryStore, StaticStatusSource};
    use keepwarden_shared::SeatTier;
    use time::OffsetDateTime;

    fn member(user_id: &str, status: SubscriptionStatus) -> Member {
        Member {
            id: Uuid::new_v4(),
            display_name: user_id.to_string(),
            billing_customer_ref: Some(format!("cus_{}", user_id)),
            subscription_status: status,
            platform_user_id: Some(user_id.to_string()),
            intro_completed: true,
            is_in_debtor_state: false,
            payment_failed_at: None,
            grace_period_ends_at: None,
            immediate_notice_sent_at: None,
            seat_tier: SeatTier::Individual,
            team_id: None,
        }
    }

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_classify_table() {
        let active = member("a", SubscriptionStatus::Active);
        let cancelled = member("c", SubscriptionStatus::Cancelled);

        assert_eq!(classify(&active, SubscriptionStatus::Active, &roles(&["Lord"])), None);
        assert_eq!(
            classify(&active, SubscriptionStatus::Active, &roles(&["Other"])).map(|c| c.0),
            Some(IssueType::MissingAccess)
        );
        assert_eq!(
            classify(&active, SubscriptionStatus::Active, &roles(&["Knight"])).map(|c| c.0),
            Some(IssueType::RoleMismatch)
        );
        assert_eq!(
            classify(&active, SubscriptionStatus::Active, &roles(&["Lord", "Knight"])).map(|c| c.0),
            Some(IssueType::RoleMismatch)
        );
        assert_eq!(
            classify(&cancelled, SubscriptionStatus::Cancelled, &roles(&["Lord"])).map(|c| c.0),
            Some(IssueType::UnauthorizedAccess)
        );
        assert_eq!(classify(&cancelled, SubscriptionStatus::Cancelled, &roles(&[])), None);
    }

    #[test]
    fn test_classify_debtor_cases() {
        let mut debtor = member("d", SubscriptionStatus::PastDue);
        debtor.payment_failed_at = Some(OffsetDateTime::now_utc());
        debtor.is_in_debtor_state = true;

        assert_eq!(
            classify(&debtor, SubscriptionStatus::PastDue, &roles(&["Lord"])).map(|c| c.0),
            Some(IssueType::DebtorMismatch)
        );
        assert_eq!(
            classify(&debtor, SubscriptionStatus::PastDue, &roles(&[])).map(|c| c.0),
            Some(IssueType::DebtorMismatch)
        );
        assert_eq!(classify(&debtor, SubscriptionStatus::PastDue, &roles(&["Debtor"])), None);

        let recovered = member("r", SubscriptionStatus::Active);
        assert_eq!(
            classify(&recovered, SubscriptionStatus::Active, &roles(&["Debtor"])).map(|c| c.0),
            Some(IssueType::DebtorMismatch)
        );
    }

    #[test]
    fn test_grace_period_keeps_access() {
        let mut in_grace = member("g", SubscriptionStatus::PastDue);
        in_grace.payment_failed_at = Some(OffsetDateTime::now_utc());
        assert_eq!(classify(&in_grace, SubscriptionStatus::PastDue, &roles(&["Lord"])), None);

        let lapsed = member("l", SubscriptionStatus::PastDue);
        assert_eq!(
            classify(&lapsed, SubscriptionStatus::PastDue, &roles(&["Lord"])).map(|c| c.0),
            Some(IssueType::UnauthorizedAccess)
        );
    }

    #[test]
    fn test_severity_by_type() {
        assert_eq!(IssueType::MissingAccess.severity(), Severity::High);
        assert_eq!(IssueType::UnauthorizedAccess.severity(), Severity::High);
        assert_eq!(IssueType::RoleMismatch.severity(), Severity::Medium);
        assert_eq!(IssueType::DebtorMismatch.severity(), Severity::Low);
    }

    #[tokio::test]
    async fn test_detect_skips_absent_and_failed_members() {
        let store = Arc::new(InMemoryStore::new());
        let platform = Arc::new(InMemoryPlatform::new());

        let gone = member("gone", SubscriptionStatus::Active);
        let flaky = member("flaky", SubscriptionStatus::Cancelled);
        let unauthorized = member("bad", SubscriptionStatus::Cancelled);
        for m in [&gone, &flaky, &unauthorized] {
            store.insert_member(m.clone());
        }
        platform.add_member("flaky", &["Lord"]);
        platform.add_member("bad", &["Lord"]);
        platform.fail(
            PlatformOp::MemberRoles,
            Some("flaky"),
            None,
            None,
            PlatformError::Transport("timeout".to_string()),
        );

        let detector = DriftDetector::new(store, platform);
        let issues = detector.detect().await.unwrap();

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].member_id, unauthorized.id);
        assert_eq!(issues[0].issue_type, IssueType::UnauthorizedAccess);
        assert_eq!(issues[0].severity, Severity::High);
        assert_eq!(issues[0].billing_status, None);
    }

    #[tokio::test]
    async fn test_team_seat_uses_team_status() {
        let store = Arc::new(InMemoryStore::new());
        let platform = Arc::new(InMemoryPlatform::new());
        let team = Team {
            id: Uuid::new_v4(),
            name: "Orkney".to_string(),
            billing_customer_ref: "cus_team".to_string(),
            subscription_status: SubscriptionStatus::Cancelled,
            owner_seats: 1,
            team_seats: 2,
            payment_failed_at: None,
            grace_period_ends_at: None,
        };
        store.insert_team(team.clone());

        // Seat row still says ACTIVE but the team was cancelled
        let mut seat = member("seat", SubscriptionStatus::Active);
        seat.seat_tier = SeatTier::TeamMember;
        seat.team_id = Some(team.id);
        seat.billing_customer_ref = None;
        store.insert_member(seat.clone());
        platform.add_member("seat", &["Knight"]);

        let billing = Arc::new(StaticStatusSource::new());
        billing.set("cus_team", SubscriptionStatus::Cancelled);

        let issues = DriftDetector::new(store, platform)
            .with_billing_source(billing)
            .detect()
            .await
            .unwrap();

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, IssueType::UnauthorizedAccess);
        assert_eq!(issues[0].db_status, SubscriptionStatus::Cancelled);
        assert_eq!(issues[0].billing_status, Some(SubscriptionStatus::Cancelled));
    }
}
