//! Retrying role-mutation primitives
//!
//! Every operation reports success as a `bool`. Exhausted retries are logged
//! here and never surface as errors, so callers on background tasks can fire
//! and forget. Only transient platform failures are retried.
//!
//! Callers that must stay under the platform's mutation quota pass a
//! [`MutationBudget`]; every add or remove attempt, retries included, takes
//! one slot from it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keepwarden_billing::{
    AuditAction, AuditEntry, MembershipStore, PERFORMED_BY_BILLING_WEBHOOK,
};
use keepwarden_shared::{ManagedRole, SubscriptionStatus};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::platform::{PlatformClient, PlatformError};

const FAREWELL_MESSAGE: &str = "Your membership has ended and your access to the community has been removed. \
     Thank you for being part of it. You are welcome back any time.";

/// Attempt budget and backoff bounds for one platform call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: usize, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            min_delay,
            max_delay,
        }
    }

    /// Five attempts, 1s doubling up to 30s
    pub const fn standard() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Reconciliation fixes: two attempts, 1s apart
    pub const fn fix() -> Self {
        Self::new(2, Duration::from_secs(1), Duration::from_secs(30))
    }

    pub const fn kick() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Delays between attempts: `min_delay`, doubling, capped at `max_delay`
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.min_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .take(self.attempts.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Sliding-window cap on role mutations shared by concurrent callers.
///
/// No window of length `window` ever holds more than `capacity` grants.
/// Waiters are served in arrival order.
pub struct MutationBudget {
    capacity: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl MutationBudget {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            grants: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Wait for a free slot and take it
    pub async fn acquire(&self) {
        let mut grants = self.grants.lock().await;
        if grants.len() >= self.capacity {
            if let Some(oldest) = grants.pop_front() {
                let free_at = oldest + self.window;
                if free_at > Instant::now() {
                    tracing::debug!(
                        wait_ms = (free_at - Instant::now()).as_millis() as u64,
                        "Role mutation budget exhausted, waiting"
                    );
                    tokio::time::sleep_until(free_at).await;
                }
            }
        }
        grants.push_back(Instant::now());
    }
}

/// What `remove_and_kick` managed to do on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KickOutcome {
    pub farewell_sent: bool,
    pub roles_removed: bool,
    pub kicked: bool,
    /// CANCELLED was written to the store
    pub status_recorded: bool,
}

pub struct RoleAssignmentService {
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn MembershipStore>,
    policy: RetryPolicy,
    kick_policy: RetryPolicy,
}

impl RoleAssignmentService {
    pub fn new(platform: Arc<dyn PlatformClient>, store: Arc<dyn MembershipStore>) -> Self {
        Self {
            platform,
            store,
            policy: RetryPolicy::standard(),
            kick_policy: RetryPolicy::kick(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn platform(&self) -> &Arc<dyn PlatformClient> {
        &self.platform
    }

    /// Run `action` under `policy`. Each attempt first takes a slot from
    /// `budget`, if given. A rate-limited attempt waits out the platform's
    /// `retry_after` (capped at `max_delay`) before the normal backoff.
    async fn retry<T, F, Fut>(
        policy: RetryPolicy,
        budget: Option<&MutationBudget>,
        mut action: F,
    ) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 0;
        RetryIf::spawn(
            policy.delays(),
            || {
                attempt += 1;
                let last = attempt >= policy.attempts;
                let call = action();
                async move {
                    if let Some(budget) = budget {
                        budget.acquire().await;
                    }
                    let result = call.await;
                    if let Err(PlatformError::RateLimited { retry_after_ms }) = &result {
                        if !last {
                            let wait = Duration::from_millis(*retry_after_ms).min(policy.max_delay);
                            tokio::time::sleep(wait).await;
                        }
                    }
                    result
                }
            },
            PlatformError::is_transient,
        )
        .await
    }

    pub async fn assign(&self, user_id: &str, role: ManagedRole) -> bool {
        self.assign_with(user_id, role, self.policy, None).await
    }

    pub async fn assign_with(
        &self,
        user_id: &str,
        role: ManagedRole,
        policy: RetryPolicy,
        budget: Option<&MutationBudget>,
    ) -> bool {
        match Self::retry(policy, budget, || self.platform.add_role(user_id, role)).await {
            Ok(()) => {
                tracing::info!(user_id = %user_id, role = %role, "Assigned managed role");
                true
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    role = %role,
                    attempts = policy.attempts,
                    error = %e,
                    "Failed to assign role after retries"
                );
                false
            }
        }
    }

    pub async fn remove(&self, user_id: &str, role: ManagedRole) -> bool {
        self.remove_with(user_id, role, self.policy, None).await
    }

    pub async fn remove_with(
        &self,
        user_id: &str,
        role: ManagedRole,
        policy: RetryPolicy,
        budget: Option<&MutationBudget>,
    ) -> bool {
        match Self::retry(policy, budget, || self.platform.remove_role(user_id, role)).await {
            Ok(()) => {
                tracing::info!(user_id = %user_id, role = %role, "Removed managed role");
                true
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    role = %role,
                    attempts = policy.attempts,
                    error = %e,
                    "Failed to remove role after retries"
                );
                false
            }
        }
    }

    /// Managed roles the user currently holds; `Some(vec![])` if not in the guild
    async fn held_roles(&self, user_id: &str, policy: RetryPolicy) -> Option<Vec<ManagedRole>> {
        match Self::retry(policy, None, || self.platform.member_roles(user_id)).await {
            Ok(Some(roles)) => Some(ManagedRole::managed_in(&roles)),
            Ok(None) => {
                tracing::debug!(user_id = %user_id, "User not in guild, no roles to remove");
                Some(Vec::new())
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to fetch platform roles");
                None
            }
        }
    }

    /// Remove every managed role except `keep`
    pub async fn remove_managed(&self, user_id: &str, keep: Option<ManagedRole>) -> bool {
        self.remove_managed_with(user_id, keep, self.policy, None).await
    }

    pub async fn remove_managed_with(
        &self,
        user_id: &str,
        keep: Option<ManagedRole>,
        policy: RetryPolicy,
        budget: Option<&MutationBudget>,
    ) -> bool {
        let Some(held) = self.held_roles(user_id, policy).await else {
            return false;
        };

        let mut all_removed = true;
        for role in held.into_iter().filter(|r| Some(*r) != keep) {
            all_removed &= self.remove_with(user_id, role, policy, budget).await;
        }
        all_removed
    }

    /// Leave the user holding exactly `expected` (or nothing) among managed roles
    pub async fn apply_expected(
        &self,
        user_id: &str,
        expected: Option<ManagedRole>,
        policy: RetryPolicy,
        budget: Option<&MutationBudget>,
    ) -> bool {
        if !self.remove_managed_with(user_id, expected, policy, budget).await {
            return false;
        }
        match expected {
            Some(role) => self.assign_with(user_id, role, policy, budget).await,
            None => true,
        }
    }

    /// Remove `from`, then add `to`.
    ///
    /// A failed remove adds nothing. A failed add puts `from` back (best
    /// effort) so the user is not left without a managed role. Either
    /// failure reports `false`.
    pub async fn swap(&self, user_id: &str, from: ManagedRole, to: ManagedRole) -> bool {
        if from == to {
            return self.assign(user_id, to).await;
        }

        if !self.remove(user_id, from).await {
            tracing::warn!(
                user_id = %user_id,
                from = %from,
                to = %to,
                "Swap aborted: old role could not be removed"
            );
            return false;
        }

        if self.assign(user_id, to).await {
            tracing::info!(user_id = %user_id, from = %from, to = %to, "Swapped managed role");
            return true;
        }

        let restored = self.assign(user_id, from).await;
        tracing::warn!(
            user_id = %user_id,
            from = %from,
            to = %to,
            restored = restored,
            "Swap failed: new role could not be added"
        );
        false
    }

    /// Farewell DM, strip managed roles, kick, and mark the membership CANCELLED.
    ///
    /// The status is written whatever the platform outcome.
    pub async fn remove_and_kick(&self, user_id: &str, member_id: Uuid) -> KickOutcome {
        let farewell_sent = match self.platform.send_dm(user_id, FAREWELL_MESSAGE).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(user_id = %user_id, error = %e, "Farewell DM not delivered");
                false
            }
        };

        let roles_removed = self.remove_managed(user_id, None).await;

        let kicked = match Self::retry(self.kick_policy, None, || {
            self.platform.kick(user_id, "Membership cancelled")
        })
        .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    member_id = %member_id,
                    error = %e,
                    "Failed to kick member after retries"
                );
                false
            }
        };

        let audit = AuditEntry::member(AuditAction::MembershipCancelled, member_id)
            .details(serde_json::json!({
                "platform_user_id": user_id,
                "farewell_sent": farewell_sent,
                "roles_removed": roles_removed,
                "kicked": kicked,
            }))
            .performed_by(PERFORMED_BY_BILLING_WEBHOOK);

        let status_recorded = match self
            .store
            .set_member_status(member_id, SubscriptionStatus::Cancelled, audit)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(member_id = %member_id, error = %e, "Failed to record cancelled membership");
                false
            }
        };

        tracing::info!(
            user_id = %user_id,
            member_id = %member_id,
            kicked = kicked,
            roles_removed = roles_removed,
            "Member removed from community"
        );

        KickOutcome {
            farewell_sent,
            roles_removed,
            kicked,
            status_recorded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{InMemoryPlatform, PlatformOp};
    use keepwarden_billing::InMemoryStore;
    use keepwarden_shared::{Member, SeatTier};

    fn transient() -> PlatformError {
        PlatformError::Server {
            status: 503,
            body: "unavailable".to_string(),
        }
    }

    fn setup() -> (Arc<InMemoryPlatform>, Arc<InMemoryStore>, RoleAssignmentService) {
        let platform = Arc::new(InMemoryPlatform::new());
        let store = Arc::new(InMemoryStore::new());
        let service = RoleAssignmentService::new(platform.clone(), store.clone());
        (platform, store, service)
    }

    fn member(user_id: &str) -> Member {
        Member {
            id: Uuid::new_v4(),
            display_name: "Percival".to_string(),
            billing_customer_ref: Some("cus_p".to_string()),
            subscription_status: SubscriptionStatus::Active,
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

    #[test]
    fn test_policy_delays() {
        let delays: Vec<Duration> = RetryPolicy::standard().delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
        let fix: Vec<Duration> = RetryPolicy::fix().delays().collect();
        assert_eq!(fix, vec![Duration::from_secs(1)]);

        let capped: Vec<Duration> =
            RetryPolicy::new(8, Duration::from_secs(1), Duration::from_secs(30))
                .delays()
                .collect();
        assert_eq!(capped.last(), Some(&Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_spaces_grants_by_window() {
        let budget = MutationBudget::new(2, Duration::from_secs(2));
        let start = Instant::now();
        let mut granted = Vec::new();
        for _ in 0..5 {
            budget.acquire().await;
            granted.push(start.elapsed());
        }
        assert_eq!(
            granted,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_budgeted_calls_include_retries() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &["Knight"]);
        platform.fail(PlatformOp::AddRole, Some("u1"), None, Some(1), transient());
        let budget = MutationBudget::new(2, Duration::from_secs(10));

        let start = Instant::now();
        assert!(
            service
                .apply_expected("u1", Some(ManagedRole::Lord), RetryPolicy::fix(), Some(&budget))
                .await
        );

        // remove, failed add, then the retried add waits for the window
        let calls = platform.role_mutations();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].at - start >= Duration::from_secs(10));
        assert_eq!(platform.managed_roles("u1"), vec![ManagedRole::Lord]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_attempt_waits_for_retry_after() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &[]);
        platform.fail(
            PlatformOp::AddRole,
            Some("u1"),
            None,
            Some(1),
            PlatformError::RateLimited {
                retry_after_ms: 5_000,
            },
        );

        assert!(service.assign("u1", ManagedRole::Squire).await);

        let calls = platform.role_mutations();
        assert_eq!(calls.len(), 2);
        // retry_after plus the first 1s backoff step
        let gap = calls[1].at - calls[0].at;
        assert!(gap >= Duration::from_secs(6) && gap < Duration::from_millis(6100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_capped_at_max_delay() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &[]);
        platform.fail(
            PlatformOp::AddRole,
            Some("u1"),
            None,
            Some(1),
            PlatformError::RateLimited {
                retry_after_ms: 600_000,
            },
        );

        assert!(service.assign("u1", ManagedRole::Squire).await);
        let calls = platform.role_mutations();
        let gap = calls[1].at - calls[0].at;
        assert!(gap >= Duration::from_secs(31) && gap < Duration::from_millis(31_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_assign_retries_transient_failures() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &[]);
        platform.fail(PlatformOp::AddRole, Some("u1"), None, Some(2), transient());

        assert!(service.assign("u1", ManagedRole::Lord).await);

        let calls = platform.role_mutations();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1].at - calls[0].at;
        let second_gap = calls[2].at - calls[1].at;
        assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));
        assert_eq!(platform.managed_roles("u1"), vec![ManagedRole::Lord]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assign_gives_up_after_five_attempts() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &[]);
        platform.fail(PlatformOp::AddRole, None, None, None, transient());

        assert!(!service.assign("u1", ManagedRole::Lord).await);
        assert_eq!(platform.role_mutations().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let (platform, _store, service) = setup();
        assert!(!service.assign("ghost", ManagedRole::Squire).await);
        assert_eq!(platform.role_mutations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_does_not_grant_when_remove_fails() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &["Lord"]);
        platform.fail(
            PlatformOp::RemoveRole,
            Some("u1"),
            Some(ManagedRole::Lord),
            None,
            transient(),
        );

        assert!(!service.swap("u1", ManagedRole::Lord, ManagedRole::Debtor).await);
        assert_eq!(platform.managed_roles("u1"), vec![ManagedRole::Lord]);
        assert!(platform
            .calls()
            .iter()
            .all(|c| c.op != PlatformOp::AddRole));
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_restores_old_role_when_add_fails() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &["Lord"]);
        platform.fail(
            PlatformOp::AddRole,
            Some("u1"),
            Some(ManagedRole::Debtor),
            None,
            transient(),
        );

        assert!(!service.swap("u1", ManagedRole::Lord, ManagedRole::Debtor).await);
        assert_eq!(platform.managed_roles("u1"), vec![ManagedRole::Lord]);
    }

    #[tokio::test]
    async fn test_swap_success() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &["Lord", "Events"]);

        assert!(service.swap("u1", ManagedRole::Lord, ManagedRole::Debtor).await);
        assert_eq!(platform.managed_roles("u1"), vec![ManagedRole::Debtor]);
        assert!(platform.roles("u1").unwrap().contains(&"Events".to_string()));
    }

    #[tokio::test]
    async fn test_remove_managed_keeps_target_and_foreign_roles() {
        let (platform, _store, service) = setup();
        platform.add_member("u1", &["Lord", "Knight", "Moderator"]);

        assert!(service.remove_managed("u1", Some(ManagedRole::Lord)).await);
        let roles = platform.roles("u1").unwrap();
        assert_eq!(roles, vec!["Lord".to_string(), "Moderator".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_managed_for_absent_user_is_noop() {
        let (platform, _store, service) = setup();
        assert!(service.remove_managed("gone", None).await);
        assert!(platform.role_mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_kick_records_cancellation_when_kick_fails() {
        let (platform, store, service) = setup();
        let m = member("u9");
        store.insert_member(m.clone());
        platform.add_member("u9", &["Lord"]);
        platform.fail(PlatformOp::SendDm, None, None, None, transient());
        platform.fail(PlatformOp::Kick, None, None, None, transient());

        let outcome = service.remove_and_kick("u9", m.id).await;

        assert!(!outcome.farewell_sent);
        assert!(outcome.roles_removed);
        assert!(!outcome.kicked);
        assert!(outcome.status_recorded);
        let kicks = platform
            .calls()
            .iter()
            .filter(|c| c.op == PlatformOp::Kick)
            .count();
        assert_eq!(kicks, 3);
        assert_eq!(
            store.member(m.id).unwrap().subscription_status,
            SubscriptionStatus::Cancelled
        );
        assert!(platform.managed_roles("u9").is_empty());
        let audit = store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::MembershipCancelled);
    }

    #[tokio::test]
    async fn test_remove_and_kick_happy_path() {
        let (platform, store, service) = setup();
        let m = member("u7");
        store.insert_member(m.clone());
        platform.add_member("u7", &["Knight"]);

        let outcome = service.remove_and_kick("u7", m.id).await;

        assert!(outcome.farewell_sent && outcome.kicked && outcome.status_recorded);
        assert_eq!(platform.kicked(), vec!["u7".to_string()]);
        assert_eq!(platform.messages_to("u7").len(), 1);
    }
}
