//! Payment-failure grace period state machine
//!
//! ```text
//! CURRENT --renewal failure--> GRACE --grace expired--> RESTRICTED --> CANCELLED
//!    ^                           |                          |
//!    +--------recovery-----------+--------------------------+
//! ```
//!
//! GRACE keeps full access for 48 hours. RESTRICTED sets the debtor flag so
//! the member is moved to the support-only role. The relational store holds
//! the state; notifications are sent only after the state change commits and
//! never roll it back.

use std::sync::Arc;

use async_trait::async_trait;
use keepwarden_shared::{GraceWindow, Member, SubscriptionStatus, Team};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, EntityType, PERFORMED_BY_GRACE_EXPIRY};
use crate::error::BillingResult;
use crate::store::MembershipStore;

/// Stripe's billing reason for a scheduled renewal charge
pub const RENEWAL_BILLING_REASON: &str = "subscription_cycle";

/// An `invoice.payment_failed` event, stripped to what the state machine needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailedEvent {
    pub customer_ref: String,
    pub billing_reason: Option<String>,
    pub invoice_id: Option<String>,
    pub attempt_count: u32,
}

impl PaymentFailedEvent {
    pub fn is_renewal(&self) -> bool {
        self.billing_reason.as_deref() == Some(RENEWAL_BILLING_REASON)
    }
}

/// Direct-message notifications to affected members
#[async_trait]
pub trait MemberNotifier: Send + Sync {
    /// Immediate notice when a grace period starts
    async fn payment_failed(&self, member: &Member, grace_ends_at: OffsetDateTime)
        -> BillingResult<()>;

    /// Notice when the grace period expired and access was restricted
    async fn access_restricted(&self, member: &Member) -> BillingResult<()>;
}

/// Result of handling a payment failure
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Not a renewal failure (e.g. initial checkout); nothing changed
    Ignored { billing_reason: Option<String> },
    /// No team or member matches the customer
    UnknownCustomer,
    /// A grace period is already running; the timer was not reset
    AlreadyInGrace { payment_failed_at: OffsetDateTime },
    GraceStarted {
        entity_type: EntityType,
        entity_id: Uuid,
        window: GraceWindow,
        /// Rows that entered grace (one for individuals, every seat for teams)
        members: Vec<Member>,
        notified: usize,
    },
}

/// Result of a recovery or cancellation
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    UnknownCustomer,
    Unchanged,
    Applied { members: Vec<Member> },
}

impl TransitionOutcome {
    pub fn members(&self) -> &[Member] {
        match self {
            TransitionOutcome::Applied { members } => members,
            _ => &[],
        }
    }
}

enum Customer {
    Team(Team),
    Individual(Member),
}

pub struct BillingFailureHandler {
    store: Arc<dyn MembershipStore>,
    notifier: Arc<dyn MemberNotifier>,
}

impl BillingFailureHandler {
    pub fn new(store: Arc<dyn MembershipStore>, notifier: Arc<dyn MemberNotifier>) -> Self {
        Self { store, notifier }
    }

    async fn resolve_customer(&self, customer_ref: &str) -> BillingResult<Option<Customer>> {
        if let Some(team) = self.store.find_team_by_customer(customer_ref).await? {
            return Ok(Some(Customer::Team(team)));
        }
        Ok(self
            .store
            .find_member_by_customer(customer_ref)
            .await?
            .map(Customer::Individual))
    }

    pub async fn handle_payment_failed(
        &self,
        event: &PaymentFailedEvent,
    ) -> BillingResult<FailureOutcome> {
        self.handle_payment_failed_at(event, OffsetDateTime::now_utc())
            .await
    }

    /// CURRENT -> GRACE
    pub async fn handle_payment_failed_at(
        &self,
        event: &PaymentFailedEvent,
        now: OffsetDateTime,
    ) -> BillingResult<FailureOutcome> {
        if !event.is_renewal() {
            tracing::info!(
                customer = %event.customer_ref,
                billing_reason = ?event.billing_reason,
                "Ignoring payment failure that is not a subscription renewal"
            );
            return Ok(FailureOutcome::Ignored {
                billing_reason: event.billing_reason.clone(),
            });
        }

        let Some(customer) = self.resolve_customer(&event.customer_ref).await? else {
            tracing::warn!(
                customer = %event.customer_ref,
                "Payment failed for unknown customer - no team or member matches"
            );
            return Ok(FailureOutcome::UnknownCustomer);
        };

        let window = GraceWindow::starting_at(now);
        let details = serde_json::json!({
            "customer": event.customer_ref,
            "invoice_id": event.invoice_id,
            "attempt_count": event.attempt_count,
            "grace_period_ends_at": window.ends_at.to_string(),
        });

        let (entity_type, entity_id, members) = match customer {
            Customer::Team(team) => {
                if let Some(payment_failed_at) = team.payment_failed_at {
                    tracing::info!(
                        team_id = %team.id,
                        payment_failed_at = %payment_failed_at,
                        attempt_count = event.attempt_count,
                        "Team already in grace period - duplicate or retry notification"
                    );
                    return Ok(FailureOutcome::AlreadyInGrace { payment_failed_at });
                }

                let audit = AuditEntry::team(AuditAction::GracePeriodStarted, team.id)
                    .details(details)
                    .at(now);
                match self.store.start_team_grace(team.id, window, audit).await? {
                    Some(members) => (EntityType::Team, team.id, members),
                    None => return self.already_in_grace_team(team.id).await,
                }
            }
            Customer::Individual(member) => {
                if let Some(payment_failed_at) = member.payment_failed_at {
                    tracing::info!(
                        member_id = %member.id,
                        payment_failed_at = %payment_failed_at,
                        attempt_count = event.attempt_count,
                        "Member already in grace period - duplicate or retry notification"
                    );
                    return Ok(FailureOutcome::AlreadyInGrace { payment_failed_at });
                }

                let audit = AuditEntry::member(AuditAction::GracePeriodStarted, member.id)
                    .details(details)
                    .at(now);
                match self.store.start_member_grace(member.id, window, audit).await? {
                    Some(updated) => (EntityType::Member, member.id, vec![updated]),
                    None => return self.already_in_grace_member(member.id).await,
                }
            }
        };

        tracing::warn!(
            entity_type = entity_type.as_str(),
            entity_id = %entity_id,
            members = members.len(),
            grace_period_ends_at = %window.ends_at,
            "Renewal payment failed - grace period started"
        );

        // Committed; notify outside the transaction
        let notified = self.notify_payment_failed(&members, window.ends_at).await;

        Ok(FailureOutcome::GraceStarted {
            entity_type,
            entity_id,
            window,
            members,
            notified,
        })
    }

    // A concurrent delivery opened the episode between our read and the update
    async fn already_in_grace_team(&self, team_id: Uuid) -> BillingResult<FailureOutcome> {
        let team = self.store.get_team(team_id).await?;
        tracing::info!(team_id = %team_id, "Concurrent payment failure delivery already opened grace period");
        Ok(FailureOutcome::AlreadyInGrace {
            payment_failed_at: team
                .and_then(|t| t.payment_failed_at)
                .unwrap_or_else(OffsetDateTime::now_utc),
        })
    }

    async fn already_in_grace_member(&self, member_id: Uuid) -> BillingResult<FailureOutcome> {
        let member = self.store.get_member(member_id).await?;
        tracing::info!(member_id = %member_id, "Concurrent payment failure delivery already opened grace period");
        Ok(FailureOutcome::AlreadyInGrace {
            payment_failed_at: member
                .and_then(|m| m.payment_failed_at)
                .unwrap_or_else(OffsetDateTime::now_utc),
        })
    }

    async fn notify_payment_failed(&self, members: &[Member], grace_ends_at: OffsetDateTime) -> usize {
        let mut notified = 0;
        for member in members.iter().filter(|m| m.is_platform_linked()) {
            match self.notifier.payment_failed(member, grace_ends_at).await {
                Ok(()) => notified += 1,
                Err(e) => {
                    tracing::warn!(
                        member_id = %member.id,
                        error = %e,
                        "Failed to send payment failed notification"
                    );
                }
            }
        }
        notified
    }

    /// GRACE/RESTRICTED -> CURRENT
    pub async fn handle_payment_recovered(
        &self,
        customer_ref: &str,
    ) -> BillingResult<TransitionOutcome> {
        let Some(customer) = self.resolve_customer(customer_ref).await? else {
            tracing::warn!(customer = %customer_ref, "Payment recovered for unknown customer");
            return Ok(TransitionOutcome::UnknownCustomer);
        };

        match customer {
            Customer::Team(team) => {
                if team.payment_failed_at.is_none()
                    && team.subscription_status == SubscriptionStatus::Active
                {
                    return Ok(TransitionOutcome::Unchanged);
                }
                let audit = AuditEntry::team(AuditAction::PaymentRecovered, team.id).details(
                    serde_json::json!({
                        "customer": customer_ref,
                        "previous_status": team.subscription_status,
                    }),
                );
                let members = self
                    .store
                    .close_team_episode(team.id, SubscriptionStatus::Active, audit)
                    .await?;
                tracing::info!(team_id = %team.id, members = members.len(), "Team payment recovered - grace period cleared");
                Ok(TransitionOutcome::Applied { members })
            }
            Customer::Individual(member) => {
                if !member.in_failure_episode()
                    && !member.is_in_debtor_state
                    && member.subscription_status == SubscriptionStatus::Active
                {
                    return Ok(TransitionOutcome::Unchanged);
                }
                let audit = AuditEntry::member(AuditAction::PaymentRecovered, member.id).details(
                    serde_json::json!({
                        "customer": customer_ref,
                        "previous_status": member.subscription_status,
                        "was_restricted": member.is_in_debtor_state,
                    }),
                );
                let updated = self
                    .store
                    .close_member_episode(member.id, SubscriptionStatus::Active, audit)
                    .await?;
                tracing::info!(member_id = %member.id, "Payment recovered - grace period cleared");
                Ok(TransitionOutcome::Applied {
                    members: vec![updated],
                })
            }
        }
    }

    /// Any state -> CANCELLED
    pub async fn handle_subscription_cancelled(
        &self,
        customer_ref: &str,
    ) -> BillingResult<TransitionOutcome> {
        let Some(customer) = self.resolve_customer(customer_ref).await? else {
            tracing::warn!(customer = %customer_ref, "Subscription cancelled for unknown customer");
            return Ok(TransitionOutcome::UnknownCustomer);
        };

        let members = match customer {
            Customer::Team(team) => {
                let audit = AuditEntry::team(AuditAction::SubscriptionCancelled, team.id)
                    .details(serde_json::json!({ "customer": customer_ref }));
                self.store
                    .close_team_episode(team.id, SubscriptionStatus::Cancelled, audit)
                    .await?
            }
            Customer::Individual(member) => {
                if member.subscription_status == SubscriptionStatus::Cancelled
                    && !member.in_failure_episode()
                {
                    return Ok(TransitionOutcome::Unchanged);
                }
                let audit = AuditEntry::member(AuditAction::SubscriptionCancelled, member.id)
                    .details(serde_json::json!({ "customer": customer_ref }));
                vec![
                    self.store
                        .close_member_episode(member.id, SubscriptionStatus::Cancelled, audit)
                        .await?,
                ]
            }
        };

        tracing::info!(customer = %customer_ref, members = members.len(), "Subscription cancelled");
        Ok(TransitionOutcome::Applied { members })
    }

    /// GRACE -> RESTRICTED for every member whose grace window ended before `now`.
    ///
    /// Returns the newly restricted members so the caller can move them to the
    /// Debtor role. Per-member failures are logged and skipped.
    pub async fn restrict_expired(&self, now: OffsetDateTime) -> BillingResult<Vec<Member>> {
        let expired = self.store.list_expired_grace(now).await?;
        let total = expired.len();
        let mut restricted = Vec::new();

        for member in expired {
            let audit = AuditEntry::member(AuditAction::AccessRestricted, member.id)
                .details(serde_json::json!({
                    "grace_period_ends_at": member.grace_period_ends_at.map(|t| t.to_string()),
                }))
                .performed_by(PERFORMED_BY_GRACE_EXPIRY)
                .at(now);

            match self.store.mark_debtor(member.id, audit).await {
                Ok(Some(updated)) => {
                    if updated.is_platform_linked() {
                        if let Err(e) = self.notifier.access_restricted(&updated).await {
                            tracing::warn!(member_id = %updated.id, error = %e, "Failed to send access restricted notification");
                        }
                    }
                    restricted.push(updated);
                }
                Ok(None) => {
                    tracing::debug!(member_id = %member.id, "Member no longer eligible for restriction");
                }
                Err(e) => {
                    tracing::error!(member_id = %member.id, error = %e, "Failed to restrict member after grace expiry");
                }
            }
        }

        tracing::info!(
            expired = total,
            restricted = restricted.len(),
            "Grace period expiry pass complete"
        );
        Ok(restricted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::store::InMemoryStore;
    use keepwarden_shared::SeatTier;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        failed: Mutex<Vec<Uuid>>,
        restricted: Mutex<Vec<Uuid>>,
        fail_for: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl MemberNotifier for RecordingNotifier {
        async fn payment_failed(&self, member: &Member, _ends: OffsetDateTime) -> BillingResult<()> {
            if self.fail_for.lock().unwrap().contains(&member.id) {
                return Err(BillingError::Notification("DMs blocked".to_string()));
            }
            self.failed.lock().unwrap().push(member.id);
            Ok(())
        }

        async fn access_restricted(&self, member: &Member) -> BillingResult<()> {
            self.restricted.lock().unwrap().push(member.id);
            Ok(())
        }
    }

    fn individual(customer: &str) -> Member {
        Member {
            id: Uuid::new_v4(),
            display_name: "Ada".to_string(),
            billing_customer_ref: Some(customer.to_string()),
            subscription_status: SubscriptionStatus::Active,
            platform_user_id: Some(format!("discord-{}", customer)),
            intro_completed: true,
            is_in_debtor_state: false,
            payment_failed_at: None,
            grace_period_ends_at: None,
            immediate_notice_sent_at: None,
            seat_tier: SeatTier::Individual,
            team_id: None,
        }
    }

    fn team(customer: &str) -> Team {
        Team {
            id: Uuid::new_v4(),
            name: "Round Table".to_string(),
            billing_customer_ref: customer.to_string(),
            subscription_status: SubscriptionStatus::Active,
            owner_seats: 1,
            team_seats: 3,
            payment_failed_at: None,
            grace_period_ends_at: None,
        }
    }

    fn seat(team: &Team, tier: SeatTier, n: usize) -> Member {
        Member {
            id: Uuid::new_v4(),
            display_name: format!("seat-{}", n),
            billing_customer_ref: None,
            subscription_status: SubscriptionStatus::Active,
            platform_user_id: Some(format!("discord-seat-{}", n)),
            intro_completed: true,
            is_in_debtor_state: false,
            payment_failed_at: None,
            grace_period_ends_at: None,
            immediate_notice_sent_at: None,
            seat_tier: tier,
            team_id: Some(team.id),
        }
    }

    fn failed(customer: &str, reason: &str) -> PaymentFailedEvent {
        PaymentFailedEvent {
            customer_ref: customer.to_string(),
            billing_reason: Some(reason.to_string()),
            invoice_id: Some("in_123".to_string()),
            attempt_count: 1,
        }
    }

    fn handler() -> (Arc<InMemoryStore>, Arc<RecordingNotifier>, BillingFailureHandler) {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = BillingFailureHandler::new(store.clone(), notifier.clone());
        (store, notifier, handler)
    }

    #[tokio::test]
    async fn test_initial_checkout_failure_is_noop() {
        let (store, notifier, handler) = handler();
        let member = individual("cus_new");
        store.insert_member(member.clone());

        let outcome = handler
            .handle_payment_failed(&failed("cus_new", "subscription_create"))
            .await
            .unwrap();

        assert!(matches!(outcome, FailureOutcome::Ignored { .. }));
        let stored = store.member(member.id).unwrap();
        assert!(stored.payment_failed_at.is_none());
        assert!(stored.grace_period_ends_at.is_none());
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert!(notifier.failed.lock().unwrap().is_empty());
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn test_renewal_failure_starts_grace() {
        let (store, notifier, handler) = handler();
        let member = individual("cus_1");
        store.insert_member(member.clone());
        let now = OffsetDateTime::now_utc();

        let outcome = handler
            .handle_payment_failed_at(&failed("cus_1", RENEWAL_BILLING_REASON), now)
            .await
            .unwrap();

        match outcome {
            FailureOutcome::GraceStarted { notified, window, .. } => {
                assert_eq!(notified, 1);
                assert_eq!(window.ends_at, now + time::Duration::hours(48));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let stored = store.member(member.id).unwrap();
        assert_eq!(stored.payment_failed_at, Some(now));
        assert_eq!(stored.grace_period_ends_at, Some(now + time::Duration::hours(48)));
        assert_eq!(stored.immediate_notice_sent_at, Some(now));
        assert_eq!(stored.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(store.audit_entries().len(), 1);
        assert_eq!(store.audit_entries()[0].action, AuditAction::GracePeriodStarted);
    }

    #[tokio::test]
    async fn test_second_failure_does_not_extend_grace() {
        let (store, _notifier, handler) = handler();
        let member = individual("cus_2");
        store.insert_member(member.clone());
        let first = OffsetDateTime::now_utc();

        handler
            .handle_payment_failed_at(&failed("cus_2", RENEWAL_BILLING_REASON), first)
            .await
            .unwrap();
        let ends_after_first = store.member(member.id).unwrap().grace_period_ends_at;

        let outcome = handler
            .handle_payment_failed_at(
                &failed("cus_2", RENEWAL_BILLING_REASON),
                first + time::Duration::hours(24),
            )
            .await
            .unwrap();

        assert_eq!(outcome, FailureOutcome::AlreadyInGrace { payment_failed_at: first });
        let stored = store.member(member.id).unwrap();
        assert_eq!(stored.grace_period_ends_at, ends_after_first);
        assert_eq!(stored.payment_failed_at, Some(first));
    }

    #[tokio::test]
    async fn test_team_failure_moves_every_seat() {
        let (store, notifier, handler) = handler();
        let t = team("cus_team");
        store.insert_team(t.clone());
        let seats: Vec<Member> = (0..4)
            .map(|n| seat(&t, if n == 0 { SeatTier::Owner } else { SeatTier::TeamMember }, n))
            .collect();
        for s in &seats {
            store.insert_member(s.clone());
        }

        let outcome = handler
            .handle_payment_failed(&failed("cus_team", RENEWAL_BILLING_REASON))
            .await
            .unwrap();

        let FailureOutcome::GraceStarted { members, notified, .. } = outcome else {
            panic!("expected grace to start");
        };
        assert_eq!(members.len(), 4);
        assert_eq!(notified, 4);
        assert!(store.team(t.id).unwrap().payment_failed_at.is_some());
        for s in &seats {
            let stored = store.member(s.id).unwrap();
            assert!(stored.payment_failed_at.is_some());
            assert_eq!(stored.subscription_status, SubscriptionStatus::PastDue);
        }
        assert_eq!(notifier.failed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_team_failure_is_all_or_nothing() {
        let (store, notifier, handler) = handler();
        let t = team("cus_atomic");
        store.insert_team(t.clone());
        let seats: Vec<Member> = (0..5).map(|n| seat(&t, SeatTier::TeamMember, n)).collect();
        for s in &seats {
            store.insert_member(s.clone());
        }
        store.fail_team_update_after(3);

        let result = handler
            .handle_payment_failed(&failed("cus_atomic", RENEWAL_BILLING_REASON))
            .await;
        assert!(result.is_err());

        let in_grace = seats
            .iter()
            .filter(|s| store.member(s.id).unwrap().payment_failed_at.is_some())
            .count();
        assert_eq!(in_grace, 0, "no partial subset may enter grace");
        assert!(store.team(t.id).unwrap().payment_failed_at.is_none());
        assert!(notifier.failed.lock().unwrap().is_empty());

        // The next delivery (fault cleared) applies to every seat
        handler
            .handle_payment_failed(&failed("cus_atomic", RENEWAL_BILLING_REASON))
            .await
            .unwrap();
        let in_grace = seats
            .iter()
            .filter(|s| store.member(s.id).unwrap().payment_failed_at.is_some())
            .count();
        assert_eq!(in_grace, seats.len());
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_state() {
        let (store, notifier, handler) = handler();
        let member = individual("cus_blocked");
        store.insert_member(member.clone());
        notifier.fail_for.lock().unwrap().push(member.id);

        let outcome = handler
            .handle_payment_failed(&failed("cus_blocked", RENEWAL_BILLING_REASON))
            .await
            .unwrap();

        let FailureOutcome::GraceStarted { notified, .. } = outcome else {
            panic!("expected grace to start");
        };
        assert_eq!(notified, 0);
        assert!(store.member(member.id).unwrap().payment_failed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_customer_is_noop() {
        let (_store, _notifier, handler) = handler();
        let outcome = handler
            .handle_payment_failed(&failed("cus_ghost", RENEWAL_BILLING_REASON))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::UnknownCustomer);
    }

    #[tokio::test]
    async fn test_recovery_clears_episode_and_allows_new_one() {
        let (store, _notifier, handler) = handler();
        let member = individual("cus_rec");
        store.insert_member(member.clone());
        let first = OffsetDateTime::now_utc();

        handler
            .handle_payment_failed_at(&failed("cus_rec", RENEWAL_BILLING_REASON), first)
            .await
            .unwrap();
        let outcome = handler.handle_payment_recovered("cus_rec").await.unwrap();
        assert_eq!(outcome.members().len(), 1);

        let stored = store.member(member.id).unwrap();
        assert!(stored.payment_failed_at.is_none());
        assert!(stored.grace_period_ends_at.is_none());
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);

        // Next month's failure opens a fresh episode
        let later = first + time::Duration::days(30);
        handler
            .handle_payment_failed_at(&failed("cus_rec", RENEWAL_BILLING_REASON), later)
            .await
            .unwrap();
        assert_eq!(store.member(member.id).unwrap().payment_failed_at, Some(later));
    }

    #[tokio::test]
    async fn test_recovery_without_episode_is_unchanged() {
        let (store, _notifier, handler) = handler();
        store.insert_member(individual("cus_fine"));
        let outcome = handler.handle_payment_recovered("cus_fine").await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn test_restrict_expired_sets_debtor() {
        let (store, notifier, handler) = handler();
        let member = individual("cus_late");
        store.insert_member(member.clone());
        let failed_at = OffsetDateTime::now_utc() - time::Duration::hours(50);

        handler
            .handle_payment_failed_at(&failed("cus_late", RENEWAL_BILLING_REASON), failed_at)
            .await
            .unwrap();

        let restricted = handler.restrict_expired(OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(restricted.len(), 1);
        assert!(store.member(member.id).unwrap().is_in_debtor_state);
        assert_eq!(notifier.restricted.lock().unwrap().as_slice(), &[member.id]);

        // Second pass finds nothing new
        let again = handler.restrict_expired(OffsetDateTime::now_utc()).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_restrict_expired_skips_open_grace() {
        let (store, _notifier, handler) = handler();
        let member = individual("cus_early");
        store.insert_member(member.clone());

        handler
            .handle_payment_failed(&failed("cus_early", RENEWAL_BILLING_REASON))
            .await
            .unwrap();

        let restricted = handler.restrict_expired(OffsetDateTime::now_utc()).await.unwrap();
        assert!(restricted.is_empty());
        assert!(!store.member(member.id).unwrap().is_in_debtor_state);
    }

    #[tokio::test]
    async fn test_cancellation_clears_debtor_state() {
        let (store, _notifier, handler) = handler();
        let mut member = individual("cus_gone");
        member.subscription_status = SubscriptionStatus::PastDue;
        member.payment_failed_at = Some(OffsetDateTime::now_utc());
        member.is_in_debtor_state = true;
        store.insert_member(member.clone());

        let outcome = handler.handle_subscription_cancelled("cus_gone").await.unwrap();
        assert_eq!(outcome.members().len(), 1);

        let stored = store.member(member.id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Cancelled);
        assert!(!stored.is_in_debtor_state);
        assert!(stored.payment_failed_at.is_none());
    }
}
