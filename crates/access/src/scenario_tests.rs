//! End-to-end runs of the reconciliation pipeline against in-memory adapters

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keepwarden_billing::{
    BillingFailureHandler, FailureOutcome, InMemoryStore, PaymentFailedEvent,
};
use keepwarden_shared::flags::{AUTO_FIX_RECONCILIATION, DEFAULT_FLAG_TTL, MAINTENANCE_MODE};
use keepwarden_shared::{FlagCache, ManagedRole, Member, SeatTier, StaticFlagSource, SubscriptionStatus};
use uuid::Uuid;

use crate::autofix::AutoFixer;
use crate::drift::{DriftDetector, IssueType, Severity};
use crate::error::AccessResult;
use crate::notify::PlatformMemberNotifier;
use crate::platform::InMemoryPlatform;
use crate::reconcile::{AdminNotifier, Reconciler, ScheduledRun, SkipReason};
use crate::roles::RoleAssignmentService;

#[derive(Default)]
struct RecordingAdmins {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingAdmins {
    fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdminNotifier for RecordingAdmins {
    async fn notify_admins(&self, subject: &str, body: &str) -> AccessResult<()> {
        self.reports
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    platform: Arc<InMemoryPlatform>,
    admins: Arc<RecordingAdmins>,
    reconciler: Reconciler,
}

fn harness(flags: &[(&str, bool)]) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let platform = Arc::new(InMemoryPlatform::new());
    let admins = Arc::new(RecordingAdmins::default());
    let roles = Arc::new(RoleAssignmentService::new(platform.clone(), store.clone()));

    let reconciler = Reconciler::new(
        DriftDetector::new(store.clone(), platform.clone()),
        AutoFixer::new(store.clone(), roles),
        FlagCache::new(Arc::new(StaticFlagSource::new(flags)), DEFAULT_FLAG_TTL),
        admins.clone(),
    )
    .with_pause_check(Arc::new(|| false));

    Harness {
        store,
        platform,
        admins,
        reconciler,
    }
}

fn member(user_id: &str, status: SubscriptionStatus, intro: bool) -> Member {
    Member {
        id: Uuid::new_v4(),
        display_name: format!("{}-name", user_id),
        billing_customer_ref: Some(format!("cus_{}", user_id)),
        subscription_status: status,
        platform_user_id: Some(user_id.to_string()),
        intro_completed: intro,
        is_in_debtor_state: false,
        payment_failed_at: None,
        grace_period_ends_at: None,
        immediate_notice_sent_at: None,
        seat_tier: SeatTier::Individual,
        team_id: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_lord_is_stripped() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    let lapsed = member("percival", SubscriptionStatus::Cancelled, true);
    h.store.insert_member(lapsed.clone());
    h.platform.add_member("percival", &["Lord", "Artist"]);

    let result = h.reconciler.run_manual().await.unwrap();

    assert_eq!(result.issues_found, 1);
    assert_eq!(result.issues[0].issue_type, IssueType::UnauthorizedAccess);
    assert_eq!(result.issues[0].severity, Severity::High);
    assert_eq!(result.issues_fixed, 1);
    assert!(h.platform.managed_roles("percival").is_empty());
    // Roles outside the managed set are left alone
    assert_eq!(h.platform.roles("percival"), Some(vec!["Artist".to_string()]));

    let reports = h.admins.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].0.contains("1 issue found"));
    assert!(reports[0].1.contains("UNAUTHORIZED_ACCESS (1)"));
    assert!(result.notified);
}

#[tokio::test(start_paused = true)]
async fn test_new_member_without_intro_gets_squire() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    h.store
        .insert_member(member("galahad", SubscriptionStatus::Active, false));
    h.platform.add_member("galahad", &[]);

    let result = h.reconciler.run_manual().await.unwrap();

    assert_eq!(result.issues_found, 1);
    assert_eq!(result.issues[0].issue_type, IssueType::MissingAccess);
    assert_eq!(result.issues[0].expected_role, Some(ManagedRole::Squire));
    assert_eq!(h.platform.managed_roles("galahad"), vec![ManagedRole::Squire]);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_is_clean() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    h.store
        .insert_member(member("bors", SubscriptionStatus::Cancelled, true));
    h.store
        .insert_member(member("kay", SubscriptionStatus::Active, true));
    h.store
        .insert_member(member("tristan", SubscriptionStatus::Active, false));
    h.platform.add_member("bors", &["Knight"]);
    h.platform.add_member("kay", &["Squire"]);
    h.platform.add_member("tristan", &[]);

    let first = h.reconciler.run_manual().await.unwrap();
    assert_eq!(first.issues_found, 3);
    assert_eq!(first.issues_fixed, 3);

    h.platform.clear_calls();
    let second = h.reconciler.run_manual().await.unwrap();
    assert_eq!(second.issues_found, 0);
    assert!(h.platform.role_mutations().is_empty());
    assert_eq!(h.admins.reports().len(), 1);
}

#[tokio::test]
async fn test_clean_run_sends_no_report() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    h.store
        .insert_member(member("kay", SubscriptionStatus::Active, true));
    h.platform.add_member("kay", &["Lord"]);

    let result = h.reconciler.run_manual().await.unwrap();

    assert_eq!(result.issues_found, 0);
    assert!(!result.notified);
    assert!(h.admins.reports().is_empty());
}

#[tokio::test]
async fn test_auto_fix_disabled_reports_only() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, false)]);
    h.store
        .insert_member(member("mordred", SubscriptionStatus::Cancelled, true));
    h.platform.add_member("mordred", &["Lord"]);

    let result = h.reconciler.run_manual().await.unwrap();

    assert_eq!(result.issues_found, 1);
    assert_eq!(result.issues_fixed, 0);
    assert!(!result.auto_fix_enabled);
    assert!(h.platform.role_mutations().is_empty());
    assert_eq!(h.platform.managed_roles("mordred"), vec![ManagedRole::Lord]);
    assert!(h.admins.reports()[0].1.contains("Auto-fix disabled"));
}

#[tokio::test]
async fn test_pause_override_skips_scheduled_run() {
    let mut h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    h.reconciler = h.reconciler.with_pause_check(Arc::new(|| true));
    h.store
        .insert_member(member("mordred", SubscriptionStatus::Cancelled, true));
    h.platform.add_member("mordred", &["Lord"]);

    let run = h.reconciler.run_scheduled().await.unwrap();

    assert!(matches!(run, ScheduledRun::Skipped(SkipReason::Paused)));
    assert!(h.platform.calls().is_empty());
    assert!(h.admins.reports().is_empty());
}

#[tokio::test]
async fn test_maintenance_mode_skips_scheduled_run() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, true), (MAINTENANCE_MODE, true)]);
    h.store
        .insert_member(member("mordred", SubscriptionStatus::Cancelled, true));
    h.platform.add_member("mordred", &["Lord"]);

    let run = h.reconciler.run_scheduled().await.unwrap();

    assert!(matches!(
        run,
        ScheduledRun::Skipped(SkipReason::MaintenanceMode)
    ));
    assert!(h.platform.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_manual_run_ignores_pause() {
    let mut h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    h.reconciler = h.reconciler.with_pause_check(Arc::new(|| true));
    h.store
        .insert_member(member("mordred", SubscriptionStatus::Cancelled, true));
    h.platform.add_member("mordred", &["Lord"]);

    let result = h.reconciler.run_manual().await.unwrap();

    assert_eq!(result.issues_fixed, 1);
    assert!(h.platform.managed_roles("mordred").is_empty());
}

#[tokio::test]
async fn test_initial_checkout_failure_changes_nothing() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    let newcomer = member("gareth", SubscriptionStatus::Active, true);
    h.store.insert_member(newcomer.clone());
    h.platform.add_member("gareth", &["Lord"]);

    let billing = BillingFailureHandler::new(
        h.store.clone(),
        Arc::new(PlatformMemberNotifier::new(h.platform.clone())),
    );
    let outcome = billing
        .handle_payment_failed(&PaymentFailedEvent {
            customer_ref: "cus_gareth".to_string(),
            billing_reason: Some("subscription_create".to_string()),
            invoice_id: Some("in_1".to_string()),
            attempt_count: 1,
        })
        .await
        .unwrap();

    assert!(matches!(outcome, FailureOutcome::Ignored { .. }));
    assert_eq!(h.store.member(newcomer.id), Some(newcomer));
    assert!(h.platform.messages_to("gareth").is_empty());
    assert!(h.store.audit_entries().is_empty());
}

#[tokio::test]
async fn test_member_in_grace_keeps_role() {
    let h = harness(&[(AUTO_FIX_RECONCILIATION, true)]);
    let late = member("lamorak", SubscriptionStatus::Active, true);
    h.store.insert_member(late.clone());
    h.platform.add_member("lamorak", &["Lord"]);

    let billing = BillingFailureHandler::new(
        h.store.clone(),
        Arc::new(PlatformMemberNotifier::new(h.platform.clone())),
    );
    let outcome = billing
        .handle_payment_failed(&PaymentFailedEvent {
            customer_ref: "cus_lamorak".to_string(),
            billing_reason: Some("subscription_cycle".to_string()),
            invoice_id: Some("in_2".to_string()),
            attempt_count: 1,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, FailureOutcome::GraceStarted { .. }));
    assert_eq!(h.platform.messages_to("lamorak").len(), 1);

    let result = h.reconciler.run_manual().await.unwrap();
    assert_eq!(result.issues_found, 0);
    assert_eq!(h.platform.managed_roles("lamorak"), vec![ManagedRole::Lord]);
}
