// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Keepwarden Billing Module
//!
//! Owns the billing side of membership state.
//!
//! ## Features
//!
//! - **Membership Store**: Postgres and in-memory adapters behind one port
//! - **Grace Periods**: Payment-failure state machine with a 48 hour grace window
//! - **Audit Log**: Append-only record of every transition and corrective action
//! - **Webhooks**: Stripe signature verification and event parsing
//! - **Status Lookups**: Stripe subscription status for drift detection
//! - **Email**: Plain-text admin reports via Resend

pub mod audit;
pub mod billing_failure;
pub mod email;
pub mod error;
pub mod store;
pub mod stripe_status;
pub mod webhooks;

pub use audit::{
    AuditAction, AuditEntry, EntityType, PERFORMED_BY_BILLING_WEBHOOK, PERFORMED_BY_CLAIM,
    PERFORMED_BY_GRACE_EXPIRY, PERFORMED_BY_RECONCILIATION,
};
pub use billing_failure::{
    BillingFailureHandler, FailureOutcome, MemberNotifier, PaymentFailedEvent, TransitionOutcome,
    RENEWAL_BILLING_REASON,
};
pub use email::EmailService;
pub use error::{BillingError, BillingResult};
pub use store::{InMemoryStore, MembershipStore, PgMembershipStore};
pub use stripe_status::{BillingStatusSource, StaticStatusSource, StripeStatusSource};
pub use webhooks::{BillingWebhook, EventSummary, WebhookVerifier};
