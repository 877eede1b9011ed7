//! Observed billing status lookups
//!
//! The drift detector asks the payment processor for each member's current
//! subscription status. The result is informational: the relational store
//! stays authoritative for entitlement.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use keepwarden_shared::SubscriptionStatus;
use stripe::{
    CustomerId, ListSubscriptions, Subscription, SubscriptionStatus as StripeSubStatus,
    SubscriptionStatusFilter,
};

use crate::error::{BillingError, BillingResult};

#[async_trait]
pub trait BillingStatusSource: Send + Sync {
    async fn subscription_status(&self, customer_ref: &str) -> BillingResult<SubscriptionStatus>;
}

pub struct StripeStatusSource {
    client: stripe::Client,
}

impl StripeStatusSource {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }
}

pub fn map_stripe_status(status: &StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid | StripeSubStatus::Incomplete => {
            SubscriptionStatus::PastDue
        }
        StripeSubStatus::Canceled
        | StripeSubStatus::IncompleteExpired
        | StripeSubStatus::Paused => SubscriptionStatus::Cancelled,
    }
}

fn rank(status: SubscriptionStatus) -> u8 {
    match status {
        SubscriptionStatus::Active => 4,
        SubscriptionStatus::PastDue => 3,
        SubscriptionStatus::Trialing => 2,
        SubscriptionStatus::Cancelled => 1,
        SubscriptionStatus::None => 0,
    }
}

/// Collapse a customer's subscriptions into one status, preferring the
/// most entitled. No subscriptions at all means NONE.
pub fn summarize(statuses: impl IntoIterator<Item = SubscriptionStatus>) -> SubscriptionStatus {
    statuses
        .into_iter()
        .max_by_key(|s| rank(*s))
        .unwrap_or(SubscriptionStatus::None)
}

#[async_trait]
impl BillingStatusSource for StripeStatusSource {
    async fn subscription_status(&self, customer_ref: &str) -> BillingResult<SubscriptionStatus> {
        let customer_id = customer_ref
            .parse::<CustomerId>()
            .map_err(|e| BillingError::Stripe(format!("Invalid customer ID: {}", e)))?;

        let params = ListSubscriptions {
            customer: Some(customer_id),
            status: Some(SubscriptionStatusFilter::All),
            ..Default::default()
        };

        let subscriptions = Subscription::list(&self.client, &params).await?;
        let status = summarize(subscriptions.data.iter().map(|s| map_stripe_status(&s.status)));
        tracing::debug!(customer = %customer_ref, status = %status, "Fetched billing status");
        Ok(status)
    }
}

/// Fixed statuses by customer; customers not listed fail the lookup
#[derive(Default)]
pub struct StaticStatusSource {
    statuses: Mutex<HashMap<String, SubscriptionStatus>>,
}

impl StaticStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, customer_ref: &str, status: SubscriptionStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(customer_ref.to_string(), status);
        }
    }
}

#[async_trait]
impl BillingStatusSource for StaticStatusSource {
    async fn subscription_status(&self, customer_ref: &str) -> BillingResult<SubscriptionStatus> {
        self.statuses
            .lock()
            .map_err(|_| BillingError::Stripe("status map poisoned".to_string()))?
            .get(customer_ref)
            .copied()
            .ok_or_else(|| BillingError::Stripe(format!("no such customer: {}", customer_ref)))
    }
}
