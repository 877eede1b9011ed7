//! Stripe webhook verification and parsing
//!
//! Events are verified and parsed into the typed `stripe::Event`, then turned
//! into a [`BillingWebhook`] which the API layer dispatches to the
//! [`BillingFailureHandler`](crate::BillingFailureHandler) and the role task
//! queue.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Customer, Event, EventObject, EventType, Expandable, Invoice, Webhook};
use subtle::ConstantTimeEq;

use crate::billing_failure::PaymentFailedEvent;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Identifying fields of a verified event, for logs and the HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub id: String,
    pub event_type: String,
    pub created: i64,
}

impl EventSummary {
    fn of(event: &Event) -> Self {
        Self {
            id: event.id.to_string(),
            event_type: event_type_name(event.type_),
            created: event.created,
        }
    }
}

/// The webhook events this system acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingWebhook {
    PaymentFailed(PaymentFailedEvent),
    PaymentSucceeded {
        customer_ref: String,
        billing_reason: Option<String>,
    },
    SubscriptionCancelled {
        customer_ref: String,
    },
    Unhandled {
        event_type: String,
    },
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify the `Stripe-Signature` header and parse the event
    pub fn verify_and_parse(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<(EventSummary, BillingWebhook)> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let event = self.verify_event(payload, signature, now)?;
        let webhook = classify(&event)?;
        Ok((EventSummary::of(&event), webhook))
    }

    /// `stripe::Webhook::construct_event` first. It only checks the last
    /// `v1` entry of the header, so a failure falls back to verifying every
    /// `v1` entry by hand before parsing.
    fn verify_event(&self, payload: &str, signature: &str, now_unix: i64) -> BillingResult<Event> {
        match Webhook::construct_event_with_timestamp(payload, signature, &self.secret, now_unix) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature(payload, signature, &self.secret, now_unix)?;
        parse_event(payload)
    }
}

/// Check a `t=<ts>,v1=<hex>[,v1=<hex>...]` header against the payload
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in Stripe-Signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in Stripe-Signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = sign(payload, secret, timestamp)?;
    let matched = signatures
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn sign(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn parse_event(payload: &str) -> BillingResult<Event> {
    serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::WebhookPayload(e.to_string())
    })
}

/// Wire name of an event type, e.g. `invoice.paid`
pub fn event_type_name(event_type: EventType) -> String {
    // Display renders the serde name as a JSON string
    event_type.to_string().trim_matches('"').to_string()
}

fn customer_id(customer: &Expandable<Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(c) => c.id.to_string(),
    }
}

fn unexpected_object(event: &Event, expected: &str) -> BillingError {
    BillingError::WebhookPayload(format!(
        "{} event {} does not carry {}",
        event_type_name(event.type_),
        event.id,
        expected
    ))
}

fn invoice(event: &Event) -> BillingResult<&Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(unexpected_object(event, "an invoice")),
    }
}

fn invoice_customer(event: &Event, invoice: &Invoice) -> BillingResult<String> {
    invoice
        .customer
        .as_ref()
        .map(customer_id)
        .ok_or_else(|| unexpected_object(event, "a customer"))
}

pub fn classify(event: &Event) -> BillingResult<BillingWebhook> {
    let webhook = match event.type_ {
        EventType::InvoicePaymentFailed => {
            let invoice = invoice(event)?;
            BillingWebhook::PaymentFailed(PaymentFailedEvent {
                customer_ref: invoice_customer(event, invoice)?,
                billing_reason: invoice.billing_reason.map(|r| r.as_str().to_string()),
                invoice_id: Some(invoice.id.to_string()),
                attempt_count: invoice
                    .attempt_count
                    .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX)),
            })
        }
        EventType::InvoicePaid | EventType::InvoicePaymentSucceeded => {
            let invoice = invoice(event)?;
            BillingWebhook::PaymentSucceeded {
                customer_ref: invoice_customer(event, invoice)?,
                billing_reason: invoice.billing_reason.map(|r| r.as_str().to_string()),
            }
        }
        EventType::CustomerSubscriptionDeleted => match &event.data.object {
            EventObject::Subscription(subscription) => BillingWebhook::SubscriptionCancelled {
                customer_ref: customer_id(&subscription.customer),
            },
            _ => return Err(unexpected_object(event, "a subscription")),
        },
        other => BillingWebhook::Unhandled {
            event_type: event_type_name(other),
        },
    };
    Ok(webhook)
}
