//! Stripe webhook ingress
//!
//! Database state is updated before the response is sent. Role changes are
//! handed to the task queue and run after the response.

use axum::{extract::State, http::HeaderMap, Json};
use keepwarden_access::RoleTask;
use keepwarden_billing::{BillingWebhook, FailureOutcome, RENEWAL_BILLING_REASON};
use keepwarden_shared::Member;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// POST /webhooks/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let verifier = state
        .webhook_verifier
        .as_ref()
        .ok_or(ApiError::ServiceUnavailable("webhook verification not configured"))?;

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation("Missing Stripe-Signature header".to_string()))?;

    let (event, webhook) = verifier.verify_and_parse(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Rejected Stripe webhook");
        ApiError::from(e)
    })?;

    tracing::info!(event_id = %event.id, event_type = %event.event_type, "Stripe webhook received");

    let queued = dispatch(&state, webhook).await?;

    Ok(Json(json!({
        "received": true,
        "event_id": event.id,
        "tasks_queued": queued,
    })))
}

/// Apply the billing transition, then queue role work. Returns the number of
/// tasks queued.
async fn dispatch(state: &AppState, webhook: BillingWebhook) -> ApiResult<usize> {
    let services = &state.services;

    match webhook {
        BillingWebhook::PaymentFailed(event) => {
            let outcome = services.billing.handle_payment_failed(&event).await?;
            match &outcome {
                FailureOutcome::GraceStarted {
                    entity_id,
                    members,
                    notified,
                    ..
                } => {
                    tracing::info!(
                        entity_id = %entity_id,
                        members = members.len(),
                        notified = notified,
                        "Grace period started from webhook"
                    );
                }
                other => tracing::debug!(outcome = ?other, "Payment failure required no transition"),
            }
            Ok(0)
        }
        BillingWebhook::PaymentSucceeded {
            customer_ref,
            billing_reason,
        } => {
            if billing_reason.as_deref() != Some(RENEWAL_BILLING_REASON) {
                tracing::debug!(customer = %customer_ref, billing_reason = ?billing_reason, "Ignoring paid invoice that is not a renewal");
                return Ok(0);
            }
            let outcome = services
                .billing
                .handle_payment_recovered(&customer_ref)
                .await?;
            Ok(queue_for(state, outcome.members(), |member, _| {
                RoleTask::RestoreAccess {
                    member_id: member.id,
                }
            }))
        }
        BillingWebhook::SubscriptionCancelled { customer_ref } => {
            let outcome = services
                .billing
                .handle_subscription_cancelled(&customer_ref)
                .await?;
            Ok(queue_for(state, outcome.members(), |member, user_id| {
                RoleTask::RemoveAndKick {
                    platform_user_id: user_id.to_string(),
                    member_id: member.id,
                }
            }))
        }
        BillingWebhook::Unhandled { event_type } => {
            tracing::debug!(event_type = %event_type, "Ignoring unhandled Stripe event");
            Ok(0)
        }
    }
}

/// Queue one task per platform-linked member. Queue failures are logged;
/// the next reconciliation run picks up anything missed.
fn queue_for(
    state: &AppState,
    members: &[Member],
    task: impl Fn(&Member, &str) -> RoleTask,
) -> usize {
    let mut queued = 0;
    for member in members {
        let Some(user_id) = member.platform_user_id.as_deref() else {
            continue;
        };
        match state.services.queue.submit(task(member, user_id)) {
            Ok(_) => queued += 1,
            Err(e) => {
                tracing::warn!(member_id = %member.id, error = %e, "Failed to queue role task from webhook");
            }
        }
    }
    queued
}
