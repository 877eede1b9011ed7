//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Stripe API error: {0}")]
    Stripe(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Member notification failed: {0}")]
    Notification(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Stripe(e.to_string())
    }
}

impl BillingError {
    pub fn member_not_found(id: impl ToString) -> Self {
        BillingError::NotFound {
            entity: "Member",
            id: id.to_string(),
        }
    }

    pub fn team_not_found(id: impl ToString) -> Self {
        BillingError::NotFound {
            entity: "Team",
            id: id.to_string(),
        }
    }
}
