//! Access-control error types

use keepwarden_billing::BillingError;
use thiserror::Error;

use crate::platform::PlatformError;

pub type AccessResult<T> = Result<T, AccessError>;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Member {member_id} is already linked to another platform account")]
    AlreadyClaimed { member_id: uuid::Uuid },

    #[error("Role task queue is shut down")]
    QueueClosed,

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}
