//! Chat platform port
//!
//! Role membership on the platform is a set: adding a held role or removing
//! an absent one succeeds without effect. Member role sets are reported by
//! name for managed roles; roles this system does not manage are passed
//! through as opaque ids.

mod discord;
mod memory;

pub use discord::DiscordClient;
pub use memory::{InMemoryPlatform, PlatformCall, PlatformOp};

use async_trait::async_trait;
use keepwarden_shared::ManagedRole;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Platform server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Platform request rejected {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl PlatformError {
    /// Worth retrying: rate limits, transport failures and 5xx responses
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. }
                | PlatformError::Transport(_)
                | PlatformError::Server { .. }
        )
    }
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Current role set, or `None` when the user is not in the guild
    async fn member_roles(&self, user_id: &str) -> Result<Option<Vec<String>>, PlatformError>;

    async fn add_role(&self, user_id: &str, role: ManagedRole) -> Result<(), PlatformError>;

    async fn remove_role(&self, user_id: &str, role: ManagedRole) -> Result<(), PlatformError>;

    /// Expel from the guild. Kicking a user who already left succeeds.
    async fn kick(&self, user_id: &str, reason: &str) -> Result<(), PlatformError>;

    async fn send_dm(&self, user_id: &str, content: &str) -> Result<(), PlatformError>;

    async fn post_channel_message(&self, channel_id: &str, content: &str)
        -> Result<(), PlatformError>;
}
