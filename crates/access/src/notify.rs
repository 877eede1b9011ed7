//! Notification glue
//!
//! Members are notified by direct message on the platform. Admin reports go
//! to the configured admin channel and by email.

use std::sync::Arc;

use async_trait::async_trait;
use keepwarden_billing::{BillingError, BillingResult, EmailService, MemberNotifier};
use keepwarden_shared::Member;
use time::OffsetDateTime;

use crate::error::{AccessError, AccessResult};
use crate::platform::PlatformClient;
use crate::reconcile::AdminNotifier;

/// Platform messages are capped at 2000 characters
const MAX_MESSAGE_LEN: usize = 2000;

fn format_deadline(at: OffsetDateTime) -> String {
    chrono::DateTime::from_timestamp(at.unix_timestamp(), 0)
        .map(|t| t.format("%B %-d at %H:%M UTC").to_string())
        .unwrap_or_else(|| at.to_string())
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_MESSAGE_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}

pub fn payment_failed_message(member: &Member, grace_ends_at: OffsetDateTime) -> String {
    format!(
        "Hi {}, your latest membership payment did not go through. \
         You keep full access until {} while you update your payment method. \
         After that your access will be limited to the support channel.",
        member.display_name,
        format_deadline(grace_ends_at)
    )
}

pub fn access_restricted_message(member: &Member) -> String {
    format!(
        "Hi {}, we still could not collect your membership payment, so your access \
         is now limited to the support channel. Update your payment method to \
         restore full access right away.",
        member.display_name
    )
}

pub struct PlatformMemberNotifier {
    platform: Arc<dyn PlatformClient>,
}

impl PlatformMemberNotifier {
    pub fn new(platform: Arc<dyn PlatformClient>) -> Self {
        Self { platform }
    }

    async fn dm(&self, member: &Member, content: String) -> BillingResult<()> {
        let user_id = member
            .platform_user_id
            .as_deref()
            .ok_or_else(|| BillingError::Notification("member has no platform account".to_string()))?;
        self.platform
            .send_dm(user_id, &content)
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))
    }
}

#[async_trait]
impl MemberNotifier for PlatformMemberNotifier {
    async fn payment_failed(
        &self,
        member: &Member,
        grace_ends_at: OffsetDateTime,
    ) -> BillingResult<()> {
        self.dm(member, payment_failed_message(member, grace_ends_at))
            .await
    }

    async fn access_restricted(&self, member: &Member) -> BillingResult<()> {
        self.dm(member, access_restricted_message(member)).await
    }
}

/// Posts to the admin channel and emails the admin list
pub struct ChannelEmailNotifier {
    platform: Arc<dyn PlatformClient>,
    admin_channel_id: Option<String>,
    email: EmailService,
}

impl ChannelEmailNotifier {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        admin_channel_id: Option<String>,
        email: EmailService,
    ) -> Self {
        Self {
            platform,
            admin_channel_id,
            email,
        }
    }
}

#[async_trait]
impl AdminNotifier for ChannelEmailNotifier {
    async fn notify_admins(&self, subject: &str, body: &str) -> AccessResult<()> {
        let mut delivered = false;
        let mut last_error: Option<AccessError> = None;

        match self.admin_channel_id.as_deref() {
            Some(channel_id) => {
                let message = truncate(&format!("**{}**\n{}", subject, body));
                match self.platform.post_channel_message(channel_id, &message).await {
                    Ok(()) => delivered = true,
                    Err(e) => {
                        tracing::warn!(channel_id = %channel_id, error = %e, "Failed to post admin channel report");
                        last_error = Some(e.into());
                    }
                }
            }
            None => tracing::debug!("DISCORD_ADMIN_CHANNEL_ID not set, skipping channel report"),
        }

        if self.email.is_configured() {
            match self.email.send_admin_report(subject, body).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to email admin report");
                    last_error = Some(e.into());
                }
            }
        }

        match (delivered, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }
}
