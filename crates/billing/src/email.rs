//! Admin email delivery via the Resend HTTP API
//!
//! Template rendering is out of scope; reports are sent as plain text.

use std::time::Duration;

use keepwarden_shared::EmailConfig;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: &'a str,
}

#[derive(Clone)]
pub struct EmailService {
    client: reqwest::Client,
    config: Option<EmailConfig>,
    api_url: String,
}

impl EmailService {
    pub fn new(config: Option<EmailConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build email HTTP client, falling back to defaults without a request timeout");
                reqwest::Client::default()
            });

        if config.is_none() {
            tracing::warn!("RESEND_API_KEY not set - admin report emails disabled");
        }

        Self {
            client,
            config,
            api_url: RESEND_API_URL.to_string(),
        }
    }

    /// Point at a different endpoint (local mail catcher, tests)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.config
            .as_ref()
            .is_some_and(|c| !c.admin_recipients.is_empty())
    }

    /// Send a plain-text report to every configured admin address.
    ///
    /// A missing configuration is not an error; the send is skipped.
    pub async fn send_admin_report(&self, subject: &str, body: &str) -> BillingResult<()> {
        let Some(config) = self.config.as_ref() else {
            tracing::debug!(subject = subject, "Email not configured, skipping admin report");
            return Ok(());
        };
        if config.admin_recipients.is_empty() {
            tracing::debug!(subject = subject, "No ADMIN_EMAILS configured, skipping admin report");
            return Ok(());
        }

        let payload = ResendEmail {
            from: &config.from,
            to: &config.admin_recipients,
            subject,
            text: body,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&config.resend_api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BillingError::Email(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BillingError::Email(format!("Resend returned {}: {}", status, text)));
        }

        tracing::info!(
            subject = subject,
            recipients = config.admin_recipients.len(),
            "Admin report email sent"
        );
        Ok(())
    }
}
