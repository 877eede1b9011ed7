//! Application state

use keepwarden_access::Services;
use keepwarden_billing::WebhookVerifier;
use keepwarden_shared::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    /// `None` when `STRIPE_WEBHOOK_SECRET` is unset; the webhook route then refuses events
    pub webhook_verifier: Option<WebhookVerifier>,
    /// `None` when `ADMIN_API_TOKEN` is unset; admin routes then reject every request
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(services: Services, config: &Config) -> Self {
        if config.stripe_webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - Stripe webhooks will be rejected");
        }
        if config.admin_api_token.is_none() {
            tracing::warn!("ADMIN_API_TOKEN not set - admin routes are disabled");
        }

        Self {
            services,
            webhook_verifier: config
                .stripe_webhook_secret
                .as_deref()
                .map(WebhookVerifier::new),
            admin_token: config.admin_api_token.clone(),
        }
    }
}
