//! Environment configuration
//!
//! Loaded once at startup (after `dotenvy::dotenv()`) by both binaries.
//! `RECONCILIATION_PAUSED` is deliberately not part of [`Config`]: it is read
//! at every scheduled run through [`reconciliation_paused`].

use chrono_tz::Tz;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Platform role id for each managed role
#[derive(Debug, Clone)]
pub struct RoleIds {
    pub squire: String,
    pub knight: String,
    pub lord: String,
    pub debtor: String,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub guild_id: String,
    pub role_ids: RoleIds,
    pub admin_channel_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: String,
    pub from: String,
    pub admin_recipients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub discord: DiscordConfig,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    /// `None` disables the admin report email
    pub email: Option<EmailConfig>,
    pub reconciliation_hour: u32,
    pub reconciliation_timezone: Tz,
    pub admin_api_token: Option<String>,
    pub bind_addr: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse the configured reconciliation hour (0-23)
pub fn parse_hour(raw: &str) -> Result<u32, ConfigError> {
    let hour: u32 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
        name: "RECONCILIATION_HOUR",
        reason: format!("{}", e),
    })?;
    if hour > 23 {
        return Err(ConfigError::Invalid {
            name: "RECONCILIATION_HOUR",
            reason: format!("hour must be 0-23, got {}", hour),
        });
    }
    Ok(hour)
}

/// Parse an IANA timezone name such as `America/New_York`
pub fn parse_timezone(raw: &str) -> Result<Tz, ConfigError> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|e| ConfigError::Invalid {
            name: "RECONCILIATION_TIMEZONE",
            reason: e.to_string(),
        })
}

/// Truthy env values: `true`, `1`, `yes` (case-insensitive)
pub fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Environment-level pause override, read fresh on every call
pub fn reconciliation_paused() -> bool {
    std::env::var("RECONCILIATION_PAUSED")
        .map(|v| parse_bool(&v))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let role_ids = RoleIds {
            squire: required("DISCORD_ROLE_SQUIRE")?,
            knight: required("DISCORD_ROLE_KNIGHT")?,
            lord: required("DISCORD_ROLE_LORD")?,
            debtor: required("DISCORD_ROLE_DEBTOR")?,
        };

        let discord = DiscordConfig {
            bot_token: required("DISCORD_BOT_TOKEN")?,
            guild_id: required("DISCORD_GUILD_ID")?,
            role_ids,
            admin_channel_id: optional("DISCORD_ADMIN_CHANNEL_ID"),
        };

        let email = optional("RESEND_API_KEY").map(|resend_api_key| EmailConfig {
            resend_api_key,
            from: optional("EMAIL_FROM")
                .unwrap_or_else(|| "Keepwarden <noreply@keepwarden.dev>".to_string()),
            admin_recipients: optional("ADMIN_EMAILS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        });

        let reconciliation_hour = match optional("RECONCILIATION_HOUR") {
            Some(raw) => parse_hour(&raw)?,
            None => 4,
        };
        let reconciliation_timezone = match optional("RECONCILIATION_TIMEZONE") {
            Some(raw) => parse_timezone(&raw)?,
            None => Tz::UTC,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            discord,
            stripe_secret_key: optional("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
            email,
            reconciliation_hour,
            reconciliation_timezone,
            admin_api_token: optional("ADMIN_API_TOKEN"),
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }
}
