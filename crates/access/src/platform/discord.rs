//! Discord REST v10 adapter

use std::time::Duration;

use async_trait::async_trait;
use keepwarden_shared::{DiscordConfig, ManagedRole, RoleIds};
use reqwest::{Response, StatusCode};
use serde::Deserialize;

use super::{PlatformClient, PlatformError};

const DISCORD_API_URL: &str = "https://discord.com/api/v10";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Discord JSON error code for a user that is not a guild member
const UNKNOWN_MEMBER_CODE: u64 = 10007;

#[derive(Deserialize)]
struct GuildMember {
    roles: Vec<String>,
}

#[derive(Deserialize)]
struct DmChannel {
    id: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    api_url: String,
    bot_token: String,
    guild_id: String,
    role_ids: RoleIds,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build Discord HTTP client, falling back to defaults without a request timeout");
                reqwest::Client::default()
            });

        Self {
            http,
            api_url: DISCORD_API_URL.to_string(),
            bot_token: config.bot_token.clone(),
            guild_id: config.guild_id.clone(),
            role_ids: config.role_ids.clone(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn role_id(&self, role: ManagedRole) -> &str {
        match role {
            ManagedRole::Squire => &self.role_ids.squire,
            ManagedRole::Knight => &self.role_ids.knight,
            ManagedRole::Lord => &self.role_ids.lord,
            ManagedRole::Debtor => &self.role_ids.debtor,
        }
    }

    /// Managed role ids become role names; anything else stays an opaque id
    fn role_name(&self, role_id: &str) -> String {
        ManagedRole::ALL
            .into_iter()
            .find(|role| self.role_id(*role) == role_id)
            .map(|role| role.name().to_string())
            .unwrap_or_else(|| role_id.to_string())
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    fn member_url(&self, user_id: &str) -> String {
        format!("{}/guilds/{}/members/{}", self.api_url, self.guild_id, user_id)
    }

    fn member_role_url(&self, user_id: &str, role: ManagedRole) -> String {
        format!("{}/roles/{}", self.member_url(user_id), self.role_id(role))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, PlatformError> {
        let response = request
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status, &body))
    }

    async fn post_message(&self, channel_id: &str, content: &str) -> Result<(), PlatformError> {
        let url = format!("{}/channels/{}/messages", self.api_url, channel_id);
        self.send(
            self.http
                .post(url)
                .json(&serde_json::json!({ "content": content })),
        )
        .await?;
        Ok(())
    }
}

fn classify_error(status: StatusCode, body: &str) -> PlatformError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_ms = serde_json::from_str::<RateLimitBody>(body)
            .map(|b| (b.retry_after * 1000.0) as u64)
            .unwrap_or(1000);
        return PlatformError::RateLimited { retry_after_ms };
    }
    if status.is_server_error() {
        return PlatformError::Server {
            status: status.as_u16(),
            body: body.to_string(),
        };
    }
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["code"].as_u64());
    if status == StatusCode::NOT_FOUND && code == Some(UNKNOWN_MEMBER_CODE) {
        return PlatformError::UnknownMember(body.to_string());
    }
    PlatformError::Rejected {
        status: status.as_u16(),
        body: body.to_string(),
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    async fn member_roles(&self, user_id: &str) -> Result<Option<Vec<String>>, PlatformError> {
        let result = self.send(self.http.get(self.member_url(user_id))).await;
        let response = match result {
            Ok(response) => response,
            Err(PlatformError::UnknownMember(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let member: GuildMember = response
            .json()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        Ok(Some(
            member.roles.iter().map(|id| self.role_name(id)).collect(),
        ))
    }

    async fn add_role(&self, user_id: &str, role: ManagedRole) -> Result<(), PlatformError> {
        self.send(self.http.put(self.member_role_url(user_id, role)))
            .await?;
        tracing::debug!(user_id = %user_id, role = %role, "Added platform role");
        Ok(())
    }

    async fn remove_role(&self, user_id: &str, role: ManagedRole) -> Result<(), PlatformError> {
        self.send(self.http.delete(self.member_role_url(user_id, role)))
            .await?;
        tracing::debug!(user_id = %user_id, role = %role, "Removed platform role");
        Ok(())
    }

    async fn kick(&self, user_id: &str, reason: &str) -> Result<(), PlatformError> {
        let request = self
            .http
            .delete(self.member_url(user_id))
            .header("X-Audit-Log-Reason", reason);
        match self.send(request).await {
            Ok(_) | Err(PlatformError::UnknownMember(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_dm(&self, user_id: &str, content: &str) -> Result<(), PlatformError> {
        let url = format!("{}/users/@me/channels", self.api_url);
        let channel: DmChannel = self
            .send(
                self.http
                    .post(url)
                    .json(&serde_json::json!({ "recipient_id": user_id })),
            )
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        self.post_message(&channel.id, content).await
    }

    async fn post_channel_message(
        &self,
        channel_id: &str,
        content: &str,
    ) -> Result<(), PlatformError> {
        self.post_message(channel_id, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> DiscordClient {
        DiscordClient::new(&DiscordConfig {
            bot_token: "token".to_string(),
            guild_id: "guild".to_string(),
            role_ids: RoleIds {
                squire: "101".to_string(),
                knight: "102".to_string(),
                lord: "103".to_string(),
                debtor: "104".to_string(),
            },
            admin_channel_id: None,
        })
    }

    #[test]
    fn test_role_ids_map_to_names() {
        let client = client();
        assert_eq!(client.role_name("103"), "Lord");
        assert_eq!(client.role_name("104"), "Debtor");
        assert_eq!(client.role_name("999"), "999");
        assert_eq!(
            client.member_role_url("42", ManagedRole::Knight),
            "https://discord.com/api/v10/guilds/guild/members/42/roles/102"
        );
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_error(StatusCode::TOO_MANY_REQUESTS, r#"{"retry_after": 1.5}"#),
            PlatformError::RateLimited {
                retry_after_ms: 1500
            }
        );
        assert!(matches!(
            classify_error(StatusCode::NOT_FOUND, r#"{"code": 10007, "message": "Unknown Member"}"#),
            PlatformError::UnknownMember(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::FORBIDDEN, r#"{"code": 50013}"#),
            PlatformError::Rejected { status: 403, .. }
        ));
        assert!(classify_error(StatusCode::BAD_GATEWAY, "").is_transient());
    }

    async fn server() -> (mockito::ServerGuard, DiscordClient) {
        let server = mockito::Server::new_async().await;
        let client = client().with_api_url(server.url());
        (server, client)
    }

    #[tokio::test]
    async fn test_member_roles_maps_managed_ids() {
        let (mut server, client) = server().await;
        let mock = server
            .mock("GET", "/guilds/guild/members/42")
            .match_header("authorization", "Bot token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"user": {"id": "42"}, "roles": ["103", "555"]}"#)
            .create_async()
            .await;

        let roles = client.member_roles("42").await.unwrap();
        assert_eq!(roles, Some(vec!["Lord".to_string(), "555".to_string()]));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_member_roles_for_unknown_member_is_none() {
        let (mut server, client) = server().await;
        server
            .mock("GET", "/guilds/guild/members/gone")
            .with_status(404)
            .with_body(r#"{"message": "Unknown Member", "code": 10007}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/guilds/guild/members/other")
            .with_status(404)
            .with_body(r#"{"message": "Unknown Guild", "code": 10004}"#)
            .create_async()
            .await;

        assert_eq!(client.member_roles("gone").await.unwrap(), None);
        assert!(matches!(
            client.member_roles("other").await,
            Err(PlatformError::Rejected { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_role_mutations_hit_member_role_routes() {
        let (mut server, client) = server().await;
        let put = server
            .mock("PUT", "/guilds/guild/members/42/roles/103")
            .match_header("authorization", "Bot token")
            .with_status(204)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/guilds/guild/members/42/roles/104")
            .with_status(204)
            .create_async()
            .await;

        client.add_role("42", ManagedRole::Lord).await.unwrap();
        client.remove_role("42", ManagedRole::Debtor).await.unwrap();
        put.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_and_server_errors_are_transient() {
        let (mut server, client) = server().await;
        server
            .mock("PUT", "/guilds/guild/members/42/roles/101")
            .with_status(429)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message": "You are being rate limited.", "retry_after": 0.25, "global": false}"#)
            .create_async()
            .await;
        server
            .mock("PUT", "/guilds/guild/members/42/roles/102")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        assert_eq!(
            client.add_role("42", ManagedRole::Squire).await,
            Err(PlatformError::RateLimited {
                retry_after_ms: 250
            })
        );
        let server_error = client.add_role("42", ManagedRole::Knight).await.unwrap_err();
        assert_eq!(
            server_error,
            PlatformError::Server {
                status: 502,
                body: "Bad Gateway".to_string()
            }
        );
        assert!(server_error.is_transient());
    }

    #[tokio::test]
    async fn test_kick_of_departed_member_succeeds() {
        let (mut server, client) = server().await;
        let gone = server
            .mock("DELETE", "/guilds/guild/members/gone")
            .match_header("x-audit-log-reason", "Membership cancelled")
            .with_status(404)
            .with_body(r#"{"message": "Unknown Member", "code": 10007}"#)
            .create_async()
            .await;
        server
            .mock("DELETE", "/guilds/guild/members/42")
            .with_status(403)
            .with_body(r#"{"message": "Missing Permissions", "code": 50013}"#)
            .create_async()
            .await;

        client.kick("gone", "Membership cancelled").await.unwrap();
        gone.assert_async().await;
        assert!(matches!(
            client.kick("42", "Membership cancelled").await,
            Err(PlatformError::Rejected { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_send_dm_opens_channel_then_posts() {
        let (mut server, client) = server().await;
        let open = server
            .mock("POST", "/users/@me/channels")
            .match_body(mockito::Matcher::Json(serde_json::json!({ "recipient_id": "42" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "dm-1", "type": 1}"#)
            .create_async()
            .await;
        let post = server
            .mock("POST", "/channels/dm-1/messages")
            .match_body(mockito::Matcher::Json(serde_json::json!({ "content": "hello" })))
            .with_status(200)
            .with_body(r#"{"id": "m-1"}"#)
            .create_async()
            .await;

        client.send_dm("42", "hello").await.unwrap();
        open.assert_async().await;
        post.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_dm_stops_when_channel_cannot_be_opened() {
        let (mut server, client) = server().await;
        server
            .mock("POST", "/users/@me/channels")
            .with_status(403)
            .with_body(r#"{"message": "Cannot send messages to this user", "code": 50007}"#)
            .create_async()
            .await;
        let post = server
            .mock("POST", mockito::Matcher::Regex(r"^/channels/.*/messages$".to_string()))
            .expect(0)
            .create_async()
            .await;

        assert!(matches!(
            client.send_dm("42", "hello").await,
            Err(PlatformError::Rejected { status: 403, .. })
        ));
        post.assert_async().await;
    }
}
