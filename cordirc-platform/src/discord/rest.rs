//! Discord REST client.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{PlatformError, Result};
use crate::model::{Channel, Guild, Message, User};
use crate::snowflake::Snowflake;

pub const API_BASE: &str = "https://discord.com/api/v10";

const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/cordirc/cordirc, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

#[derive(Clone)]
pub struct RestClient {
    token: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct Created {
    id: Snowflake,
}

impl RestClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{API_BASE}{path}"))
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        decode(path, resp).await
    }

    pub async fn current_user(&self) -> Result<User> {
        self.get("/users/@me").await
    }

    /// Guild with member counts; channels come from a second call because
    /// the guild object itself does not carry them.
    pub async fn guild(&self, id: Snowflake) -> Result<Guild> {
        let mut guild: Guild = self.get(&format!("/guilds/{id}?with_counts=true")).await?;
        guild.channels = self.get(&format!("/guilds/{id}/channels")).await?;
        Ok(guild)
    }

    pub async fn private_channels(&self) -> Result<Vec<Channel>> {
        self.get("/users/@me/channels").await
    }

    pub async fn channel(&self, id: Snowflake) -> Result<Channel> {
        self.get(&format!("/channels/{id}")).await
    }

    pub async fn user(&self, id: Snowflake) -> Result<User> {
        self.get(&format!("/users/{id}")).await
    }

    pub async fn recent_messages(&self, channel: Snowflake, limit: u8) -> Result<Vec<Message>> {
        let limit = limit.clamp(1, 100);
        self.get(&format!("/channels/{channel}/messages?limit={limit}"))
            .await
    }

    pub async fn create_message(&self, channel: Snowflake, content: &str) -> Result<Snowflake> {
        let path = format!("/channels/{channel}/messages");
        let body = serde_json::json!({ "content": content });
        let resp = self
            .http
            .post(format!("{API_BASE}{path}"))
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&body)
            .send()
            .await?;
        let created: Created = decode(&path, resp).await?;
        Ok(created.id)
    }
}

async fn decode<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(PlatformError::NotFound(path.to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PlatformError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
