//! Discord implementation of [`Platform`] and [`Connector`].

mod gateway;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{Connector, Platform, Upstream};
use crate::error::{PlatformError, Result};
use crate::model::{Channel, Guild, Message, User};
use crate::snowflake::Snowflake;

pub use gateway::{GATEWAY_URL, INTENTS};
use gateway::GatewayCommand;
pub use rest::RestClient;

/// Default depth of the per-credential event buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// One authenticated Discord account.
pub struct Discord {
    rest: RestClient,
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

#[async_trait]
impl Platform for Discord {
    async fn current_user(&self) -> Result<User> {
        self.rest.current_user().await
    }

    async fn guild(&self, id: Snowflake) -> Result<Guild> {
        self.rest.guild(id).await
    }

    async fn private_channels(&self) -> Result<Vec<Channel>> {
        self.rest.private_channels().await
    }

    async fn channel(&self, id: Snowflake) -> Result<Channel> {
        self.rest.channel(id).await
    }

    async fn user(&self, id: Snowflake) -> Result<User> {
        self.rest.user(id).await
    }

    async fn send_message(&self, channel: Snowflake, content: &str) -> Result<Snowflake> {
        self.rest.create_message(channel, content).await
    }

    async fn fetch_recent_messages(&self, channel: Snowflake, limit: u8) -> Result<Vec<Message>> {
        self.rest.recent_messages(channel, limit).await
    }

    async fn request_members(&self, guild: Snowflake) -> Result<()> {
        self.commands
            .send(GatewayCommand::RequestMembers(guild))
            .map_err(|_| PlatformError::Closed)
    }
}

/// Opens a REST client and a gateway session per credential.
pub struct DiscordConnector {
    event_buffer: usize,
}

impl DiscordConnector {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            event_buffer: event_buffer.max(1),
        }
    }
}

impl Default for DiscordConnector {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

#[async_trait]
impl Connector for DiscordConnector {
    async fn connect(&self, credential: &str) -> Result<Upstream> {
        let rest = RestClient::new(credential);
        // Reject bad tokens before spawning a gateway that would only loop.
        let me = rest.current_user().await?;
        tracing::info!(user = %me.id, name = %me.tag(), "Credential accepted");

        let (events_tx, events_rx) = mpsc::channel(self.event_buffer);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(gateway::run(credential.to_string(), events_tx, commands_rx));

        let platform: Arc<dyn Platform> = Arc::new(Discord {
            rest,
            commands: commands_tx,
        });
        Ok(Upstream {
            platform,
            events: events_rx,
        })
    }
}
