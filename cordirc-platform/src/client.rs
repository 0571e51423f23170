//! The seams between the bridge and the platform.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::Event;
use crate::model::{Channel, Guild, Message, User};
use crate::snowflake::Snowflake;

/// REST-style operations available to one authenticated credential.
#[async_trait]
pub trait Platform: Send + Sync {
    /// The account the credential belongs to.
    async fn current_user(&self) -> Result<User>;

    /// Guild metadata including its roles and channels.
    async fn guild(&self, id: Snowflake) -> Result<Guild>;

    /// Open direct-message and group conversations.
    async fn private_channels(&self) -> Result<Vec<Channel>>;

    async fn channel(&self, id: Snowflake) -> Result<Channel>;

    async fn user(&self, id: Snowflake) -> Result<User>;

    /// Post `content` to a channel, returning the new message's id.
    async fn send_message(&self, channel: Snowflake, content: &str) -> Result<Snowflake>;

    /// Up to `limit` of the most recent messages, newest first.
    async fn fetch_recent_messages(&self, channel: Snowflake, limit: u8) -> Result<Vec<Message>>;

    /// Ask for the guild's member list. Members arrive later as
    /// [`Event::MembersChunk`] on the event stream.
    async fn request_members(&self, guild: Snowflake) -> Result<()>;
}

/// A live upstream: the client plus the event stream for its credential.
pub struct Upstream {
    pub platform: Arc<dyn Platform>,
    pub events: mpsc::Receiver<Event>,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream").finish_non_exhaustive()
    }
}

/// Establishes upstreams from credentials.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credential: &str) -> Result<Upstream>;
}
