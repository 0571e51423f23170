//! In-process platform.
//!
//! [`MemoryPlatform`] keeps guilds, members, conversations and history in
//! memory and answers the [`Platform`] operations from them. Events are
//! injected with [`MemoryPlatform::emit`]. Test-only; built under the
//! `testing` feature.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::{Connector, Platform, Upstream};
use crate::error::{PlatformError, Result};
use crate::event::Event;
use crate::model::{Channel, Guild, Member, Message, Role, User, channel_kind};
use crate::snowflake::Snowflake;

const EVENT_BUFFER: usize = 256;
const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Default)]
struct State {
    guilds: HashMap<Snowflake, Guild>,
    members: HashMap<Snowflake, Vec<Member>>,
    private_channels: Vec<Channel>,
    users: HashMap<Snowflake, User>,
    /// Oldest first.
    history: HashMap<Snowflake, Vec<Message>>,
    sent: Vec<(Snowflake, String)>,
    fail_sends: bool,
    chunk_size: usize,
}

pub struct MemoryPlatform {
    me: User,
    state: Mutex<State>,
    events: Mutex<Option<mpsc::Sender<Event>>>,
    next_seq: AtomicU64,
    guild_fetches: AtomicUsize,
}

impl MemoryPlatform {
    pub fn new(me: User) -> Self {
        let mut state = State {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ..Default::default()
        };
        state.users.insert(me.id, me.clone());
        Self {
            me,
            state: Mutex::new(state),
            events: Mutex::new(None),
            next_seq: AtomicU64::new(0),
            guild_fetches: AtomicUsize::new(0),
        }
    }

    pub fn add_guild(&self, guild: Guild) {
        self.state.lock().guilds.insert(guild.id, guild);
    }

    /// Members answered to [`Platform::request_members`].
    pub fn add_members(&self, guild: Snowflake, members: Vec<Member>) {
        let mut state = self.state.lock();
        for member in &members {
            state.users.insert(member.user.id, member.user.clone());
        }
        state.members.entry(guild).or_default().extend(members);
    }

    pub fn add_private_channel(&self, channel: Channel) {
        let mut state = self.state.lock();
        for user in &channel.recipients {
            state.users.insert(user.id, user.clone());
        }
        state.private_channels.push(channel);
    }

    /// Append to a channel's history.
    pub fn push_history(&self, message: Message) {
        self.state
            .lock()
            .history
            .entry(message.channel_id)
            .or_default()
            .push(message);
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.state.lock().chunk_size = size.max(1);
    }

    /// Make every following send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// `(channel, content)` of every message sent so far.
    pub fn sent(&self) -> Vec<(Snowflake, String)> {
        self.state.lock().sent.clone()
    }

    pub fn guild_fetches(&self) -> usize {
        self.guild_fetches.load(Ordering::Relaxed)
    }

    /// Deliver an event to whoever is connected. Returns false when no one is.
    pub async fn emit(&self, event: Event) -> bool {
        let tx = self.events.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    fn attach(&self, tx: mpsc::Sender<Event>) {
        *self.events.lock() = Some(tx);
    }

    fn find_channel(&self, id: Snowflake) -> Option<Channel> {
        let state = self.state.lock();
        state
            .guilds
            .values()
            .flat_map(|g| g.channels.iter())
            .chain(state.private_channels.iter())
            .find(|c| c.id == id)
            .cloned()
    }

    fn next_id(&self) -> Snowflake {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Snowflake::from_timestamp(Utc::now(), seq)
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn current_user(&self) -> Result<User> {
        Ok(self.me.clone())
    }

    async fn guild(&self, id: Snowflake) -> Result<Guild> {
        self.guild_fetches.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .guilds
            .get(&id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("guild {id}")))
    }

    async fn private_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.state.lock().private_channels.clone())
    }

    async fn channel(&self, id: Snowflake) -> Result<Channel> {
        self.find_channel(id)
            .ok_or_else(|| PlatformError::NotFound(format!("channel {id}")))
    }

    async fn user(&self, id: Snowflake) -> Result<User> {
        self.state
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("user {id}")))
    }

    async fn send_message(&self, channel: Snowflake, content: &str) -> Result<Snowflake> {
        if self.state.lock().fail_sends {
            return Err(PlatformError::Status {
                status: 500,
                body: "send refused".to_string(),
            });
        }
        let target = self
            .find_channel(channel)
            .ok_or_else(|| PlatformError::NotFound(format!("channel {channel}")))?;
        let id = self.next_id();
        let message = Message {
            id,
            channel_id: channel,
            guild_id: target.guild_id,
            author: self.me.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            edited_timestamp: None,
            pinned: false,
            mentions: Vec::new(),
            attachments: Vec::new(),
        };
        {
            let mut state = self.state.lock();
            state.sent.push((channel, content.to_string()));
            state
                .history
                .entry(channel)
                .or_default()
                .push(message.clone());
        }
        self.emit(Event::MessageCreate(message)).await;
        Ok(id)
    }

    async fn fetch_recent_messages(&self, channel: Snowflake, limit: u8) -> Result<Vec<Message>> {
        let state = self.state.lock();
        let history = state.history.get(&channel).map(Vec::as_slice).unwrap_or_default();
        Ok(history.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn request_members(&self, guild: Snowflake) -> Result<()> {
        let Some(tx) = self.events.lock().clone() else {
            return Err(PlatformError::Closed);
        };
        let (members, size) = {
            let state = self.state.lock();
            (
                state.members.get(&guild).cloned().unwrap_or_default(),
                state.chunk_size,
            )
        };
        let chunks: Vec<Vec<Member>> = if members.is_empty() {
            vec![Vec::new()]
        } else {
            members.chunks(size).map(<[Member]>::to_vec).collect()
        };
        let count = chunks.len() as u32;
        // Delivered from a task: the caller may be the one draining events.
        tokio::spawn(async move {
            for (index, members) in chunks.into_iter().enumerate() {
                let event = Event::MembersChunk {
                    guild_id: guild,
                    members,
                    chunk_index: index as u32,
                    chunk_count: count,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

/// Hands out registered [`MemoryPlatform`]s by credential.
#[derive(Default)]
pub struct MemoryConnector {
    accounts: Mutex<HashMap<String, Arc<MemoryPlatform>>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, credential: &str, platform: Arc<MemoryPlatform>) {
        self.accounts.lock().insert(credential.to_string(), platform);
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, credential: &str) -> Result<Upstream> {
        let platform = self
            .accounts
            .lock()
            .get(credential)
            .cloned()
            .ok_or_else(|| PlatformError::Status {
                status: 401,
                body: "401: Unauthorized".to_string(),
            })?;
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        platform.attach(tx);
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Upstream { platform, events })
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

pub fn user(id: u64, username: &str) -> User {
    User {
        id: Snowflake(id),
        username: username.to_string(),
        discriminator: None,
        global_name: None,
        bot: false,
    }
}

pub fn member(id: u64, username: &str) -> Member {
    Member {
        user: user(id, username),
        nick: None,
        roles: Vec::new(),
    }
}

pub fn text_channel(id: u64, guild: u64, name: &str) -> Channel {
    Channel {
        id: Snowflake(id),
        kind: channel_kind::GUILD_TEXT,
        guild_id: Some(Snowflake(guild)),
        name: Some(name.to_string()),
        topic: None,
        recipients: Vec::new(),
    }
}

pub fn dm_channel(id: u64, recipients: Vec<User>) -> Channel {
    Channel {
        id: Snowflake(id),
        kind: if recipients.len() > 1 {
            channel_kind::GROUP_DM
        } else {
            channel_kind::DM
        },
        guild_id: None,
        name: None,
        topic: None,
        recipients,
    }
}

pub fn guild(id: u64, name: &str, channels: Vec<Channel>, members: u64) -> Guild {
    Guild {
        id: Snowflake(id),
        name: name.to_string(),
        member_count: Some(members),
        approximate_member_count: None,
        roles: vec![Role {
            id: Snowflake(id),
            name: "@everyone".to_string(),
        }],
        channels,
    }
}

pub fn message(id: u64, channel: u64, author: User, content: &str) -> Message {
    Message {
        id: Snowflake(id),
        channel_id: Snowflake(channel),
        guild_id: None,
        author,
        content: content.to_string(),
        timestamp: Utc::now(),
        edited_timestamp: None,
        pinned: false,
        mentions: Vec::new(),
        attachments: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_comes_back_newest_first() {
        let platform = MemoryPlatform::new(user(1, "me"));
        for n in 1..=5 {
            platform.push_history(message(n, 10, user(2, "bob"), &format!("m{n}")));
        }
        let recent = platform.fetch_recent_messages(Snowflake(10), 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m5", "m4", "m3"]);
    }

    #[tokio::test]
    async fn sends_echo_as_events() {
        let connector = MemoryConnector::new();
        let platform = Arc::new(MemoryPlatform::new(user(1, "me")));
        platform.add_guild(guild(100, "g", vec![text_channel(10, 100, "general")], 1));
        connector.register("tok", platform.clone());

        let mut upstream = connector.connect("tok").await.unwrap();
        let id = upstream.platform.send_message(Snowflake(10), "hi").await.unwrap();
        match upstream.events.recv().await {
            Some(Event::MessageCreate(m)) => {
                assert_eq!(m.id, id);
                assert_eq!(m.author.id, Snowflake(1));
                assert_eq!(m.guild_id, Some(Snowflake(100)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(platform.sent(), vec![(Snowflake(10), "hi".to_string())]);
    }

    #[tokio::test]
    async fn members_arrive_in_chunks() {
        let connector = MemoryConnector::new();
        let platform = Arc::new(MemoryPlatform::new(user(1, "me")));
        platform.set_chunk_size(2);
        platform.add_members(Snowflake(100), (1..=5).map(|n| member(n, &format!("u{n}"))).collect());
        connector.register("tok", platform.clone());

        let mut upstream = connector.connect("tok").await.unwrap();
        upstream.platform.request_members(Snowflake(100)).await.unwrap();
        let mut sizes = Vec::new();
        for _ in 0..3 {
            match upstream.events.recv().await {
                Some(Event::MembersChunk { members, chunk_count, .. }) => {
                    assert_eq!(chunk_count, 3);
                    sizes.push(members.len());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let connector = MemoryConnector::new();
        let err = connector.connect("nope").await.unwrap_err();
        assert!(matches!(err, PlatformError::Status { status: 401, .. }));
        assert_eq!(connector.connects(), 0);
    }
}
