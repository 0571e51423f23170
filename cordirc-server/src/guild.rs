//! Guild sessions.
//!
//! A [`GuildSession`] is the shared view of one guild (or of the account's
//! direct messages) for one credential: name maps for users and channels,
//! the message cache, the member roster and the IRC clients attached to it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cordirc_platform::{Channel, Member, Message, Platform, Role, Snowflake, User};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cache::MessageCache;
use crate::connection::client::Client;
use crate::error::BridgeError;
use crate::format::{self, Directory};
use crate::idmap::{Entry, IdMap, Insertion};
use crate::registry::Account;

/// What a login (and a session) is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Guild(Snowflake),
    Direct,
}

impl Scope {
    /// Parse the `USER` username: a guild id, or `dm`.
    pub fn from_username(username: &str) -> Result<Self, BridgeError> {
        if username.eq_ignore_ascii_case("dm") {
            return Ok(Scope::Direct);
        }
        username
            .parse::<Snowflake>()
            .map(Scope::Guild)
            .map_err(|_| BridgeError::InvalidScope(username.to_string()))
    }

    /// Scope an upstream entity belongs to.
    pub fn of(guild_id: Option<Snowflake>) -> Self {
        guild_id.map_or(Scope::Direct, Scope::Guild)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Guild(id) => write!(f, "guild:{id}"),
            Scope::Direct => f.write_str("dm"),
        }
    }
}

/// A member's nickname changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub user: User,
    pub old: String,
    pub new: String,
}

#[derive(Default)]
struct Roster {
    expected: u64,
    /// First-appearance order.
    order: Vec<Snowflake>,
    members: HashMap<Snowflake, Member>,
    /// Indices of the member chunks received so far.
    chunks: HashSet<u32>,
}

impl Roster {
    /// Returns true if the member was not present before.
    fn upsert(&mut self, member: Member) -> bool {
        let id = member.user.id;
        let fresh = self.members.insert(id, member).is_none();
        if fresh {
            self.order.push(id);
        }
        fresh
    }

    fn remove(&mut self, id: Snowflake) -> Option<Member> {
        let member = self.members.remove(&id)?;
        self.order.retain(|m| *m != id);
        Some(member)
    }

    fn reached_expected(&self) -> bool {
        self.order.len() as u64 >= self.expected
    }
}

#[derive(Default)]
struct State {
    channels: HashMap<Snowflake, Channel>,
    roles: HashMap<Snowflake, Role>,
    /// Every user a name was derived for, members or not.
    users: HashMap<Snowflake, User>,
    roster: Roster,
}

pub struct GuildSession {
    scope: Scope,
    name: String,
    account: Arc<Account>,
    users: IdMap,
    channels: IdMap,
    messages: MessageCache,
    state: Mutex<State>,
    roster_ready: watch::Sender<bool>,
    roster_requested: AtomicBool,
    connections: Mutex<Vec<Arc<Client>>>,
}

impl GuildSession {
    fn empty(account: Arc<Account>, scope: Scope, name: String, cache_size: usize) -> Self {
        let (roster_ready, _) = watch::channel(false);
        let session = Self {
            scope,
            name,
            account,
            users: IdMap::new(format::NICK_LEN),
            channels: IdMap::new(format::CHANNEL_LEN),
            messages: MessageCache::new(cache_size),
            state: Mutex::new(State::default()),
            roster_ready,
            roster_requested: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        };
        // Our own name is bound first so it never needs a suffix.
        let me = session.account.me.clone();
        session.nick_of(&me);
        session
    }

    /// Fetch the scope's metadata and build its session.
    ///
    /// The member list of a guild is requested separately through
    /// [`GuildSession::request_roster`] once the session is reachable by the
    /// event router.
    pub async fn load(
        account: Arc<Account>,
        scope: Scope,
        cache_size: usize,
    ) -> Result<Self, BridgeError> {
        let platform = account.platform.clone();
        let session = match scope {
            Scope::Guild(id) => {
                let guild = platform.guild(id).await?;
                let session = Self::empty(account, scope, guild.name.clone(), cache_size);
                session.state.lock().roster.expected = guild.expected_members();
                for role in guild.roles {
                    session.add_role(role);
                }
                for channel in guild.channels {
                    session.add_channel(channel);
                }
                session
            }
            Scope::Direct => {
                let channels = platform.private_channels().await?;
                let session =
                    Self::empty(account, scope, "Direct Messages".to_string(), cache_size);
                for channel in channels {
                    session.add_channel(channel);
                }
                session
            }
        };
        if matches!(scope, Scope::Direct) || session.state.lock().roster.reached_expected() {
            session.finish_roster();
        }
        tracing::info!(
            scope = %session.scope,
            name = %session.name,
            channels = session.channels.len(),
            "Session loaded"
        );
        Ok(session)
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.account.platform
    }

    /// Ask the platform for the guild's member list, once per session.
    pub async fn request_roster(&self) -> Result<(), BridgeError> {
        let Scope::Guild(id) = self.scope else {
            return Ok(());
        };
        if self.roster_complete() || self.roster_requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.platform().request_members(id).await {
            self.roster_requested.store(false, Ordering::Release);
            return Err(e.into());
        }
        tracing::debug!(guild = %id, "Requested member list");
        Ok(())
    }

    // ── Members ──────────────────────────────────────────────────────

    /// Add (or refresh) a member. Returns its nick and whether it is new
    /// to the roster.
    pub fn add_member(&self, member: Member) -> (Insertion, bool) {
        let ins = self.users.insert(member.user.id, &format::nick(member.display_name()));
        let fresh = {
            let mut state = self.state.lock();
            state.users.insert(member.user.id, member.user.clone());
            let fresh = state.roster.upsert(member);
            if fresh && state.roster.reached_expected() {
                drop(state);
                self.finish_roster();
            }
            fresh
        };
        (ins, fresh)
    }

    /// Accumulate one chunk of the member list.
    pub fn add_members(&self, members: Vec<Member>) {
        for member in members {
            self.add_member(member);
        }
    }

    /// Accumulate chunk `index` of `count`. The roster completes once every
    /// index has arrived, in whatever order.
    pub fn add_chunk(&self, members: Vec<Member>, index: u32, count: u32) {
        self.add_members(members);
        let done = {
            let mut state = self.state.lock();
            state.roster.chunks.insert(index);
            state.roster.chunks.len() as u32 >= count
        };
        if done {
            self.finish_roster();
        }
    }

    /// Apply a member update, reporting a nickname change.
    pub fn update_member(&self, member: Member) -> Option<Rename> {
        let user = member.user.clone();
        let (ins, _) = self.add_member(member);
        let (old, new) = ins.renamed()?;
        Some(Rename {
            user,
            old: old.to_string(),
            new: new.to_string(),
        })
    }

    /// Drop a member, returning the nick it had.
    pub fn remove_member(&self, user: Snowflake) -> Option<String> {
        self.state.lock().roster.remove(user)?;
        self.users.remove(user)
    }

    /// Known user object for an id (member or message author).
    pub fn user(&self, id: Snowflake) -> Option<User> {
        self.state.lock().users.get(&id).cloned()
    }

    /// Nick for a user, deriving and binding one on first sight.
    pub fn nick_of(&self, user: &User) -> String {
        if let Some(name) = self.users.resolve_to_name(user.id) {
            return name;
        }
        self.state.lock().users.insert(user.id, user.clone());
        self.users.insert(user.id, &format::nick(user.display_name())).name
    }

    pub fn user_id(&self, nick: &str) -> Option<Snowflake> {
        self.users.resolve_to_id(nick)
    }

    /// Roster nicks in order of first appearance.
    pub fn roster_nicks(&self) -> Vec<String> {
        let order = self.state.lock().roster.order.clone();
        order
            .into_iter()
            .filter_map(|id| self.users.resolve_to_name(id))
            .collect()
    }

    pub fn roster_len(&self) -> usize {
        self.state.lock().roster.order.len()
    }

    pub fn roster_complete(&self) -> bool {
        *self.roster_ready.borrow()
    }

    /// Mark the roster complete; later calls are no-ops.
    pub fn finish_roster(&self) {
        self.roster_ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }

    /// Wait until the roster is complete, at most `timeout`.
    pub async fn wait_for_roster(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut rx = self.roster_ready.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            // The sender lives as long as the session.
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(BridgeError::RosterTimeout(match self.scope {
                Scope::Guild(id) => id,
                Scope::Direct => Snowflake(0),
            })),
        }
    }

    /// Nicks to list for a channel: the whole roster in a guild, the
    /// recipients plus ourselves in a DM.
    pub fn names_for(&self, channel: Snowflake) -> Vec<String> {
        match self.scope {
            Scope::Guild(_) => self.roster_nicks(),
            Scope::Direct => {
                let recipients = self
                    .state
                    .lock()
                    .channels
                    .get(&channel)
                    .map(|c| c.recipients.clone())
                    .unwrap_or_default();
                let mut names: Vec<String> = recipients.iter().map(|u| self.nick_of(u)).collect();
                names.push(self.nick_of(&self.account.me));
                names
            }
        }
    }

    pub fn member_count(&self, channel: Snowflake) -> usize {
        match self.scope {
            Scope::Guild(_) => self.roster_len(),
            Scope::Direct => {
                self.state
                    .lock()
                    .channels
                    .get(&channel)
                    .map_or(0, |c| c.recipients.len())
                    + 1
            }
        }
    }

    // ── Channels ─────────────────────────────────────────────────────

    fn derive_channel_name(&self, channel: &Channel) -> String {
        if channel.is_private() {
            let nicks: Vec<String> = channel.recipients.iter().map(|u| self.nick_of(u)).collect();
            format::dm_channel_name(&nicks)
        } else {
            format::channel_name(channel.name.as_deref().unwrap_or_default())
        }
    }

    /// Bind a text channel. Non-text channels are ignored.
    pub fn add_channel(&self, channel: Channel) -> Option<Insertion> {
        if !channel.is_text() {
            return None;
        }
        if channel.is_private() {
            let mut state = self.state.lock();
            for user in &channel.recipients {
                state.users.insert(user.id, user.clone());
            }
        }
        let ins = self.channels.insert(channel.id, &self.derive_channel_name(&channel));
        self.state.lock().channels.insert(channel.id, channel);
        Some(ins)
    }

    /// Apply a channel update; [`Insertion::renamed`] reports a rename.
    pub fn update_channel(&self, channel: Channel) -> Option<Insertion> {
        if !channel.is_text() {
            // A channel converted away from text is gone as far as IRC goes.
            self.remove_channel(channel.id);
            return None;
        }
        self.add_channel(channel)
    }

    /// Unbind a channel, returning its former name.
    pub fn remove_channel(&self, id: Snowflake) -> Option<String> {
        self.state.lock().channels.remove(&id);
        self.messages.drop_channel(id);
        self.channels.remove(id)
    }

    pub fn channel(&self, id: Snowflake) -> Option<Channel> {
        self.state.lock().channels.get(&id).cloned()
    }

    pub fn channel_id(&self, name: &str) -> Option<Snowflake> {
        self.channels.resolve_to_id(name)
    }

    pub fn channel_name(&self, id: Snowflake) -> Option<String> {
        self.channels.resolve_to_name(id)
    }

    /// All channels, ordered by name.
    pub fn channel_entries(&self) -> Vec<Entry> {
        self.channels.all_entries()
    }

    /// Snapshot of id → name for every channel.
    pub fn channel_names(&self) -> HashMap<Snowflake, String> {
        self.channels
            .all_entries()
            .into_iter()
            .map(|e| (e.id, e.name))
            .collect()
    }

    /// Topic converted for IRC, if one is set.
    pub fn topic(&self, id: Snowflake) -> Option<String> {
        let raw = self.state.lock().channels.get(&id)?.topic.clone()?;
        let topic = format::topic_to_irc(self, &raw);
        (!topic.is_empty()).then_some(topic)
    }

    // ── Roles ────────────────────────────────────────────────────────

    pub fn add_role(&self, role: Role) {
        self.state.lock().roles.insert(role.id, role);
    }

    pub fn update_role(&self, role: Role) {
        self.add_role(role);
    }

    pub fn remove_role(&self, id: Snowflake) -> Option<Role> {
        self.state.lock().roles.remove(&id)
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Cache a message, replacing any earlier copy.
    pub fn add_message(&self, message: Message) {
        self.messages.insert(message);
    }

    /// Cache a message only if no copy is held (history replay).
    pub fn remember_message(&self, message: Message) {
        self.messages.insert_if_absent(message);
    }

    pub fn get_message(&self, channel: Snowflake, id: Snowflake) -> Result<Message, BridgeError> {
        self.messages
            .get(channel, id)
            .ok_or(BridgeError::MessageNotFound { channel, message: id })
    }

    // ── Connections ──────────────────────────────────────────────────

    pub fn attach(&self, client: Arc<Client>) {
        let mut conns = self.connections.lock();
        if !conns.iter().any(|c| c.id == client.id) {
            conns.push(client);
        }
    }

    pub fn detach(&self, client_id: &str) {
        self.connections.lock().retain(|c| c.id != client_id);
    }

    /// Attached clients, in attach order.
    pub fn connections(&self) -> Vec<Arc<Client>> {
        self.connections.lock().clone()
    }
}

impl Directory for GuildSession {
    fn nick_for(&self, user: Snowflake) -> Option<String> {
        self.users.resolve_to_name(user)
    }

    fn channel_for(&self, channel: Snowflake) -> Option<String> {
        self.channels.resolve_to_name(channel)
    }

    fn role_for(&self, role: Snowflake) -> Option<String> {
        self.state
            .lock()
            .roles
            .get(&role)
            .map(|r| format::nick(&r.name))
    }

    fn user_named(&self, nick: &str) -> Option<Snowflake> {
        self.users.resolve_to_id(nick)
    }

    fn channel_named(&self, name: &str) -> Option<Snowflake> {
        self.channels.resolve_to_id(name)
    }
}

/// Keeps a client attached to a session; detaches on drop.
pub struct Attachment {
    session: Arc<GuildSession>,
    client_id: String,
}

impl Attachment {
    pub fn new(session: Arc<GuildSession>, client: Arc<Client>) -> Self {
        let client_id = client.id.clone();
        session.attach(client);
        Self { session, client_id }
    }

    pub fn session(&self) -> &Arc<GuildSession> {
        &self.session
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.session.detach(&self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordirc_platform::memory::{self, MemoryPlatform};
    use proptest::prelude::*;

    fn session_with(expected: u64) -> GuildSession {
        let me = memory::user(1, "me");
        let platform = Arc::new(MemoryPlatform::new(me.clone()));
        let account = Arc::new(Account::new("token", platform, me));
        let session = GuildSession::empty(account, Scope::Guild(Snowflake(100)), "g".into(), 10);
        session.state.lock().roster.expected = expected;
        session
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(Scope::from_username("DM").unwrap(), Scope::Direct);
        assert_eq!(Scope::from_username("42").unwrap(), Scope::Guild(Snowflake(42)));
        assert!(matches!(
            Scope::from_username("nope"),
            Err(BridgeError::InvalidScope(_))
        ));
    }

    #[test]
    fn roster_completes_at_expected_count() {
        let session = session_with(3);
        session.add_members(vec![memory::member(1, "a"), memory::member(2, "b")]);
        assert!(!session.roster_complete());
        // Duplicate delivery does not count twice.
        session.add_members(vec![memory::member(2, "b")]);
        assert!(!session.roster_complete());
        session.add_members(vec![memory::member(3, "c")]);
        assert!(session.roster_complete());
        assert_eq!(session.roster_nicks(), vec!["a", "b", "c"]);
    }

    #[test]
    fn roster_waits_for_every_chunk_index() {
        let session = session_with(10);
        session.add_chunk(vec![memory::member(3, "c")], 2, 3);
        session.add_chunk(vec![memory::member(1, "a")], 0, 3);
        // Redelivered chunk does not count twice.
        session.add_chunk(vec![memory::member(1, "a")], 0, 3);
        assert!(!session.roster_complete());
        session.add_chunk(vec![memory::member(2, "b")], 1, 3);
        assert!(session.roster_complete());
        assert_eq!(session.roster_len(), 3);
    }

    #[test]
    fn member_update_reports_rename_only_on_change() {
        let session = session_with(0);
        session.add_member(memory::member(5, "eve"));
        assert_eq!(session.update_member(memory::member(5, "eve")), None);
        let mut renamed = memory::member(5, "eve");
        renamed.nick = Some("Evie".into());
        let rename = session.update_member(renamed).unwrap();
        assert_eq!((rename.old.as_str(), rename.new.as_str()), ("eve", "Evie"));
        assert_eq!(session.user_id("evie"), Some(Snowflake(5)));
    }

    #[test]
    fn removed_member_frees_name() {
        let session = session_with(0);
        session.add_member(memory::member(5, "eve"));
        assert_eq!(session.remove_member(Snowflake(5)).as_deref(), Some("eve"));
        assert_eq!(session.user_id("eve"), None);
        assert_eq!(session.remove_member(Snowflake(5)), None);
    }

    #[test]
    fn channels_bind_text_only_and_report_renames() {
        let session = session_with(0);
        assert!(session.add_channel(memory::text_channel(10, 100, "General")).is_some());
        let mut voice = memory::text_channel(11, 100, "Lounge");
        voice.kind = 2;
        assert!(session.add_channel(voice).is_none());
        assert_eq!(session.channel_id("#general"), Some(Snowflake(10)));

        let ins = session.update_channel(memory::text_channel(10, 100, "chat")).unwrap();
        assert_eq!(ins.renamed(), Some(("#general", "#chat")));
        assert_eq!(session.remove_channel(Snowflake(10)).as_deref(), Some("#chat"));
        assert!(session.channel_entries().is_empty());
    }

    #[test]
    fn missing_message_is_an_error() {
        let session = session_with(0);
        assert!(matches!(
            session.get_message(Snowflake(1), Snowflake(2)),
            Err(BridgeError::MessageNotFound { .. })
        ));
        session.add_message(memory::message(2, 1, memory::user(7, "x"), "hi"));
        assert_eq!(session.get_message(Snowflake(1), Snowflake(2)).unwrap().content, "hi");
    }

    #[tokio::test]
    async fn roster_wait_wakes_on_completion() {
        let session = Arc::new(session_with(1));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_roster(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        session.add_member(memory::member(9, "late"));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn roster_wait_times_out() {
        let session = session_with(2);
        let result = session.wait_for_roster(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BridgeError::RosterTimeout(Snowflake(100)))));
    }

    proptest! {
        #[test]
        fn any_chunking_yields_deduplicated_union(
            ids in prop::collection::vec(1u64..60, 1..120),
            cuts in prop::collection::vec(1usize..10, 1..30),
            seed in any::<u64>(),
        ) {
            let mut distinct: Vec<u64> = Vec::new();
            for id in &ids {
                if !distinct.contains(id) {
                    distinct.push(*id);
                }
            }
            let session = session_with(distinct.len() as u64);

            let mut chunks: Vec<Vec<u64>> = Vec::new();
            let mut rest = ids.as_slice();
            let mut i = 0;
            while !rest.is_empty() {
                let n = cuts[i % cuts.len()].min(rest.len());
                chunks.push(rest[..n].to_vec());
                rest = &rest[n..];
                i += 1;
            }
            // Deterministic shuffle of chunk order.
            let len = chunks.len();
            for k in 0..len {
                let j = ((seed.wrapping_mul(k as u64 + 7)) % len as u64) as usize;
                chunks.swap(k, j);
            }

            let mut seen = std::collections::HashSet::new();
            for chunk in chunks {
                prop_assert_eq!(session.roster_complete(), seen.len() == distinct.len());
                for id in &chunk {
                    seen.insert(*id);
                }
                session.add_members(chunk.iter().map(|id| memory::member(*id, &format!("u{id}"))).collect());
            }
            prop_assert!(session.roster_complete());
            prop_assert_eq!(session.roster_len(), distinct.len());
            let nicks: std::collections::HashSet<String> = session.roster_nicks().into_iter().collect();
            let expected: std::collections::HashSet<String> =
                distinct.iter().map(|id| format!("u{id}")).collect();
            prop_assert_eq!(nicks, expected);
        }
    }
}
