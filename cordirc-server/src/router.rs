//! Upstream event routing.
//!
//! One router task runs per connected account. It applies each event to the
//! matching guild session and fans the result out to the IRC clients
//! attached to it. Events are handled in arrival order, so two updates to the
//! same entity are never reordered.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use cordirc_platform::{Channel, Event, Member, Message, Snowflake, User};
use tokio::sync::mpsc;

use crate::connection::messaging::render_privmsgs;
use crate::format;
use crate::guild::{GuildSession, Scope};
use crate::registry::{Account, SessionRegistry};

pub async fn run(
    registry: Weak<SessionRegistry>,
    account: Arc<Account>,
    mut events: mpsc::Receiver<Event>,
) {
    while let Some(event) = events.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        dispatch(&registry, &account, event).await;
    }
    tracing::info!(user = %account.me.tag(), "Upstream event stream ended");
}

async fn dispatch(registry: &SessionRegistry, account: &Arc<Account>, event: Event) {
    let event = match event {
        Event::Ready { user } => {
            tracing::debug!(user = %user.tag(), "Upstream ready");
            return;
        }
        // Messages may open a session (a DM nobody has looked at yet); every
        // other event only concerns sessions that already exist.
        Event::MessageCreate(message) => {
            let scope = Scope::of(message.guild_id);
            match registry.session(account, scope).await {
                Ok(session) => message_created(&session, message).await,
                Err(e) => tracing::warn!(%scope, error = %e, "Dropping message: no session"),
            }
            return;
        }
        other => other,
    };
    let scope = Scope::of(event.guild_id());
    let Some(session) = registry.lookup(&account.credential, scope) else {
        return;
    };
    match event {
        Event::MessageUpdate(message) => message_updated(&session, message),
        Event::MessageDelete { id, channel_id, .. } => message_deleted(&session, channel_id, id),
        Event::ChannelCreate(channel) => {
            session.add_channel(channel);
        }
        Event::ChannelUpdate(channel) => channel_updated(&session, channel),
        Event::ChannelDelete(channel) => channel_deleted(&session, channel.id),
        Event::RoleCreate { role, .. } => session.add_role(role),
        Event::RoleUpdate { role, .. } => session.update_role(role),
        Event::RoleDelete { role_id, .. } => {
            session.remove_role(role_id);
        }
        Event::MemberAdd { member, .. } => member_added(&session, member),
        Event::MemberUpdate { member, .. } => member_updated(&session, member),
        Event::MemberRemove { user, .. } => member_removed(&session, &user),
        Event::MembersChunk {
            members,
            chunk_index,
            chunk_count,
            ..
        } => {
            let received = members.len();
            session.add_chunk(members, chunk_index, chunk_count);
            tracing::debug!(
                scope = %scope,
                chunk = chunk_index + 1,
                of = chunk_count,
                received,
                total = session.roster_len(),
                "Member chunk"
            );
        }
        Event::Ready { .. } | Event::MessageCreate(_) => {}
    }
}

/// IRC name of a message's channel, learning unseen DM conversations.
async fn resolve_channel(session: &GuildSession, channel: Snowflake) -> Option<String> {
    if let Some(name) = session.channel_name(channel) {
        return Some(name);
    }
    if session.scope() != Scope::Direct {
        return None;
    }
    match session.platform().channel(channel).await {
        Ok(fetched) => session.add_channel(fetched).map(|ins| ins.name),
        Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "Unknown conversation");
            None
        }
    }
}

async fn message_created(session: &Arc<GuildSession>, message: Message) {
    session.add_message(message.clone());
    let Some(target) = resolve_channel(session, message.channel_id).await else {
        tracing::debug!(channel = %message.channel_id, "Message for unknown channel");
        return;
    };
    let lines = format::message_lines(&**session, &message);
    if lines.is_empty() {
        return;
    }
    let nick = session.nick_of(&message.author);
    let prefix = format::prefix(&nick, &message.author);
    let own = message.author.id == session.account().me.id;

    for client in session.connections() {
        if own && client.take_echo(message.channel_id, &message.content) && !client.has_cap("echo-message") {
            continue;
        }
        let rendered = render_privmsgs(&client, &prefix, &target, &lines, message.timestamp, None);
        if session.scope() == Scope::Direct {
            // Conversations open themselves on the first message.
            let me = format::prefix(&client.nick(), &session.account().me);
            client.open(message.channel_id, vec![format!(":{me} JOIN {target}")], rendered);
        } else {
            client.relay(message.channel_id, rendered);
        }
    }
}

fn relay_notice(session: &GuildSession, message: &Message, lines: Vec<String>, at: DateTime<Utc>) {
    let Some(target) = session.channel_name(message.channel_id) else {
        return;
    };
    let nick = session.nick_of(&message.author);
    let prefix = format::prefix(&nick, &message.author);
    for client in session.connections() {
        let rendered = render_privmsgs(&client, &prefix, &target, &lines, at, None);
        client.relay(message.channel_id, rendered);
    }
}

fn message_updated(session: &GuildSession, message: Message) {
    let Ok(old) = session.get_message(message.channel_id, message.id) else {
        session.add_message(message);
        return;
    };
    if old.content == message.content && old.pinned == message.pinned {
        session.add_message(message);
        return;
    }
    let sent = format::relative_time(message.id.created_at(), Utc::now());
    let mut lines = Vec::new();
    if old.pinned != message.pinned {
        let verb = if message.pinned { "pinned" } else { "unpinned" };
        lines.push(format!("\x0312message sent \x0f\x02{sent} was {verb}\x0f:"));
        lines.extend(format::message_lines(session, &old));
    } else {
        lines.push(format!("\x0312message sent \x0f\x02{sent}\x0f:"));
        lines.extend(format::message_lines(session, &old));
        lines.push("\x0312was edited to:".to_string());
        lines.extend(format::message_lines(session, &message));
    }
    let at = message.edited_timestamp.unwrap_or_else(Utc::now);
    relay_notice(session, &message, lines, at);
    session.add_message(message);
}

fn message_deleted(session: &GuildSession, channel: Snowflake, id: Snowflake) {
    if session.connections().is_empty() {
        return;
    }
    let Ok(old) = session.get_message(channel, id) else {
        tracing::debug!(channel = %channel, message = %id, "Delete for uncached message");
        return;
    };
    let sent = format::relative_time(id.created_at(), Utc::now());
    let mut lines = vec![format!(
        "\x0304message sent \x0f\x02{sent}\x0f \x0304in this channel was deleted:"
    )];
    lines.extend(format::message_lines(session, &old));
    relay_notice(session, &old, lines, Utc::now());
}

fn channel_updated(session: &GuildSession, channel: Channel) {
    if !channel.is_text() {
        channel_deleted(session, channel.id);
        return;
    }
    let id = channel.id;
    let Some(ins) = session.update_channel(channel) else {
        return;
    };
    let Some((old, new)) = ins.renamed() else {
        return;
    };
    tracing::debug!(channel = %id, %old, %new, "Channel renamed");
    for client in session.connections() {
        let me = format::prefix(&client.nick(), &session.account().me);
        client.relay(
            id,
            vec![
                format!(":{me} PART {old} :Renamed to {new}"),
                format!(":{me} JOIN {new}"),
            ],
        );
    }
}

fn channel_deleted(session: &GuildSession, id: Snowflake) {
    let Some(name) = session.remove_channel(id) else {
        return;
    };
    for client in session.connections() {
        let me = format::prefix(&client.nick(), &session.account().me);
        client.evict(id, vec![format!(":{me} PART {name} :Channel deleted")]);
    }
}

fn member_added(session: &GuildSession, member: Member) {
    let user = member.user.clone();
    let (ins, fresh) = session.add_member(member);
    // A bound name (say, from an earlier message) may change to the member's.
    if let Some((old, new)) = ins.renamed() {
        let line = format!(":{} NICK {new}", format::prefix(old, &user));
        let is_me = user.id == session.account().me.id;
        for client in session.connections() {
            if is_me {
                client.set_nick(new);
            }
            client.send(&line);
        }
    }
    if !fresh {
        return;
    }
    let prefix = format::prefix(&ins.name, &user);
    let joins: HashMap<Snowflake, String> = session
        .channel_names()
        .into_iter()
        .map(|(id, name)| (id, format!(":{prefix} JOIN {name}")))
        .collect();
    let joins = Arc::new(joins);
    for client in session.connections() {
        client.each_joined(joins.clone());
    }
}

fn member_updated(session: &GuildSession, member: Member) {
    let Some(rename) = session.update_member(member) else {
        return;
    };
    let line = format!(
        ":{} NICK {}",
        format::prefix(&rename.old, &rename.user),
        rename.new
    );
    let is_me = rename.user.id == session.account().me.id;
    for client in session.connections() {
        if is_me {
            client.set_nick(&rename.new);
        }
        client.send(&line);
    }
}

fn member_removed(session: &GuildSession, user: &User) {
    let Some(nick) = session.remove_member(user.id) else {
        return;
    };
    let line = format!(":{} QUIT :Quit", format::prefix(&nick, user));
    for client in session.connections() {
        client.send(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::connection::client::{Client, run_writer};
    use cordirc_platform::memory::{self, MemoryConnector, MemoryPlatform};
    use tokio::io::{AsyncBufReadExt, BufReader};

    const GUILD: Scope = Scope::Guild(Snowflake(100));

    struct Harness {
        registry: Arc<SessionRegistry>,
        account: Arc<Account>,
        session: Arc<GuildSession>,
        client: Arc<Client>,
        reader: BufReader<tokio::io::DuplexStream>,
    }

    /// A session with one attached client. No router runs, so events reach
    /// the session only through [`Harness::deliver`].
    async fn harness(scope: Scope, expected_members: u64) -> Harness {
        let me = memory::user(1, "me");
        let platform = Arc::new(MemoryPlatform::new(me.clone()));
        platform.add_guild(memory::guild(
            100,
            "Guild",
            vec![memory::text_channel(10, 100, "general")],
            expected_members,
        ));
        platform.add_private_channel(memory::dm_channel(50, vec![memory::user(2, "bob")]));
        let account = Arc::new(Account::new("tok", platform, me));
        let registry = SessionRegistry::new(Arc::new(MemoryConnector::new()), 100);
        let session = registry.session(&account, scope).await.unwrap();

        let (tx, rx) = mpsc::channel(64);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_writer(rx, ours, "test".into()));
        let client = Arc::new(Client::new("c1".into(), "cordirc", tx));
        client.set_nick("me");
        session.attach(client.clone());
        if scope == GUILD {
            assert!(client.join(Snowflake(10), vec![]).await);
        }
        Harness {
            registry,
            account,
            session,
            client,
            reader: BufReader::new(theirs),
        }
    }

    impl Harness {
        async fn deliver(&self, event: Event) {
            dispatch(&self.registry, &self.account, event).await;
        }

        /// Lines written so far, up to a PING marker.
        async fn drain(&mut self) -> Vec<String> {
            self.client.send("PING :mark");
            let mut out = Vec::new();
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end().to_string();
                if line == "PING :mark" {
                    return out;
                }
                out.push(line);
            }
        }
    }

    fn guild_message(id: u64, content: &str) -> Message {
        let mut m = memory::message(id, 10, memory::user(2, "bob"), content);
        m.guild_id = Some(Snowflake(100));
        m
    }

    fn chunk(index: u32, count: u32, members: Vec<Member>) -> Event {
        Event::MembersChunk {
            guild_id: Snowflake(100),
            members,
            chunk_index: index,
            chunk_count: count,
        }
    }

    #[tokio::test]
    async fn new_messages_are_relayed() {
        let mut h = harness(GUILD, 0).await;
        h.deliver(Event::MessageCreate(guild_message(500, "hello\nworld"))).await;
        let lines = h.drain().await;
        assert_eq!(
            lines,
            vec![
                ":bob!bob@2 PRIVMSG #general hello",
                ":bob!bob@2 PRIVMSG #general world",
            ]
        );
    }

    #[tokio::test]
    async fn first_direct_message_opens_the_conversation() {
        let mut h = harness(Scope::Direct, 0).await;
        let dm = memory::message(700, 50, memory::user(2, "bob"), "hi there");
        h.deliver(Event::MessageCreate(dm.clone())).await;
        let mut again = dm;
        again.id = Snowflake(701);
        h.deliver(Event::MessageCreate(again)).await;
        assert_eq!(
            h.drain().await,
            vec![
                ":me!me@1 JOIN #bob",
                ":bob!bob@2 PRIVMSG #bob :hi there",
                ":bob!bob@2 PRIVMSG #bob :hi there",
            ]
        );
    }

    #[tokio::test]
    async fn stalled_client_does_not_hold_up_direct_messages() {
        let mut h = harness(Scope::Direct, 0).await;
        // A second client whose socket nobody reads: its writer blocks.
        let (tx, rx) = mpsc::channel(64);
        let (ours, _unread) = tokio::io::duplex(64);
        tokio::spawn(run_writer(rx, ours, "stalled".into()));
        let stalled = Arc::new(Client::new("c2".into(), "cordirc", tx));
        stalled.set_nick("me");
        for _ in 0..8 {
            stalled.send("x".repeat(200));
        }
        h.session.attach(stalled.clone());

        let dm = memory::message(700, 50, memory::user(2, "bob"), "hi there");
        tokio::time::timeout(Duration::from_secs(2), h.deliver(Event::MessageCreate(dm)))
            .await
            .expect("event handling blocked on a stalled client");
        assert_eq!(
            h.drain().await,
            vec![":me!me@1 JOIN #bob", ":bob!bob@2 PRIVMSG #bob :hi there"]
        );
    }

    #[tokio::test]
    async fn pin_toggle_is_not_an_edit() {
        let mut h = harness(GUILD, 0).await;
        h.session.add_message(guild_message(500, "note"));
        let mut pinned = guild_message(500, "note");
        pinned.pinned = true;
        h.deliver(Event::MessageUpdate(pinned)).await;
        let lines = h.drain().await;
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("was pinned"));
        assert!(lines.iter().all(|l| !l.contains("edited")));
        assert!(lines[1].ends_with(" note"));
    }

    #[tokio::test]
    async fn unpin_is_reported() {
        let mut h = harness(GUILD, 0).await;
        let mut pinned = guild_message(500, "note");
        pinned.pinned = true;
        h.session.add_message(pinned);
        h.deliver(Event::MessageUpdate(guild_message(500, "note"))).await;
        let lines = h.drain().await;
        assert!(lines[0].contains("was unpinned"));
    }

    #[tokio::test]
    async fn edit_emits_sent_and_edited_pair() {
        let mut h = harness(GUILD, 0).await;
        h.session.add_message(guild_message(500, "teh"));
        h.deliver(Event::MessageUpdate(guild_message(500, "the"))).await;
        let lines = h.drain().await;
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("message sent"));
        assert!(lines[1].ends_with(" teh"));
        assert!(lines[2].contains("was edited to:"));
        assert!(lines[3].ends_with(" the"));
        assert_eq!(
            h.session.get_message(Snowflake(10), Snowflake(500)).unwrap().content,
            "the"
        );
    }

    #[tokio::test]
    async fn unchanged_or_uncached_updates_are_silent() {
        let mut h = harness(GUILD, 0).await;
        h.deliver(Event::MessageUpdate(guild_message(500, "first sight"))).await;
        h.deliver(Event::MessageUpdate(guild_message(500, "first sight"))).await;
        assert!(h.drain().await.is_empty());
        assert!(h.session.get_message(Snowflake(10), Snowflake(500)).is_ok());
    }

    #[tokio::test]
    async fn delete_replays_cached_content() {
        let mut h = harness(GUILD, 0).await;
        h.session.add_message(guild_message(500, "oops"));
        h.deliver(Event::MessageDelete {
            id: Snowflake(500),
            channel_id: Snowflake(10),
            guild_id: Some(Snowflake(100)),
        })
        .await;
        let lines = h.drain().await;
        assert!(lines[0].contains("was deleted"));
        assert!(lines[1].ends_with(" oops"));

        // Unknown message: nothing.
        h.deliver(Event::MessageDelete {
            id: Snowflake(501),
            channel_id: Snowflake(10),
            guild_id: Some(Snowflake(100)),
        })
        .await;
        assert!(h.drain().await.is_empty());
    }

    #[tokio::test]
    async fn member_lifecycle_fans_out() {
        let mut h = harness(GUILD, 0).await;
        let guild_id = Snowflake(100);
        h.deliver(Event::MemberAdd { guild_id, member: memory::member(7, "eve") }).await;
        let mut renamed = memory::member(7, "eve");
        renamed.nick = Some("evie".into());
        h.deliver(Event::MemberUpdate { guild_id, member: renamed.clone() }).await;
        // Same name again: no NICK.
        h.deliver(Event::MemberUpdate { guild_id, member: renamed }).await;
        h.deliver(Event::MemberRemove { guild_id, user: memory::user(7, "eve") }).await;
        assert_eq!(
            h.drain().await,
            vec![
                ":eve!eve@7 JOIN #general",
                ":eve!eve@7 NICK evie",
                ":evie!eve@7 QUIT :Quit",
            ]
        );
    }

    #[tokio::test]
    async fn joining_member_renames_an_author_first() {
        let mut h = harness(GUILD, 0).await;
        // Seen as a message author before the member record arrived.
        h.deliver(Event::MessageCreate(guild_message(500, "hi"))).await;
        let mut member = memory::member(2, "bob");
        member.nick = Some("bobby".into());
        h.deliver(Event::MemberAdd { guild_id: Snowflake(100), member }).await;
        assert_eq!(
            h.drain().await,
            vec![
                ":bob!bob@2 PRIVMSG #general hi",
                ":bob!bob@2 NICK bobby",
                ":bobby!bob@2 JOIN #general",
            ]
        );
        assert_eq!(h.session.user_id("bobby"), Some(Snowflake(2)));
    }

    #[tokio::test]
    async fn channel_rename_and_delete() {
        let mut h = harness(GUILD, 0).await;
        h.deliver(Event::ChannelUpdate(memory::text_channel(10, 100, "chat"))).await;
        h.deliver(Event::ChannelDelete(memory::text_channel(10, 100, "chat"))).await;
        assert_eq!(
            h.drain().await,
            vec![
                ":me!me@1 PART #general :Renamed to #chat",
                ":me!me@1 JOIN #chat",
                ":me!me@1 PART #chat :Channel deleted",
            ]
        );
        assert!(!h.client.is_joined(Snowflake(10)).await);
    }

    #[tokio::test]
    async fn own_echo_is_suppressed_once() {
        let mut h = harness(GUILD, 0).await;
        h.client.remember_sent(Snowflake(10), "mine");
        let mut echo = memory::message(600, 10, memory::user(1, "me"), "mine");
        echo.guild_id = Some(Snowflake(100));
        h.deliver(Event::MessageCreate(echo.clone())).await;
        assert!(h.drain().await.is_empty());

        // Sent from elsewhere: shown.
        echo.id = Snowflake(601);
        h.deliver(Event::MessageCreate(echo)).await;
        assert_eq!(h.drain().await, vec![":me!me@1 PRIVMSG #general mine"]);
    }

    #[tokio::test]
    async fn last_chunk_completes_roster() {
        let h = harness(GUILD, 0).await;
        // A guild announcing zero members is complete from the start.
        assert!(h.session.roster_complete());
        h.deliver(chunk(0, 1, vec![memory::member(3, "carol")])).await;
        assert_eq!(h.session.roster_nicks(), vec!["carol"]);
    }

    #[tokio::test]
    async fn out_of_order_chunks_wait_for_the_rest() {
        let h = harness(GUILD, 3).await;
        assert!(!h.session.roster_complete());
        h.deliver(chunk(1, 2, vec![memory::member(3, "carol")])).await;
        assert!(!h.session.roster_complete());
        assert_eq!(h.session.roster_len(), 1);
        h.deliver(chunk(0, 2, vec![memory::member(4, "dave"), memory::member(5, "erin")]))
            .await;
        assert!(h.session.roster_complete());
        assert_eq!(h.session.roster_len(), 3);
    }
}
