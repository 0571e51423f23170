//! Channel commands: JOIN, PART, TOPIC, NAMES, LIST.

use cordirc_platform::Snowflake;
use rand::Rng;
use rand::distributions::Alphanumeric;

use super::Context;
use super::messaging::render_privmsgs;
use crate::format;
use crate::guild::Scope;
use crate::irc;

/// Messages replayed when a channel is joined.
const HISTORY_WINDOW: u8 = 100;
/// Soft limit on the joined names carried by one 353 line.
const NAMES_LINE_LIMIT: usize = 400;

pub(super) async fn handle_join(ctx: &Context, msg: &irc::Message) {
    let Some(target) = msg.params.first() else {
        ctx.need_more_params("JOIN");
        return;
    };
    let channels: Vec<(Snowflake, String)> = if target == "*" {
        ctx.session
            .channel_entries()
            .into_iter()
            .map(|e| (e.id, e.name))
            .collect()
    } else {
        let mut found = Vec::new();
        for name in target.split(',').filter(|n| !n.is_empty()) {
            match ctx.session.channel_id(name) {
                Some(id) => {
                    let name = ctx.session.channel_name(id).unwrap_or_else(|| name.to_string());
                    found.push((id, name));
                }
                None => ctx
                    .client
                    .numeric(irc::ERR_NOSUCHCHANNEL, vec![name, "No such channel"]),
            }
        }
        found
    };
    for (id, name) in channels {
        join_channel(ctx, id, name).await;
    }
}

async fn join_channel(ctx: &Context, id: Snowflake, name: String) {
    let line = format!(":{} JOIN {name}", ctx.prefix());
    if !ctx.client.join(id, vec![line]).await {
        return;
    }
    tracing::debug!(session_id = %ctx.client.id, channel = %name, "Joined");

    let topic = ctx.clone();
    let topic_name = name.clone();
    tokio::spawn(async move { send_topic(&topic, id, &topic_name, false) });

    let history = ctx.clone();
    let history_name = name.clone();
    tokio::spawn(async move { replay_history(&history, id, &history_name).await });

    let names = ctx.clone();
    tokio::spawn(async move { send_names(&names, id, &name).await });
}

fn batch_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Replay recent history oldest first, wrapped in a batch when the client
/// negotiated `batch`.
pub(super) async fn replay_history(ctx: &Context, id: Snowflake, name: &str) {
    let messages = match ctx
        .session
        .platform()
        .fetch_recent_messages(id, HISTORY_WINDOW)
        .await
    {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(channel = %id, error = %e, "History fetch failed");
            ctx.client
                .notice("There was an error getting messages from Discord.");
            return;
        }
    };
    if messages.is_empty() {
        return;
    }

    let batch = ctx.client.has_cap("batch").then(batch_id);
    let server_name = &ctx.state.server_name;
    let mut lines = Vec::new();
    if let Some(ref batch) = batch {
        let open = format!("+{batch}");
        lines.push(
            irc::Message::from_server(server_name, "BATCH", vec![&open, "chathistory", name])
                .to_string(),
        );
    }
    let count = messages.len();
    // Fetched newest first.
    for message in messages.into_iter().rev() {
        let text = format::message_lines(&*ctx.session, &message);
        let nick = ctx.session.nick_of(&message.author);
        let prefix = format::prefix(&nick, &message.author);
        lines.extend(render_privmsgs(
            &ctx.client,
            &prefix,
            name,
            &text,
            message.timestamp,
            batch.as_deref(),
        ));
        ctx.session.remember_message(message);
    }
    if let Some(ref batch) = batch {
        let close = format!("-{batch}");
        lines.push(irc::Message::from_server(server_name, "BATCH", vec![&close]).to_string());
    }
    tracing::debug!(channel = %id, count, "History replayed");
    // One request, so the batch stays contiguous.
    ctx.client.relay(id, lines);
}

pub(super) async fn handle_part(ctx: &Context, msg: &irc::Message) {
    let Some(target) = msg.params.first() else {
        ctx.need_more_params("PART");
        return;
    };
    let reason = msg.params.get(1).map(String::as_str).unwrap_or("Leaving");
    for name in target.split(',').filter(|n| !n.is_empty()) {
        let Some(id) = ctx.session.channel_id(name) else {
            ctx.client
                .numeric(irc::ERR_NOSUCHCHANNEL, vec![name, "No such channel"]);
            continue;
        };
        let canonical = ctx.session.channel_name(id).unwrap_or_else(|| name.to_string());
        let line = format!(":{} PART {canonical} :{reason}", ctx.prefix());
        if !ctx.client.part(id, vec![line]).await {
            ctx.client
                .numeric(irc::ERR_NOTONCHANNEL, vec![name, "You're not on that channel"]);
        }
    }
}

pub(super) async fn handle_topic(ctx: &Context, msg: &irc::Message) {
    let Some(name) = msg.params.first().map(String::as_str) else {
        ctx.need_more_params("TOPIC");
        return;
    };
    let Some(id) = ctx.session.channel_id(name) else {
        ctx.client
            .numeric(irc::ERR_NOSUCHCHANNEL, vec![name, "No such channel"]);
        return;
    };
    if msg.params.len() > 1 {
        ctx.client
            .notice("Changing channel topics from IRC is not supported");
        return;
    }
    if !ctx.client.is_joined(id).await {
        ctx.client
            .numeric(irc::ERR_NOTONCHANNEL, vec![name, "You're not on that channel"]);
        return;
    }
    let canonical = ctx.session.channel_name(id).unwrap_or_else(|| name.to_string());
    send_topic(ctx, id, &canonical, true);
}

/// 332/333 for a set topic; 331 only when asked explicitly.
fn send_topic(ctx: &Context, id: Snowflake, name: &str, reply_if_unset: bool) {
    match ctx.session.topic(id) {
        Some(topic) => ctx.client.send_lines(vec![
            ctx.client.numeric_line(irc::RPL_TOPIC, vec![name, &topic]),
            ctx.client
                .numeric_line(irc::RPL_TOPICWHOTIME, vec![name, "noone", "0"]),
        ]),
        None if reply_if_unset => ctx
            .client
            .numeric(irc::RPL_NOTOPIC, vec![name, "No topic is set"]),
        None => {}
    }
}

pub(super) async fn handle_names(ctx: &Context, msg: &irc::Message) {
    let Some(target) = msg.params.first() else {
        ctx.client
            .numeric(irc::RPL_ENDOFNAMES, vec!["*", "End of /NAMES list"]);
        return;
    };
    for name in target.split(',').filter(|n| !n.is_empty()) {
        match ctx.session.channel_id(name) {
            Some(id) => {
                let canonical = ctx.session.channel_name(id).unwrap_or_else(|| name.to_string());
                send_names(ctx, id, &canonical).await;
            }
            None => ctx
                .client
                .numeric(irc::RPL_ENDOFNAMES, vec![name, "End of /NAMES list"]),
        }
    }
}

/// Roster listing for a channel. In a guild this waits for the member list
/// to be complete.
pub(super) async fn send_names(ctx: &Context, id: Snowflake, name: &str) {
    if let Scope::Guild(_) = ctx.session.scope()
        && let Err(e) = ctx
            .session
            .wait_for_roster(ctx.state.config.roster_timeout())
            .await
    {
        tracing::warn!(channel = %id, error = %e, "Roster wait timed out");
        ctx.client.notice(&format!("{e}"));
        ctx.client
            .numeric(irc::RPL_ENDOFNAMES, vec![name, "End of /NAMES list"]);
        return;
    }
    let names = ctx.session.names_for(id);
    let mut lines: Vec<String> = paginate_names(&names, NAMES_LINE_LIMIT)
        .iter()
        .map(|chunk| {
            ctx.client
                .numeric_line(irc::RPL_NAMREPLY, vec!["=", name, chunk.as_str()])
        })
        .collect();
    lines.push(
        ctx.client
            .numeric_line(irc::RPL_ENDOFNAMES, vec![name, "End of /NAMES list"]),
    );
    ctx.client.send_lines(lines);
}

/// Pack names into space-separated lines of at most `limit` bytes. A single
/// name longer than the limit gets a line of its own.
pub(crate) fn paginate_names(names: &[String], limit: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut current = String::new();
    for name in names {
        if !current.is_empty() && current.len() + 1 + name.len() > limit {
            pages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(name);
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}

pub(super) fn handle_list(ctx: &Context) {
    let mut lines = vec![
        ctx.client
            .numeric_line(irc::RPL_LISTSTART, vec!["Channel", "Users  Name"]),
    ];
    for entry in ctx.session.channel_entries() {
        let count = ctx.session.member_count(entry.id).to_string();
        let topic = ctx.session.topic(entry.id).unwrap_or_default();
        lines.push(
            ctx.client
                .numeric_line(irc::RPL_LIST, vec![entry.name.as_str(), &count, &topic]),
        );
    }
    lines.push(ctx.client.numeric_line(irc::RPL_LISTEND, vec!["End of /LIST"]));
    ctx.client.send_lines(lines);
}
