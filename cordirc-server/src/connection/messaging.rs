//! PRIVMSG, and rendering of relayed messages.

use chrono::{DateTime, Utc};

use super::Context;
use super::client::Client;
use crate::format;
use crate::irc;

pub(super) async fn handle_privmsg(ctx: &Context, msg: &irc::Message) {
    let Some(target) = msg.params.first() else {
        ctx.client
            .numeric(irc::ERR_NORECIPIENT, vec!["No recipient given (PRIVMSG)"]);
        return;
    };
    let Some(text) = msg.params.get(1).filter(|t| !t.is_empty()) else {
        ctx.client.numeric(irc::ERR_NOTEXTTOSEND, vec!["No text to send"]);
        return;
    };
    let Some(channel) = ctx.session.channel_id(target) else {
        ctx.client
            .numeric(irc::ERR_NOSUCHCHANNEL, vec![target.as_str(), "No such channel"]);
        return;
    };
    let content = format::irc_to_discord(&*ctx.session, text);
    if content.trim().is_empty() {
        return;
    }

    // Remembered before sending: the echo can arrive before the reply.
    ctx.client.remember_sent(channel, &content);
    match ctx.session.platform().send_message(channel, &content).await {
        Ok(id) => {
            tracing::debug!(session_id = %ctx.client.id, channel = %channel, message = %id, "Sent");
        }
        Err(e) => {
            ctx.client.forget_sent(channel, &content);
            tracing::warn!(session_id = %ctx.client.id, channel = %channel, error = %e, "Send failed");
            ctx.client
                .notice("There was an error sending your message.");
        }
    }
}

/// One PRIVMSG per line from `prefix` to `target`, tagged for the client's
/// capabilities.
pub(crate) fn render_privmsgs(
    client: &Client,
    prefix: &str,
    target: &str,
    lines: &[String],
    at: DateTime<Utc>,
    batch: Option<&str>,
) -> Vec<String> {
    let time = client.has_cap("server-time").then(|| format::server_time(at));
    lines
        .iter()
        .map(|line| {
            let mut msg = irc::Message::from_user(prefix, "PRIVMSG", vec![target, line]);
            if let Some(time) = &time {
                msg = msg.with_tag("time", time);
            }
            if let Some(batch) = batch {
                msg = msg.with_tag("batch", batch);
            }
            msg.to_string()
        })
        .collect()
}
