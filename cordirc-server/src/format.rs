//! Text conversion between Discord markup and IRC.
//!
//! Everything here is stateless; lookups of names and ids go through a
//! [`Directory`], which a guild session implements.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use cordirc_platform::{Message, Snowflake, User};
use regex::{Captures, Regex};

/// Maximum nickname length produced by [`nick`].
pub const NICK_LEN: usize = 30;
/// Maximum channel name length produced by [`channel_name`].
pub const CHANNEL_LEN: usize = 50;

/// Name and id lookups needed to translate mentions.
pub trait Directory {
    fn nick_for(&self, user: Snowflake) -> Option<String>;
    fn channel_for(&self, channel: Snowflake) -> Option<String>;
    fn role_for(&self, role: Snowflake) -> Option<String>;
    fn user_named(&self, nick: &str) -> Option<Snowflake>;
    fn channel_named(&self, name: &str) -> Option<Snowflake>;
}

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?(\d+)>").expect("static regex"));
static ROLE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@&(\d+)>").expect("static regex"));
static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#(\d+)>").expect("static regex"));
static CUSTOM_EMOJI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<a?:(\w+):\d+>").expect("static regex"));

static IRC_HIGHLIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s:,]+)[:,](\s|$)").expect("static regex"));
static IRC_NICK_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@([A-Za-z0-9_\-\[\]\\^{}|`]+)").expect("static regex")
});
static IRC_CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)(#[^\s,]+)").expect("static regex"));
static IRC_COLOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x03(\d{1,2}(,\d{1,2})?)?").expect("static regex"));

fn parse_id(caps: &Captures<'_>) -> Option<Snowflake> {
    caps.get(1)?.as_str().parse().ok()
}

/// Convert Discord message markup to plain IRC text.
///
/// `mentions` carries the user objects delivered with the message and is
/// consulted when a mentioned user is not in the directory.
pub fn discord_to_irc(dir: &dyn Directory, content: &str, mentions: &[User]) -> String {
    let text = USER_MENTION.replace_all(content, |caps: &Captures<'_>| {
        let name = parse_id(caps).and_then(|id| {
            dir.nick_for(id).or_else(|| {
                mentions
                    .iter()
                    .find(|u| u.id == id)
                    .map(|u| nick(u.display_name()))
            })
        });
        match name {
            Some(name) => format!("@{name}"),
            None => caps[0].to_string(),
        }
    });
    let text = ROLE_MENTION.replace_all(&text, |caps: &Captures<'_>| {
        match parse_id(caps).and_then(|id| dir.role_for(id)) {
            Some(role) => format!("@{role}"),
            None => caps[0].to_string(),
        }
    });
    let text = CHANNEL_MENTION.replace_all(&text, |caps: &Captures<'_>| {
        match parse_id(caps).and_then(|id| dir.channel_for(id)) {
            Some(channel) => channel,
            None => caps[0].to_string(),
        }
    });
    CUSTOM_EMOJI.replace_all(&text, ":$1:").into_owned()
}

/// Lines to relay for one message: the converted body split on newlines,
/// then one line per attachment URL. Empty lines are dropped.
pub fn message_lines(dir: &dyn Directory, message: &Message) -> Vec<String> {
    let body = discord_to_irc(dir, &message.content, &message.mentions);
    body.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .chain(message.attachments.iter().map(|a| a.url.clone()))
        .collect()
}

/// Convert a channel topic; topics are single-line on IRC.
pub fn topic_to_irc(dir: &dyn Directory, topic: &str) -> String {
    let converted = discord_to_irc(dir, topic, &[]);
    converted
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Convert text typed by an IRC user into Discord markup.
pub fn irc_to_discord(dir: &dyn Directory, text: &str) -> String {
    let (text, action) = match text
        .strip_prefix("\x01ACTION ")
        .or_else(|| text.strip_prefix("\x01ACTION"))
    {
        Some(inner) => (inner.trim_end_matches('\x01'), true),
        None => (text, false),
    };

    let text = IRC_COLOR.replace_all(text, "");

    let text = IRC_HIGHLIGHT.replace(&text, |caps: &Captures<'_>| {
        match dir.user_named(&caps[1]) {
            Some(id) => format!("<@{id}>{}", &caps[2]),
            None => caps[0].to_string(),
        }
    });
    let text = IRC_NICK_MENTION.replace_all(&text, |caps: &Captures<'_>| {
        match dir.user_named(&caps[1]) {
            Some(id) => format!("<@{id}>"),
            None => caps[0].to_string(),
        }
    });
    let text = IRC_CHANNEL_MENTION.replace_all(&text, |caps: &Captures<'_>| {
        match dir.channel_named(&caps[2]) {
            Some(id) => format!("{}<#{id}>", &caps[1]),
            None => caps[0].to_string(),
        }
    });

    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\x02' => out.push_str("**"),
            '\x1d' => out.push('*'),
            '\x1f' => out.push_str("__"),
            '\x1e' => out.push_str("~~"),
            '\x11' => out.push('`'),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    if action {
        format!("*{}*", out.trim())
    } else {
        out
    }
}

/// Derive an IRC nickname from a display name.
pub fn nick(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            c if c.is_ascii_alphanumeric() => out.push(c),
            '-' | '_' | '[' | ']' | '\\' | '^' | '{' | '}' | '|' | '`' => out.push(c),
            ' ' => out.push('_'),
            _ => {}
        }
    }
    if out.is_empty() {
        return "user".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        out.insert(0, '_');
    }
    out.truncate(NICK_LEN);
    out
}

/// Derive an IRC channel name (with `#`) from a platform channel name.
pub fn channel_name(raw: &str) -> String {
    let mut out = String::from("#");
    for c in raw.trim_start_matches('#').chars() {
        match c {
            ' ' => out.push('-'),
            ',' | ':' | '\x07' => {}
            c if c.is_control() || c.is_whitespace() => {}
            c => out.extend(c.to_lowercase()),
        }
    }
    if out.len() == 1 {
        out.push_str("channel");
    }
    if out.len() > CHANNEL_LEN {
        let mut end = CHANNEL_LEN;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

/// Name of a DM conversation: the recipients' nicks joined by `+`.
pub fn dm_channel_name(recipient_nicks: &[String]) -> String {
    if recipient_nicks.is_empty() {
        return channel_name("dm");
    }
    channel_name(&recipient_nicks.join("+"))
}

/// Username part of a hostmask.
pub fn ident(user: &User) -> String {
    let ident: String = user
        .username
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(16)
        .collect();
    if ident.is_empty() {
        "user".to_string()
    } else {
        ident.to_ascii_lowercase()
    }
}

/// `nick!ident@<user id>`
pub fn prefix(nick: &str, user: &User) -> String {
    format!("{nick}!{}@{}", ident(user), user.id)
}

/// Human-friendly age of `then` as seen at `now`, e.g. "3 minutes ago".
pub fn relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    if secs < 1 {
        return "just now".to_string();
    }
    let (n, unit) = match secs {
        s if s < 60 => (s, "second"),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s if s < 86_400 * 30 => (s / 86_400, "day"),
        s if s < 86_400 * 365 => (s / (86_400 * 30), "month"),
        s => (s / (86_400 * 365), "year"),
    };
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

/// IRCv3 `time` tag value.
pub fn server_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
