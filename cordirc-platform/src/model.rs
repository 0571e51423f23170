//! Entity snapshots as delivered by the platform.
//!
//! Only the fields the bridge reads are modelled; everything else in the
//! platform payloads is ignored by serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snowflake::Snowflake;

/// Channel type codes.
pub mod channel_kind {
    pub const GUILD_TEXT: u8 = 0;
    pub const DM: u8 = 1;
    pub const GUILD_VOICE: u8 = 2;
    pub const GROUP_DM: u8 = 3;
    pub const GUILD_CATEGORY: u8 = 4;
    pub const GUILD_ANNOUNCEMENT: u8 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    /// Legacy four-digit tag; `"0"` for accounts on unique usernames.
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// Name shown to other users when no guild nickname applies.
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }

    /// `username#1234` for legacy accounts, plain `username` otherwise.
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some(d) if !d.is_empty() && d != "0" => format!("{}#{d}", self.username),
            _ => self.username.clone(),
        }
    }
}

/// A user's membership in one guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user: User,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
}

impl Member {
    pub fn display_name(&self) -> &str {
        self.nick.as_deref().unwrap_or_else(|| self.user.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    /// Other participants of a DM or group DM.
    #[serde(default)]
    pub recipients: Vec<User>,
}

impl Channel {
    /// Channels that carry chat messages and can be bridged.
    pub fn is_text(&self) -> bool {
        matches!(
            self.kind,
            channel_kind::GUILD_TEXT
                | channel_kind::GUILD_ANNOUNCEMENT
                | channel_kind::DM
                | channel_kind::GROUP_DM
        )
    }

    pub fn is_private(&self) -> bool {
        matches!(self.kind, channel_kind::DM | channel_kind::GROUP_DM)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Snowflake,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guild {
    pub id: Snowflake,
    pub name: String,
    /// Exact count, present on gateway guild payloads.
    #[serde(default)]
    pub member_count: Option<u64>,
    /// Estimate, present on REST payloads fetched `with_counts`.
    #[serde(default)]
    pub approximate_member_count: Option<u64>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

impl Guild {
    /// Member total the roster is expected to reach once all chunks arrive.
    pub fn expected_members(&self) -> u64 {
        self.member_count
            .or(self.approximate_member_count)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub url: String,
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_payload_decodes() {
        let json = r#"{
            "id": "1100000000000000000",
            "channel_id": "200",
            "guild_id": "300",
            "author": {"id": "400", "username": "alice", "discriminator": "0", "global_name": "Alice A"},
            "content": "hi <@500>",
            "timestamp": "2024-01-01T12:00:00.000000+00:00",
            "edited_timestamp": null,
            "pinned": false,
            "mentions": [{"id": "500", "username": "bob"}],
            "attachments": [],
            "embeds": [],
            "type": 0
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.guild_id, Some(Snowflake(300)));
        assert_eq!(msg.author.display_name(), "Alice A");
        assert_eq!(msg.author.tag(), "alice");
        assert_eq!(msg.mentions[0].id, Snowflake(500));
        assert!(!msg.pinned);
    }

    #[test]
    fn legacy_tag_keeps_discriminator() {
        let user = User {
            id: Snowflake(1),
            username: "carol".into(),
            discriminator: Some("0420".into()),
            global_name: None,
            bot: false,
        };
        assert_eq!(user.tag(), "carol#0420");
        assert_eq!(user.display_name(), "carol");
    }

    #[test]
    fn member_nick_wins_over_user_names() {
        let member: Member = serde_json::from_str(
            r#"{"user": {"id": "1", "username": "dave", "global_name": "Dave"}, "nick": "Captain", "roles": ["9"]}"#,
        )
        .unwrap();
        assert_eq!(member.display_name(), "Captain");
        assert_eq!(member.roles, vec![Snowflake(9)]);
    }

    #[test]
    fn guild_expected_members_prefers_exact_count() {
        let guild: Guild = serde_json::from_str(
            r#"{"id": "1", "name": "g", "member_count": 10, "approximate_member_count": 12}"#,
        )
        .unwrap();
        assert_eq!(guild.expected_members(), 10);
        let rest: Guild =
            serde_json::from_str(r#"{"id": "1", "name": "g", "approximate_member_count": 12}"#).unwrap();
        assert_eq!(rest.expected_members(), 12);
    }

    #[test]
    fn voice_and_category_channels_are_not_text() {
        let voice: Channel = serde_json::from_str(r#"{"id": "1", "type": 2, "name": "lounge"}"#).unwrap();
        let dm: Channel = serde_json::from_str(r#"{"id": "2", "type": 1, "recipients": []}"#).unwrap();
        assert!(!voice.is_text());
        assert!(dm.is_text());
        assert!(dm.is_private());
    }
}
