//! Upstream events.
//!
//! Each variant carries the full entity snapshot the platform delivered, so
//! consumers never need a follow-up lookup to apply it.

use serde::Deserialize;
use serde_json::Value;

use crate::model::{Channel, Member, Message, Role, User};
use crate::snowflake::Snowflake;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The event stream is live; `user` is the account the credential belongs to.
    Ready { user: User },
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete {
        id: Snowflake,
        channel_id: Snowflake,
        guild_id: Option<Snowflake>,
    },
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),
    RoleCreate { guild_id: Snowflake, role: Role },
    RoleUpdate { guild_id: Snowflake, role: Role },
    RoleDelete { guild_id: Snowflake, role_id: Snowflake },
    MemberAdd { guild_id: Snowflake, member: Member },
    MemberUpdate { guild_id: Snowflake, member: Member },
    MemberRemove { guild_id: Snowflake, user: User },
    /// One slice of a guild's member list, answering a roster request.
    MembersChunk {
        guild_id: Snowflake,
        members: Vec<Member>,
        chunk_index: u32,
        chunk_count: u32,
    },
}

#[derive(Deserialize)]
struct ReadyPayload {
    user: User,
}

#[derive(Deserialize)]
struct DeletePayload {
    id: Snowflake,
    channel_id: Snowflake,
    #[serde(default)]
    guild_id: Option<Snowflake>,
}

#[derive(Deserialize)]
struct RolePayload {
    guild_id: Snowflake,
    role: Role,
}

#[derive(Deserialize)]
struct RoleDeletePayload {
    guild_id: Snowflake,
    role_id: Snowflake,
}

#[derive(Deserialize)]
struct MemberPayload {
    guild_id: Snowflake,
    #[serde(flatten)]
    member: Member,
}

#[derive(Deserialize)]
struct MemberRemovePayload {
    guild_id: Snowflake,
    user: User,
}

#[derive(Deserialize)]
struct ChunkPayload {
    guild_id: Snowflake,
    members: Vec<Member>,
    #[serde(default)]
    chunk_index: u32,
    #[serde(default = "one")]
    chunk_count: u32,
}

fn one() -> u32 {
    1
}

impl Event {
    /// Decode a gateway dispatch by its event name.
    ///
    /// Dispatches the bridge has no use for decode to `Ok(None)`.
    pub fn from_dispatch(kind: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
        use serde_json::from_value;

        let event = match kind {
            "READY" => {
                let p: ReadyPayload = from_value(data)?;
                Event::Ready { user: p.user }
            }
            "MESSAGE_CREATE" => Event::MessageCreate(from_value(data)?),
            "MESSAGE_UPDATE" => Event::MessageUpdate(from_value(data)?),
            "MESSAGE_DELETE" => {
                let p: DeletePayload = from_value(data)?;
                Event::MessageDelete {
                    id: p.id,
                    channel_id: p.channel_id,
                    guild_id: p.guild_id,
                }
            }
            "CHANNEL_CREATE" => Event::ChannelCreate(from_value(data)?),
            "CHANNEL_UPDATE" => Event::ChannelUpdate(from_value(data)?),
            "CHANNEL_DELETE" => Event::ChannelDelete(from_value(data)?),
            "GUILD_ROLE_CREATE" => {
                let p: RolePayload = from_value(data)?;
                Event::RoleCreate { guild_id: p.guild_id, role: p.role }
            }
            "GUILD_ROLE_UPDATE" => {
                let p: RolePayload = from_value(data)?;
                Event::RoleUpdate { guild_id: p.guild_id, role: p.role }
            }
            "GUILD_ROLE_DELETE" => {
                let p: RoleDeletePayload = from_value(data)?;
                Event::RoleDelete { guild_id: p.guild_id, role_id: p.role_id }
            }
            "GUILD_MEMBER_ADD" => {
                let p: MemberPayload = from_value(data)?;
                Event::MemberAdd { guild_id: p.guild_id, member: p.member }
            }
            "GUILD_MEMBER_UPDATE" => {
                let p: MemberPayload = from_value(data)?;
                Event::MemberUpdate { guild_id: p.guild_id, member: p.member }
            }
            "GUILD_MEMBER_REMOVE" => {
                let p: MemberRemovePayload = from_value(data)?;
                Event::MemberRemove { guild_id: p.guild_id, user: p.user }
            }
            "GUILD_MEMBERS_CHUNK" => {
                let p: ChunkPayload = from_value(data)?;
                Event::MembersChunk {
                    guild_id: p.guild_id,
                    members: p.members,
                    chunk_index: p.chunk_index,
                    chunk_count: p.chunk_count,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Guild the event belongs to, if it is guild-scoped.
    pub fn guild_id(&self) -> Option<Snowflake> {
        match self {
            Event::Ready { .. } => None,
            Event::MessageCreate(m) | Event::MessageUpdate(m) => m.guild_id,
            Event::MessageDelete { guild_id, .. } => *guild_id,
            Event::ChannelCreate(c) | Event::ChannelUpdate(c) | Event::ChannelDelete(c) => c.guild_id,
            Event::RoleCreate { guild_id, .. }
            | Event::RoleUpdate { guild_id, .. }
            | Event::RoleDelete { guild_id, .. }
            | Event::MemberAdd { guild_id, .. }
            | Event::MemberUpdate { guild_id, .. }
            | Event::MemberRemove { guild_id, .. }
            | Event::MembersChunk { guild_id, .. } => Some(*guild_id),
        }
    }
}
