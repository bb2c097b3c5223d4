//! The gateway envelope and dispatch-event taxonomy (spec §4.D, §4.G, §9).
//!
//! Dispatch payloads are modeled as a tagged sum over event names with a
//! shared envelope, the way `client-api-messages`'s `ClientMessage` /
//! `ServerMessage` model the SpacetimeDB wire protocol — except here the
//! wire format is JSON, not BSATN, so the tag dispatch happens on the `t`
//! field of the envelope rather than an enum discriminant. Unknown events
//! fall back to a catch-all variant carrying the raw JSON (spec §9).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Channel, Guild, GuildEmoji, GuildMember, Message, ReadyPayload, Role, Thread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOpcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    Unknown(u8),
}

impl From<u8> for GatewayOpcode {
    fn from(v: u8) -> Self {
        match v {
            0 => GatewayOpcode::Dispatch,
            1 => GatewayOpcode::Heartbeat,
            2 => GatewayOpcode::Identify,
            3 => GatewayOpcode::PresenceUpdate,
            4 => GatewayOpcode::VoiceStateUpdate,
            6 => GatewayOpcode::Resume,
            7 => GatewayOpcode::Reconnect,
            8 => GatewayOpcode::RequestGuildMembers,
            9 => GatewayOpcode::InvalidSession,
            10 => GatewayOpcode::Hello,
            11 => GatewayOpcode::HeartbeatAck,
            other => GatewayOpcode::Unknown(other),
        }
    }
}

impl From<GatewayOpcode> for u8 {
    fn from(op: GatewayOpcode) -> u8 {
        match op {
            GatewayOpcode::Dispatch => 0,
            GatewayOpcode::Heartbeat => 1,
            GatewayOpcode::Identify => 2,
            GatewayOpcode::PresenceUpdate => 3,
            GatewayOpcode::VoiceStateUpdate => 4,
            GatewayOpcode::Resume => 6,
            GatewayOpcode::Reconnect => 7,
            GatewayOpcode::RequestGuildMembers => 8,
            GatewayOpcode::InvalidSession => 9,
            GatewayOpcode::Hello => 10,
            GatewayOpcode::HeartbeatAck => 11,
            GatewayOpcode::Unknown(other) => other,
        }
    }
}

/// The raw envelope every gateway frame arrives in, before `d` is parsed
/// into a typed [`DispatchEvent`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn opcode(&self) -> GatewayOpcode {
        self.op.into()
    }
}

#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct InvalidSessionData(pub bool);

#[derive(Debug, Deserialize)]
pub struct ThreadListSyncData {
    pub guild_id: archive_types::GuildId,
    pub channel_ids: Option<Vec<archive_types::ChannelId>>,
    pub threads: Vec<Thread>,
}

#[derive(Debug, Deserialize)]
pub struct GuildMembersChunkData {
    pub guild_id: archive_types::GuildId,
    pub members: Vec<GuildMember>,
    pub chunk_index: u32,
    pub chunk_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct MessageReactionAddData {
    pub user_id: archive_types::UserId,
    pub channel_id: archive_types::ChannelId,
    pub message_id: archive_types::MessageId,
    pub guild_id: Option<archive_types::GuildId>,
    pub emoji: crate::model::Emoji,
    #[serde(default)]
    pub burst: bool,
}

#[derive(Debug, Deserialize)]
pub struct MessageReactionRemoveData {
    pub user_id: archive_types::UserId,
    pub channel_id: archive_types::ChannelId,
    pub message_id: archive_types::MessageId,
    pub emoji: crate::model::Emoji,
}

#[derive(Debug, Deserialize)]
pub struct MessageReactionRemoveEmojiData {
    pub channel_id: archive_types::ChannelId,
    pub message_id: archive_types::MessageId,
    pub emoji: crate::model::Emoji,
}

#[derive(Debug, Deserialize)]
pub struct MessageReactionRemoveAllData {
    pub channel_id: archive_types::ChannelId,
    pub message_id: archive_types::MessageId,
}

#[derive(Debug, Deserialize)]
pub struct MessageDeleteData {
    pub id: archive_types::MessageId,
    pub channel_id: archive_types::ChannelId,
    pub guild_id: Option<archive_types::GuildId>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelDeleteData {
    pub id: archive_types::ChannelId,
    pub guild_id: Option<archive_types::GuildId>,
}

#[derive(Debug, Deserialize)]
pub struct GuildMemberRemoveData {
    pub guild_id: archive_types::GuildId,
    pub user: crate::model::User,
}

#[derive(Debug, Deserialize)]
pub struct GuildRoleCreateUpdateData {
    pub guild_id: archive_types::GuildId,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct GuildRoleDeleteData {
    pub guild_id: archive_types::GuildId,
    pub role_id: archive_types::RoleId,
}

/// A dispatched event, tagged by the envelope's `t` field. Unknown event
/// names decode to [`DispatchEvent::Unknown`] rather than failing, matching
/// the "logged at verbose, ignored" handling in spec §7.
#[derive(Debug)]
pub enum DispatchEvent {
    Ready(ReadyPayload),
    GuildCreate(Guild),
    GuildUpdate(Guild),
    GuildDelete { id: archive_types::GuildId },
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(ChannelDeleteData),
    ThreadCreate(Thread),
    ThreadUpdate(Thread),
    ThreadDelete(ChannelDeleteData),
    ThreadListSync(ThreadListSyncData),
    GuildRoleCreate(GuildRoleCreateUpdateData),
    GuildRoleUpdate(GuildRoleCreateUpdateData),
    GuildRoleDelete(GuildRoleDeleteData),
    GuildMemberRemove(GuildMemberRemoveData),
    GuildMembersChunk(GuildMembersChunkData),
    GuildEmojisUpdate { guild_id: archive_types::GuildId, emojis: Vec<GuildEmoji> },
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete(MessageDeleteData),
    MessageReactionAdd(MessageReactionAddData),
    MessageReactionRemove(MessageReactionRemoveData),
    MessageReactionRemoveEmoji(MessageReactionRemoveEmojiData),
    MessageReactionRemoveAll(MessageReactionRemoveAllData),
    Unknown { name: String, data: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeDispatchError {
    #[error("dispatch payload missing event name")]
    MissingEventName,
    #[error("failed to decode `{event}` payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DispatchEvent {
    pub fn decode(payload: &GatewayPayload) -> Result<Self, DecodeDispatchError> {
        let name = payload.t.as_deref().ok_or(DecodeDispatchError::MissingEventName)?;
        let data = payload.d.clone();
        let decode = |data: Value| -> Result<_, serde_json::Error> { serde_json::from_value(data) };
        macro_rules! variant {
            ($ctor:expr) => {
                decode(data).map($ctor).map_err(|source| DecodeDispatchError::Payload {
                    event: name.to_string(),
                    source,
                })
            };
        }
        Ok(match name {
            "READY" => variant!(DispatchEvent::Ready)?,
            "GUILD_CREATE" => variant!(DispatchEvent::GuildCreate)?,
            "GUILD_UPDATE" => variant!(DispatchEvent::GuildUpdate)?,
            "GUILD_DELETE" => {
                #[derive(Deserialize)]
                struct D {
                    id: archive_types::GuildId,
                }
                let d: D = decode(data).map_err(|source| DecodeDispatchError::Payload {
                    event: name.to_string(),
                    source,
                })?;
                DispatchEvent::GuildDelete { id: d.id }
            }
            "CHANNEL_CREATE" => variant!(DispatchEvent::ChannelCreate)?,
            "CHANNEL_UPDATE" => variant!(DispatchEvent::ChannelUpdate)?,
            "CHANNEL_DELETE" => variant!(DispatchEvent::ChannelDelete)?,
            "THREAD_CREATE" => variant!(DispatchEvent::ThreadCreate)?,
            "THREAD_UPDATE" => variant!(DispatchEvent::ThreadUpdate)?,
            "THREAD_DELETE" => variant!(DispatchEvent::ThreadDelete)?,
            "THREAD_LIST_SYNC" => variant!(DispatchEvent::ThreadListSync)?,
            "GUILD_ROLE_CREATE" => variant!(DispatchEvent::GuildRoleCreate)?,
            "GUILD_ROLE_UPDATE" => variant!(DispatchEvent::GuildRoleUpdate)?,
            "GUILD_ROLE_DELETE" => variant!(DispatchEvent::GuildRoleDelete)?,
            "GUILD_MEMBER_REMOVE" => variant!(DispatchEvent::GuildMemberRemove)?,
            "GUILD_MEMBERS_CHUNK" => variant!(DispatchEvent::GuildMembersChunk)?,
            "GUILD_EMOJIS_UPDATE" => {
                #[derive(Deserialize)]
                struct D {
                    guild_id: archive_types::GuildId,
                    emojis: Vec<GuildEmoji>,
                }
                let d: D = decode(data).map_err(|source| DecodeDispatchError::Payload {
                    event: name.to_string(),
                    source,
                })?;
                DispatchEvent::GuildEmojisUpdate {
                    guild_id: d.guild_id,
                    emojis: d.emojis,
                }
            }
            "MESSAGE_CREATE" => variant!(DispatchEvent::MessageCreate)?,
            "MESSAGE_UPDATE" => variant!(DispatchEvent::MessageUpdate)?,
            "MESSAGE_DELETE" => variant!(DispatchEvent::MessageDelete)?,
            "MESSAGE_REACTION_ADD" => variant!(DispatchEvent::MessageReactionAdd)?,
            "MESSAGE_REACTION_REMOVE" => variant!(DispatchEvent::MessageReactionRemove)?,
            "MESSAGE_REACTION_REMOVE_EMOJI" => variant!(DispatchEvent::MessageReactionRemoveEmoji)?,
            "MESSAGE_REACTION_REMOVE_ALL" => variant!(DispatchEvent::MessageReactionRemoveAll)?,
            other => DispatchEvent::Unknown {
                name: other.to_string(),
                data,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips_through_u8() {
        for raw in [0u8, 1, 2, 9, 10, 11, 200] {
            let op = GatewayOpcode::from(raw);
            assert_eq!(u8::from(op), raw);
        }
    }

    #[test]
    fn unknown_event_name_decodes_to_catchall() {
        let payload = GatewayPayload {
            op: 0,
            d: serde_json::json!({"foo": "bar"}),
            s: Some(1),
            t: Some("SOME_FUTURE_EVENT".to_string()),
        };
        match DispatchEvent::decode(&payload).unwrap() {
            DispatchEvent::Unknown { name, .. } => assert_eq!(name, "SOME_FUTURE_EVENT"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn missing_event_name_on_dispatch_is_an_error() {
        let payload = GatewayPayload {
            op: 0,
            d: Value::Null,
            s: None,
            t: None,
        };
        assert!(matches!(
            DispatchEvent::decode(&payload),
            Err(DecodeDispatchError::MissingEventName)
        ));
    }
}
