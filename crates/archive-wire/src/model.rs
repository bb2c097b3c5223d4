//! Domain object shapes shared between gateway dispatch payloads and REST
//! responses. These are the values `archive-store::encode_object` flattens
//! into snapshot rows (spec §3, §4.A).

use archive_types::{AttachmentId, ChannelId, EmojiId, GuildId, MessageId, RoleId, Snowflake, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryGuild {
    pub identity_guild_id: Option<GuildId>,
    pub identity_enabled: Option<bool>,
    pub tag: Option<String>,
    pub badge: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collectibles {
    pub nameplate: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub discriminator: String,
    pub global_name: Option<String>,
    pub avatar: Option<String>,
    pub bot: Option<bool>,
    #[serde(rename = "type")]
    pub kind: Option<i32>,
    pub primary_guild: Option<PrimaryGuild>,
    pub collectibles: Option<Collectibles>,
    /// Fields the upstream sends that this type doesn't model, preserved
    /// verbatim into the store's `_extra` column rather than dropped
    /// (spec §4.A "Encoding contract").
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTags {
    pub bot_id: Option<UserId>,
    pub premium_subscriber: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub color: u32,
    pub hoist: bool,
    pub position: i32,
    pub permissions: String,
    pub managed: bool,
    pub mentionable: bool,
    pub tags: Option<RoleTags>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildMember {
    /// Absent on `GUILD_MEMBER_REMOVE` and on the "member left" tombstone
    /// (spec §3.1); present otherwise.
    pub user: Option<User>,
    pub nick: Option<String>,
    pub avatar: Option<String>,
    pub roles: Vec<RoleId>,
    pub joined_at: Option<String>,
    pub premium_since: Option<String>,
    pub pending: Option<bool>,
    pub communication_disabled_until: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: u8,
    pub allow: String,
    pub deny: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumTag {
    pub id: Snowflake,
    pub name: String,
    pub moderated: bool,
    pub emoji_id: Option<EmojiId>,
    pub emoji_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub guild_id: Option<GuildId>,
    #[serde(rename = "type")]
    pub kind: i32,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub nsfw: Option<bool>,
    pub position: Option<i32>,
    pub parent_id: Option<ChannelId>,
    pub bitrate: Option<i32>,
    pub rate_limit_per_user: Option<i32>,
    pub permission_overwrites: Option<Vec<PermissionOverwrite>>,
    pub available_tags: Option<Vec<ForumTag>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub archived: bool,
    pub auto_archive_duration: i32,
    pub archive_timestamp: String,
    pub locked: bool,
    pub invitable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: ChannelId,
    pub guild_id: Option<GuildId>,
    #[serde(rename = "type")]
    pub kind: i32,
    pub name: Option<String>,
    pub parent_id: Option<ChannelId>,
    pub owner_id: Option<UserId>,
    pub message_count: Option<i32>,
    pub member_count: Option<i32>,
    pub rate_limit_per_user: Option<i32>,
    pub thread_metadata: Option<ThreadMetadata>,
    pub applied_tags: Option<Vec<Snowflake>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: GuildId,
    pub name: String,
    pub icon: Option<String>,
    pub owner_id: UserId,
    pub roles: Vec<Role>,
    pub channels: Option<Vec<Channel>>,
    pub threads: Option<Vec<Thread>>,
    pub emojis: Vec<GuildEmoji>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildEmoji {
    pub id: EmojiId,
    pub name: String,
    pub animated: Option<bool>,
    pub available: Option<bool>,
    pub roles: Option<Vec<RoleId>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    pub url: String,
    pub proxy_url: String,
    pub size: i64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReference {
    pub message_id: Option<MessageId>,
    pub channel_id: Option<ChannelId>,
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReactionSummary {
    pub emoji: Emoji,
    pub count: i64,
    #[serde(default)]
    pub burst: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub author: Option<User>,
    pub webhook_id: Option<Snowflake>,
    pub application_id: Option<Snowflake>,
    pub content: String,
    pub timestamp: String,
    pub edited_timestamp: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Kept opaque: the store's message-write path treats this as an
    /// embed-only update carrier, never as part of snapshot identity
    /// (spec §4.A.3).
    #[serde(default)]
    pub embeds: Vec<Value>,
    pub message_reference: Option<MessageReference>,
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub reactions: Vec<MessageReactionSummary>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emoji {
    pub id: Option<EmojiId>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionType {
    Normal,
    Burst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub user: User,
    pub session_id: String,
    pub resume_gateway_url: String,
}
