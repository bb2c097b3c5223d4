use std::fmt;

use serde::{Deserialize, Serialize};

/// A snowflake: a 64-bit id whose upper bits encode a creation timestamp.
///
/// Deserializes from either a JSON number or a JSON string, since the
/// upstream REST/gateway payloads send snowflakes as strings to avoid
/// precision loss in JavaScript clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Snowflake(pub u64);

impl Snowflake {
    pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

    pub fn created_at_unix_ms(self) -> u64 {
        (self.0 >> 22) + Self::DISCORD_EPOCH_MS
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Snowflake {
    fn from(v: u64) -> Self {
        Snowflake(v)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Num(u64),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => s.parse::<u64>().map(Snowflake).map_err(serde::de::Error::custom),
            Repr::Num(n) => Ok(Snowflake(n)),
        }
    }
}

macro_rules! snowflake_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Snowflake);

        impl $name {
            pub fn get(self) -> u64 {
                self.0 .0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                $name(Snowflake(v))
            }
        }

        impl From<Snowflake> for $name {
            fn from(v: Snowflake) -> Self {
                $name(v)
            }
        }
    };
}

snowflake_newtype!(GuildId);
snowflake_newtype!(ChannelId);
snowflake_newtype!(UserId);
snowflake_newtype!(MessageId);
snowflake_newtype!(RoleId);
snowflake_newtype!(EmojiId);
snowflake_newtype!(AttachmentId);
snowflake_newtype!(ApplicationId);

/// An author-of-message surrogate for webhooks, keyed by an internal id
/// strictly below `1 << 32` so it can never collide with a real snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookUserId(pub u32);

/// Identifies one archiver account (one chat-service token) inside the
/// scheduler's registry. Assigned sequentially by the registry, not by the
/// upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account#{}", self.0)
    }
}

/// The versioned entity kinds the snapshot store knows about (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Guild,
    Role,
    Member,
    Channel,
    Thread,
    ForumTag,
    Message,
    GuildEmoji,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::User,
        EntityKind::Guild,
        EntityKind::Role,
        EntityKind::Member,
        EntityKind::Channel,
        EntityKind::Thread,
        EntityKind::ForumTag,
        EntityKind::Message,
        EntityKind::GuildEmoji,
    ];

    /// The table-name fragment used by `latest_<kind>_snapshots` /
    /// `previous_<kind>_snapshots` (spec §6).
    pub fn table_fragment(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Guild => "guild",
            EntityKind::Role => "role",
            EntityKind::Member => "member",
            EntityKind::Channel => "channel",
            EntityKind::Thread => "thread",
            EntityKind::ForumTag => "forum_tag",
            EntityKind::Message => "message",
            EntityKind::GuildEmoji => "guild_emoji",
        }
    }

    /// Whether this kind has no separate `latest` table (member: latest is
    /// `max(_timestamp)` over `member_snapshots`, spec §3.1).
    pub fn is_history_only(self) -> bool {
        matches!(self, EntityKind::Member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflake_deserializes_from_string_and_number() {
        let from_str: Snowflake = serde_json::from_str(r#""123456789""#).unwrap();
        let from_num: Snowflake = serde_json::from_str("123456789").unwrap();
        assert_eq!(from_str, from_num);
        assert_eq!(from_str.0, 123_456_789);
    }

    #[test]
    fn channel_id_newtype_roundtrips() {
        let id = ChannelId::from(42u64);
        let json = serde_json::to_string(&id).unwrap();
        let back: ChannelId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
