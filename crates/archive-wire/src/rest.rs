//! REST route and rate-limit bucket identity (spec §4.C).
//!
//! A `Bucket` is the key the rate limiter budgets tokens against: the route
//! shape plus whichever path parameter the upstream service scopes its
//! per-route limit to (usually the channel or guild id). Two calls to
//! different messages in the same channel share a bucket; two calls to the
//! same route in different channels do not.

use std::fmt;

use archive_types::{ChannelId, GuildId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    GetChannel,
    GetChannelMessages,
    GetMessage,
    GetReactions,
    GetGuild,
    GetGuildRoles,
    GetGuildChannels,
    GetGuildMembers,
    GetActiveThreads,
    GetThreadMembers,
    GetPublicArchivedThreads,
    GetPrivateArchivedThreads,
}

impl Route {
    /// Method + path template, for logging and for matching the upstream
    /// service's per-route bucket semantics (some routes share a bucket
    /// across methods that touch the same resource).
    pub fn template(self) -> &'static str {
        match self {
            Route::GetChannel => "GET /channels/{channel_id}",
            Route::GetChannelMessages => "GET /channels/{channel_id}/messages",
            Route::GetMessage => "GET /channels/{channel_id}/messages/{message_id}",
            Route::GetReactions => "GET /channels/{channel_id}/messages/{message_id}/reactions/{emoji}",
            Route::GetGuild => "GET /guilds/{guild_id}",
            Route::GetGuildRoles => "GET /guilds/{guild_id}/roles",
            Route::GetGuildChannels => "GET /guilds/{guild_id}/channels",
            Route::GetGuildMembers => "GET /guilds/{guild_id}/members",
            Route::GetActiveThreads => "GET /guilds/{guild_id}/threads/active",
            Route::GetThreadMembers => "GET /channels/{channel_id}/thread-members",
            Route::GetPublicArchivedThreads => "GET /channels/{channel_id}/threads/archived/public",
            Route::GetPrivateArchivedThreads => "GET /channels/{channel_id}/threads/archived/private",
        }
    }
}

/// The resource the bucket is scoped to, when the route is parameterized by
/// one. `None` for routes that share a single global bucket (none currently
/// defined, but the shape leaves room for one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Channel(ChannelId),
    Guild(GuildId),
    Message(ChannelId, MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bucket {
    pub route: Route,
    pub resource: Resource,
}

impl Bucket {
    pub fn channel(route: Route, channel_id: ChannelId) -> Bucket {
        Bucket {
            route,
            resource: Resource::Channel(channel_id),
        }
    }

    pub fn guild(route: Route, guild_id: GuildId) -> Bucket {
        Bucket {
            route,
            resource: Resource::Guild(guild_id),
        }
    }

    pub fn message(route: Route, channel_id: ChannelId, message_id: MessageId) -> Bucket {
        Bucket {
            route,
            resource: Resource::Message(channel_id, message_id),
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource {
            Resource::Channel(id) => write!(f, "{}#{id}", self.route.template()),
            Resource::Guild(id) => write!(f, "{}#{id}", self.route.template()),
            Resource::Message(channel_id, message_id) => {
                write!(f, "{}#{channel_id}/{message_id}", self.route.template())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_for_different_channels_are_distinct() {
        let a = Bucket::channel(Route::GetChannelMessages, ChannelId::from(1u64));
        let b = Bucket::channel(Route::GetChannelMessages, ChannelId::from(2u64));
        assert_ne!(a, b);
    }

    #[test]
    fn buckets_for_same_channel_and_route_are_equal() {
        let a = Bucket::channel(Route::GetChannelMessages, ChannelId::from(1u64));
        let b = Bucket::channel(Route::GetChannelMessages, ChannelId::from(1u64));
        assert_eq!(a, b);
    }
}
