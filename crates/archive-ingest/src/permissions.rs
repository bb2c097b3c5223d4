//! Bridges the wire model and the mirror to the pure permission evaluator
//! (spec §4.E, §4.G.4 `update_guild_channel_permissions`).

use std::collections::HashSet;

use archive_permissions::{channel_permissions, guild_permissions, parse_permissions};
pub use archive_permissions::{Overwrite, OverwriteKind};
use archive_scheduler::AccountId;
use archive_types::{ChannelId, GuildId, Permissions};
use archive_wire::model::Channel;

use crate::mirror::{CachedChannel, CachedGuild, Mirror};

/// Normalizes upstream permission overwrites into the evaluator's sentinel
/// convention: the `@everyone` overwrite shares the guild's id upstream,
/// but [`archive_permissions::channel_permissions`] expects it tagged
/// `id == 0`.
pub fn overwrites_from_channel(channel: &Channel, guild_id: GuildId) -> Vec<Overwrite> {
    channel
        .permission_overwrites
        .as_ref()
        .map(|raw| {
            raw.iter()
                .map(|ow| {
                    let id = if ow.id.0 == guild_id.get() { 0 } else { ow.id.0 };
                    Overwrite {
                        id,
                        kind: if ow.kind == 0 { OverwriteKind::Role } else { OverwriteKind::Member },
                        allow: parse_permissions(&ow.allow),
                        deny: parse_permissions(&ow.deny),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `guild_permissions` fed from the mirror's per-account role list.
pub fn account_guild_permissions(guild: &CachedGuild, user_id: u64, account_roles: &[Permissions]) -> Permissions {
    guild_permissions(user_id, guild.owner_id.get(), guild.everyone_permissions(), account_roles)
}

/// `channel_permissions` for one account in one channel, reading the
/// account's resolved guild permissions and role ids out of the mirror.
pub fn account_channel_permissions(guild: &CachedGuild, channel: &CachedChannel, account: AccountId) -> Permissions {
    let Some(data) = guild.account_data.get(&account) else {
        return Permissions::NONE;
    };
    let role_ids: Vec<u64> = data.roles.iter().map(|r| r.get()).collect();
    channel_permissions(data.user_id.get(), guild.owner_id.get(), data.guild_permissions, &role_ids, &channel.permission_overwrites)
}

/// The result of recomputing one channel's account permissions: which
/// accounts newly have read / manage-threads, and which lost it (spec
/// §4.G.4).
#[derive(Debug, Default)]
pub struct PermissionDiff {
    pub gained_read: Vec<AccountId>,
    pub lost_read: Vec<AccountId>,
    pub gained_manage_threads: Vec<AccountId>,
    pub lost_manage_threads: Vec<AccountId>,
}

/// Recomputes `accounts_with_read` / `accounts_with_manage_threads` for one
/// channel against every account the guild currently tracks, diffing
/// against the previous sets (spec §4.G.4 "diff the previous sets against
/// the new ones per account").
pub fn recompute_channel_permissions(mirror: &mut Mirror, guild_id: GuildId, channel_id: ChannelId) -> PermissionDiff {
    let Some(guild) = mirror.guild(guild_id) else {
        return PermissionDiff::default();
    };
    let account_ids: Vec<AccountId> = guild.account_data.keys().copied().collect();

    let mut new_read = HashSet::new();
    let mut new_manage_threads = HashSet::new();
    if let Some(channel) = mirror.channel(channel_id) {
        for account in &account_ids {
            let Some(guild) = mirror.guild(guild_id) else { break };
            let perms = account_channel_permissions(guild, channel, *account);
            if perms.has(Permissions::VIEW_CHANNEL) {
                new_read.insert(*account);
            }
            if perms.has(Permissions::MANAGE_THREADS) {
                new_manage_threads.insert(*account);
            }
        }
    }

    let mut diff = PermissionDiff::default();
    if let Some(channel) = mirror.channel_mut(channel_id) {
        for account in new_read.difference(&channel.accounts_with_read) {
            diff.gained_read.push(*account);
        }
        for account in channel.accounts_with_read.difference(&new_read) {
            diff.lost_read.push(*account);
        }
        for account in new_manage_threads.difference(&channel.accounts_with_manage_threads) {
            diff.gained_manage_threads.push(*account);
        }
        for account in channel.accounts_with_manage_threads.difference(&new_manage_threads) {
            diff.lost_manage_threads.push(*account);
        }
        channel.accounts_with_read = new_read;
        channel.accounts_with_manage_threads = new_manage_threads;
    }
    diff
}
