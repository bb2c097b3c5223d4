//! Gateway dispatch handling (spec §4.G.4): one event at a time, mutating
//! the mirror and the store and occasionally starting or stopping a
//! backfill task. Runs entirely on the controller's single task — nothing
//! here is behind a lock (spec §5).

use archive_permissions::parse_permissions;
use archive_scheduler::{AccountId, ReferenceSide};
use archive_store::AddSnapshotOptions;
use archive_types::{ChannelId, EntityKind, GuildId, Timing};
use archive_wire::gateway::DispatchEvent;
use archive_wire::model::{Channel, Guild};

use crate::controller::IngestController;
use crate::error::IngestError;
use crate::mirror::CachedChannel;
use crate::permissions::{overwrites_from_channel, recompute_channel_permissions};

/// Channel kinds worth caching and scheduling a sync for: text, announcement,
/// forum and their thread variants. Voice channels carry no message history.
fn is_cacheable_channel(kind: i32) -> bool {
    matches!(kind, 0 | 5 | 10 | 11 | 12 | 15 | 16)
}

pub(crate) fn upsert_cached_channel(ctl: &mut IngestController, guild_id: GuildId, channel: &Channel) {
    let overwrites = overwrites_from_channel(channel, guild_id);
    let existing = ctl.mirror.channel(channel.id);
    let cached = CachedChannel {
        id: channel.id,
        guild_id,
        name: channel.name.clone().unwrap_or_default(),
        kind: channel.kind,
        permission_overwrites: overwrites,
        parent_id: channel.parent_id,
        accounts_with_read: existing.map(|c| c.accounts_with_read.clone()).unwrap_or_default(),
        accounts_with_manage_threads: existing.map(|c| c.accounts_with_manage_threads.clone()).unwrap_or_default(),
        sync_info: existing.and_then(|c| c.sync_info.clone()),
    };
    ctl.mirror.upsert_channel(cached);
}

/// Recomputes one channel's permissions and acts on the diff: accounts that
/// lost read have their message sync cancelled (and, if another
/// read-capable account remains, restarted on it); accounts that newly
/// gained read start one (spec §4.G.4 `update_guild_channel_permissions`).
pub(crate) async fn update_guild_channel_permissions(ctl: &mut IngestController, guild_id: GuildId, channel_id: ChannelId) {
    let diff = recompute_channel_permissions(&mut ctl.mirror, guild_id, channel_id);
    let Some(channel) = ctl.mirror.channel(channel_id) else { return };
    if !is_cacheable_channel(channel.kind) {
        return;
    }
    let parent = channel.parent_id.unwrap_or(channel_id);

    for account in diff.lost_read {
        ctl.set_reference(account, channel_id, ReferenceSide::Read, false).await;
        ctl.cancel_message_sync(account, parent, channel_id).await;
        if let Some(replacement) = ctl.least_busy_read_account(channel_id).await {
            ctl.set_reference(replacement, channel_id, ReferenceSide::Read, true).await;
            ctl.spawn_message_sync(replacement, guild_id, channel_id).await;
        }
    }
    for account in diff.gained_read {
        ctl.set_reference(account, channel_id, ReferenceSide::Read, true).await;
        if !ctl.is_syncing_messages(account, parent, channel_id).await {
            ctl.spawn_message_sync(account, guild_id, channel_id).await;
        }
    }
    for account in diff.gained_manage_threads {
        ctl.set_reference(account, channel_id, ReferenceSide::ManageThreads, true).await;
    }
    for account in diff.lost_manage_threads {
        ctl.set_reference(account, channel_id, ReferenceSide::ManageThreads, false).await;
    }
}

async fn handle_guild_upsert(ctl: &mut IngestController, account: AccountId, guild: Guild, initial: bool) -> Result<(), IngestError> {
    if initial {
        ctl.initial_sync(account, guild).await
    } else {
        let guild_id = guild.id;
        ctl.mirror.ensure_guild(guild_id, guild.name.clone(), guild.owner_id);
        if let Some(mirror_guild) = ctl.mirror.guild_mut(guild_id) {
            for role in &guild.roles {
                mirror_guild.role_permissions.insert(role.id, parse_permissions(&role.permissions));
            }
        }
        ctl.recompute_account_guild_permissions(guild_id);
        let channel_ids: Vec<ChannelId> = ctl.mirror.channels_in_guild(guild_id).map(|c| c.id).collect();
        for channel_id in channel_ids {
            update_guild_channel_permissions(ctl, guild_id, channel_id).await;
        }
        Ok(())
    }
}

/// Dispatches one decoded gateway event (spec §4.G.4). `realtime` marks
/// whether the payload should be timestamped as live activity or as
/// bring-up replay (spec §3.2 `Timing`).
pub async fn handle_event(ctl: &mut IngestController, account: AccountId, event: DispatchEvent, realtime: bool) -> Result<(), IngestError> {
    let timing = if realtime { Timing::realtime(crate::now_ms()) } else { Timing::replayed(crate::now_ms()) };

    match event {
        DispatchEvent::GuildCreate(guild) => {
            let initial = ctl.mirror.guild(guild.id).is_none();
            handle_guild_upsert(ctl, account, guild, initial).await?;
        }
        DispatchEvent::GuildUpdate(guild) => {
            handle_guild_upsert(ctl, account, guild, false).await?;
            let value = serde_json::to_value(&guild).expect("guild always serializes");
            ctl.store.add_snapshot(EntityKind::Guild, guild.id.get(), value, timing, AddSnapshotOptions::new()).await?;
        }
        DispatchEvent::GuildDelete { id } => {
            ctl.mirror.remove_guild(id);
            ctl.store.with_conn(move |conn| archive_store::mark_as_deleted(conn, EntityKind::Guild, id.get() as i64, timing).map(|_| ())).await?;
        }
        DispatchEvent::ChannelCreate(channel) | DispatchEvent::ChannelUpdate(channel) => {
            let Some(guild_id) = channel.guild_id else { return Ok(()) };
            let value = serde_json::to_value(&channel).expect("channel always serializes");
            ctl.store.add_snapshot(EntityKind::Channel, channel.id.get(), value, timing, AddSnapshotOptions::new()).await?;
            upsert_cached_channel(ctl, guild_id, &channel);
            // Any update may have touched overwrites; recomputing unconditionally
            // is simpler and cheaper than diffing the raw overwrite payload.
            update_guild_channel_permissions(ctl, guild_id, channel.id).await;
        }
        DispatchEvent::ChannelDelete(data) => {
            ctl.mirror.remove_channel(data.id);
            ctl.store
                .with_conn(move |conn| archive_store::mark_as_deleted(conn, EntityKind::Channel, data.id.get() as i64, timing).map(|_| ()))
                .await?;
        }
        DispatchEvent::ThreadCreate(thread) | DispatchEvent::ThreadUpdate(thread) => {
            let value = serde_json::to_value(&thread).expect("thread always serializes");
            ctl.store.add_snapshot(EntityKind::Thread, thread.id.get(), value, timing, AddSnapshotOptions::new()).await?;
            if let Some(guild_id) = thread.guild_id {
                if let Some(parent) = thread.parent_id {
                    if !ctl.is_syncing_messages(account, parent, thread.id).await {
                        ctl.spawn_message_sync(account, guild_id, thread.id).await;
                    }
                }
            }
        }
        DispatchEvent::ThreadDelete(data) => {
            ctl.store
                .with_conn(move |conn| archive_store::mark_as_deleted(conn, EntityKind::Thread, data.id.get() as i64, timing).map(|_| ()))
                .await?;
        }
        DispatchEvent::ThreadListSync(data) => {
            for thread in &data.threads {
                let value = serde_json::to_value(thread).expect("thread always serializes");
                ctl.store.add_snapshot(EntityKind::Thread, thread.id.get(), value, timing, AddSnapshotOptions::new()).await?;
                if let Some(parent) = thread.parent_id {
                    if !ctl.is_syncing_messages(account, parent, thread.id).await {
                        ctl.spawn_message_sync(account, data.guild_id, thread.id).await;
                    }
                }
            }
        }
        DispatchEvent::GuildRoleCreate(data) | DispatchEvent::GuildRoleUpdate(data) => {
            let value = serde_json::to_value(&data.role).expect("role always serializes");
            ctl.store.add_snapshot(EntityKind::Role, data.role.id.get(), value, timing, AddSnapshotOptions::new()).await?;
            if let Some(guild) = ctl.mirror.guild_mut(data.guild_id) {
                guild.role_permissions.insert(data.role.id, parse_permissions(&data.role.permissions));
            }
            ctl.recompute_account_guild_permissions(data.guild_id);
            let channel_ids: Vec<ChannelId> = ctl.mirror.channels_in_guild(data.guild_id).map(|c| c.id).collect();
            for channel_id in channel_ids {
                update_guild_channel_permissions(ctl, data.guild_id, channel_id).await;
            }
        }
        DispatchEvent::GuildRoleDelete(data) => {
            ctl.store
                .with_conn(move |conn| archive_store::mark_as_deleted(conn, EntityKind::Role, data.role_id.get() as i64, timing).map(|_| ()))
                .await?;
            if let Some(guild) = ctl.mirror.guild_mut(data.guild_id) {
                guild.role_permissions.remove(&data.role_id);
            }
        }
        DispatchEvent::GuildMemberRemove(data) => {
            if let Some(guild) = ctl.mirror.guild_mut(data.guild_id) {
                if let Some(ids) = &mut guild.member_user_ids {
                    ids.remove(&data.user.id);
                }
            }
        }
        DispatchEvent::GuildMembersChunk(data) => {
            ctl.accumulate_members_chunk(account, data).await?;
        }
        DispatchEvent::GuildEmojisUpdate { guild_id, emojis } => {
            for emoji in emojis {
                let value = serde_json::to_value(&emoji).expect("emoji always serializes");
                ctl.store.add_snapshot(EntityKind::GuildEmoji, emoji.id.get(), value, timing, AddSnapshotOptions::new()).await?;
            }
            let _ = guild_id;
        }
        DispatchEvent::MessageCreate(msg) | DispatchEvent::MessageUpdate(msg) => {
            ctl.write_realtime_message(&msg, timing).await?;
        }
        DispatchEvent::MessageDelete(data) => {
            ctl.store.with_conn(move |conn| archive_store::mark_message_as_deleted(conn, data.id.get() as i64, timing).map(|_| ())).await?;
        }
        DispatchEvent::MessageReactionAdd(data) => {
            let key = crate::messages::emoji_key(&data.emoji);
            ctl.store
                .with_conn(move |conn| {
                    archive_store::add_reaction_placement(
                        conn,
                        data.message_id.get() as i64,
                        &key,
                        data.emoji.id.map(|i| i.get() as i64),
                        data.emoji.name.as_deref(),
                        data.burst,
                        data.user_id.get() as i64,
                        timing,
                    )
                    .map(|_| ())
                })
                .await?;
        }
        DispatchEvent::MessageReactionRemove(data) => {
            let key = crate::messages::emoji_key(&data.emoji);
            ctl.store
                .with_conn(move |conn| archive_store::mark_reaction_as_removed(conn, data.message_id.get() as i64, &key, data.user_id.get() as i64, timing).map(|_| ()))
                .await?;
        }
        DispatchEvent::MessageReactionRemoveEmoji(data) => {
            let key = crate::messages::emoji_key(&data.emoji);
            ctl.store
                .with_conn(move |conn| archive_store::mark_reactions_as_removed_bulk(conn, data.message_id.get() as i64, Some(&key), timing).map(|_| ()))
                .await?;
        }
        DispatchEvent::MessageReactionRemoveAll(data) => {
            ctl.store
                .with_conn(move |conn| archive_store::mark_reactions_as_removed_bulk(conn, data.message_id.get() as i64, None, timing).map(|_| ()))
                .await?;
        }
        DispatchEvent::Ready(ready) => {
            ctl.note_account_user(account, ready.user.id);
        }
        DispatchEvent::Unknown { .. } => {}
    }
    Ok(())
}
