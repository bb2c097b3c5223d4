//! Ties the mirror, the scheduler, and the store into the ingestion
//! controller (spec §4.G): one task reading a shared, account-tagged
//! gateway event stream and driving everything else.

use std::collections::HashMap;
use std::sync::Arc;

use archive_gateway::GatewayEvent;
use archive_permissions::{guild_permissions, parse_permissions};
use archive_scheduler::{AccountId, AccountRegistry, ReferenceSide, ThreadVariant};
use archive_store::{AddSnapshotOptions, BlobStore, Downloader, MessageWriteContext, Store};
use archive_types::{ChannelId, EntityKind, GuildId, Permissions, Timing, UserId};
use archive_wire::gateway::GuildMembersChunkData;
use archive_wire::model::{Guild, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch;
use crate::error::IngestError;
use crate::messages::{sync_messages, ChannelContext};
use crate::mirror::{AccountGuildData, Mirror};
use crate::threads::sync_all_archived_threads;

fn is_cacheable_channel(kind: i32) -> bool {
    matches!(kind, 0 | 5 | 10 | 11 | 12 | 15 | 16)
}

fn supports_thread_list(kind: i32) -> bool {
    matches!(kind, 0 | 5 | 15 | 16)
}

/// One account's gateway event, tagged so [`IngestController::run`] can
/// multiplex every registered account's stream through a single channel.
pub struct ControllerMessage {
    pub account: AccountId,
    pub event: GatewayEvent,
}

pub struct IngestController {
    pub(crate) store: Store,
    pub(crate) blobs: BlobStore,
    pub(crate) registry: AccountRegistry,
    pub(crate) downloader: Arc<dyn Downloader>,
    pub(crate) mirror: Mirror,
    pub(crate) account_users: HashMap<AccountId, UserId>,
    abort: CancellationToken,
}

impl IngestController {
    pub fn new(store: Store, blobs: BlobStore, registry: AccountRegistry, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            store,
            blobs,
            registry,
            downloader,
            mirror: Mirror::new(),
            account_users: HashMap::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Takes the account's event stream and spawns a task forwarding it,
    /// tagged with its id, onto `sink` (spec §4.F).
    pub async fn forward_account_events(&self, account: AccountId, sink: mpsc::UnboundedSender<ControllerMessage>) {
        let events = self.registry.with_account_mut(account, |a| a.take_events()).await.flatten();
        let Some(mut events) = events else { return };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if sink.send(ControllerMessage { account, event }).is_err() {
                    break;
                }
            }
        });
    }

    /// Drains `messages` until the channel closes or [`IngestController::shutdown`]
    /// cancels the controller's abort token (spec §4.G).
    pub async fn run(&mut self, mut messages: mpsc::UnboundedReceiver<ControllerMessage>) {
        loop {
            tokio::select! {
                _ = self.abort.cancelled() => return,
                msg = messages.recv() => {
                    let Some(msg) = msg else { return };
                    self.handle_gateway_event(msg.account, msg.event).await;
                }
            }
        }
    }

    async fn handle_gateway_event(&mut self, account: AccountId, event: GatewayEvent) {
        match event {
            GatewayEvent::Dispatch { payload, realtime } => {
                if let Err(e) = dispatch::handle_event(self, account, *payload, realtime).await {
                    tracing::warn!(%account, error = %e, "dispatch handling failed");
                }
            }
            GatewayEvent::SessionLost => self.handle_session_lost(account).await,
            GatewayEvent::ConnectionLost { was_connected, code } => {
                tracing::info!(%account, was_connected, ?code, "gateway connection lost");
            }
            GatewayEvent::Error(message) => tracing::warn!(%account, %message, "gateway error"),
            GatewayEvent::Connecting | GatewayEvent::PayloadSent | GatewayEvent::PayloadReceived => {}
        }
    }

    pub(crate) fn note_account_user(&mut self, account: AccountId, user_id: UserId) {
        self.account_users.insert(account, user_id);
    }

    /// `sessionLost` recovery (spec §4.G.5): outstanding member requests are
    /// abandoned immediately rather than awaited, since their state is
    /// already invalid once the session drops.
    async fn handle_session_lost(&mut self, account: AccountId) {
        let affected: Vec<GuildId> = self
            .mirror
            .guild_ids()
            .filter(|&id| self.mirror.guild(id).map(|g| g.account_data.contains_key(&account)).unwrap_or(false))
            .collect();
        for guild_id in affected {
            self.registry.with_account_mut(account, |a| a.abandon_member_request(guild_id)).await;
            if let Some(guild) = self.mirror.guild_mut(guild_id) {
                guild.member_user_ids = None;
            }
        }
        tracing::info!(%account, "session lost; outstanding member requests abandoned");
    }

    /// `initial_sync` (spec §4.G.1): writes the guild's bring-up snapshot in
    /// one transaction, downloads its icon, populates the mirror, computes
    /// per-channel permissions for this account, and starts backfills for
    /// every channel it can read.
    pub(crate) async fn initial_sync(&mut self, account: AccountId, guild: Guild) -> Result<(), IngestError> {
        let guild_id = guild.id;
        let timing = Timing::replayed(crate::now_ms());

        if let Some(icon) = &guild.icon {
            let url = format!("https://cdn.discordapp.com/icons/{}/{icon}.png", guild_id.get());
            if let Ok(pending) = self.blobs.download_if_needed(&self.store, url.clone(), url, self.downloader.as_ref()).await {
                self.blobs.perform_file_transaction(&self.store, vec![pending], |_| Ok(())).await?;
            }
        }

        self.write_guild_snapshot(&guild, timing).await?;

        self.mirror.ensure_guild(guild_id, guild.name.clone(), guild.owner_id);
        if let Some(mirror_guild) = self.mirror.guild_mut(guild_id) {
            for role in &guild.roles {
                mirror_guild.role_permissions.insert(role.id, parse_permissions(&role.permissions));
            }
        }
        let user_id = self.account_users.get(&account).copied().unwrap_or_else(|| UserId::from(0));
        if let Some(mirror_guild) = self.mirror.guild_mut(guild_id) {
            mirror_guild.account_data.entry(account).or_insert_with(|| AccountGuildData {
                user_id,
                roles: Vec::new(),
                guild_permissions: Permissions::NONE,
            });
        }
        self.recompute_account_guild_permissions(guild_id);

        let channels: Vec<_> = guild.channels.iter().flatten().cloned().collect();
        for channel in &channels {
            dispatch::upsert_cached_channel(self, guild_id, channel);
        }
        for thread in guild.threads.iter().flatten() {
            if let Some(parent) = thread.parent_id {
                self.spawn_message_sync(account, guild_id, thread.id).await;
                let _ = parent;
            }
        }

        for channel in &channels {
            if !is_cacheable_channel(channel.kind) {
                continue;
            }
            dispatch::update_guild_channel_permissions(self, guild_id, channel.id).await;
            if supports_thread_list(channel.kind) {
                let can_read = self.mirror.channel(channel.id).map(|c| c.accounts_with_read.contains(&account)).unwrap_or(false);
                if can_read {
                    self.spawn_thread_list_sync(account, guild_id, channel.id, ThreadVariant::Public).await;
                    self.spawn_thread_list_sync(account, guild_id, channel.id, ThreadVariant::Private).await;
                }
            }
        }

        if let Some(mirror_guild) = self.mirror.guild_mut(guild_id) {
            mirror_guild.mark_initial_sync_done();
        }
        Ok(())
    }

    async fn write_guild_snapshot(&self, guild: &Guild, timing: Timing) -> Result<(), IngestError> {
        let guild_id = guild.id;
        self.store.transaction_begin().await?;
        let result: Result<(), IngestError> = async {
            let value = serde_json::to_value(guild).expect("guild always serializes");
            self.store.add_snapshot(EntityKind::Guild, guild_id.get(), value, timing, AddSnapshotOptions::new()).await?;

            let mut role_ids = Vec::with_capacity(guild.roles.len());
            for role in &guild.roles {
                role_ids.push(role.id.get() as i64);
                let value = serde_json::to_value(role).expect("role always serializes");
                self.store.add_snapshot(EntityKind::Role, role.id.get(), value, timing, AddSnapshotOptions::new()).await?;
            }
            let guild_id_i64 = guild_id.get() as i64;
            self.store
                .with_conn(move |conn| archive_store::sync_deletions(conn, EntityKind::Role, guild_id_i64, &role_ids, timing).map(|_| ()))
                .await?;

            let mut channel_ids = Vec::new();
            for channel in guild.channels.iter().flatten() {
                channel_ids.push(channel.id.get() as i64);
                let value = serde_json::to_value(channel).expect("channel always serializes");
                self.store.add_snapshot(EntityKind::Channel, channel.id.get(), value, timing, AddSnapshotOptions::new()).await?;
            }
            self.store
                .with_conn(move |conn| archive_store::sync_deletions(conn, EntityKind::Channel, guild_id_i64, &channel_ids, timing).map(|_| ()))
                .await?;

            for thread in guild.threads.iter().flatten() {
                let value = serde_json::to_value(thread).expect("thread always serializes");
                self.store.add_snapshot(EntityKind::Thread, thread.id.get(), value, timing, AddSnapshotOptions::new()).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => self.store.commit().await.map_err(IngestError::from),
            Err(e) => {
                self.store.rollback().await.ok();
                Err(e)
            }
        }
    }

    /// Recomputes `guild_permissions` on every `account_data` entry after a
    /// role's permission bitset or an account's role list changed.
    pub(crate) fn recompute_account_guild_permissions(&mut self, guild_id: GuildId) {
        let Some(guild) = self.mirror.guild(guild_id) else { return };
        let everyone = guild.everyone_permissions();
        let owner_id = guild.owner_id.get();
        let updates: Vec<(AccountId, Permissions)> = guild
            .account_data
            .iter()
            .map(|(account, data)| {
                let role_perms: Vec<Permissions> = data.roles.iter().filter_map(|r| guild.role_permissions.get(r).copied()).collect();
                (*account, guild_permissions(data.user_id.get(), owner_id, everyone, &role_perms))
            })
            .collect();
        if let Some(guild) = self.mirror.guild_mut(guild_id) {
            for (account, perms) in updates {
                if let Some(data) = guild.account_data.get_mut(&account) {
                    data.guild_permissions = perms;
                }
            }
        }
    }

    pub(crate) async fn set_reference(&self, account: AccountId, channel_id: ChannelId, side: ReferenceSide, present: bool) {
        self.registry
            .with_account_mut(account, move |a| {
                if present {
                    a.add_reference(channel_id, side);
                } else {
                    a.remove_reference(channel_id, side);
                }
            })
            .await;
    }

    pub(crate) async fn is_syncing_messages(&self, account: AccountId, parent: ChannelId, channel_id: ChannelId) -> bool {
        let private = self.mirror.channel(channel_id).map(|c| c.kind == 12).unwrap_or(false);
        self.registry.with_account(account, |a| a.is_syncing_messages(parent, channel_id, private)).await.unwrap_or(false)
    }

    pub(crate) async fn cancel_message_sync(&self, account: AccountId, parent: ChannelId, channel_id: ChannelId) {
        let private = self.mirror.channel(channel_id).map(|c| c.kind == 12).unwrap_or(false);
        let op = self.registry.with_account_mut(account, |a| a.cancel_message_sync(parent, channel_id, private)).await.flatten();
        if let Some(op) = op {
            op.cancel.cancel();
            op.await_completion().await;
        }
    }

    pub(crate) async fn least_busy_read_account(&self, channel_id: ChannelId) -> Option<AccountId> {
        let candidates: Vec<AccountId> = self.mirror.channel(channel_id)?.accounts_with_read.iter().copied().collect();
        self.registry.least_rest_busy(&candidates).await
    }

    /// Starts a backfill for `channel_id` on `account` (spec §4.G.2),
    /// registering the running operation before returning so a racing
    /// dispatch handler never double-starts the same sync.
    pub(crate) async fn spawn_message_sync(&self, account: AccountId, guild_id: GuildId, channel_id: ChannelId) {
        let Some(channel) = self.mirror.channel(channel_id) else { return };
        let parent = channel.parent_id.unwrap_or(channel_id);
        let private = channel.kind == 12;
        let ctx = ChannelContext {
            channel_id,
            guild_id: Some(guild_id),
            parent_channel_id: channel.parent_id,
            channel_name: channel.name.clone(),
            guild_name: self.mirror.guild(guild_id).map(|g| g.name.clone()).unwrap_or_default(),
        };

        let registered = self
            .registry
            .with_account_mut(account, |a| {
                if a.is_syncing_messages(parent, channel_id, private) {
                    return None;
                }
                let (cancel, tx) = a.start_message_sync(parent, channel_id, private);
                a.begin_rest_op();
                Some((a.rest.clone(), cancel, tx))
            })
            .await
            .flatten();
        let Some((rest, abort, completion_tx)) = registered else { return };

        let store = self.store.clone();
        let blobs = self.blobs.clone();
        let downloader = self.downloader.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let result = sync_messages(&rest, &store, &blobs, downloader.as_ref(), &ctx, &abort).await;
            if let Err(e) = result {
                tracing::warn!(%account, %channel_id, error = %e, "message sync ended with error");
            }
            registry
                .with_account_mut(account, |a| {
                    a.end_rest_op();
                    a.cancel_message_sync(parent, channel_id, private);
                })
                .await;
            drop(completion_tx);
        });
    }

    /// Starts enumerating one channel's archived threads on `account`
    /// (spec §4.G.3). Discovered threads get their own message backfill
    /// once the page enumeration finishes.
    pub(crate) async fn spawn_thread_list_sync(&self, account: AccountId, guild_id: GuildId, channel_id: ChannelId, variant: ThreadVariant) {
        let registered = self
            .registry
            .with_account_mut(account, |a| {
                if a.is_syncing_threads(channel_id, variant) {
                    return None;
                }
                let (cancel, tx) = a.start_thread_list_sync(channel_id, variant);
                a.begin_rest_op();
                Some((a.rest.clone(), cancel, tx))
            })
            .await
            .flatten();
        let Some((rest, abort, completion_tx)) = registered else { return };

        let store = self.store.clone();
        let blobs = self.blobs.clone();
        let downloader = self.downloader.clone();
        let registry = self.registry.clone();
        let guild_name = self.mirror.guild(guild_id).map(|g| g.name.clone()).unwrap_or_default();

        tokio::spawn(async move {
            let mut discovered = Vec::new();
            let result = sync_all_archived_threads(&rest, &store, channel_id, variant, &abort, |thread| discovered.push(thread.clone())).await;
            if let Err(e) = result {
                tracing::warn!(%account, %channel_id, ?variant, error = %e, "thread list sync ended with error");
            }
            for thread in discovered {
                let ctx = ChannelContext {
                    channel_id: thread.id,
                    guild_id: Some(guild_id),
                    parent_channel_id: Some(channel_id),
                    channel_name: thread.name.clone().unwrap_or_default(),
                    guild_name: guild_name.clone(),
                };
                let rest = rest.clone();
                let store = store.clone();
                let blobs = blobs.clone();
                let downloader = downloader.clone();
                tokio::spawn(async move {
                    let _ = sync_messages(&rest, &store, &blobs, downloader.as_ref(), &ctx, &CancellationToken::new()).await;
                });
            }
            registry
                .with_account_mut(account, |a| {
                    a.end_rest_op();
                    a.finish_thread_list_sync(channel_id, variant);
                })
                .await;
            drop(completion_tx);
        });
    }

    /// Accumulates one `GUILD_MEMBERS_CHUNK` page, writing each member's
    /// snapshot immediately; on the last chunk, prunes members who dropped
    /// out of the refresh (spec §4.G.4, §9 "treat null as abandoned").
    pub(crate) async fn accumulate_members_chunk(&mut self, account: AccountId, data: GuildMembersChunkData) -> Result<(), IngestError> {
        let guild_id = data.guild_id;
        if data.chunk_index == 0 {
            if let Some(guild) = self.mirror.guild_mut(guild_id) {
                guild.member_user_ids = Some(Default::default());
            }
        }
        let timing = Timing::replayed(crate::now_ms());
        let guild_id_i64 = guild_id.get() as i64;
        let is_self = self.account_users.get(&account).copied();

        for member in &data.members {
            let Some(user) = &member.user else { continue };
            if let Some(guild) = self.mirror.guild_mut(guild_id) {
                if let Some(ids) = &mut guild.member_user_ids {
                    ids.insert(user.id);
                }
                if is_self == Some(user.id) {
                    guild
                        .account_data
                        .entry(account)
                        .or_insert_with(|| AccountGuildData {
                            user_id: user.id,
                            roles: Vec::new(),
                            guild_permissions: Permissions::NONE,
                        })
                        .roles = member.roles.clone();
                }
            }
            let user_id_i64 = user.id.get() as i64;
            let value = serde_json::to_value(member).expect("member always serializes");
            self.store
                .with_conn(move |conn| archive_store::add_member_snapshot(conn, guild_id_i64, user_id_i64, &value, timing, true).map(|_| ()))
                .await?;
        }
        if is_self.is_some() {
            self.recompute_account_guild_permissions(guild_id);
        }

        if data.chunk_index + 1 >= data.chunk_count {
            let present_ids: Vec<i64> = self
                .mirror
                .guild(guild_id)
                .and_then(|g| g.member_user_ids.clone())
                .map(|ids| ids.into_iter().map(|id| id.get() as i64).collect())
                .unwrap_or_default();
            self.store
                .with_conn(move |conn| archive_store::sync_members(conn, guild_id_i64, &present_ids, timing).map(|_| ()))
                .await?;
            self.registry.with_account_mut(account, |a| a.finish_member_request(guild_id)).await;
        }
        Ok(())
    }

    /// Writes one realtime `MESSAGE_CREATE`/`MESSAGE_UPDATE` (spec §4.G.4),
    /// downloading attachments through the same two-phase commit the
    /// backfill path uses.
    pub(crate) async fn write_realtime_message(&self, msg: &Message, timing: Timing) -> Result<(), IngestError> {
        let (channel_name, guild_name, parent_channel_id) = match self.mirror.channel(msg.channel_id) {
            Some(c) => (c.name.clone(), self.mirror.guild(c.guild_id).map(|g| g.name.clone()).unwrap_or_default(), c.parent_id),
            None => (String::new(), String::new(), None),
        };
        let ctx = MessageWriteContext {
            channel_id: msg.channel_id.get() as i64,
            guild_id: msg.guild_id.map(|g| g.get() as i64),
            parent_channel_id: parent_channel_id.map(|c| c.get() as i64),
            author_name: msg.author.as_ref().map(|a| a.username.clone()).unwrap_or_else(|| "unknown".to_string()),
            channel_name,
            guild_name,
        };
        let value = serde_json::to_value(msg).expect("message always serializes");

        if msg.attachments.is_empty() {
            return self.store.with_conn(move |conn| archive_store::add_message_snapshot(conn, &ctx, &value, timing).map(|_| ())).await.map_err(IngestError::from);
        }

        let mut downloads = Vec::with_capacity(msg.attachments.len());
        for att in &msg.attachments {
            downloads.push(self.blobs.download_if_needed(&self.store, att.url.clone(), att.proxy_url.clone(), self.downloader.as_ref()).await?);
        }
        self.blobs
            .perform_file_transaction(&self.store, downloads, move |conn| archive_store::add_message_snapshot(conn, &ctx, &value, timing).map(|_| ()))
            .await?;
        Ok(())
    }

    /// Global shutdown (spec §4.G.6): stops the run loop, disconnects every
    /// account (which aborts and awaits its running operations), folds the
    /// returned back-references into the mirror, then closes the store.
    pub async fn shutdown(&mut self) {
        self.abort.cancel();
        let account_ids = self.registry.account_ids().await;
        for id in account_ids {
            let references = self.registry.disconnect(id).await;
            for (channel_id, side) in references {
                self.mirror.remove_account_reference(id, channel_id, side);
            }
        }
        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, "error closing store during shutdown");
        }
    }
}
