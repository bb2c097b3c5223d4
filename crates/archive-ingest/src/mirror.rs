//! The in-memory mirror (spec §3.3): the minimum state kept outside the
//! store to compute permissions and schedule work. Touched only by the
//! controller's single task, so — per spec §5's shared-resource policy —
//! nothing here is behind a lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use archive_scheduler::{AccountId, ReferenceSide};
use archive_types::{ChannelId, GuildId, Permissions, RoleId, UserId};
use tokio::sync::Notify;

use crate::permissions::Overwrite;

/// What the mirror knows about one account's standing in one guild: its
/// roles there and the guild-level permission bitset they fold to (spec
/// §3.3 `account_data`).
#[derive(Debug, Clone)]
pub struct AccountGuildData {
    pub user_id: UserId,
    pub roles: Vec<RoleId>,
    pub guild_permissions: Permissions,
}

/// Active threads a channel's sync has discovered, so `THREAD_LIST_SYNC`
/// can tell new arrivals from ones already being synced (spec §3.3
/// `sync_info`).
#[derive(Debug, Clone, Default)]
pub struct ChannelSyncInfo {
    pub active_threads: HashSet<ChannelId>,
}

#[derive(Debug, Clone)]
pub struct CachedChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub kind: i32,
    pub permission_overwrites: Vec<Overwrite>,
    pub parent_id: Option<ChannelId>,
    pub accounts_with_read: HashSet<AccountId>,
    pub accounts_with_manage_threads: HashSet<AccountId>,
    pub sync_info: Option<ChannelSyncInfo>,
}

pub struct CachedGuild {
    pub id: GuildId,
    pub name: String,
    pub owner_id: UserId,
    pub role_permissions: HashMap<RoleId, Permissions>,
    pub account_data: HashMap<AccountId, AccountGuildData>,
    pub channel_ids: HashSet<ChannelId>,
    /// `None` while a member fetch is in flight and has not completed —
    /// spec §9 "treat null as abandoned and skip" on session loss.
    pub member_user_ids: Option<HashSet<UserId>>,
    initial_sync_done: bool,
    initial_sync_notify: Arc<Notify>,
}

impl CachedGuild {
    fn new(id: GuildId, name: String, owner_id: UserId) -> CachedGuild {
        CachedGuild {
            id,
            name,
            owner_id,
            role_permissions: HashMap::new(),
            account_data: HashMap::new(),
            channel_ids: HashSet::new(),
            member_user_ids: None,
            initial_sync_done: false,
            initial_sync_notify: Arc::new(Notify::new()),
        }
    }

    /// The `@everyone` role shares the guild's id (upstream convention) —
    /// there is no separate lookup key for it.
    pub fn everyone_permissions(&self) -> Permissions {
        self.role_permissions
            .get(&RoleId::from(self.id.get()))
            .copied()
            .unwrap_or(Permissions::NONE)
    }

    pub fn is_initial_sync_done(&self) -> bool {
        self.initial_sync_done
    }

    /// Resolves every waiter on [`CachedGuild::wait_for_initial_sync`].
    /// Idempotent: calling it again after the latch has already fired is a
    /// no-op as far as observers are concerned.
    pub fn mark_initial_sync_done(&mut self) {
        if !self.initial_sync_done {
            self.initial_sync_done = true;
            self.initial_sync_notify.notify_waiters();
        }
    }

    /// The `initial_sync` future spec §4.G.1 promises. Returns immediately
    /// if the latch already fired.
    pub fn wait_for_initial_sync(&self) -> impl std::future::Future<Output = ()> {
        let notify = self.initial_sync_notify.clone();
        let already_done = self.initial_sync_done;
        async move {
            if already_done {
                return;
            }
            notify.notified().await;
        }
    }
}

#[derive(Default)]
pub struct Mirror {
    guilds: HashMap<GuildId, CachedGuild>,
    channels: HashMap<ChannelId, CachedChannel>,
}

impl Mirror {
    pub fn new() -> Mirror {
        Mirror::default()
    }

    pub fn guild(&self, id: GuildId) -> Option<&CachedGuild> {
        self.guilds.get(&id)
    }

    pub fn guild_mut(&mut self, id: GuildId) -> Option<&mut CachedGuild> {
        self.guilds.get_mut(&id)
    }

    pub fn guild_ids(&self) -> impl Iterator<Item = GuildId> + '_ {
        self.guilds.keys().copied()
    }

    pub fn ensure_guild(&mut self, id: GuildId, name: String, owner_id: UserId) -> &mut CachedGuild {
        self.guilds.entry(id).or_insert_with(|| CachedGuild::new(id, name.clone(), owner_id));
        let guild = self.guilds.get_mut(&id).expect("just inserted");
        guild.name = name;
        guild.owner_id = owner_id;
        guild
    }

    pub fn remove_guild(&mut self, id: GuildId) -> Option<CachedGuild> {
        let guild = self.guilds.remove(&id)?;
        for channel_id in &guild.channel_ids {
            self.channels.remove(channel_id);
        }
        Some(guild)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&CachedChannel> {
        self.channels.get(&id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut CachedChannel> {
        self.channels.get_mut(&id)
    }

    pub fn upsert_channel(&mut self, channel: CachedChannel) {
        if let Some(guild) = self.guilds.get_mut(&channel.guild_id) {
            guild.channel_ids.insert(channel.id);
        }
        self.channels.insert(channel.id, channel);
    }

    pub fn remove_channel(&mut self, id: ChannelId) -> Option<CachedChannel> {
        let channel = self.channels.remove(&id)?;
        if let Some(guild) = self.guilds.get_mut(&channel.guild_id) {
            guild.channel_ids.remove(&id);
        }
        Some(channel)
    }

    pub fn channels_in_guild(&self, guild_id: GuildId) -> impl Iterator<Item = &CachedChannel> + '_ {
        self.guilds
            .get(&guild_id)
            .into_iter()
            .flat_map(|g| g.channel_ids.iter())
            .filter_map(move |id| self.channels.get(id))
    }

    /// O(1) per reference: the contract spec §5 asks of the back-reference
    /// set on disconnect.
    pub fn remove_account_reference(&mut self, account: AccountId, channel_id: ChannelId, side: ReferenceSide) {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            match side {
                ReferenceSide::Read => {
                    channel.accounts_with_read.remove(&account);
                }
                ReferenceSide::ManageThreads => {
                    channel.accounts_with_manage_threads.remove(&account);
                }
            }
        }
    }
}
