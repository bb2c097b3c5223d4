//! A single registered account (spec §4.F): one REST client, one gateway
//! session, and every cancellable operation the ingestion controller has
//! started on its behalf.

use std::collections::{HashMap, HashSet};

use archive_gateway::{GatewayEvent, GatewayHandle};
use archive_rest::RestClient;
pub use archive_types::AccountId;
use archive_types::{ChannelId, GuildId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// The three ways a thread can be enumerated (spec §4.G.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadVariant {
    Public,
    Private,
    JoinedPrivate,
}

/// Which reference set on a cached channel this account occupies, so
/// `disconnect` can drop it from every `cached_channel` in O(ongoing_refs)
/// instead of scanning the whole mirror (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceSide {
    Read,
    ManageThreads,
}

/// A cancellable long-running operation (a message backfill, a thread
/// enumeration, an in-flight member request). `cancel` tells it to unwind;
/// `completion` resolves once it actually has, whether it finished,
/// errored, or was cancelled — the owning task drops the paired
/// `oneshot::Sender` on every exit path, so there's nothing to remember to
/// signal explicitly.
pub struct RunningOperation {
    pub cancel: CancellationToken,
    completion: oneshot::Receiver<()>,
}

impl RunningOperation {
    /// Returns the handle to store in the account plus the two halves the
    /// caller threads into the spawned task: the token it should poll, and
    /// the sender it should hold for the task's lifetime.
    pub fn new() -> (RunningOperation, CancellationToken, oneshot::Sender<()>) {
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        (
            RunningOperation {
                cancel: cancel.clone(),
                completion: rx,
            },
            cancel,
            tx,
        )
    }

    pub async fn await_completion(self) {
        let _ = self.completion.await;
    }
}

pub struct Account {
    pub id: AccountId,
    pub bot: bool,
    pub rest: RestClient,
    gateway: Option<GatewayHandle>,
    events: Option<mpsc::UnboundedReceiver<GatewayEvent>>,

    ongoing_rest: u64,
    ongoing_gateway: u64,

    public_message_syncs: HashMap<(ChannelId, ChannelId), RunningOperation>,
    private_message_syncs: HashMap<(ChannelId, ChannelId), RunningOperation>,
    thread_list_syncs: HashMap<(ChannelId, ThreadVariant), RunningOperation>,
    member_requests: HashMap<GuildId, RunningOperation>,

    references: HashSet<(ChannelId, ReferenceSide)>,
}

impl Account {
    pub(crate) fn new(
        id: AccountId,
        bot: bool,
        rest: RestClient,
        gateway: GatewayHandle,
        events: mpsc::UnboundedReceiver<GatewayEvent>,
    ) -> Account {
        Account {
            id,
            bot,
            rest,
            gateway: Some(gateway),
            events: Some(events),
            ongoing_rest: 0,
            ongoing_gateway: 0,
            public_message_syncs: HashMap::new(),
            private_message_syncs: HashMap::new(),
            thread_list_syncs: HashMap::new(),
            member_requests: HashMap::new(),
            references: HashSet::new(),
        }
    }

    /// Takes the dispatch event stream. Can only be taken once — the
    /// ingestion controller's dispatch loop owns it for the account's
    /// lifetime.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<GatewayEvent>> {
        self.events.take()
    }

    pub(crate) fn take_gateway(&mut self) -> Option<GatewayHandle> {
        self.gateway.take()
    }

    pub fn ongoing_rest(&self) -> u64 {
        self.ongoing_rest
    }

    pub fn ongoing_gateway(&self) -> u64 {
        self.ongoing_gateway
    }

    pub fn begin_rest_op(&mut self) {
        self.ongoing_rest += 1;
    }

    pub fn end_rest_op(&mut self) {
        self.ongoing_rest = self.ongoing_rest.saturating_sub(1);
    }

    pub fn begin_gateway_op(&mut self) {
        self.ongoing_gateway += 1;
    }

    pub fn end_gateway_op(&mut self) {
        self.ongoing_gateway = self.ongoing_gateway.saturating_sub(1);
    }

    pub fn start_message_sync(&mut self, parent: ChannelId, channel: ChannelId, private: bool) -> (CancellationToken, oneshot::Sender<()>) {
        let (op, cancel, tx) = RunningOperation::new();
        self.message_syncs_mut(private).insert((parent, channel), op);
        (cancel, tx)
    }

    pub fn is_syncing_messages(&self, parent: ChannelId, channel: ChannelId, private: bool) -> bool {
        self.message_syncs(private).contains_key(&(parent, channel))
    }

    pub fn cancel_message_sync(&mut self, parent: ChannelId, channel: ChannelId, private: bool) -> Option<RunningOperation> {
        self.message_syncs_mut(private).remove(&(parent, channel))
    }

    fn message_syncs(&self, private: bool) -> &HashMap<(ChannelId, ChannelId), RunningOperation> {
        if private {
            &self.private_message_syncs
        } else {
            &self.public_message_syncs
        }
    }

    fn message_syncs_mut(&mut self, private: bool) -> &mut HashMap<(ChannelId, ChannelId), RunningOperation> {
        if private {
            &mut self.private_message_syncs
        } else {
            &mut self.public_message_syncs
        }
    }

    pub fn start_thread_list_sync(&mut self, channel: ChannelId, variant: ThreadVariant) -> (CancellationToken, oneshot::Sender<()>) {
        let (op, cancel, tx) = RunningOperation::new();
        self.thread_list_syncs.insert((channel, variant), op);
        (cancel, tx)
    }

    pub fn is_syncing_threads(&self, channel: ChannelId, variant: ThreadVariant) -> bool {
        self.thread_list_syncs.contains_key(&(channel, variant))
    }

    pub fn finish_thread_list_sync(&mut self, channel: ChannelId, variant: ThreadVariant) {
        self.thread_list_syncs.remove(&(channel, variant));
    }

    pub fn start_member_request(&mut self, guild: GuildId) -> (CancellationToken, oneshot::Sender<()>) {
        let (op, cancel, tx) = RunningOperation::new();
        self.member_requests.insert(guild, op);
        (cancel, tx)
    }

    pub fn has_member_request(&self, guild: GuildId) -> bool {
        self.member_requests.contains_key(&guild)
    }

    pub fn finish_member_request(&mut self, guild: GuildId) {
        self.member_requests.remove(&guild);
    }

    /// Cancels the member request for `guild`, if any, without waiting for
    /// it to unwind — used on `sessionLost`, where the request's state is
    /// already invalid (spec §4.G.5).
    pub fn abandon_member_request(&mut self, guild: GuildId) {
        if let Some(op) = self.member_requests.remove(&guild) {
            op.cancel.cancel();
        }
    }

    pub fn add_reference(&mut self, channel: ChannelId, side: ReferenceSide) {
        self.references.insert((channel, side));
    }

    pub fn remove_reference(&mut self, channel: ChannelId, side: ReferenceSide) {
        self.references.remove(&(channel, side));
    }

    pub fn references(&self) -> impl Iterator<Item = &(ChannelId, ReferenceSide)> {
        self.references.iter()
    }

    /// Empties every running-op map and returns the handles, for
    /// `disconnect` to cancel and await. Leaves the account with no
    /// tracked operations, matching "aborts all its ongoing operations"
    /// (spec §4.F).
    pub(crate) fn drain_operations(&mut self) -> Vec<RunningOperation> {
        let mut ops = Vec::new();
        ops.extend(self.public_message_syncs.drain().map(|(_, op)| op));
        ops.extend(self.private_message_syncs.drain().map(|(_, op)| op));
        ops.extend(self.thread_list_syncs.drain().map(|(_, op)| op));
        ops.extend(self.member_requests.drain().map(|(_, op)| op));
        ops
    }
}
