//! The account registry (spec §4.F), storage-shaped the way
//! `core/src/client/client_connection_index.rs`'s `ClientActorIndex` is: an
//! `Arc<Mutex<Inner>>` wrapping a `Vec<Account>` plus a `HashMap<AccountId,
//! Pointer>` index, with `swap_remove` on disconnect and index fixup for
//! whichever account got swapped into the removed slot.

use std::collections::HashMap;
use std::sync::Arc;

use archive_gateway::GatewayHandle;
use archive_rest::RestClient;
use archive_types::ChannelId;
use tokio::sync::Mutex;

use crate::account::{Account, AccountId};

#[derive(PartialEq, Eq, Clone, Copy, Hash)]
struct Pointer(usize);

struct Inner {
    index: HashMap<AccountId, Pointer>,
    accounts: Vec<Account>,
}

impl Inner {
    fn drop_account(&mut self, id: AccountId) -> Option<Account> {
        let pointer = self.index.remove(&id)?;
        let removed = self.accounts.swap_remove(pointer.0);
        if let Some(moved) = self.accounts.get(pointer.0) {
            self.index.insert(moved.id, pointer);
        }
        Some(removed)
    }
}

/// Everything `register` needs to open an account's gateway and REST
/// client. `rest_base_url` defaults to the upstream API when `None`.
pub struct RegisterOptions {
    pub id: AccountId,
    pub bot: bool,
    pub token: String,
    pub gateway_url: String,
    pub intents: u64,
    pub rest_base_url: Option<String>,
    pub global_requests_per_second: u32,
}

#[derive(Clone)]
pub struct AccountRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountRegistry {
    pub fn new() -> AccountRegistry {
        AccountRegistry {
            inner: Arc::new(Mutex::new(Inner {
                index: HashMap::new(),
                accounts: Vec::new(),
            })),
        }
    }

    /// Opens a gateway connection (spec §4.D) and REST client (spec §4.C)
    /// for the account and adds it to the registry. The gateway connects in
    /// the background; waiting for `READY` (and, for bot accounts, every
    /// bring-up `GUILD_CREATE`) is the ingestion controller's job once it
    /// takes the event stream via [`Account::take_events`] — registration
    /// itself just makes the account visible to the scheduler.
    pub async fn register(&self, options: RegisterOptions) -> Result<AccountId, reqwest::Error> {
        let rest = RestClient::with_base_url(
            options.token.clone(),
            options.rest_base_url.as_deref().unwrap_or(archive_rest::DISCORD_API_BASE),
            options.global_requests_per_second,
        )?;
        let (gateway, events): (GatewayHandle, _) = GatewayHandle::connect(options.gateway_url, options.token, options.intents);
        let account = Account::new(options.id, options.bot, rest, gateway, events);

        let mut inner = self.inner.lock().await;
        let pointer = Pointer(inner.accounts.len());
        inner.index.insert(options.id, pointer);
        inner.accounts.push(account);
        Ok(options.id)
    }

    /// Aborts every ongoing operation the account holds, awaits their
    /// completion latches, removes it from the registry (so it drops out of
    /// every later `least_*_busy` scan), and closes its gateway. The
    /// account's back-reference set is returned so the caller can do the
    /// O(ongoing_refs) removal from `cached_channel` the in-memory mirror
    /// owns (spec §5) — the registry has no visibility into that mirror.
    pub async fn disconnect(&self, id: AccountId) -> Vec<(ChannelId, crate::account::ReferenceSide)> {
        let (gateway, ops, references) = {
            let mut inner = self.inner.lock().await;
            let Some(mut account) = inner.drop_account(id) else {
                return Vec::new();
            };
            let ops = account.drain_operations();
            let references: Vec<_> = account.references().copied().collect();
            let gateway = account.take_gateway();
            (gateway, ops, references)
        };

        for op in &ops {
            op.cancel.cancel();
        }
        for op in ops {
            op.await_completion().await;
        }
        if let Some(gateway) = gateway {
            gateway.destroy().await;
        }

        references
    }

    pub async fn account_ids(&self) -> Vec<AccountId> {
        let inner = self.inner.lock().await;
        inner.accounts.iter().map(|a| a.id).collect()
    }

    pub async fn with_account<R>(&self, id: AccountId, f: impl FnOnce(&Account) -> R) -> Option<R> {
        let inner = self.inner.lock().await;
        let pointer = *inner.index.get(&id)?;
        Some(f(&inner.accounts[pointer.0]))
    }

    pub async fn with_account_mut<R>(&self, id: AccountId, f: impl FnOnce(&mut Account) -> R) -> Option<R> {
        let mut inner = self.inner.lock().await;
        let pointer = *inner.index.get(&id)?;
        Some(f(&mut inner.accounts[pointer.0]))
    }

    /// Linear scan over `candidates` returning the account with the
    /// smallest ongoing-REST-operation counter (spec §4.F). Unknown ids are
    /// skipped rather than treated as an error — a candidate may have
    /// disconnected between being listed and being scored here.
    pub async fn least_rest_busy(&self, candidates: &[AccountId]) -> Option<AccountId> {
        let inner = self.inner.lock().await;
        candidates
            .iter()
            .filter_map(|id| inner.index.get(id).map(|p| (*id, inner.accounts[p.0].ongoing_rest())))
            .min_by_key(|(_, count)| *count)
            .map(|(id, _)| id)
    }

    /// Same as [`AccountRegistry::least_rest_busy`] but scored on ongoing
    /// gateway operations.
    pub async fn least_gateway_busy(&self, candidates: &[AccountId]) -> Option<AccountId> {
        let inner = self.inner.lock().await;
        candidates
            .iter()
            .filter_map(|id| inner.index.get(id).map(|p| (*id, inner.accounts[p.0].ongoing_gateway())))
            .min_by_key(|(_, count)| *count)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(id: u32) -> RegisterOptions {
        RegisterOptions {
            id: AccountId(id),
            bot: true,
            token: "test-token".to_string(),
            gateway_url: "ws://127.0.0.1:1".to_string(),
            intents: 0,
            rest_base_url: Some("http://127.0.0.1:1".to_string()),
            global_requests_per_second: 50,
        }
    }

    #[tokio::test]
    async fn register_then_disconnect_removes_the_account() {
        let registry = AccountRegistry::new();
        registry.register(opts(1)).await.unwrap();
        assert_eq!(registry.account_ids().await, vec![AccountId(1)]);

        registry.disconnect(AccountId(1)).await;
        assert!(registry.account_ids().await.is_empty());
    }

    #[tokio::test]
    async fn swap_remove_fixes_up_the_index_for_the_moved_account() {
        let registry = AccountRegistry::new();
        registry.register(opts(1)).await.unwrap();
        registry.register(opts(2)).await.unwrap();
        registry.register(opts(3)).await.unwrap();

        registry.disconnect(AccountId(1)).await;

        let mut remaining = registry.account_ids().await;
        remaining.sort();
        assert_eq!(remaining, vec![AccountId(2), AccountId(3)]);

        // both surviving accounts must still be independently reachable
        // through the index after the swap_remove reshuffled their slots.
        assert!(registry.with_account(AccountId(2), |_| ()).await.is_some());
        assert!(registry.with_account(AccountId(3), |_| ()).await.is_some());
    }

    #[tokio::test]
    async fn least_rest_busy_picks_the_smallest_counter() {
        let registry = AccountRegistry::new();
        registry.register(opts(1)).await.unwrap();
        registry.register(opts(2)).await.unwrap();

        registry.with_account_mut(AccountId(1), |a| a.begin_rest_op()).await;
        registry.with_account_mut(AccountId(1), |a| a.begin_rest_op()).await;
        registry.with_account_mut(AccountId(2), |a| a.begin_rest_op()).await;

        let busiest = registry.least_rest_busy(&[AccountId(1), AccountId(2)]).await;
        assert_eq!(busiest, Some(AccountId(2)));
    }

    #[tokio::test]
    async fn least_rest_busy_skips_unknown_candidates() {
        let registry = AccountRegistry::new();
        registry.register(opts(1)).await.unwrap();

        let picked = registry.least_rest_busy(&[AccountId(99), AccountId(1)]).await;
        assert_eq!(picked, Some(AccountId(1)));
    }
}
