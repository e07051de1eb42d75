//! Chain-access agent over a JSON-RPC node
//!
//! Talks to a node through an ethers HTTP provider:
//! - Accounts come from a local wallet when a key is configured, otherwise
//!   from the node's unlocked accounts
//! - Settlement is awaited by polling for the receipt
//! - Log subscriptions and change notices are polling tasks

use super::{AgentError, AgentNotice, AgentResult, ChainAgent, LogHandler, SessionId, SubscriptionId};
use crate::config::AgentConfig;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest wait for a transaction receipt
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Largest block range fetched by one `eth_getLogs`
const MAX_LOG_RANGE: u64 = 1000;

/// Session bookkeeping shared with the polling tasks
struct Sessions {
    next: AtomicU64,
    /// Sessions below this id were superseded by a network change
    min_valid: AtomicU64,
}

impl Sessions {
    fn open(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn is_valid(&self, session: SessionId) -> bool {
        session.0 >= self.min_valid.load(Ordering::SeqCst) && session.0 < self.next.load(Ordering::SeqCst)
    }

    fn check(&self, session: SessionId) -> AgentResult<()> {
        if self.is_valid(session) {
            Ok(())
        } else {
            Err(AgentError::StaleSession(session))
        }
    }

    fn supersede_all(&self) {
        self.min_valid
            .store(self.next.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

/// Production chain-access agent
pub struct RpcAgent {
    provider: Provider<Http>,
    /// Local signing key, when configured
    wallet: Option<LocalWallet>,
    /// Signing client for the chain the node last reported
    signer: RwLock<Option<SignerMiddleware<Provider<Http>, LocalWallet>>>,
    poll_interval: Duration,
    sessions: Arc<Sessions>,
    subscriptions: DashMap<SubscriptionId, JoinHandle<()>>,
    next_subscription: AtomicU64,
    notices: broadcast::Sender<AgentNotice>,
    watcher: Option<JoinHandle<()>>,
}

impl RpcAgent {
    /// Connect to the configured node and start watching for network and
    /// account changes
    pub async fn connect(config: &AgentConfig) -> AgentResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| AgentError::Unavailable(format!("invalid RPC URL {}: {}", config.rpc_url, e)))?
            .interval(Duration::from_millis(config.poll_interval_ms));

        let wallet = match &config.private_key_env {
            Some(var) => Some(load_wallet(var)?),
            None => None,
        };

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| AgentError::Unavailable(format!("node at {} unreachable: {}", config.rpc_url, e)))?
            .as_u64();

        info!("Connected to {} (chain {})", config.rpc_url, chain_id);

        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let mut agent = Self::new(provider, wallet, poll_interval);
        if let Some(wallet) = agent.wallet.clone() {
            agent.signer_for(&wallet, chain_id).await;
        }

        let initial_accounts = agent.accounts().await.unwrap_or_default();
        agent.watcher = Some(tokio::spawn(watch_changes(
            agent.provider.clone(),
            agent.wallet.as_ref().map(|w| w.address()),
            agent.sessions.clone(),
            agent.notices.clone(),
            chain_id,
            initial_accounts,
            poll_interval,
        )));

        Ok(agent)
    }

    fn new(provider: Provider<Http>, wallet: Option<LocalWallet>, poll_interval: Duration) -> Self {
        let (notices, _) = broadcast::channel(16);
        Self {
            provider,
            wallet,
            signer: RwLock::new(None),
            poll_interval,
            sessions: Arc::new(Sessions {
                next: AtomicU64::new(1),
                min_valid: AtomicU64::new(1),
            }),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            notices,
            watcher: None,
        }
    }

    /// Signing client for `chain_id`, rebuilt after the node switches networks
    async fn signer_for(
        &self,
        wallet: &LocalWallet,
        chain_id: u64,
    ) -> SignerMiddleware<Provider<Http>, LocalWallet> {
        if let Some(signer) = self.signer.read().await.as_ref() {
            if signer.signer().chain_id() == chain_id {
                return signer.clone();
            }
        }

        info!("Signing locally as {:?} on chain {}", wallet.address(), chain_id);
        let signer = SignerMiddleware::new(self.provider.clone(), wallet.clone().with_chain_id(chain_id));
        *self.signer.write().await = Some(signer.clone());
        signer
    }

    async fn poll_receipt(&self, session: SessionId, tx_hash: H256) -> AgentResult<TransactionReceipt> {
        loop {
            self.sessions.check(session)?;
            if let Some(receipt) = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(rpc_error)?
            {
                return Ok(receipt);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn accounts(&self) -> AgentResult<Vec<Address>> {
        match &self.wallet {
            Some(wallet) => Ok(vec![wallet.address()]),
            None => self.provider.get_accounts().await.map_err(rpc_error),
        }
    }
}

impl Drop for RpcAgent {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for entry in self.subscriptions.iter() {
            entry.value().abort();
        }
    }
}

/// Load a wallet from the environment variable named in configuration
fn load_wallet(var: &str) -> AgentResult<LocalWallet> {
    let key = std::env::var(var)
        .map_err(|_| AgentError::Unavailable(format!("signing key variable {} is not set", var)))?;

    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| AgentError::Unavailable(format!("invalid signing key in {}: {}", var, e)))
}

fn rpc_error(e: impl std::fmt::Display) -> AgentError {
    let message = e.to_string();
    if message.contains("User denied") || message.contains("rejected by user") {
        AgentError::UserRejected
    } else {
        AgentError::Rpc(message)
    }
}

/// Poll the node for network and account changes
async fn watch_changes(
    provider: Provider<Http>,
    local_account: Option<Address>,
    sessions: Arc<Sessions>,
    notices: broadcast::Sender<AgentNotice>,
    mut chain_id: u64,
    mut accounts: Vec<Address>,
    poll_interval: Duration,
) {
    loop {
        tokio::time::sleep(poll_interval).await;

        match provider.get_chainid().await {
            Ok(current) if current.as_u64() != chain_id => {
                chain_id = current.as_u64();
                warn!("Node switched to chain {}", chain_id);
                sessions.supersede_all();
                // No receivers, that's okay
                let _ = notices.send(AgentNotice::ChainChanged(chain_id));
            }
            Ok(_) => {}
            Err(e) => debug!("Chain id poll failed: {}", e),
        }

        if local_account.is_some() {
            continue;
        }

        match provider.get_accounts().await {
            Ok(current) if current != accounts => {
                info!("Node accounts changed");
                accounts = current;
                let _ = notices.send(AgentNotice::AccountsChanged(accounts.clone()));
            }
            Ok(_) => {}
            Err(e) => debug!("Account poll failed: {}", e),
        }
    }
}

/// Poll `eth_getLogs` over new blocks and feed matching logs to `handler`
/// until the session is superseded
async fn poll_logs(
    provider: Provider<Http>,
    sessions: Arc<Sessions>,
    session: SessionId,
    filter: Filter,
    handler: LogHandler,
    mut last_block: u64,
    poll_interval: Duration,
) {
    loop {
        tokio::time::sleep(poll_interval).await;

        if !sessions.is_valid(session) {
            debug!("Stopping log poll for superseded {}", session);
            return;
        }

        let current_block = match provider.get_block_number().await {
            Ok(b) => b.as_u64(),
            Err(e) => {
                warn!("Failed to get block number: {}", e);
                continue;
            }
        };

        let Some((from_block, to_block)) = next_log_range(last_block, current_block) else {
            continue;
        };
        let range = filter.clone().from_block(from_block).to_block(to_block);

        match provider.get_logs(&range).await {
            Ok(logs) => {
                debug!("{}: {} logs in blocks {} to {}", session, logs.len(), from_block, to_block);
                for log in logs {
                    handler(log);
                }
                last_block = to_block;
            }
            Err(e) => {
                // Range is retried on the next tick
                warn!("Failed to get logs: {}", e);
            }
        }
    }
}

/// Next block range to fetch after `last_block`, at most `MAX_LOG_RANGE` blocks
fn next_log_range(last_block: u64, current_block: u64) -> Option<(u64, u64)> {
    if current_block <= last_block {
        return None;
    }
    let from_block = last_block + 1;
    Some((from_block, current_block.min(from_block + MAX_LOG_RANGE - 1)))
}

#[async_trait]
impl ChainAgent for RpcAgent {
    async fn open_session(&self) -> AgentResult<SessionId> {
        let session = self.sessions.open();
        debug!("Opened {}", session);
        Ok(session)
    }

    async fn chain_id(&self, session: SessionId) -> AgentResult<u64> {
        self.sessions.check(session)?;
        Ok(self.provider.get_chainid().await.map_err(rpc_error)?.as_u64())
    }

    async fn request_accounts(&self, session: SessionId) -> AgentResult<Vec<Address>> {
        self.sessions.check(session)?;
        self.accounts().await
    }

    async fn get_balance(&self, session: SessionId, account: Address) -> AgentResult<U256> {
        self.sessions.check(session)?;
        self.provider
            .get_balance(account, None)
            .await
            .map_err(rpc_error)
    }

    async fn call(&self, session: SessionId, to: Address, data: Bytes) -> AgentResult<Bytes> {
        self.sessions.check(session)?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, None).await.map_err(rpc_error)
    }

    async fn send_transaction(&self, session: SessionId, tx: TransactionRequest) -> AgentResult<H256> {
        self.sessions.check(session)?;

        let tx_hash = match &self.wallet {
            Some(wallet) => {
                // Sign for the node's current chain, not the one seen at connect
                let chain_id = self.provider.get_chainid().await.map_err(rpc_error)?.as_u64();
                let signer = self.signer_for(wallet, chain_id).await;
                let pending = signer.send_transaction(tx, None).await.map_err(rpc_error)?;
                pending.tx_hash()
            }
            None => self
                .provider
                .send_transaction(tx, None)
                .await
                .map_err(rpc_error)?
                .tx_hash(),
        };

        debug!("{}: sent {:?}", session, tx_hash);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, session: SessionId, tx_hash: H256) -> AgentResult<TransactionReceipt> {
        tokio::time::timeout(RECEIPT_TIMEOUT, self.poll_receipt(session, tx_hash))
            .await
            .map_err(|_| AgentError::Rpc(format!("no receipt for {:?} after {:?}", tx_hash, RECEIPT_TIMEOUT)))?
    }

    async fn subscribe_logs(
        &self,
        session: SessionId,
        filter: Filter,
        handler: LogHandler,
    ) -> AgentResult<SubscriptionId> {
        self.sessions.check(session)?;

        let start = self
            .provider
            .get_block_number()
            .await
            .map_err(rpc_error)?
            .as_u64();

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let task = tokio::spawn(poll_logs(
            self.provider.clone(),
            self.sessions.clone(),
            session,
            filter,
            handler,
            start,
            self.poll_interval,
        ));
        self.subscriptions.insert(id, task);

        debug!("{}: subscription {:?} from block {}", session, id, start);
        Ok(id)
    }

    async fn unsubscribe(&self, _session: SessionId, id: SubscriptionId) -> AgentResult<()> {
        // Allowed on superseded sessions so their tasks can be reclaimed
        let (_, task) = self
            .subscriptions
            .remove(&id)
            .ok_or(AgentError::UnknownSubscription(id))?;
        task.abort();
        Ok(())
    }

    fn notices(&self) -> broadcast::Receiver<AgentNotice> {
        self.notices.subscribe()
    }
}
