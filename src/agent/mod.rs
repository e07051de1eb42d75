//! Chain-access agent contract
//!
//! The agent is the external party that holds signing authority and brokers
//! every read and write against the chain. This module defines:
//! - The `ChainAgent` trait the core is written against
//! - Session and subscription identifiers
//! - Account/network change notices
//!
//! `rpc` provides the production adapter over an ethers HTTP provider.

pub mod rpc;

#[cfg(test)]
pub(crate) mod fake;

pub use rpc::RpcAgent;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, Filter, Log, TransactionReceipt, TransactionRequest, H256, U256};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifies one connection's worth of requests to the agent.
///
/// A new session is opened per connection; once the agent supersedes it
/// (network change) every request tagged with it is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Handle returned by `subscribe_logs`, required to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Callback invoked for every log matching a subscription filter
pub type LogHandler = Arc<dyn Fn(Log) + Send + Sync>;

/// Notifications pushed by the agent outside of any request
#[derive(Debug, Clone, PartialEq)]
pub enum AgentNotice {
    /// The user switched accounts in the agent
    AccountsChanged(Vec<Address>),
    /// The agent moved to another network
    ChainChanged(u64),
}

/// Errors reported by the agent
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected by user")]
    UserRejected,

    #[error("Request on superseded {0}")]
    StaleSession(SessionId),

    #[error("Transaction {0:?} reverted")]
    Reverted(H256),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Unknown subscription {0:?}")]
    UnknownSubscription(SubscriptionId),
}

/// Result type for agent requests
pub type AgentResult<T> = Result<T, AgentError>;

/// External chain-access agent (wallet extension, node, or a test double)
#[async_trait]
pub trait ChainAgent: Send + Sync {
    /// Open a new session; earlier sessions stay valid until the agent supersedes them
    async fn open_session(&self) -> AgentResult<SessionId>;

    /// Chain ID of the network the agent is on
    async fn chain_id(&self, session: SessionId) -> AgentResult<u64>;

    /// Ask for account access. May prompt the user.
    async fn request_accounts(&self, session: SessionId) -> AgentResult<Vec<Address>>;

    /// Native currency balance of an account
    async fn get_balance(&self, session: SessionId, account: Address) -> AgentResult<U256>;

    /// Read-only contract call
    async fn call(&self, session: SessionId, to: Address, data: Bytes) -> AgentResult<Bytes>;

    /// Sign and submit a state-changing transaction
    async fn send_transaction(&self, session: SessionId, tx: TransactionRequest) -> AgentResult<H256>;

    /// Wait until the transaction is included and return its receipt
    async fn wait_for_receipt(&self, session: SessionId, tx_hash: H256) -> AgentResult<TransactionReceipt>;

    /// Install a log subscription
    async fn subscribe_logs(
        &self,
        session: SessionId,
        filter: Filter,
        handler: LogHandler,
    ) -> AgentResult<SubscriptionId>;

    /// Remove a log subscription
    async fn unsubscribe(&self, session: SessionId, id: SubscriptionId) -> AgentResult<()>;

    /// Stream of account/network change notices
    fn notices(&self) -> broadcast::Receiver<AgentNotice>;
}
