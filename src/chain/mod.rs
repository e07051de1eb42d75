//! Connection resolution
//!
//! A `Connection` pairs the injected chain-access agent with the session it
//! opened. It is created once per pipeline run and replaced wholesale when the
//! agent reports a network change; requests through a replaced connection are
//! rejected by the agent.

use crate::agent::{
    AgentError, AgentResult, ChainAgent, LogHandler, SessionId, SubscriptionId,
};
use crate::error::{ClientError, ClientResult};
use crate::events::{Emitted, StateEvent};

use ethers::types::{Address, Bytes, Filter, TransactionReceipt, TransactionRequest, H256, U256, U64};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle to the chain-access agent for one session
#[derive(Clone)]
pub struct Connection {
    agent: Arc<dyn ChainAgent>,
    session: SessionId,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .finish()
    }
}

impl Connection {
    /// Session this connection tags its requests with
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn agent(&self) -> &Arc<dyn ChainAgent> {
        &self.agent
    }

    pub async fn chain_id(&self) -> AgentResult<u64> {
        self.agent.chain_id(self.session).await
    }

    pub async fn request_accounts(&self) -> AgentResult<Vec<Address>> {
        self.agent.request_accounts(self.session).await
    }

    pub async fn get_balance(&self, account: Address) -> AgentResult<U256> {
        self.agent.get_balance(self.session, account).await
    }

    pub async fn call(&self, to: Address, data: Bytes) -> AgentResult<Bytes> {
        self.agent.call(self.session, to, data).await
    }

    pub async fn send_transaction(&self, tx: TransactionRequest) -> AgentResult<H256> {
        self.agent.send_transaction(self.session, tx).await
    }

    /// Wait for a transaction to be included; a failed receipt is a revert
    pub async fn settle(&self, step: &str, tx_hash: H256) -> ClientResult<TransactionReceipt> {
        let receipt = self
            .agent
            .wait_for_receipt(self.session, tx_hash)
            .await
            .map_err(|e| ClientError::transaction(step, e))?;

        if receipt.status != Some(U64::from(1u64)) {
            warn!("Transaction {:?} ({}) reverted", tx_hash, step);
            return Err(ClientError::transaction(step, AgentError::Reverted(tx_hash)));
        }

        debug!(
            "Transaction {:?} ({}) settled in block {:?}",
            tx_hash, step, receipt.block_number
        );
        Ok(receipt)
    }

    pub async fn subscribe_logs(&self, filter: Filter, handler: LogHandler) -> AgentResult<SubscriptionId> {
        self.agent.subscribe_logs(self.session, filter, handler).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> AgentResult<()> {
        self.agent.unsubscribe(self.session, id).await
    }
}

/// Build a connection over the injected agent. Emits `PROVIDER_LOADED`.
///
/// A missing agent (no wallet installed) is fatal to the pipeline.
pub async fn resolve(agent: Option<Arc<dyn ChainAgent>>) -> ClientResult<Emitted<Connection>> {
    let agent = agent.ok_or_else(|| {
        ClientError::AgentUnavailable("no chain-access agent installed".to_string())
    })?;

    let session = agent.open_session().await.map_err(|e| match e {
        AgentError::Unavailable(message) => ClientError::AgentUnavailable(message),
        other => ClientError::AgentUnavailable(other.to_string()),
    })?;

    info!("Connected to chain-access agent ({})", session);

    Ok(Emitted::new(Connection { agent, session })
        .with(StateEvent::ProviderLoaded { session }))
}

/// Read the active network identifier. Emits `NETWORK_LOADED`.
pub async fn resolve_network(connection: &Connection) -> ClientResult<Emitted<u64>> {
    let chain_id = connection.chain_id().await.map_err(|e| match e {
        AgentError::Unavailable(message) => ClientError::AgentUnavailable(message),
        other => ClientError::QueryFailed {
            address: connection.session.to_string(),
            function: "eth_chainId".to_string(),
            message: other.to_string(),
        },
    })?;

    info!("Agent is on network {}", chain_id);
    crate::metrics::record_network(chain_id);

    Ok(Emitted::new(chain_id).with(StateEvent::NetworkLoaded { chain_id }))
}
