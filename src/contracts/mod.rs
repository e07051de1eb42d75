//! Contract binding
//!
//! Produces typed handles over the token and exchange contracts:
//! - Read calls go through the connection as ABI-encoded `eth_call`s
//! - Write calls need a signer attached with `connect`
//! - The exchange binding owns its `Deposit`/`Withdraw` subscriptions

pub mod abi;

use crate::agent::{AgentError, LogHandler, SubscriptionId};
use crate::chain::Connection;
use crate::error::{ClientError, ClientResult};
use crate::events::{Emitted, StateEvent, TokenSlot, TransferEvent, TransferKind};

use ethers::abi::{Abi, Token};
use ethers::types::{Address, Filter, Log, TransactionRequest, H256, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback receiving every decoded exchange transfer event, for any account
pub type TransferHandler = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// Binding of {address, interface, connection}, optionally with a signer
#[derive(Debug, Clone)]
pub struct ContractHandle {
    address: Address,
    abi: &'static Abi,
    connection: Connection,
    signer: Option<Address>,
}

impl ContractHandle {
    pub fn new(address: Address, abi: &'static Abi, connection: Connection) -> Self {
        Self {
            address,
            abi,
            connection,
            signer: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Copy of this handle that signs writes as `signer`
    pub fn connect(&self, signer: Address) -> Self {
        Self {
            signer: Some(signer),
            ..self.clone()
        }
    }

    fn encode(&self, function: &str, args: &[Token]) -> ClientResult<(Vec<u8>, &'static ethers::abi::Function)> {
        let f = abi::function(self.abi, function).map_err(|e| self.query_error(function, e.to_string()))?;
        let data = f
            .encode_input(args)
            .map_err(|e| self.query_error(function, e.to_string()))?;
        Ok((data, f))
    }

    fn query_error(&self, function: &str, message: String) -> ClientError {
        ClientError::QueryFailed {
            address: format!("{:?}", self.address),
            function: function.to_string(),
            message,
        }
    }

    /// Read call returning the first output token
    pub async fn query(&self, function: &str, args: &[Token]) -> ClientResult<Token> {
        let (data, f) = self.encode(function, args)?;

        let output = self
            .connection
            .call(self.address, data.into())
            .await
            .map_err(|e| self.query_error(function, e.to_string()))?;

        f.decode_output(&output)
            .map_err(|e| self.query_error(function, e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| self.query_error(function, "empty output".to_string()))
    }

    pub async fn query_uint(&self, function: &str, args: &[Token]) -> ClientResult<U256> {
        self.query(function, args)
            .await?
            .into_uint()
            .ok_or_else(|| self.query_error(function, "output is not a uint".to_string()))
    }

    /// Submit a state-changing call signed by the attached signer
    pub async fn transact(&self, function: &str, args: &[Token]) -> ClientResult<H256> {
        let signer = self
            .signer
            .ok_or_else(|| ClientError::NotReady(format!("no signer attached for {}", function)))?;
        let (data, _) = self.encode(function, args)?;

        let tx = TransactionRequest::new()
            .from(signer)
            .to(self.address)
            .data(data);

        let tx_hash = self
            .connection
            .send_transaction(tx)
            .await
            .map_err(|e| ClientError::transaction(function, e))?;

        debug!("Submitted {} on {:?}: {:?}", function, self.address, tx_hash);
        Ok(tx_hash)
    }
}

/// Token contract handle with its cached symbol
#[derive(Debug, Clone)]
pub struct TokenHandle {
    contract: ContractHandle,
    symbol: String,
}

impl TokenHandle {
    pub fn address(&self) -> Address {
        self.contract.address()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn connection(&self) -> &Connection {
        self.contract.connection()
    }

    pub fn connect(&self, signer: Address) -> Self {
        Self {
            contract: self.contract.connect(signer),
            symbol: self.symbol.clone(),
        }
    }

    /// Wallet-held balance of `owner`
    pub async fn balance_of(&self, owner: Address) -> ClientResult<U256> {
        self.contract
            .query_uint("balanceOf", &[Token::Address(owner)])
            .await
    }

    pub async fn allowance(&self, owner: Address, spender: Address) -> ClientResult<U256> {
        self.contract
            .query_uint("allowance", &[Token::Address(owner), Token::Address(spender)])
            .await
    }

    pub async fn approve(&self, spender: Address, amount: U256) -> ClientResult<H256> {
        self.contract
            .transact("approve", &[Token::Address(spender), Token::Uint(amount)])
            .await
    }
}

/// Exchange contract handle
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
    contract: ContractHandle,
}

impl ExchangeHandle {
    pub fn address(&self) -> Address {
        self.contract.address()
    }

    pub fn connection(&self) -> &Connection {
        self.contract.connection()
    }

    pub fn connect(&self, signer: Address) -> Self {
        Self {
            contract: self.contract.connect(signer),
        }
    }

    /// Exchange-custody balance of `user` for `token`; zero if never deposited
    pub async fn balance_of(&self, token: Address, user: Address) -> ClientResult<U256> {
        self.contract
            .query_uint("balanceOf", &[Token::Address(token), Token::Address(user)])
            .await
    }

    pub async fn deposit(&self, token: Address, amount: U256) -> ClientResult<H256> {
        self.contract
            .transact("deposit", &[Token::Address(token), Token::Uint(amount)])
            .await
    }

    pub async fn withdraw(&self, token: Address, amount: U256) -> ClientResult<H256> {
        self.contract
            .transact("withdraw", &[Token::Address(token), Token::Uint(amount)])
            .await
    }

    /// Subscribe to one kind of transfer event, for every account
    pub async fn subscribe(&self, kind: TransferKind, handler: TransferHandler) -> ClientResult<SubscriptionId> {
        let event = abi::exchange_event(kind).map_err(|e| self.unreachable(e.to_string()))?;
        let filter = Filter::new().address(self.address()).topic0(event.signature());

        let log_handler: LogHandler = Arc::new(move |log: Log| {
            match TransferEvent::from_log(kind, event, &log) {
                Ok(decoded) => handler(decoded),
                Err(e) => warn!("Dropping undecodable {} log: {}", kind.event_name(), e),
            }
        });

        self.connection()
            .subscribe_logs(filter, log_handler)
            .await
            .map_err(|e| self.unreachable(e.to_string()))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), AgentError> {
        self.connection().unsubscribe(id).await
    }

    fn unreachable(&self, message: String) -> ClientError {
        ClientError::ContractUnreachable {
            address: format!("{:?}", self.address()),
            message,
        }
    }
}

/// Bound exchange together with the subscriptions installed for it
#[derive(Debug, Clone)]
pub struct ExchangeBinding {
    pub handle: ExchangeHandle,
    pub subscriptions: Vec<SubscriptionId>,
}

impl ExchangeBinding {
    /// Remove the subscriptions. Failures are logged; the connection may
    /// already be superseded.
    pub async fn teardown(&self) {
        for id in &self.subscriptions {
            if let Err(e) = self.handle.unsubscribe(*id).await {
                debug!("Unsubscribe {:?} failed: {}", id, e);
            }
        }
    }
}

/// Bind a token contract and probe its symbol. Emits `TOKEN_LOADED_<n>`.
///
/// A failed probe leaves the handle unusable and surfaces as `ContractUnreachable`.
pub async fn bind_token(
    slot: TokenSlot,
    address: Address,
    connection: &Connection,
) -> ClientResult<Emitted<TokenHandle>> {
    let contract = ContractHandle::new(address, &abi::TOKEN_ABI, connection.clone());

    let symbol = contract
        .query("symbol", &[])
        .await
        .and_then(|token| {
            token
                .into_string()
                .ok_or_else(|| contract.query_error("symbol", "output is not a string".to_string()))
        })
        .map_err(|e| ClientError::ContractUnreachable {
            address: format!("{:?}", address),
            message: e.to_string(),
        })?;

    info!("Bound token {} at {:?}", symbol, address);

    Ok(Emitted::new(TokenHandle {
        contract,
        symbol: symbol.clone(),
    })
    .with(StateEvent::token_loaded(slot, address, symbol)))
}

/// Bind the exchange contract and install its `Deposit`/`Withdraw`
/// subscriptions. Emits `EXCHANGE_LOADED`.
pub async fn bind_exchange(
    address: Address,
    connection: &Connection,
    on_transfer: TransferHandler,
) -> ClientResult<Emitted<ExchangeBinding>> {
    let handle = ExchangeHandle {
        contract: ContractHandle::new(address, &abi::EXCHANGE_ABI, connection.clone()),
    };

    let mut subscriptions = Vec::with_capacity(2);
    for kind in [TransferKind::Deposit, TransferKind::Withdraw] {
        match handle.subscribe(kind, on_transfer.clone()).await {
            Ok(id) => subscriptions.push(id),
            Err(e) => {
                ExchangeBinding {
                    handle: handle.clone(),
                    subscriptions,
                }
                .teardown()
                .await;
                return Err(e);
            }
        }
    }

    info!("Bound exchange at {:?}", address);

    Ok(Emitted::new(ExchangeBinding {
        handle,
        subscriptions,
    })
    .with(StateEvent::ExchangeLoaded { address }))
}
