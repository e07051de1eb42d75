//! In-memory chain-access agent for tests
//!
//! Simulates one token exchange deployment: token ledgers, allowances,
//! exchange custody, event emission to subscribers, session staleness after a
//! network switch, and injectable query failures, rejections and reverts.
//! Calldata is decoded with the same ABI descriptions the client encodes with.

use super::{AgentError, AgentNotice, AgentResult, ChainAgent, LogHandler, SessionId, SubscriptionId};
use crate::contracts::abi::{self, EXCHANGE_ABI, TOKEN_ABI};
use crate::events::TransferKind;

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::types::{
    Address, Bytes, Filter, Log, NameOrAddress, TransactionReceipt, TransactionRequest, ValueOrArray,
    H256, U256, U64,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Default)]
struct FakeToken {
    symbol: String,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
}

struct Subscription {
    session: SessionId,
    address: Option<Address>,
    topic0: Option<H256>,
    handler: LogHandler,
}

struct ChainState {
    chain_id: u64,
    next_session: u64,
    min_valid_session: u64,
    accounts: Vec<Address>,
    decline_accounts: bool,
    native: HashMap<Address, U256>,
    tokens: HashMap<Address, FakeToken>,
    exchange: Option<Address>,
    custody: HashMap<(Address, Address), U256>,
    receipts: HashMap<H256, (bool, u64)>,
    next_address: u64,
    next_tx: u64,
    block: u64,
    calls: usize,
    sent: Vec<String>,
    failing_queries: HashSet<(Address, String)>,
    rejected: HashSet<String>,
    reverting: HashSet<String>,
    subscriptions: HashMap<u64, Subscription>,
    next_subscription: u64,
}

impl ChainState {
    fn check(&self, session: SessionId) -> AgentResult<()> {
        if session.0 < self.min_valid_session || session.0 >= self.next_session {
            return Err(AgentError::StaleSession(session));
        }
        Ok(())
    }

    fn fresh_address(&mut self) -> Address {
        self.next_address += 1;
        Address::from_low_u64_be(0x1000 + self.next_address)
    }

    fn custody(&self, token: Address, user: Address) -> U256 {
        self.custody.get(&(token, user)).copied().unwrap_or_default()
    }

    /// Apply a write; `None` means the call reverts
    fn execute(&mut self, from: Address, to: Address, data: &[u8]) -> Option<Option<(TransferKind, Vec<Token>)>> {
        if Some(to) == self.exchange {
            let f = abi::function_by_selector(&EXCHANGE_ABI, data)?;
            let args = f.decode_input(&data[4..]).ok()?;
            let token = args.first()?.clone().into_address()?;
            let amount = args.get(1)?.clone().into_uint()?;
            let exchange = to;

            return match f.name.as_str() {
                "deposit" => {
                    let ledger = self.tokens.get_mut(&token)?;
                    let allowance = ledger.allowances.get(&(from, exchange)).copied().unwrap_or_default();
                    let balance = ledger.balances.get(&from).copied().unwrap_or_default();
                    if allowance < amount || balance < amount {
                        return None;
                    }
                    ledger.allowances.insert((from, exchange), allowance - amount);
                    ledger.balances.insert(from, balance - amount);
                    *ledger.balances.entry(exchange).or_default() += amount;
                    let custody = self.custody(token, from) + amount;
                    self.custody.insert((token, from), custody);
                    Some(Some((TransferKind::Deposit, transfer_tokens(token, from, amount, custody))))
                }
                "withdraw" => {
                    let custody = self.custody(token, from);
                    if custody < amount {
                        return None;
                    }
                    let ledger = self.tokens.get_mut(&token)?;
                    let held = ledger.balances.get(&exchange).copied().unwrap_or_default();
                    ledger.balances.insert(exchange, held.saturating_sub(amount));
                    *ledger.balances.entry(from).or_default() += amount;
                    self.custody.insert((token, from), custody - amount);
                    Some(Some((
                        TransferKind::Withdraw,
                        transfer_tokens(token, from, amount, custody - amount),
                    )))
                }
                _ => None,
            };
        }

        let ledger = self.tokens.get_mut(&to)?;
        let f = abi::function_by_selector(&TOKEN_ABI, data)?;
        let args = f.decode_input(&data[4..]).ok()?;
        match f.name.as_str() {
            "approve" => {
                let spender = args.first()?.clone().into_address()?;
                let value = args.get(1)?.clone().into_uint()?;
                ledger.allowances.insert((from, spender), value);
                Some(None)
            }
            _ => None,
        }
    }
}

fn transfer_tokens(token: Address, user: Address, amount: U256, balance: U256) -> Vec<Token> {
    vec![
        Token::Address(token),
        Token::Address(user),
        Token::Uint(amount),
        Token::Uint(balance),
    ]
}

fn function_name(data: &[u8]) -> String {
    abi::function_by_selector(&TOKEN_ABI, data)
        .or_else(|| abi::function_by_selector(&EXCHANGE_ABI, data))
        .map(|f| f.name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Test double for the chain-access agent
pub(crate) struct FakeAgent {
    state: Mutex<ChainState>,
    notices: broadcast::Sender<AgentNotice>,
}

/// Test-side controller over a shared `FakeAgent`
#[derive(Clone)]
pub(crate) struct FakeChain {
    agent: Arc<FakeAgent>,
}

/// Account the fake agent hands out unless told otherwise
pub(crate) fn default_account() -> Address {
    Address::repeat_byte(0xaa)
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        let (notices, _) = broadcast::channel(64);
        let mut native = HashMap::new();
        native.insert(default_account(), U256::exp10(18) * U256::from(10_000u64));

        let state = ChainState {
            chain_id,
            next_session: 1,
            min_valid_session: 1,
            accounts: vec![default_account()],
            decline_accounts: false,
            native,
            tokens: HashMap::new(),
            exchange: None,
            custody: HashMap::new(),
            receipts: HashMap::new(),
            next_address: 0,
            next_tx: 0,
            block: 1,
            calls: 0,
            sent: Vec::new(),
            failing_queries: HashSet::new(),
            rejected: HashSet::new(),
            reverting: HashSet::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
        };

        Self {
            agent: Arc::new(FakeAgent {
                state: Mutex::new(state),
                notices,
            }),
        }
    }

    pub fn agent(&self) -> Arc<dyn ChainAgent> {
        self.agent.clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> R {
        let mut state = self.agent.state.lock().unwrap();
        f(&mut *state)
    }

    pub fn deploy_token(&self, symbol: &str) -> Address {
        self.with(|s| {
            let address = s.fresh_address();
            s.tokens.insert(
                address,
                FakeToken {
                    symbol: symbol.to_string(),
                    ..Default::default()
                },
            );
            address
        })
    }

    pub fn deploy_exchange(&self) -> Address {
        self.with(|s| {
            let address = s.fresh_address();
            s.exchange = Some(address);
            address
        })
    }

    pub fn mint(&self, token: Address, owner: Address, amount: U256) {
        self.with(|s| {
            if let Some(ledger) = s.tokens.get_mut(&token) {
                *ledger.balances.entry(owner).or_default() += amount;
            }
        })
    }

    pub fn set_custody(&self, token: Address, user: Address, amount: U256) {
        self.with(|s| {
            s.custody.insert((token, user), amount);
        })
    }

    pub fn set_native_balance(&self, account: Address, amount: U256) {
        self.with(|s| {
            s.native.insert(account, amount);
        })
    }

    pub fn decline_accounts(&self, decline: bool) {
        self.with(|s| s.decline_accounts = decline)
    }

    pub fn fail_query(&self, address: Address, function: &str) {
        self.with(|s| {
            s.failing_queries.insert((address, function.to_string()));
        })
    }

    pub fn reject(&self, function: &str) {
        self.with(|s| {
            s.rejected.insert(function.to_string());
        })
    }

    pub fn revert(&self, function: &str) {
        self.with(|s| {
            s.reverting.insert(function.to_string());
        })
    }

    /// Move to another network; every open session becomes stale
    pub fn switch_network(&self, chain_id: u64) {
        self.with(|s| {
            s.chain_id = chain_id;
            s.min_valid_session = s.next_session;
        });
        let _ = self.agent.notices.send(AgentNotice::ChainChanged(chain_id));
    }

    pub fn switch_account(&self, account: Address) {
        self.with(|s| s.accounts = vec![account]);
        let _ = self
            .agent
            .notices
            .send(AgentNotice::AccountsChanged(vec![account]));
    }

    /// Approve and deposit on behalf of another account, bypassing sessions
    pub fn external_deposit(&self, user: Address, token: Address, amount: U256) {
        let (handlers, log) = self.with(|s| {
            let exchange = s.exchange.expect("exchange deployed");
            if let Some(ledger) = s.tokens.get_mut(&token) {
                ledger.allowances.insert((user, exchange), amount);
            }
            let data = abi::function(&EXCHANGE_ABI, "deposit")
                .unwrap()
                .encode_input(&[Token::Address(token), Token::Uint(amount)])
                .unwrap();
            let effect = s.execute(user, exchange, &data).expect("deposit succeeds");
            s.emit(exchange, effect)
        });
        deliver(handlers, log);
    }

    pub fn sent_functions(&self) -> Vec<String> {
        self.with(|s| s.sent.clone())
    }

    pub fn call_count(&self) -> usize {
        self.with(|s| s.calls)
    }

    pub fn subscription_count(&self) -> usize {
        self.with(|s| s.subscriptions.len())
    }

    pub fn custody(&self, token: Address, user: Address) -> U256 {
        self.with(|s| s.custody(token, user))
    }
}

impl ChainState {
    /// Build the log for an applied transfer and collect matching handlers
    fn emit(
        &mut self,
        exchange: Address,
        effect: Option<(TransferKind, Vec<Token>)>,
    ) -> (Vec<LogHandler>, Option<Log>) {
        let Some((kind, tokens)) = effect else {
            return (Vec::new(), None);
        };
        let Ok(event) = abi::exchange_event(kind) else {
            return (Vec::new(), None);
        };

        self.block += 1;
        self.next_tx += 1;
        let topic = event.signature();
        let log = Log {
            address: exchange,
            topics: vec![topic],
            data: encode(&tokens).into(),
            block_number: Some(U64::from(self.block)),
            transaction_hash: Some(H256::from_low_u64_be(0xe000 + self.next_tx)),
            ..Default::default()
        };

        let handlers = self
            .subscriptions
            .values()
            .filter(|sub| sub.session.0 >= self.min_valid_session)
            .filter(|sub| sub.address.map_or(true, |a| a == exchange))
            .filter(|sub| sub.topic0.map_or(true, |t| t == topic))
            .map(|sub| sub.handler.clone())
            .collect();

        (handlers, Some(log))
    }
}

fn deliver(handlers: Vec<LogHandler>, log: Option<Log>) {
    if let Some(log) = log {
        for handler in handlers {
            handler(log.clone());
        }
    }
}

fn filter_address(filter: &Filter) -> Option<Address> {
    match &filter.address {
        Some(ValueOrArray::Value(address)) => Some(*address),
        _ => None,
    }
}

fn filter_topic0(filter: &Filter) -> Option<H256> {
    match &filter.topics[0] {
        Some(ValueOrArray::Value(Some(topic))) => Some(*topic),
        _ => None,
    }
}

#[async_trait]
impl ChainAgent for FakeAgent {
    async fn open_session(&self) -> AgentResult<SessionId> {
        let mut state = self.state.lock().unwrap();
        let id = SessionId(state.next_session);
        state.next_session += 1;
        Ok(id)
    }

    async fn chain_id(&self, session: SessionId) -> AgentResult<u64> {
        let state = self.state.lock().unwrap();
        state.check(session)?;
        Ok(state.chain_id)
    }

    async fn request_accounts(&self, session: SessionId) -> AgentResult<Vec<Address>> {
        let state = self.state.lock().unwrap();
        state.check(session)?;
        if state.decline_accounts {
            return Err(AgentError::UserRejected);
        }
        Ok(state.accounts.clone())
    }

    async fn get_balance(&self, session: SessionId, account: Address) -> AgentResult<U256> {
        let state = self.state.lock().unwrap();
        state.check(session)?;
        if state.failing_queries.contains(&(account, "eth_getBalance".to_string())) {
            return Err(AgentError::Rpc("eth_getBalance timed out".to_string()));
        }
        Ok(state.native.get(&account).copied().unwrap_or_default())
    }

    async fn call(&self, session: SessionId, to: Address, data: Bytes) -> AgentResult<Bytes> {
        let mut state = self.state.lock().unwrap();
        state.check(session)?;
        state.calls += 1;

        let name = function_name(&data);
        if state.failing_queries.contains(&(to, name.clone())) {
            return Err(AgentError::Rpc(format!("{} timed out", name)));
        }

        let revert = || AgentError::Rpc("execution reverted".to_string());

        if Some(to) == state.exchange {
            let f = abi::function_by_selector(&EXCHANGE_ABI, &data).ok_or_else(revert)?;
            let args = f.decode_input(&data[4..]).map_err(|_| revert())?;
            let (token, user) = match (args.first().cloned(), args.get(1).cloned()) {
                (Some(Token::Address(token)), Some(Token::Address(user))) => (token, user),
                _ => return Err(revert()),
            };
            return Ok(encode(&[Token::Uint(state.custody(token, user))]).into());
        }

        let ledger = state.tokens.get(&to).ok_or_else(revert)?;
        let f = abi::function_by_selector(&TOKEN_ABI, &data).ok_or_else(revert)?;
        let args = f.decode_input(&data[4..]).map_err(|_| revert())?;
        let output = match (f.name.as_str(), args.as_slice()) {
            ("symbol", []) => Token::String(ledger.symbol.clone()),
            ("balanceOf", [Token::Address(owner)]) => {
                Token::Uint(ledger.balances.get(owner).copied().unwrap_or_default())
            }
            ("allowance", [Token::Address(owner), Token::Address(spender)]) => Token::Uint(
                ledger
                    .allowances
                    .get(&(*owner, *spender))
                    .copied()
                    .unwrap_or_default(),
            ),
            _ => return Err(revert()),
        };
        Ok(encode(&[output]).into())
    }

    async fn send_transaction(&self, session: SessionId, tx: TransactionRequest) -> AgentResult<H256> {
        let (tx_hash, handlers, log) = {
            let mut state = self.state.lock().unwrap();
            state.check(session)?;

            let data = tx.data.clone().unwrap_or_default();
            let name = function_name(&data);
            if state.rejected.contains(&name) {
                return Err(AgentError::UserRejected);
            }

            let from = tx.from.unwrap_or_default();
            let to = match tx.to {
                Some(NameOrAddress::Address(to)) => to,
                _ => return Err(AgentError::Rpc("missing recipient".to_string())),
            };

            state.sent.push(name.clone());
            state.next_tx += 1;
            state.block += 1;
            let tx_hash = H256::from_low_u64_be(state.next_tx);
            let block = state.block;

            let effect = if state.reverting.contains(&name) {
                None
            } else {
                state.execute(from, to, &data)
            };

            match effect {
                Some(effect) => {
                    state.receipts.insert(tx_hash, (true, block));
                    let (handlers, log) = state.emit(to, effect);
                    (tx_hash, handlers, log)
                }
                None => {
                    state.receipts.insert(tx_hash, (false, block));
                    (tx_hash, Vec::new(), None)
                }
            }
        };

        deliver(handlers, log);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, session: SessionId, tx_hash: H256) -> AgentResult<TransactionReceipt> {
        let state = self.state.lock().unwrap();
        state.check(session)?;
        let (success, block) = state
            .receipts
            .get(&tx_hash)
            .copied()
            .ok_or_else(|| AgentError::Rpc(format!("unknown transaction {:?}", tx_hash)))?;

        Ok(TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(block)),
            status: Some(U64::from(if success { 1u64 } else { 0u64 })),
            ..Default::default()
        })
    }

    async fn subscribe_logs(
        &self,
        session: SessionId,
        filter: Filter,
        handler: LogHandler,
    ) -> AgentResult<SubscriptionId> {
        let mut state = self.state.lock().unwrap();
        state.check(session)?;
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(
            id,
            Subscription {
                session,
                address: filter_address(&filter),
                topic0: filter_topic0(&filter),
                handler,
            },
        );
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, _session: SessionId, id: SubscriptionId) -> AgentResult<()> {
        // Superseded sessions may still release their subscriptions
        let mut state = self.state.lock().unwrap();
        state
            .subscriptions
            .remove(&id.0)
            .map(|_| ())
            .ok_or(AgentError::UnknownSubscription(id))
    }

    fn notices(&self) -> broadcast::Receiver<AgentNotice> {
        self.notices.subscribe()
    }
}
