//! State events and dispatch
//!
//! Every component returns its result together with the state events it
//! produced (`Emitted<T>`). Broadcasting them is left to a `DispatchSink`
//! owned by whoever embeds the client.

use crate::agent::SessionId;
use crate::error::{ClientError, ClientResult};
use crate::transfer::TransferDirection;
use crate::units::Quantity;

use ethers::abi::{Event, RawLog, Token};
use ethers::types::{Address, Log, H256};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Which of the two configured tokens an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TokenSlot {
    First,
    Second,
}

impl TokenSlot {
    pub fn index(self) -> usize {
        match self {
            TokenSlot::First => 0,
            TokenSlot::Second => 1,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(TokenSlot::First),
            2 => Some(TokenSlot::Second),
            _ => None,
        }
    }
}

/// Typed state update, serialized as `{"type": <TAG>, ...payload}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateEvent {
    ProviderLoaded {
        session: SessionId,
    },
    NetworkLoaded {
        chain_id: u64,
    },
    AccountLoaded {
        account: Address,
    },
    BalanceLoaded {
        balance: Quantity,
    },
    #[serde(rename = "TOKEN_LOADED_1")]
    TokenLoaded1 {
        address: Address,
        symbol: String,
    },
    #[serde(rename = "TOKEN_LOADED_2")]
    TokenLoaded2 {
        address: Address,
        symbol: String,
    },
    ExchangeLoaded {
        address: Address,
    },
    #[serde(rename = "TOKEN_1_BALANCE_LOADED")]
    Token1BalanceLoaded {
        balance: Quantity,
    },
    #[serde(rename = "TOKEN_2_BALANCE_LOADED")]
    Token2BalanceLoaded {
        balance: Quantity,
    },
    #[serde(rename = "EXCHANGE_USER_1_BALANCE_LOADED")]
    ExchangeUser1BalanceLoaded {
        balance: Quantity,
    },
    #[serde(rename = "EXCHANGE_USER_2_BALANCE_LOADED")]
    ExchangeUser2BalanceLoaded {
        balance: Quantity,
    },
    TransferRequest {
        id: Uuid,
        direction: TransferDirection,
        token: Address,
        amount: Quantity,
    },
    TransferSuccess {
        event: TransferEvent,
    },
    TransferFailed {
        id: Uuid,
        reason: String,
    },
}

impl StateEvent {
    /// Wire tag of the event
    pub fn tag(&self) -> &'static str {
        match self {
            StateEvent::ProviderLoaded { .. } => "PROVIDER_LOADED",
            StateEvent::NetworkLoaded { .. } => "NETWORK_LOADED",
            StateEvent::AccountLoaded { .. } => "ACCOUNT_LOADED",
            StateEvent::BalanceLoaded { .. } => "BALANCE_LOADED",
            StateEvent::TokenLoaded1 { .. } => "TOKEN_LOADED_1",
            StateEvent::TokenLoaded2 { .. } => "TOKEN_LOADED_2",
            StateEvent::ExchangeLoaded { .. } => "EXCHANGE_LOADED",
            StateEvent::Token1BalanceLoaded { .. } => "TOKEN_1_BALANCE_LOADED",
            StateEvent::Token2BalanceLoaded { .. } => "TOKEN_2_BALANCE_LOADED",
            StateEvent::ExchangeUser1BalanceLoaded { .. } => "EXCHANGE_USER_1_BALANCE_LOADED",
            StateEvent::ExchangeUser2BalanceLoaded { .. } => "EXCHANGE_USER_2_BALANCE_LOADED",
            StateEvent::TransferRequest { .. } => "TRANSFER_REQUEST",
            StateEvent::TransferSuccess { .. } => "TRANSFER_SUCCESS",
            StateEvent::TransferFailed { .. } => "TRANSFER_FAILED",
        }
    }

    pub fn token_loaded(slot: TokenSlot, address: Address, symbol: String) -> Self {
        match slot {
            TokenSlot::First => StateEvent::TokenLoaded1 { address, symbol },
            TokenSlot::Second => StateEvent::TokenLoaded2 { address, symbol },
        }
    }

    pub fn wallet_balance(slot: TokenSlot, balance: Quantity) -> Self {
        match slot {
            TokenSlot::First => StateEvent::Token1BalanceLoaded { balance },
            TokenSlot::Second => StateEvent::Token2BalanceLoaded { balance },
        }
    }

    pub fn exchange_balance(slot: TokenSlot, balance: Quantity) -> Self {
        match slot {
            TokenSlot::First => StateEvent::ExchangeUser1BalanceLoaded { balance },
            TokenSlot::Second => StateEvent::ExchangeUser2BalanceLoaded { balance },
        }
    }
}

/// A computed value plus the state events produced while computing it
#[derive(Debug, Clone)]
pub struct Emitted<T> {
    pub value: T,
    pub events: Vec<StateEvent>,
}

impl<T> Emitted<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            events: Vec::new(),
        }
    }

    pub fn with(mut self, event: StateEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn push(&mut self, event: StateEvent) {
        self.events.push(event);
    }

    /// Send the events to a sink and hand back the value
    pub fn dispatch(self, sink: &dyn DispatchSink) -> T {
        for event in self.events {
            crate::metrics::record_state_event(&event);
            sink.dispatch(event);
        }
        self.value
    }
}

/// Receiver of state events (store, UI bridge, log)
pub trait DispatchSink: Send + Sync {
    fn dispatch(&self, event: StateEvent);
}

/// Logs every event as JSON
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl DispatchSink for TracingSink {
    fn dispatch(&self, event: StateEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "exchange_client::state", "{}", json),
            Err(e) => info!(target: "exchange_client::state", "{} (unserializable: {})", event.tag(), e),
        }
    }
}

/// Forwards events into a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StateEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DispatchSink for ChannelSink {
    fn dispatch(&self, event: StateEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

/// Kind of exchange balance-changing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferKind {
    Deposit,
    Withdraw,
}

impl TransferKind {
    /// Event name in the exchange ABI
    pub fn event_name(self) -> &'static str {
        match self {
            TransferKind::Deposit => "Deposit",
            TransferKind::Withdraw => "Withdraw",
        }
    }
}

/// Decoded `Deposit`/`Withdraw` event emitted by the exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferEvent {
    pub kind: TransferKind,
    pub token: Address,
    pub user: Address,
    pub amount: Quantity,
    /// User's exchange balance after the event
    pub balance: Quantity,
    pub block_number: Option<u64>,
    pub tx_hash: Option<H256>,
    /// Raw log data, hex encoded
    pub data: String,
}

impl TransferEvent {
    /// Decode a log using the exchange's event description
    pub fn from_log(kind: TransferKind, event: &Event, log: &Log) -> ClientResult<Self> {
        let parse_error = |message: String| ClientError::QueryFailed {
            address: format!("{:?}", log.address),
            function: kind.event_name().to_string(),
            message,
        };

        let decoded = event
            .parse_log(RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|e| parse_error(e.to_string()))?;

        let param = |name: &str| -> ClientResult<Token> {
            decoded
                .params
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.value.clone())
                .ok_or_else(|| parse_error(format!("missing parameter {}", name)))
        };
        let address = |name: &str| -> ClientResult<Address> {
            param(name)?
                .into_address()
                .ok_or_else(|| parse_error(format!("{} is not an address", name)))
        };
        let uint = |name: &str| -> ClientResult<Quantity> {
            param(name)?
                .into_uint()
                .map(Quantity::from_raw)
                .ok_or_else(|| parse_error(format!("{} is not a uint", name)))
        };

        Ok(Self {
            kind,
            token: address("token")?,
            user: address("user")?,
            amount: uint("amount")?,
            balance: uint("balance")?,
            block_number: log.block_number.map(|b| b.as_u64()),
            tx_hash: log.transaction_hash,
            data: format!("0x{}", hex::encode(&log.data)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::abi;
    use ethers::abi::encode;
    use ethers::types::U256;

    fn deposit_log(token: Address, user: Address, amount: u64, balance: u64) -> Log {
        let event = abi::exchange_event(TransferKind::Deposit).unwrap();
        Log {
            address: Address::repeat_byte(0xee),
            topics: vec![event.signature()],
            data: encode(&[
                Token::Address(token),
                Token::Address(user),
                Token::Uint(U256::from(amount)),
                Token::Uint(U256::from(balance)),
            ])
            .into(),
            block_number: Some(7u64.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_tags_match_wire_names() {
        let event = StateEvent::exchange_balance(TokenSlot::Second, Quantity::zero());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "EXCHANGE_USER_2_BALANCE_LOADED");
        assert_eq!(json["type"], event.tag());
        assert_eq!(json["balance"], "0.000000000000000000");

        let json = serde_json::to_value(StateEvent::NetworkLoaded { chain_id: 31337 }).unwrap();
        assert_eq!(json["type"], "NETWORK_LOADED");
        assert_eq!(json["chain_id"], 31337);
    }

    #[test]
    fn test_emitted_dispatches_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let value = Emitted::new(5)
            .with(StateEvent::NetworkLoaded { chain_id: 1 })
            .with(StateEvent::ExchangeLoaded {
                address: Address::zero(),
            })
            .dispatch(&sink);

        assert_eq!(value, 5);
        assert_eq!(rx.try_recv().unwrap().tag(), "NETWORK_LOADED");
        assert_eq!(rx.try_recv().unwrap().tag(), "EXCHANGE_LOADED");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_decode_deposit_log() {
        let token = Address::repeat_byte(0x01);
        let user = Address::repeat_byte(0x02);
        let log = deposit_log(token, user, 5, 12);
        let event = abi::exchange_event(TransferKind::Deposit).unwrap();

        let decoded = TransferEvent::from_log(TransferKind::Deposit, event, &log).unwrap();
        assert_eq!(decoded.token, token);
        assert_eq!(decoded.user, user);
        assert_eq!(decoded.amount.raw(), U256::from(5u64));
        assert_eq!(decoded.balance.raw(), U256::from(12u64));
        assert_eq!(decoded.block_number, Some(7));
        assert!(decoded.data.starts_with("0x"));
    }

    #[test]
    fn test_decode_rejects_truncated_log() {
        let mut log = deposit_log(Address::zero(), Address::zero(), 1, 1);
        log.data = log.data.to_vec()[..32].to_vec().into();
        let event = abi::exchange_event(TransferKind::Deposit).unwrap();

        assert!(TransferEvent::from_log(TransferKind::Deposit, event, &log).is_err());
    }
}
