//! Balance reconciliation
//!
//! Reads the four token figures for the active account:
//! - Wallet-held balance of each token (token contract `balanceOf`)
//! - Exchange-custody balance of each token (exchange `balanceOf(token, user)`)
//!
//! The queries run concurrently and fail independently. A failed figure is
//! not emitted and keeps its previous value in the snapshot.

use crate::account::Account;
use crate::contracts::{ExchangeHandle, TokenHandle};
use crate::error::ClientResult;
use crate::events::{Emitted, StateEvent, TokenSlot};
use crate::units::Quantity;

use ethers::types::U256;
use futures::future::join4;
use serde::Serialize;
use tracing::{debug, warn};

/// Which of the four reconciled figures a query produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceField {
    Wallet(TokenSlot),
    Exchange(TokenSlot),
}

impl BalanceField {
    /// Metric label for the field
    pub fn label(self) -> &'static str {
        match self {
            BalanceField::Wallet(TokenSlot::First) => "wallet_1",
            BalanceField::Wallet(TokenSlot::Second) => "wallet_2",
            BalanceField::Exchange(TokenSlot::First) => "exchange_1",
            BalanceField::Exchange(TokenSlot::Second) => "exchange_2",
        }
    }

    fn event(self, balance: Quantity) -> StateEvent {
        match self {
            BalanceField::Wallet(slot) => StateEvent::wallet_balance(slot, balance),
            BalanceField::Exchange(slot) => StateEvent::exchange_balance(slot, balance),
        }
    }
}

/// Last known balances; `None` until a figure has been loaded once
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalanceSnapshot {
    pub native: Option<Quantity>,
    pub wallet: [Option<Quantity>; 2],
    pub exchange: [Option<Quantity>; 2],
}

impl BalanceSnapshot {
    /// Fold a balance event into the snapshot. Other events are ignored.
    pub fn apply(&mut self, event: &StateEvent) {
        match event {
            StateEvent::BalanceLoaded { balance } => self.native = Some(*balance),
            StateEvent::Token1BalanceLoaded { balance } => self.wallet[0] = Some(*balance),
            StateEvent::Token2BalanceLoaded { balance } => self.wallet[1] = Some(*balance),
            StateEvent::ExchangeUser1BalanceLoaded { balance } => self.exchange[0] = Some(*balance),
            StateEvent::ExchangeUser2BalanceLoaded { balance } => self.exchange[1] = Some(*balance),
            _ => {}
        }
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a StateEvent>) {
        for event in events {
            self.apply(event);
        }
    }
}

/// Query the four balances and emit one event per figure that loaded.
///
/// Starts from `previous`; figures whose query fails keep their old value.
pub async fn reconcile(
    tokens: &[TokenHandle; 2],
    exchange: &ExchangeHandle,
    account: Account,
    previous: &BalanceSnapshot,
) -> Emitted<BalanceSnapshot> {
    let (wallet_1, wallet_2, exchange_1, exchange_2) = join4(
        tokens[0].balance_of(account),
        tokens[1].balance_of(account),
        exchange.balance_of(tokens[0].address(), account),
        exchange.balance_of(tokens[1].address(), account),
    )
    .await;

    let results = [
        (BalanceField::Wallet(TokenSlot::First), wallet_1),
        (BalanceField::Wallet(TokenSlot::Second), wallet_2),
        (BalanceField::Exchange(TokenSlot::First), exchange_1),
        (BalanceField::Exchange(TokenSlot::Second), exchange_2),
    ];

    let mut emitted = Emitted::new(previous.clone());
    for (field, result) in results {
        if let Some(event) = settle_field(field, result) {
            emitted.value.apply(&event);
            emitted.push(event);
        }
    }

    debug!(
        "Reconciled {} of 4 balances for {:?}",
        emitted.events.len(),
        account
    );
    emitted
}

fn settle_field(field: BalanceField, result: ClientResult<U256>) -> Option<StateEvent> {
    match result {
        Ok(raw) => Some(field.event(Quantity::from_raw(raw))),
        Err(e) => {
            warn!("Balance query {} failed: {}", field.label(), e);
            crate::metrics::record_query_failure(field.label());
            None
        }
    }
}
