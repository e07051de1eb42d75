//! Deposit and withdraw execution

use super::request::{TransferDirection, TransferRequest, TransferStatus};
use crate::account::Account;
use crate::contracts::{ExchangeHandle, TokenHandle};
use crate::error::{ClientError, ClientResult};
use crate::events::{Emitted, StateEvent};
use crate::units::Quantity;

use tracing::{info, warn};

/// Runs transfers for one account against the bound exchange
#[derive(Debug, Clone)]
pub struct TransferOrchestrator {
    /// Exchange handle signing as `account`
    exchange: ExchangeHandle,
    account: Account,
}

impl TransferOrchestrator {
    pub fn new(exchange: &ExchangeHandle, account: Account) -> Self {
        Self {
            exchange: exchange.connect(account),
            account,
        }
    }

    pub fn account(&self) -> Account {
        self.account
    }

    /// Create a transfer in `Requested`. Emits `TRANSFER_REQUEST` before any
    /// chain interaction.
    pub fn request(
        &self,
        direction: TransferDirection,
        token: &TokenHandle,
        amount: Quantity,
    ) -> ClientResult<Emitted<TransferRequest>> {
        if amount.is_zero() {
            return Err(ClientError::InvalidAmount {
                input: amount.to_string(),
                message: "amount must be positive".to_string(),
            });
        }

        let request = TransferRequest::new(self.account, direction, token.address(), amount);
        info!(
            "Transfer {} requested: {} {} {}",
            request.id,
            direction,
            amount,
            token.symbol()
        );

        let event = StateEvent::TransferRequest {
            id: request.id,
            direction,
            token: request.token,
            amount,
        };
        Ok(Emitted::new(request).with(event))
    }

    /// Drive a requested transfer through its on-chain steps.
    ///
    /// `progress` sees every intermediate status. On success the transfer is
    /// left in `PendingSettlement`; only the exchange event confirms it. Any
    /// failing step ends in `Failed` and emits `TRANSFER_FAILED`, leaving
    /// earlier steps' effects in place.
    pub async fn execute(
        &self,
        token: &TokenHandle,
        mut request: TransferRequest,
        progress: impl Fn(&TransferRequest),
    ) -> Emitted<TransferRequest> {
        let result = match request.direction {
            TransferDirection::Deposit => self.deposit(token, &mut request, &progress).await,
            TransferDirection::Withdraw => self.withdraw(token, &mut request, &progress).await,
        };

        match result {
            Ok(()) => {
                info!(
                    "Transfer {} settled, awaiting {} event",
                    request.id,
                    request.direction.event_kind().event_name()
                );
                crate::metrics::record_transfer(request.direction, "settled");
                Emitted::new(request)
            }
            Err(e) => {
                warn!("Transfer {} failed: {}", request.id, e);
                crate::metrics::record_transfer(request.direction, "failed");
                let reason = e.to_string();
                if let Err(transition) = request.fail(reason.clone()) {
                    warn!("Transfer {} not marked failed: {}", request.id, transition);
                }
                let event = StateEvent::TransferFailed {
                    id: request.id,
                    reason,
                };
                Emitted::new(request).with(event)
            }
        }
    }

    async fn deposit(
        &self,
        token: &TokenHandle,
        request: &mut TransferRequest,
        progress: &impl Fn(&TransferRequest),
    ) -> ClientResult<()> {
        let amount = request.amount.raw();

        request.advance(TransferStatus::PendingApproval)?;
        progress(request);

        let approval = token
            .connect(self.account)
            .approve(self.exchange.address(), amount)
            .await?;
        token.connection().settle("approve", approval).await?;

        request.advance(TransferStatus::PendingSettlement)?;
        progress(request);

        let deposit = self.exchange.deposit(token.address(), amount).await?;
        self.exchange.connection().settle("deposit", deposit).await?;
        Ok(())
    }

    async fn withdraw(
        &self,
        token: &TokenHandle,
        request: &mut TransferRequest,
        progress: &impl Fn(&TransferRequest),
    ) -> ClientResult<()> {
        request.advance(TransferStatus::PendingSettlement)?;
        progress(request);

        let withdraw = self
            .exchange
            .withdraw(token.address(), request.amount.raw())
            .await?;
        self.exchange.connection().settle("withdraw", withdraw).await?;
        Ok(())
    }
}
