//! Transfer request state machine and in-flight tracking

use crate::account::Account;
use crate::error::{ClientError, ClientResult};
use crate::events::{TransferEvent, TransferKind};
use crate::units::Quantity;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Direction of a transfer between wallet and exchange custody
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Deposit,
    Withdraw,
}

impl TransferDirection {
    /// Exchange event that confirms a transfer in this direction
    pub fn event_kind(self) -> TransferKind {
        match self {
            TransferDirection::Deposit => TransferKind::Deposit,
            TransferDirection::Withdraw => TransferKind::Withdraw,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferDirection::Deposit => "deposit",
            TransferDirection::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferStatus {
    Requested,
    PendingApproval,
    PendingSettlement,
    Confirmed,
    Failed,
}

impl TransferStatus {
    /// Position along requested -> approval -> settlement -> terminal
    fn rank(self) -> u8 {
        match self {
            TransferStatus::Requested => 0,
            TransferStatus::PendingApproval => 1,
            TransferStatus::PendingSettlement => 2,
            TransferStatus::Confirmed | TransferStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Confirmed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A user-initiated deposit or withdraw
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferRequest {
    pub id: Uuid,
    /// Account that initiated the transfer
    pub account: Account,
    pub direction: TransferDirection,
    pub token: Address,
    pub amount: Quantity,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    /// Reason for `Failed`
    pub failure: Option<String>,
}

impl TransferRequest {
    pub fn new(account: Account, direction: TransferDirection, token: Address, amount: Quantity) -> Self {
        Self {
            id: Uuid::new_v4(),
            account,
            direction,
            token,
            amount,
            status: TransferStatus::Requested,
            created_at: Utc::now(),
            failure: None,
        }
    }

    /// Move forward to `next`. Status never moves backward, terminal states
    /// are final, and withdrawals never enter `PendingApproval`.
    pub fn advance(&mut self, next: TransferStatus) -> ClientResult<()> {
        let allowed = match next {
            TransferStatus::PendingApproval => {
                self.direction == TransferDirection::Deposit && self.status == TransferStatus::Requested
            }
            TransferStatus::Confirmed => self.status == TransferStatus::PendingSettlement,
            _ => !self.status.is_terminal() && next.rank() > self.status.rank(),
        };

        if !allowed {
            return Err(ClientError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        Ok(())
    }

    /// Mark failed, keeping the reason
    pub fn fail(&mut self, reason: String) -> ClientResult<()> {
        self.advance(TransferStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Whether an observed exchange event settles this transfer
    pub fn matches(&self, event: &TransferEvent) -> bool {
        self.status == TransferStatus::PendingSettlement
            && event.kind == self.direction.event_kind()
            && event.token == self.token
            && event.user == self.account
            && event.amount == self.amount
    }
}

/// Transfers the session currently tracks, keyed by id
#[derive(Debug, Default)]
pub struct TransferBook {
    transfers: HashMap<Uuid, TransferRequest>,
    /// Discarded terminal transfers whose task has not reported yet; late
    /// updates for them are ignored
    retired: HashSet<Uuid>,
    /// Tracked transfers whose task has already reported its outcome
    finished: HashSet<Uuid>,
}

impl TransferBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&TransferRequest> {
        self.transfers.get(id)
    }

    /// Record a newer view of a transfer. Updates that would move an
    /// already-tracked transfer backward are ignored; returns whether the
    /// update was taken.
    pub fn track(&mut self, update: TransferRequest) -> bool {
        if self.retired.contains(&update.id) {
            return false;
        }
        match self.transfers.get(&update.id) {
            Some(existing)
                if existing.status.is_terminal()
                    || existing.status.rank() > update.status.rank() =>
            {
                false
            }
            _ => {
                self.transfers.insert(update.id, update);
                true
            }
        }
    }

    /// Record the final report of a transfer task. Nothing follows it, so a
    /// transfer retired before its report arrives is forgotten here.
    pub fn finish(&mut self, update: TransferRequest) -> bool {
        if self.retired.remove(&update.id) {
            return false;
        }
        self.finished.insert(update.id);
        self.track(update)
    }

    /// Confirm the oldest pending transfer matched by `event`
    pub fn confirm(&mut self, event: &TransferEvent) -> Option<Uuid> {
        let id = self
            .transfers
            .values()
            .filter(|t| t.matches(event))
            .min_by_key(|t| t.created_at)
            .map(|t| t.id)?;

        let transfer = self.transfers.get_mut(&id)?;
        transfer.advance(TransferStatus::Confirmed).ok()?;
        Some(id)
    }

    /// Remove and return every terminal transfer
    pub fn drain_terminal(&mut self) -> Vec<TransferRequest> {
        let done: Vec<Uuid> = self
            .transfers
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id)
            .collect();

        for id in &done {
            if !self.finished.remove(id) {
                self.retired.insert(*id);
            }
        }
        done.iter()
            .filter_map(|id| self.transfers.remove(id))
            .collect()
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
        self.retired.clear();
        self.finished.clear();
    }
}
