//! Identity and native balance loading

use crate::agent::AgentError;
use crate::chain::Connection;
use crate::error::{ClientError, ClientResult};
use crate::events::{Emitted, StateEvent};
use crate::units::Quantity;

use ethers::types::Address;
use tracing::{info, warn};

/// Active account of the external signing agent
pub type Account = Address;

/// Request account access, then read the native balance.
///
/// Emits `ACCOUNT_LOADED` followed by `BALANCE_LOADED`, which is omitted when
/// the balance read fails. A rejected or empty account request is
/// `UserDeclined` and can be retried.
pub async fn resolve_account(connection: &Connection) -> ClientResult<Emitted<Account>> {
    let accounts = connection.request_accounts().await.map_err(|e| match e {
        AgentError::UserRejected => ClientError::UserDeclined,
        AgentError::Unavailable(message) => ClientError::AgentUnavailable(message),
        other => ClientError::QueryFailed {
            address: connection.session().to_string(),
            function: "eth_requestAccounts".to_string(),
            message: other.to_string(),
        },
    })?;

    let account = match accounts.first() {
        Some(account) => *account,
        None => {
            warn!("Agent returned no accounts");
            return Err(ClientError::UserDeclined);
        }
    };

    let mut emitted = Emitted::new(account).with(StateEvent::AccountLoaded { account });

    // A failed read leaves the native balance unknown; the account still loads
    match connection.get_balance(account).await {
        Ok(raw) => {
            let balance = Quantity::from_raw(raw);
            info!("Loaded account {:?} with balance {}", account, balance);
            emitted = emitted.with(StateEvent::BalanceLoaded { balance });
        }
        Err(e) => {
            warn!("Native balance query for {:?} failed: {}", account, e);
            crate::metrics::record_query_failure("native");
        }
    }

    Ok(emitted)
}
