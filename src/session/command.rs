//! User commands accepted by the steady-state loop

use crate::error::ClientError;
use crate::events::TokenSlot;
use crate::transfer::TransferDirection;

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Start a deposit or withdraw; the amount is parsed when the transfer
    /// is requested
    Transfer {
        direction: TransferDirection,
        slot: TokenSlot,
        amount: String,
    },
    /// Ask the agent for account access again after a decline
    RetryAccount,
    /// Take a fresh balance snapshot
    Refresh,
}

impl FromStr for SessionCommand {
    type Err = ClientError;

    /// Parse `deposit <1|2> <amount>`, `withdraw <1|2> <amount>`, `account`
    /// or `refresh`
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ClientError::InvalidCommand(format!("{:?}: {}", line.trim(), message));
        let words: Vec<&str> = line.split_whitespace().collect();

        match words.as_slice() {
            [verb, slot, amount] => {
                let direction = match verb.to_ascii_lowercase().as_str() {
                    "deposit" => TransferDirection::Deposit,
                    "withdraw" => TransferDirection::Withdraw,
                    _ => return Err(invalid("unknown command")),
                };
                let slot = slot
                    .parse::<u8>()
                    .ok()
                    .and_then(TokenSlot::from_number)
                    .ok_or_else(|| invalid("token must be 1 or 2"))?;

                Ok(SessionCommand::Transfer {
                    direction,
                    slot,
                    amount: amount.to_string(),
                })
            }
            [word] if word.eq_ignore_ascii_case("account") => Ok(SessionCommand::RetryAccount),
            [word] if word.eq_ignore_ascii_case("refresh") => Ok(SessionCommand::Refresh),
            [] => Err(invalid("empty command")),
            _ => Err(invalid("unknown command")),
        }
    }
}
