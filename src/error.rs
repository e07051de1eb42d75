//! Error types for the exchange client

use crate::agent::AgentError;

use thiserror::Error;

/// Main error type for the exchange client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Chain-access agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("User declined account access")]
    UserDeclined,

    #[error("Contract {address} unreachable: {message}")]
    ContractUnreachable { address: String, message: String },

    #[error("Query {function} on {address} failed: {message}")]
    QueryFailed {
        address: String,
        function: String,
        message: String,
    },

    #[error("Transaction {step} failed: {message}")]
    TransactionFailed { step: String, message: String },

    #[error("Invalid amount {input:?}: {message}")]
    InvalidAmount { input: String, message: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid command {0}")]
    InvalidCommand(String),

    #[error("Not ready: {0}")]
    NotReady(String),
}

impl ClientError {
    /// Setup failures that halt the pipeline
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::AgentUnavailable(_) | ClientError::ContractUnreachable { .. }
        )
    }

    /// Failures the user may recover from by re-invoking the operation
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Map an agent failure raised while submitting or settling a transaction
    pub fn transaction(step: &str, err: AgentError) -> Self {
        ClientError::TransactionFailed {
            step: step.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
