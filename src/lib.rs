//! Exchange client synchronization core
//!
//! Connects a chain-access agent to a token exchange contract pair and keeps
//! account, network, balances and pending transfers in step with the chain.
//! State changes are reported as typed events through a `DispatchSink`.

pub mod account;
pub mod agent;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod events;
pub mod metrics;
pub mod reconcile;
pub mod session;
pub mod transfer;
pub mod units;

pub use error::{ClientError, ClientResult};
pub use events::{DispatchSink, Emitted, StateEvent};
pub use session::{Session, SessionCommand};
