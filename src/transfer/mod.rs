//! Transfer orchestration
//!
//! A transfer moves tokens between the wallet and exchange custody:
//! - Deposit: approve the exchange on the token, await settlement, then deposit
//! - Withdraw: a single withdraw on the exchange
//!
//! Settlement of the last step only unblocks the flow. A transfer is
//! confirmed when the exchange's matching `Deposit`/`Withdraw` event is seen.

mod orchestrator;
mod request;

pub use orchestrator::TransferOrchestrator;
pub use request::{TransferBook, TransferDirection, TransferRequest, TransferStatus};
