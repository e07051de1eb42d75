//! Interface descriptions of the token and exchange contracts

use crate::events::TransferKind;

use ethers::abi::{parse_abi, Abi, Event, Function};
use lazy_static::lazy_static;

lazy_static! {
    /// ERC-20 subset used by the client
    pub static ref TOKEN_ABI: Abi = parse_abi(&[
        "function symbol() external view returns (string)",
        "function balanceOf(address owner) external view returns (uint256)",
        "function allowance(address owner, address spender) external view returns (uint256)",
        "function approve(address spender, uint256 value) external returns (bool)",
    ])
    .unwrap();

    /// Exchange custody functions and balance-changing events
    pub static ref EXCHANGE_ABI: Abi = parse_abi(&[
        "function balanceOf(address token, address user) external view returns (uint256)",
        "function deposit(address token, uint256 amount) external",
        "function withdraw(address token, uint256 amount) external",
        "event Deposit(address token, address user, uint256 amount, uint256 balance)",
        "event Withdraw(address token, address user, uint256 amount, uint256 balance)",
    ])
    .unwrap();
}

/// Look up a function by name
pub fn function<'a>(abi: &'a Abi, name: &str) -> Result<&'a Function, ethers::abi::Error> {
    abi.function(name)
}

/// Exchange event description for a transfer kind
pub fn exchange_event(kind: TransferKind) -> Result<&'static Event, ethers::abi::Error> {
    EXCHANGE_ABI.event(kind.event_name())
}

/// Find the function a calldata selector refers to
pub fn function_by_selector<'a>(abi: &'a Abi, data: &[u8]) -> Option<&'a Function> {
    if data.len() < 4 {
        return None;
    }
    abi.functions().find(|f| f.short_signature() == data[..4])
}
