//! Fixed-point token quantities
//!
//! On-chain balances are integers with 18 implied fractional digits.
//! `Quantity` keeps the raw integer and renders it as a decimal string.

use crate::error::{ClientError, ClientResult};

use ethers::types::U256;
use ethers::utils::{format_units, parse_units, ParseUnits};
use serde::{Serialize, Serializer};
use std::fmt;

/// Fractional digits used by both tokens and the native currency
pub const TOKEN_DECIMALS: u32 = 18;

/// A token amount, stored as its raw on-chain integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(U256);

impl Quantity {
    pub fn from_raw(raw: U256) -> Self {
        Self(raw)
    }

    pub fn zero() -> Self {
        Self(U256::zero())
    }

    /// Raw integer as sent to contracts
    pub fn raw(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Parse a user-entered decimal amount ("1.5", "100")
    pub fn parse(input: &str) -> ClientResult<Self> {
        let trimmed = input.trim();
        let invalid = |message: &str| ClientError::InvalidAmount {
            input: input.to_string(),
            message: message.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("empty amount"));
        }
        if trimmed.starts_with('-') {
            return Err(invalid("negative amount"));
        }

        match parse_units(trimmed, TOKEN_DECIMALS).map_err(|e| invalid(&e.to_string()))? {
            ParseUnits::U256(raw) => Ok(Self(raw)),
            ParseUnits::I256(_) => Err(invalid("negative amount")),
        }
    }
}

impl From<U256> for Quantity {
    fn from(raw: U256) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = format_units(self.0, TOKEN_DECIMALS).map_err(|_| fmt::Error)?;
        f.write_str(&formatted)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
