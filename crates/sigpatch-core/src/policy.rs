//! Address validity rules shared by every component.
//!
//! All address arithmetic in the engine goes through [`AddressSpacePolicy`], so the
//! "never below the minimum, never wraps" property is enforced in one place.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lowest address of the x86-64 kernel text mapping.
pub const DEFAULT_MINIMUM_VALID_ADDRESS: u64 = 0xFFFF_FFFF_8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpacePolicy {
    #[serde(with = "crate::hex::address")]
    pub minimum_valid_address: u64,
}

impl Default for AddressSpacePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MINIMUM_VALID_ADDRESS)
    }
}

impl AddressSpacePolicy {
    pub const fn new(minimum_valid_address: u64) -> Self {
        Self {
            minimum_valid_address,
        }
    }

    pub fn is_valid(&self, address: u64) -> bool {
        address >= self.minimum_valid_address
    }

    /// `base + delta`, failing instead of wrapping. Validity is not checked.
    pub fn add_checked(&self, base: u64, delta: i64) -> Result<u64> {
        base.checked_add_signed(delta)
            .ok_or(Error::Overflow { base, delta })
    }

    /// `base + len` for an unsigned byte count.
    pub fn offset(&self, base: u64, len: usize) -> Result<u64> {
        let delta = i64::try_from(len).map_err(|_| Error::Overflow {
            base,
            delta: i64::MAX,
        })?;
        self.add_checked(base, delta)
    }

    /// `base - len` for an unsigned byte count, used to place code before an anchor.
    pub fn offset_back(&self, base: u64, len: usize) -> Result<u64> {
        let delta = i64::try_from(len).map_err(|_| Error::Overflow {
            base,
            delta: i64::MIN,
        })?;
        self.add_checked(base, -delta)
    }

    pub fn validate(&self, address: u64) -> Result<u64> {
        if self.is_valid(address) {
            Ok(address)
        } else {
            Err(Error::OutOfRange {
                address,
                minimum: self.minimum_valid_address,
            })
        }
    }

    /// Checked add followed by validation of the result.
    pub fn resolve(&self, base: u64, delta: i64) -> Result<u64> {
        self.add_checked(base, delta)
            .and_then(|address| self.validate(address))
    }
}
