use tracing::debug;

use crate::error::Result;
use crate::offset::{OffsetTable, ResolvedAddresses};
use crate::policy::AddressSpacePolicy;

/// Turns an offset table into absolute addresses once the base function is known.
#[derive(Debug, Clone, Copy)]
pub struct FunctionAddressResolver<'a> {
    policy: &'a AddressSpacePolicy,
}

impl<'a> FunctionAddressResolver<'a> {
    pub fn new(policy: &'a AddressSpacePolicy) -> Self {
        Self { policy }
    }

    /// Resolve every entry of `table` relative to `base_address`.
    ///
    /// All-or-nothing: the first entry that overflows or lands below the policy
    /// minimum aborts the whole resolution, and the error names that entry. The
    /// base itself is included in the result under `table.base`.
    pub fn resolve(&self, base_address: u64, table: &OffsetTable) -> Result<ResolvedAddresses> {
        table.validate()?;
        debug!(
            "Resolving {} functions from {} = 0x{:X}",
            table.len(),
            table.base,
            base_address
        );

        let mut resolved = ResolvedAddresses::default();
        resolved.insert(self.policy, table.base.as_str(), base_address)?;

        for (name, offset) in table.iter() {
            let address = self
                .policy
                .resolve(base_address, offset)
                .map_err(|e| e.in_entry(name))?;
            debug!("  {}: 0x{:X}", name, address);
            resolved.insert(self.policy, name, address)?;
        }

        Ok(resolved)
    }
}
