use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::policy::AddressSpacePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
struct Displacement(#[serde(with = "crate::hex::offset")] i64);

/// Signed displacements of dependent functions relative to one base function.
///
/// Offsets are `function_address - base_address`, typically taken from a symbol map
/// of the target build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetTable {
    /// Logical name of the base function the offsets are relative to.
    pub base: String,
    entries: BTreeMap<String, Displacement>,
}

impl OffsetTable {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn with_offset(mut self, name: impl Into<String>, offset: i64) -> Self {
        self.entries.insert(name.into(), Displacement(offset));
        self
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.entries.get(name).map(|d| d.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(name, d)| (name.as_str(), d.0))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.base.trim().is_empty() {
            return Err(Error::config("Offset table has no base name"));
        }
        if self.entries.contains_key(&self.base) {
            return Err(Error::config(format!(
                "Offset table lists its base '{}' as an entry",
                self.base
            )));
        }
        Ok(())
    }
}

/// Validated absolute addresses keyed by logical name.
///
/// Only built through [`FunctionAddressResolver`] or [`ResolvedAddresses::insert`],
/// both of which check every entry against the policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddresses {
    entries: BTreeMap<String, u64>,
}

impl ResolvedAddresses {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    /// Add a discovered address after validating it.
    pub fn insert(
        &mut self,
        policy: &AddressSpacePolicy,
        name: impl Into<String>,
        address: u64,
    ) -> Result<()> {
        let name = name.into();
        let address = policy
            .validate(address)
            .map_err(|e| e.in_entry(name.clone()))?;
        self.entries.insert(name, address);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(name, &addr)| (name.as_str(), addr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ResolvedAddresses {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, address) in &self.entries {
            map.serialize_entry(name, &format!("0x{:X}", address))?;
        }
        map.end()
    }
}
