//! Relocatable code templates.
//!
//! A [`CodeTemplate`] is a byte sequence plus a list of [`FixupSlot`]s. Once the
//! install address and every referenced target are known, [`CodeTemplate::apply`]
//! produces the live bytes.

mod fixup;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pattern::{format_hex_bytes, parse_hex_bytes};

pub use fixup::{FixupKind, FixupSlot, FixupTarget};
pub(crate) use fixup::rel32;

/// Install addresses of the other templates placed in the same pass.
pub type SiblingAddresses = BTreeMap<TemplateId, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(String);

impl TemplateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TemplateId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Template bytes with their fixup slots.
///
/// Construction checks that the entry offset lies inside the bytes, that every slot
/// fits, and that no two slots overlap, so `apply` never indexes out of bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTemplate", into = "RawTemplate")]
pub struct CodeTemplate {
    id: TemplateId,
    bytes: Vec<u8>,
    entry: usize,
    slots: Vec<FixupSlot>,
}

#[derive(Serialize, Deserialize)]
struct RawTemplate {
    id: TemplateId,
    bytes: String,
    #[serde(default)]
    entry: usize,
    #[serde(default)]
    slots: Vec<FixupSlot>,
}

impl TryFrom<RawTemplate> for CodeTemplate {
    type Error = Error;

    fn try_from(raw: RawTemplate) -> Result<Self> {
        let bytes = parse_hex_bytes(&raw.bytes).map_err(|e| e.in_entry(raw.id.as_str()))?;
        Self::new(raw.id, bytes, raw.entry, raw.slots)
    }
}

impl From<CodeTemplate> for RawTemplate {
    fn from(template: CodeTemplate) -> Self {
        Self {
            bytes: format_hex_bytes(&template.bytes),
            id: template.id,
            entry: template.entry,
            slots: template.slots,
        }
    }
}

impl CodeTemplate {
    pub fn new(
        id: impl Into<TemplateId>,
        bytes: Vec<u8>,
        entry: usize,
        mut slots: Vec<FixupSlot>,
    ) -> Result<Self> {
        let id = id.into();
        Self::check(&bytes, entry, &mut slots).map_err(|e| e.in_entry(id.as_str()))?;
        Ok(Self {
            id,
            bytes,
            entry,
            slots,
        })
    }

    fn check(bytes: &[u8], entry: usize, slots: &mut [FixupSlot]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::config("Template has no bytes"));
        }
        if entry >= bytes.len() {
            return Err(Error::config(format!(
                "Entry offset 0x{:X} is outside the {} template bytes",
                entry,
                bytes.len()
            )));
        }

        for slot in slots.iter() {
            slot.validate(bytes.len())?;
        }

        slots.sort_by_key(|slot| slot.offset);
        for pair in slots.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            if first.end() > second.offset {
                return Err(Error::config(format!(
                    "Fixup slots at 0x{:X} and 0x{:X} overlap",
                    first.offset, second.offset
                )));
            }
        }
        Ok(())
    }

    pub fn id(&self) -> &TemplateId {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the first instruction; redirects land here.
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Slots ordered by offset.
    pub fn slots(&self) -> &[FixupSlot] {
        &self.slots
    }
}
