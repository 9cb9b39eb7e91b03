use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};
use crate::offset::ResolvedAddresses;
use crate::policy::AddressSpacePolicy;
use crate::scan::REL32_SIZE;
use crate::template::{CodeTemplate, SiblingAddresses, TemplateId};

/// How a resolved target is encoded into the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupKind {
    /// 8-byte little-endian absolute address.
    Absolute64,
    /// 4-byte sign-extended absolute address (`mov r64, imm32`, `push imm32`).
    AbsoluteSigned32,
    /// 4-byte displacement relative to `slot + instruction_length`.
    Relative32 { instruction_length: usize },
}

impl FixupKind {
    pub fn width(&self) -> usize {
        match self {
            FixupKind::Absolute64 => 8,
            FixupKind::AbsoluteSigned32 | FixupKind::Relative32 { .. } => REL32_SIZE,
        }
    }
}

/// What a slot points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupTarget {
    /// A resolved function or discovered address.
    Symbol(String),
    /// A byte offset inside the template itself.
    SelfOffset(usize),
    /// The install address of another template placed in the same pass.
    Template(TemplateId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixupSlot {
    pub offset: usize,
    pub kind: FixupKind,
    pub target: FixupTarget,
    #[serde(default, with = "crate::hex::offset")]
    pub addend: i64,
}

impl FixupSlot {
    pub fn new(offset: usize, kind: FixupKind, target: FixupTarget) -> Self {
        Self {
            offset,
            kind,
            target,
            addend: 0,
        }
    }

    pub fn with_addend(mut self, addend: i64) -> Self {
        self.addend = addend;
        self
    }

    /// One past the last byte the slot writes.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.kind.width())
    }

    pub(crate) fn validate(&self, template_len: usize) -> Result<()> {
        if self.end() > template_len {
            return Err(Error::config(format!(
                "Fixup slot at 0x{:X} ({} bytes) runs past the {} template bytes",
                self.offset,
                self.kind.width(),
                template_len
            )));
        }
        if let FixupKind::Relative32 { instruction_length } = self.kind
            && instruction_length < REL32_SIZE
        {
            return Err(Error::config(format!(
                "Relative slot at 0x{:X} has instruction length {} shorter than its operand",
                self.offset, instruction_length
            )));
        }
        if let FixupTarget::SelfOffset(target) = self.target
            && target > template_len
        {
            return Err(Error::config(format!(
                "Self reference 0x{:X} is outside the {} template bytes",
                target, template_len
            )));
        }
        Ok(())
    }
}

impl CodeTemplate {
    /// Produce the template bytes relocated to `install_address`.
    ///
    /// Every target is looked up before anything is encoded. Relative slots whose
    /// displacement does not fit in 32 signed bits fail with
    /// `DisplacementOutOfRange`; nothing is truncated.
    pub fn apply(
        &self,
        policy: &AddressSpacePolicy,
        install_address: u64,
        symbols: &ResolvedAddresses,
        siblings: &SiblingAddresses,
    ) -> Result<Vec<u8>> {
        self.relocate(policy, install_address, symbols, siblings)
            .map_err(|e| e.in_entry(self.id().as_str()))
    }

    fn relocate(
        &self,
        policy: &AddressSpacePolicy,
        install_address: u64,
        symbols: &ResolvedAddresses,
        siblings: &SiblingAddresses,
    ) -> Result<Vec<u8>> {
        policy.validate(install_address)?;
        policy.offset(install_address, self.len())?;

        let mut bytes = self.bytes().to_vec();
        for slot in self.slots() {
            let base = match &slot.target {
                FixupTarget::Symbol(name) => symbols
                    .get(name)
                    .ok_or_else(|| Error::UnknownTarget(name.clone()))?,
                FixupTarget::SelfOffset(offset) => policy.offset(install_address, *offset)?,
                FixupTarget::Template(id) => siblings
                    .get(id)
                    .copied()
                    .ok_or_else(|| Error::UnknownTarget(format!("template {}", id)))?,
            };
            let target = policy.add_checked(base, slot.addend)?;
            let site = policy.offset(install_address, slot.offset)?;

            let encoded = encode(slot.kind, site, target)?;
            trace!(
                "  Fixup {}+0x{:X} ({:?}) -> 0x{:X}",
                self.id(),
                slot.offset,
                slot.kind,
                target
            );
            bytes[slot.offset..slot.end()].copy_from_slice(&encoded);
        }

        Ok(bytes)
    }
}

fn encode(kind: FixupKind, site: u64, target: u64) -> Result<Vec<u8>> {
    match kind {
        FixupKind::Absolute64 => Ok(target.to_le_bytes().to_vec()),
        FixupKind::AbsoluteSigned32 => {
            let value = i32::try_from(target as i64).map_err(|_| Error::DisplacementOutOfRange {
                target,
                origin: 0,
            })?;
            Ok(value.to_le_bytes().to_vec())
        }
        FixupKind::Relative32 { instruction_length } => {
            let next_ip = site
                .checked_add(instruction_length as u64)
                .ok_or(Error::Overflow {
                    base: site,
                    delta: instruction_length as i64,
                })?;
            let value = rel32(next_ip, target)?;
            Ok(value.to_le_bytes().to_vec())
        }
    }
}

/// Signed 32-bit displacement from `next_ip` to `target`.
pub(crate) fn rel32(next_ip: u64, target: u64) -> Result<i32> {
    let displacement = target as i128 - next_ip as i128;
    i32::try_from(displacement).map_err(|_| Error::DisplacementOutOfRange {
        target,
        origin: next_ip,
    })
}
