//! Anchor discovery: stack scanning, call-run detection and prologue decoding.
//!
//! Every scanner is bounded by an explicit index window or byte budget and reports
//! [`Error::NotFound`] when that bound is exhausted.

mod anchor;
mod call_sequence;
mod prologue;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryView;
use crate::policy::AddressSpacePolicy;

pub use anchor::{AnchorQuery, AnchorScanner, AuxCheck, OperandEncoding, StringReference};
pub use call_sequence::{CallSequenceConfig, CallSequenceMatch, find_last_call_before_terminator};
pub use prologue::{PrologueConfig, extract_call_target};

/// Size of a rel32 displacement.
pub const REL32_SIZE: usize = 4;

/// An address found by a scanner, optionally tagged with the stack slot it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Anchor {
    #[serde(with = "crate::hex::address")]
    pub address: u64,
    pub source_index: Option<usize>,
}

impl Anchor {
    pub fn from_slot(address: u64, index: usize) -> Self {
        Self {
            address,
            source_index: Some(index),
        }
    }
}

/// Cheap pre-filter deciding whether a stack word looks like a code address.
///
/// A word passes when `word & mask == expected`. The default accepts the top 4GB of
/// the address space (high 32 bits all set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAddressFilter {
    #[serde(with = "crate::hex::address")]
    pub mask: u64,
    #[serde(with = "crate::hex::address")]
    pub expected: u64,
}

impl Default for CodeAddressFilter {
    fn default() -> Self {
        Self {
            mask: 0xFFFF_FFFF_0000_0000,
            expected: 0xFFFF_FFFF_0000_0000,
        }
    }
}

impl CodeAddressFilter {
    pub fn accepts(&self, word: u64) -> bool {
        word & self.mask == self.expected
    }
}

/// Location of a rel32 operand inside an instruction sequence starting at some anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeOperand {
    /// Offset of the displacement from the anchor.
    pub operand_offset: usize,
    /// Offset of the end of the instruction (the address the displacement is relative to).
    pub instruction_end: usize,
}

impl RelativeOperand {
    pub fn validate(&self) -> Result<()> {
        let operand_end = self.operand_offset.checked_add(REL32_SIZE);
        if operand_end.is_none_or(|end| self.instruction_end < end) {
            return Err(Error::config(format!(
                "Instruction end 0x{:X} precedes the end of the operand at 0x{:X}",
                self.instruction_end, self.operand_offset
            )));
        }
        Ok(())
    }

    /// Absolute target referenced by the operand of the code at `anchor`.
    pub fn resolve<M: MemoryView + ?Sized>(
        &self,
        memory: &M,
        policy: &AddressSpacePolicy,
        anchor: u64,
    ) -> Result<u64> {
        self.validate()?;
        let operand = policy.offset(anchor, self.operand_offset)?;
        let next_ip = policy.offset(anchor, self.instruction_end)?;
        let disp = memory.read_i32(operand)?;
        policy.resolve(next_ip, disp as i64)
    }
}

/// Shape of a relative call instruction (opcode byte, total length, rel32 last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEncoding {
    pub opcode: u8,
    pub length: usize,
}

impl Default for CallEncoding {
    fn default() -> Self {
        Self {
            opcode: 0xE8,
            length: 5,
        }
    }
}

impl CallEncoding {
    pub fn validate(&self) -> Result<()> {
        if self.length < REL32_SIZE + 1 {
            return Err(Error::config(format!(
                "Call length {} is too short for an opcode and a rel32",
                self.length
            )));
        }
        Ok(())
    }
}

/// A decoded relative call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallSite {
    #[serde(with = "crate::hex::address")]
    pub address: u64,
    #[serde(with = "crate::hex::address")]
    pub target: u64,
}

/// Verify the opcode at `address` and return the call's absolute target.
pub fn decode_call_site<M: MemoryView + ?Sized>(
    memory: &M,
    policy: &AddressSpacePolicy,
    address: u64,
    encoding: CallEncoding,
) -> Result<CallSite> {
    encoding.validate()?;
    policy.validate(address)?;

    let opcode = memory.read_u8(address)?;
    if opcode != encoding.opcode {
        return Err(Error::PatternMismatch { address });
    }

    let operand = RelativeOperand {
        operand_offset: encoding.length - REL32_SIZE,
        instruction_end: encoding.length,
    };
    let target = operand.resolve(memory, policy, address)?;
    Ok(CallSite { address, target })
}
