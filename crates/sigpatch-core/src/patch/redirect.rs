use std::ops::Range;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::StackFrame;
use crate::policy::AddressSpacePolicy;
use crate::template::rel32;

/// Length of a near jump with a rel32 operand.
pub const JUMP_LENGTH: usize = 5;

/// The control-flow edge rewritten to reach installed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Redirect {
    /// Replace a saved return address on the captured stack.
    StackSlot { frame: StackFrame, word_index: usize },
    /// Overwrite the instruction at `at` with `opcode rel32`.
    InPlaceJump { at: u64, opcode: u8 },
}

impl Redirect {
    /// Bytes overwritten by this redirect.
    pub fn site(&self) -> Result<Range<u64>> {
        let (start, len) = match *self {
            Redirect::StackSlot { frame, word_index } => (frame.slot_address(word_index)?, 8),
            Redirect::InPlaceJump { at, .. } => (at, JUMP_LENGTH),
        };
        let end = start.checked_add(len as u64).ok_or(Error::Overflow {
            base: start,
            delta: len as i64,
        })?;
        Ok(start..end)
    }

    /// Address and bytes that send execution to `entry`.
    pub(crate) fn prepare(&self, policy: &AddressSpacePolicy, entry: u64) -> Result<(u64, Vec<u8>)> {
        match *self {
            Redirect::StackSlot { frame, word_index } => {
                let slot = frame.slot_address(word_index)?;
                debug!("  Redirect stack[0x{:X}] at 0x{:X} -> 0x{:X}", word_index, slot, entry);
                Ok((slot, entry.to_le_bytes().to_vec()))
            }
            Redirect::InPlaceJump { at, opcode } => {
                policy.validate(at)?;
                let next_ip = policy.offset(at, JUMP_LENGTH)?;
                let disp = rel32(next_ip, entry)?;
                debug!("  Redirect 0x{:X} -> 0x{:X}", at, entry);

                let mut bytes = Vec::with_capacity(JUMP_LENGTH);
                bytes.push(opcode);
                bytes.extend_from_slice(&disp.to_le_bytes());
                Ok((at, bytes))
            }
        }
    }
}
