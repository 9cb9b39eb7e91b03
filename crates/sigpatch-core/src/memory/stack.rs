use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::MemoryView;

/// Hard upper bound on the number of stack words a run may capture (2KB).
pub const MAX_STACK_DEPTH: usize = 0x100;

const WORD: usize = 8;

/// Location and extent of the captured stack window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub pointer: u64,
    pub depth: usize,
}

impl StackFrame {
    /// Address of word `index`, or an error if it lies outside the frame.
    pub fn slot_address(&self, index: usize) -> Result<u64> {
        if index >= self.depth {
            return Err(Error::StackIndexOutOfRange {
                index,
                depth: self.depth,
            });
        }
        let overflow = || Error::Overflow {
            base: self.pointer,
            delta: index as i64,
        };
        let offset = index.checked_mul(WORD).ok_or_else(overflow)?;
        self.pointer.checked_add(offset as u64).ok_or_else(overflow)
    }
}

/// Stack words read once at the start of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSnapshot {
    frame: StackFrame,
    words: Vec<u64>,
}

impl StackSnapshot {
    pub fn capture<M: MemoryView + ?Sized>(
        memory: &M,
        stack_pointer: u64,
        depth: usize,
    ) -> Result<Self> {
        if depth == 0 || depth > MAX_STACK_DEPTH {
            return Err(Error::config(format!(
                "Stack depth 0x{:X} must be within 1..=0x{:X}",
                depth, MAX_STACK_DEPTH
            )));
        }

        let bytes = memory.read_bytes(stack_pointer, depth * WORD)?;
        let words = bytes
            .chunks_exact(WORD)
            .map(|chunk| {
                let mut raw = [0u8; WORD];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect();

        debug!("Captured {} stack words at 0x{:X}", depth, stack_pointer);

        Ok(Self {
            frame: StackFrame {
                pointer: stack_pointer,
                depth,
            },
            words,
        })
    }

    pub fn from_words(stack_pointer: u64, words: Vec<u64>) -> Self {
        Self {
            frame: StackFrame {
                pointer: stack_pointer,
                depth: words.len(),
            },
            words,
        }
    }

    pub fn frame(&self) -> StackFrame {
        self.frame
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }
}
