use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::MemoryView;
use crate::pattern::MaskedPattern;
use crate::policy::AddressSpacePolicy;
use crate::scan::{REL32_SIZE, RelativeOperand};

/// Fixed function prologue that ends in (or contains) a relative call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrologueConfig {
    pub pattern: MaskedPattern,
    /// Offset of the call's rel32 from the function entry.
    pub displacement_offset: usize,
}

impl PrologueConfig {
    pub fn validate(&self) -> Result<()> {
        self.operand().map(|_| ())
    }

    fn operand(&self) -> Result<RelativeOperand> {
        let instruction_end = self
            .displacement_offset
            .checked_add(REL32_SIZE)
            .ok_or_else(|| {
                Error::config(format!(
                    "Prologue displacement offset 0x{:X} is out of range",
                    self.displacement_offset
                ))
            })?;
        Ok(RelativeOperand {
            operand_offset: self.displacement_offset,
            instruction_end,
        })
    }
}

/// Check the prologue at `candidate` and return the absolute target of its embedded call.
pub fn extract_call_target<M: MemoryView + ?Sized>(
    memory: &M,
    policy: &AddressSpacePolicy,
    candidate: u64,
    config: &PrologueConfig,
) -> Result<u64> {
    config.validate()?;
    policy.validate(candidate)?;

    if !config.pattern.matches_at(memory, candidate)? {
        debug!(
            "  Prologue at 0x{:X} does not match {}",
            candidate, config.pattern
        );
        return Err(Error::PrologueMismatch { address: candidate });
    }

    let target = config.operand()?.resolve(memory, policy, candidate)?;
    debug!("  Prologue call at 0x{:X} -> 0x{:X}", candidate, target);
    Ok(target)
}
