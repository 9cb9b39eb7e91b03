use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::memory::MemoryView;
use crate::pattern::MaskedPattern;
use crate::policy::AddressSpacePolicy;
use crate::scan::{Anchor, CodeAddressFilter};

/// Default distance bound between a candidate and the string it references (2GB).
pub const DEFAULT_MAX_REFERENCE_DISTANCE: u64 = 0x8000_0000;

/// How a 32-bit operand encodes an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperandEncoding {
    /// `imm32` sign-extended to 64 bits (e.g. `mov rdi, imm32`).
    SignExtended,
    /// `disp32` relative to the end of the instruction.
    RipRelative { instruction_end: usize },
}

/// Confirms a candidate by comparing the string one of its operands points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringReference {
    pub operand_offset: usize,
    pub encoding: OperandEncoding,
    #[serde(default, with = "crate::hex::offset")]
    pub addend: i64,
    pub expected: String,
    #[serde(default = "default_max_distance", with = "crate::hex::address")]
    pub max_distance: u64,
}

fn default_max_distance() -> u64 {
    DEFAULT_MAX_REFERENCE_DISTANCE
}

impl StringReference {
    fn target<M: MemoryView + ?Sized>(
        &self,
        memory: &M,
        policy: &AddressSpacePolicy,
        candidate: u64,
    ) -> Result<u64> {
        let operand = policy.offset(candidate, self.operand_offset)?;
        let raw = memory.read_i32(operand)?;
        let address = match self.encoding {
            OperandEncoding::SignExtended => raw as i64 as u64,
            OperandEncoding::RipRelative { instruction_end } => {
                let next_ip = policy.offset(candidate, instruction_end)?;
                policy.add_checked(next_ip, raw as i64)?
            }
        };
        policy.add_checked(address, self.addend)
    }

    pub fn verify<M: MemoryView + ?Sized>(
        &self,
        memory: &M,
        policy: &AddressSpacePolicy,
        candidate: u64,
    ) -> Result<bool> {
        let target = self.target(memory, policy, candidate)?;
        if !policy.is_valid(target) {
            trace!("  String reference 0x{:X} below minimum", target);
            return Ok(false);
        }
        if target.abs_diff(candidate) > self.max_distance {
            trace!(
                "  String reference 0x{:X} too far from candidate 0x{:X}",
                target, candidate
            );
            return Ok(false);
        }

        let found = memory.read_c_string(target, self.expected.len() + 1)?;
        Ok(found.as_deref() == Some(self.expected.as_bytes()))
    }
}

/// Second, independent confirmation applied after the byte pattern matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuxCheck {
    StringReference(StringReference),
}

impl AuxCheck {
    pub fn verify<M: MemoryView + ?Sized>(
        &self,
        memory: &M,
        policy: &AddressSpacePolicy,
        candidate: u64,
    ) -> Result<bool> {
        match self {
            AuxCheck::StringReference(check) => check.verify(memory, policy, candidate),
        }
    }
}

/// What to look for in a stack window.
#[derive(Debug, Clone)]
pub struct AnchorQuery<'a> {
    pub window: Range<usize>,
    pub pattern: &'a MaskedPattern,
    pub aux: Option<&'a AuxCheck>,
}

/// Walks stack words looking for code addresses whose bytes match a signature.
pub struct AnchorScanner<'a> {
    policy: &'a AddressSpacePolicy,
    filter: CodeAddressFilter,
}

impl<'a> AnchorScanner<'a> {
    pub fn new(policy: &'a AddressSpacePolicy, filter: CodeAddressFilter) -> Self {
        Self { policy, filter }
    }

    pub fn policy(&self) -> &AddressSpacePolicy {
        self.policy
    }

    /// Stack slots in `window` holding a value that passes the code filter and the policy.
    ///
    /// An empty or out-of-bounds window is a configuration error rather than an empty scan.
    pub fn code_candidates<'w>(
        &self,
        words: &'w [u64],
        window: Range<usize>,
    ) -> Result<impl Iterator<Item = (usize, u64)> + 'w> {
        if window.start >= window.end {
            return Err(Error::config(format!(
                "Scan window 0x{:X}..0x{:X} is empty",
                window.start, window.end
            )));
        }
        if window.end > words.len() {
            return Err(Error::config(format!(
                "Scan window 0x{:X}..0x{:X} exceeds captured stack depth 0x{:X}",
                window.start,
                window.end,
                words.len()
            )));
        }

        let filter = self.filter;
        let minimum = self.policy.minimum_valid_address;
        Ok(words[window.clone()]
            .iter()
            .enumerate()
            .map(move |(i, &word)| (window.start + i, word))
            .filter(move |&(_, word)| filter.accepts(word) && word >= minimum))
    }

    /// First slot in the window whose target matches the pattern and the optional
    /// auxiliary check.
    pub fn find<M: MemoryView + ?Sized>(
        &self,
        memory: &M,
        words: &[u64],
        query: AnchorQuery<'_>,
    ) -> Result<Anchor> {
        debug!(
            "Scanning stack slots 0x{:X}..0x{:X} for {}",
            query.window.start, query.window.end, query.pattern
        );

        for (index, candidate) in self.code_candidates(words, query.window.clone())? {
            trace!("  Checking stack[0x{:X}] = 0x{:X}", index, candidate);

            match query.pattern.matches_at(memory, candidate) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    trace!("  Skipping 0x{:X}: {}", candidate, e);
                    continue;
                }
            }

            if let Some(aux) = query.aux {
                match aux.verify(memory, self.policy, candidate) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("  0x{:X} matched pattern but failed auxiliary check", candidate);
                        continue;
                    }
                    Err(e) => {
                        debug!("  Auxiliary check at 0x{:X} failed: {}", candidate, e);
                        continue;
                    }
                }
            }

            debug!("  Anchor: 0x{:X} (stack index 0x{:X})", candidate, index);
            return Ok(Anchor::from_slot(candidate, index));
        }

        Err(Error::NotFound(format!(
            "no stack slot in 0x{:X}..0x{:X} matches {}",
            query.window.start, query.window.end, query.pattern
        )))
    }
}
