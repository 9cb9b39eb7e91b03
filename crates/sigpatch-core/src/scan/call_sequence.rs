use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::memory::MemoryView;
use crate::pattern::MaskedPattern;
use crate::policy::AddressSpacePolicy;
use crate::scan::{Anchor, AnchorScanner, CallEncoding, decode_call_site};

/// A run of consecutive relative calls closed by a terminator sequence
/// (e.g. a function that calls a long list of initializers and then fences).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSequenceConfig {
    #[serde(default)]
    pub call: CallEncoding,
    pub min_consecutive_calls: usize,
    pub terminator: MaskedPattern,
    pub max_scan_bytes: usize,
}

impl CallSequenceConfig {
    pub fn validate(&self) -> Result<()> {
        self.call.validate()?;
        if self.min_consecutive_calls == 0 {
            return Err(Error::config("Call sequence needs at least one call"));
        }
        let minimum_run = self
            .min_consecutive_calls
            .checked_mul(self.call.length)
            .and_then(|calls| calls.checked_add(self.terminator.len()));
        if minimum_run.is_none_or(|run| self.max_scan_bytes < run) {
            return Err(Error::config(format!(
                "Scan budget {} bytes cannot hold {} calls and the terminator",
                self.max_scan_bytes, self.min_consecutive_calls
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallSequenceMatch {
    /// Start of the call run (the outer anchor).
    pub caller: Anchor,
    /// Address of the last call before the terminator.
    #[serde(with = "crate::hex::address")]
    pub last_call: u64,
    /// Absolute target of that call.
    #[serde(with = "crate::hex::address")]
    pub target: u64,
}

/// Verify a call run at `start` and decode the last call before the terminator.
///
/// Fails with `PatternMismatch` when fewer than `min_consecutive_calls` calls begin
/// at `start`, and with `NotFound` when the terminator is not reached within
/// `max_scan_bytes`.
pub fn find_last_call_before_terminator<M: MemoryView + ?Sized>(
    memory: &M,
    policy: &AddressSpacePolicy,
    start: u64,
    config: &CallSequenceConfig,
) -> Result<CallSequenceMatch> {
    config.validate()?;
    policy.validate(start)?;

    let step = config.call.length;
    let opcode_at = |offset: usize| -> Result<u8> {
        memory.read_u8(policy.offset(start, offset)?)
    };

    let mut offset = 0;
    for n in 0..config.min_consecutive_calls {
        let opcode = opcode_at(offset)?;
        if opcode != config.call.opcode {
            trace!(
                "  Call run at 0x{:X} broken after {} calls (opcode 0x{:02X})",
                start, n, opcode
            );
            return Err(Error::PatternMismatch { address: start });
        }
        offset += step;
    }

    let within_budget = |end: Option<usize>| end.is_some_and(|end| end <= config.max_scan_bytes);
    while within_budget(offset.checked_add(step)) && opcode_at(offset)? == config.call.opcode {
        offset += step;
    }

    if !within_budget(offset.checked_add(config.terminator.len())) {
        return Err(Error::NotFound(format!(
            "call run at 0x{:X} exceeds the {} byte scan budget",
            start, config.max_scan_bytes
        )));
    }

    let terminator_at = policy.offset(start, offset)?;
    if !config.terminator.matches_at(memory, terminator_at)? {
        return Err(Error::NotFound(format!(
            "terminator {} not found after call run at 0x{:X} (stopped at 0x{:X})",
            config.terminator, start, terminator_at
        )));
    }

    let last_call = policy.offset(start, offset - step)?;
    let site = decode_call_site(memory, policy, last_call, config.call)?;
    debug!(
        "  Call run at 0x{:X}: {} calls, last call 0x{:X} -> 0x{:X}",
        start,
        offset / step,
        last_call,
        site.target
    );

    Ok(CallSequenceMatch {
        caller: Anchor {
            address: start,
            source_index: None,
        },
        last_call,
        target: site.target,
    })
}

impl AnchorScanner<'_> {
    /// Try each code-looking slot in `window` as the start of a call run.
    pub fn find_call_sequence<M: MemoryView + ?Sized>(
        &self,
        memory: &M,
        words: &[u64],
        window: Range<usize>,
        config: &CallSequenceConfig,
    ) -> Result<CallSequenceMatch> {
        config.validate()?;
        debug!(
            "Scanning stack slots 0x{:X}..0x{:X} for a run of {} calls",
            window.start, window.end, config.min_consecutive_calls
        );

        for (index, candidate) in self.code_candidates(words, window.clone())? {
            trace!("  Checking stack[0x{:X}] = 0x{:X} for call run", index, candidate);

            match find_last_call_before_terminator(memory, self.policy(), candidate, config) {
                Ok(found) => {
                    return Ok(CallSequenceMatch {
                        caller: Anchor::from_slot(candidate, index),
                        ..found
                    });
                }
                Err(e) => debug!("  stack[0x{:X}] rejected: {}", index, e),
            }
        }

        Err(Error::NotFound(format!(
            "no call run found from stack slots 0x{:X}..0x{:X}",
            window.start, window.end
        )))
    }
}
