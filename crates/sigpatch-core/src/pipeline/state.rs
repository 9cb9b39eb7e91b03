use serde::Serialize;
use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::error::ErrorKind;
use crate::offset::ResolvedAddresses;
use crate::patch::InstalledPatch;
use crate::scan::{Anchor, CallSequenceMatch, CallSite};

/// Pipeline steps in execution order. Each step's bit is set once it completes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display, IntoStaticStr, EnumIter,
)]
pub enum Step {
    AnchorFound,
    AddressesResolved,
    Patch1Installed,
    CallerAnchorFound,
    PrologueResolved,
    Patch2Installed,
}

impl Step {
    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of completed steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StepMask(u8);

impl StepMask {
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, step: Step) {
        self.0 |= step.bit();
    }

    pub fn contains(self, step: Step) -> bool {
        self.0 & step.bit() != 0
    }

    /// Last step reached, if any.
    pub fn furthest(self) -> Option<Step> {
        Step::iter().rev().find(|&step| self.contains(step))
    }

    pub fn is_complete(self) -> bool {
        Step::iter().all(|step| self.contains(step))
    }
}

/// Everything a single run discovered, owned by that run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineState {
    pub completed: StepMask,
    pub last_error: Option<ErrorKind>,
    pub failed_step: Option<Step>,
    pub anchor: Option<Anchor>,
    /// Offset-table functions plus the addresses discovered along the way.
    pub resolved: ResolvedAddresses,
    pub caller: Option<CallSequenceMatch>,
    #[serde(serialize_with = "crate::hex::option_address::serialize")]
    pub prologue_target: Option<u64>,
    pub call_site: Option<CallSite>,
    pub patches: Vec<InstalledPatch>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn succeeded(&self) -> bool {
        self.last_error.is_none() && self.completed.is_complete()
    }

    pub(crate) fn complete(&mut self, step: Step) {
        self.completed.insert(step);
    }

    pub(crate) fn fail(&mut self, step: Step, kind: ErrorKind) {
        self.failed_step = Some(step);
        self.last_error = Some(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_bits() {
        assert_eq!(Step::AnchorFound.bit(), 0x01);
        assert_eq!(Step::Patch2Installed.bit(), 0x20);
        assert_eq!(Step::PrologueResolved.to_string(), "PrologueResolved");
    }

    #[test]
    fn test_mask_furthest() {
        let mut mask = StepMask::default();
        assert_eq!(mask.furthest(), None);

        mask.insert(Step::AnchorFound);
        mask.insert(Step::AddressesResolved);
        assert!(mask.contains(Step::AddressesResolved));
        assert!(!mask.contains(Step::Patch1Installed));
        assert_eq!(mask.furthest(), Some(Step::AddressesResolved));
        assert_eq!(mask.bits(), 0x03);
        assert!(!mask.is_complete());

        for step in Step::iter() {
            mask.insert(step);
        }
        assert!(mask.is_complete());
        assert_eq!(mask.bits(), 0x3F);
    }

    #[test]
    fn test_reset() {
        let mut state = PipelineState::new();
        state.complete(Step::AnchorFound);
        state.fail(Step::AddressesResolved, ErrorKind::OutOfRange);
        assert!(!state.succeeded());

        state.reset();
        assert_eq!(state.completed, StepMask::default());
        assert_eq!(state.last_error, None);
        assert_eq!(state.failed_step, None);
    }
}
