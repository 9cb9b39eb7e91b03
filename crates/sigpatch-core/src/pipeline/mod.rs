//! The six-step injection run.
//!
//! Steps execute strictly in order; the first failure ends the run and is recorded in
//! [`PipelineState`]. Patches already installed stay installed. Every precondition of
//! an install is checked before it writes, so a failure never leaves a half-written
//! patch behind. A later install may not touch bytes an earlier one wrote.

mod diagnostics;
mod state;

use std::ops::Range;

use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memory::{MemoryView, StackSnapshot};
use crate::offset::FunctionAddressResolver;
use crate::patch::{InstallRequest, PatchInstaller, Redirect, place_before};
use crate::profile::Profile;
use crate::scan::{AnchorQuery, AnchorScanner, decode_call_site, extract_call_target};
use crate::template::SiblingAddresses;

pub use diagnostics::{DiagnosticEvent, DiagnosticSink, Outcome, TracingSink};
pub use state::{PipelineState, Step, StepMask};

/// Names under which discovered addresses are published to template fixups.
pub mod symbols {
    pub const ANCHOR: &str = "anchor";
    pub const CALLER: &str = "caller";
    pub const CALLER_TARGET: &str = "caller_target";
    pub const PROLOGUE_TARGET: &str = "prologue_target";
    pub const CALL_SITE: &str = "call_site";
    pub const CALL_SITE_TARGET: &str = "call_site_target";

    pub const ALL: &[&str] = &[
        ANCHOR,
        CALLER,
        CALLER_TARGET,
        PROLOGUE_TARGET,
        CALL_SITE,
        CALL_SITE_TARGET,
    ];
}

pub struct InjectionPipeline<'p> {
    profile: &'p Profile,
}

impl<'p> InjectionPipeline<'p> {
    pub fn new(profile: &'p Profile) -> Result<Self> {
        profile.validate()?;
        Ok(Self { profile })
    }

    pub fn profile(&self) -> &Profile {
        self.profile
    }

    /// Run every step against `memory`, starting from the stack at `stack_pointer`.
    pub fn run<M, S>(&self, memory: &mut M, stack_pointer: u64, sink: &mut S) -> PipelineState
    where
        M: MemoryView + ?Sized,
        S: DiagnosticSink + ?Sized,
    {
        info!("Starting injection run with profile '{}'", self.profile.name);

        let mut run = Run {
            profile: self.profile,
            memory,
            stack_pointer,
            snapshot: None,
            siblings: SiblingAddresses::new(),
            reserved: Vec::new(),
            state: PipelineState::new(),
        };

        for step in Step::iter() {
            match run.execute(step) {
                Ok(addresses) => {
                    run.state.complete(step);
                    sink.emit(DiagnosticEvent {
                        step,
                        outcome: Outcome::Success,
                        addresses,
                    });
                }
                Err(e) => {
                    warn!("{} failed: {}", step, e);
                    run.state.fail(step, e.kind());
                    sink.emit(DiagnosticEvent {
                        step,
                        outcome: Outcome::Failure(e.kind()),
                        addresses: Vec::new(),
                    });
                    break;
                }
            }
        }

        if run.state.succeeded() {
            info!("Injection run completed");
        }
        run.state
    }
}

/// A validated profile waiting for its trigger. Firing consumes it, so a session
/// runs at most once.
pub struct Session {
    profile: Profile,
}

impl Session {
    pub fn new(profile: Profile) -> Result<Self> {
        profile.validate()?;
        Ok(Self { profile })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn fire<M, S>(self, memory: &mut M, stack_pointer: u64, sink: &mut S) -> PipelineState
    where
        M: MemoryView + ?Sized,
        S: DiagnosticSink + ?Sized,
    {
        let pipeline = InjectionPipeline {
            profile: &self.profile,
        };
        pipeline.run(memory, stack_pointer, sink)
    }
}

struct Run<'a, M: ?Sized> {
    profile: &'a Profile,
    memory: &'a mut M,
    stack_pointer: u64,
    snapshot: Option<StackSnapshot>,
    siblings: SiblingAddresses,
    /// Everything written so far: installed templates and redirect sites.
    reserved: Vec<Range<u64>>,
    state: PipelineState,
}

type Discovered = Vec<(String, u64)>;

fn missing(what: &str) -> Error {
    Error::NotFound(format!("{} from an earlier step", what))
}

impl<M: MemoryView + ?Sized> Run<'_, M> {
    fn execute(&mut self, step: Step) -> Result<Discovered> {
        match step {
            Step::AnchorFound => self.find_anchor(),
            Step::AddressesResolved => self.resolve_addresses(),
            Step::Patch1Installed => self.install_patch1(),
            Step::CallerAnchorFound => self.find_caller(),
            Step::PrologueResolved => self.resolve_prologue(),
            Step::Patch2Installed => self.install_patch2(),
        }
    }

    fn find_anchor(&mut self) -> Result<Discovered> {
        let profile = self.profile;
        debug!("Phase 1: Searching anchor on the stack...");

        let snapshot =
            StackSnapshot::capture(&*self.memory, self.stack_pointer, profile.stack_depth)?;
        let scanner = AnchorScanner::new(&profile.policy, profile.code_filter);
        let anchor = scanner.find(
            &*self.memory,
            snapshot.words(),
            AnchorQuery {
                window: profile.anchor.window_start..profile.anchor.window_end,
                pattern: &profile.anchor.pattern,
                aux: profile.anchor.aux.as_ref(),
            },
        )?;

        self.snapshot = Some(snapshot);
        self.state.anchor = Some(anchor);
        Ok(vec![(symbols::ANCHOR.to_string(), anchor.address)])
    }

    fn resolve_addresses(&mut self) -> Result<Discovered> {
        let profile = self.profile;
        let anchor = self.state.anchor.ok_or_else(|| missing("anchor"))?;
        debug!("Phase 2: Resolving functions from the anchor's base call...");

        let base = profile
            .anchor
            .base_call
            .resolve(&*self.memory, &profile.policy, anchor.address)?;
        debug!("  {}: 0x{:X}", profile.offsets.base, base);

        let mut resolved = FunctionAddressResolver::new(&profile.policy).resolve(base, &profile.offsets)?;
        let discovered = resolved
            .iter()
            .map(|(name, address)| (name.to_string(), address))
            .collect();
        resolved.insert(&profile.policy, symbols::ANCHOR, anchor.address)?;

        self.state.resolved = resolved;
        Ok(discovered)
    }

    fn install_patch1(&mut self) -> Result<Discovered> {
        let profile = self.profile;
        let anchor = self.state.anchor.ok_or_else(|| missing("anchor"))?;
        let word_index = anchor
            .source_index
            .ok_or_else(|| missing("anchor stack slot"))?;
        let frame = self
            .snapshot
            .as_ref()
            .ok_or_else(|| missing("stack snapshot"))?
            .frame();
        debug!("Phase 3: Installing patch before the anchor...");

        let templates = profile.patch_templates(&profile.patch1)?;
        let request = InstallRequest {
            placements: place_before(&profile.policy, anchor.address, &templates)?,
            boundary: anchor.address,
            redirect: Redirect::StackSlot { frame, word_index },
            reserved: self.reserved.clone(),
        };
        self.install(&request)
    }

    fn find_caller(&mut self) -> Result<Discovered> {
        let profile = self.profile;
        let anchor = self.state.anchor.ok_or_else(|| missing("anchor"))?;
        let index = anchor
            .source_index
            .ok_or_else(|| missing("anchor stack slot"))?;
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or_else(|| missing("stack snapshot"))?;
        debug!("Phase 4: Searching caller above stack slot 0x{:X}...", index);

        // The snapshot predates the patch 1 redirect, and the window starts past
        // the rewritten slot anyway.
        let window = (index + 1)..profile.caller.window_end;
        if window.is_empty() {
            return Err(Error::NotFound(format!(
                "no stack slots between the anchor at 0x{:X} and the caller window end 0x{:X}",
                index, profile.caller.window_end
            )));
        }
        let scanner = AnchorScanner::new(&profile.policy, profile.code_filter);
        let found = scanner.find_call_sequence(
            &*self.memory,
            snapshot.words(),
            window,
            &profile.caller.sequence,
        )?;

        self.state
            .resolved
            .insert(&profile.policy, symbols::CALLER, found.caller.address)?;
        self.state
            .resolved
            .insert(&profile.policy, symbols::CALLER_TARGET, found.target)?;
        self.state.caller = Some(found);

        Ok(vec![
            (symbols::CALLER.to_string(), found.caller.address),
            (symbols::CALLER_TARGET.to_string(), found.target),
        ])
    }

    fn resolve_prologue(&mut self) -> Result<Discovered> {
        let profile = self.profile;
        let policy = &profile.policy;
        let caller = self.state.caller.ok_or_else(|| missing("caller"))?;
        debug!("Phase 5: Decoding prologue at 0x{:X}...", caller.target);

        let target = extract_call_target(&*self.memory, policy, caller.target, &profile.prologue)?;
        let site_address = policy.offset(target, profile.call_site.offset)?;
        let site = decode_call_site(&*self.memory, policy, site_address, profile.call_site.call)?;
        debug!("  Call site 0x{:X} -> 0x{:X}", site.address, site.target);

        let resolved = &mut self.state.resolved;
        resolved.insert(policy, symbols::PROLOGUE_TARGET, target)?;
        resolved.insert(policy, symbols::CALL_SITE, site.address)?;
        resolved.insert(policy, symbols::CALL_SITE_TARGET, site.target)?;
        self.state.prologue_target = Some(target);
        self.state.call_site = Some(site);

        Ok(vec![
            (symbols::PROLOGUE_TARGET.to_string(), target),
            (symbols::CALL_SITE.to_string(), site.address),
            (symbols::CALL_SITE_TARGET.to_string(), site.target),
        ])
    }

    fn install_patch2(&mut self) -> Result<Discovered> {
        let profile = self.profile;
        let caller = self.state.caller.ok_or_else(|| missing("caller"))?;
        let site = self.state.call_site.ok_or_else(|| missing("call site"))?;
        debug!("Phase 6: Installing patch before the caller...");

        let templates = profile.patch_templates(&profile.patch2)?;
        let boundary = caller.caller.address;
        let request = InstallRequest {
            placements: place_before(&profile.policy, boundary, &templates)?,
            boundary,
            redirect: Redirect::InPlaceJump {
                at: site.address,
                opcode: profile.jump_opcode,
            },
            reserved: self.reserved.clone(),
        };
        self.install(&request)
    }

    fn install(&mut self, request: &InstallRequest<'_>) -> Result<Discovered> {
        let profile = self.profile;
        let mut claimed = Vec::with_capacity(request.placements.len() + 1);
        for placement in &request.placements {
            let end = profile
                .policy
                .offset(placement.destination, placement.template.len())?;
            claimed.push(placement.destination..end);
        }
        claimed.push(request.redirect.site()?);

        let installed = PatchInstaller::new(&profile.policy).install(
            &mut *self.memory,
            request,
            &self.state.resolved,
            &self.siblings,
        )?;

        let mut discovered = Vec::with_capacity(installed.len());
        for patch in &installed {
            self.siblings
                .insert(patch.template.clone(), patch.destination);
            discovered.push((patch.template.to_string(), patch.destination));
        }
        self.reserved.extend(claimed);
        self.state.patches.extend(installed);
        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::SparseMemory;
    use crate::profile::fixture::{self, sample_memory, sample_profile};

    fn run(profile: &Profile, memory: &mut SparseMemory, sp: u64) -> (PipelineState, Vec<DiagnosticEvent>) {
        let mut events = Vec::new();
        let state = InjectionPipeline::new(profile)
            .unwrap()
            .run(memory, sp, &mut events);
        (state, events)
    }

    #[test]
    fn test_full_run() {
        let profile = sample_profile();
        let (mut memory, sp) = sample_memory();

        let (state, events) = run(&profile, &mut memory, sp);
        assert!(state.succeeded(), "{:?}", state.last_error);
        assert_eq!(state.completed.bits(), 0x3F);
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.outcome == Outcome::Success));

        assert_eq!(state.anchor.map(|a| a.source_index), Some(Some(fixture::ANCHOR_SLOT)));
        assert_eq!(state.resolved.get("log"), Some(fixture::LOG));
        assert_eq!(state.caller.map(|c| c.caller.source_index), Some(Some(fixture::CALLER_SLOT)));
        assert_eq!(state.prologue_target, Some(fixture::TARGET));
        assert_eq!(state.resolved.get(symbols::CALL_SITE_TARGET), Some(fixture::COMPLETE));
        assert_eq!(state.patches.len(), 3);
    }

    #[test]
    fn test_anchor_outside_window_stops_run() {
        let mut profile = sample_profile();
        profile.anchor.window_start = 0x31;
        let (mut memory, sp) = sample_memory();

        let (state, events) = run(&profile, &mut memory, sp);
        assert_eq!(state.failed_step, Some(Step::AnchorFound));
        assert_eq!(state.last_error, Some(ErrorKind::NotFound));
        assert_eq!(state.completed.furthest(), None);
        assert_eq!(events.len(), 1);
        assert_eq!(memory.write_count(), 0);
    }

    #[test]
    fn test_bad_offset_writes_nothing() {
        let mut profile = sample_profile();
        profile.offsets = profile.offsets.clone().with_offset("alloc", -0x1_0000_0000);
        let (mut memory, sp) = sample_memory();

        let (state, events) = run(&profile, &mut memory, sp);
        assert_eq!(state.failed_step, Some(Step::AddressesResolved));
        assert_eq!(state.last_error, Some(ErrorKind::OutOfRange));
        assert_eq!(state.completed.furthest(), Some(Step::AnchorFound));
        assert!(state.resolved.is_empty());
        assert_eq!(events.last().map(|e| e.outcome), Some(Outcome::Failure(ErrorKind::OutOfRange)));
        assert_eq!(memory.write_count(), 0);
    }

    #[test]
    fn test_prologue_mismatch_keeps_patch1() {
        let profile = sample_profile();
        let (mut memory, sp) = sample_memory();
        memory.write_bytes(fixture::ROUTINE + 5, &[0x53]).unwrap();
        let before = memory.write_count();

        let (state, _) = run(&profile, &mut memory, sp);
        assert_eq!(state.failed_step, Some(Step::PrologueResolved));
        assert_eq!(state.last_error, Some(ErrorKind::PrologueMismatch));
        assert_eq!(state.completed.furthest(), Some(Step::CallerAnchorFound));
        assert_eq!(state.patches.len(), 1);
        // Patch 1 bytes plus its stack slot redirect.
        assert_eq!(memory.write_count() - before, 2);
    }

    #[test]
    fn test_anchor_past_caller_window() {
        let mut profile = sample_profile();
        profile.caller.window_end = fixture::ANCHOR_SLOT + 1;
        let (mut memory, sp) = sample_memory();

        let (state, _) = run(&profile, &mut memory, sp);
        assert_eq!(state.failed_step, Some(Step::CallerAnchorFound));
        assert_eq!(state.last_error, Some(ErrorKind::NotFound));
        assert_eq!(state.patches.len(), 1);
    }

    #[test]
    fn test_patch2_may_not_overwrite_patch1() {
        let profile = sample_profile();
        let (mut memory, sp) = fixture::memory_with_caller(fixture::ANCHOR + 0x20);

        let (state, events) = run(&profile, &mut memory, sp);
        assert_eq!(state.failed_step, Some(Step::Patch2Installed));
        assert_eq!(state.last_error, Some(ErrorKind::Overlap));
        assert_eq!(events.last().map(|e| e.outcome), Some(Outcome::Failure(ErrorKind::Overlap)));
        assert_eq!(state.patches.len(), 1);

        // Only patch 1 and its stack slot were written; the hooked call is intact.
        assert_eq!(memory.write_count(), 2);
        let banner = fixture::ANCHOR - 20;
        assert_eq!(memory.read_bytes(banner, 6).unwrap(), b"\x016hi\n\0");
        assert_eq!(memory.read_u8(fixture::CALL_SITE).unwrap(), 0xE8);
    }

    #[test]
    fn test_session_fires_once() {
        let session = Session::new(sample_profile()).unwrap();
        let (mut memory, sp) = sample_memory();
        let mut sink = TracingSink;

        let state = session.fire(&mut memory, sp, &mut sink);
        assert!(state.succeeded());
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let mut profile = sample_profile();
        profile.patch1.clear();
        assert!(InjectionPipeline::new(&profile).is_err());
        assert!(Session::new(profile).is_err());
    }
}
