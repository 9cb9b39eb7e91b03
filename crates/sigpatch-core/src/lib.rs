//! # sigpatch-core
//!
//! Signature scanning and relocatable patch installation.
//!
//! This crate provides:
//! - Address validation and checked arithmetic (`AddressSpacePolicy`)
//! - Masked byte signatures and stack/call-run/prologue scanners
//! - Offset-table driven function resolution
//! - Code templates with fixup slots and an all-or-nothing patch installer
//! - The six-step injection pipeline with structured diagnostics
//! - Per-target profiles loaded from JSON or TOML
//!
//! All memory access goes through the [`MemoryView`] trait; [`SparseMemory`] is a
//! region-based implementation for captured images and tests.

// Lets the shared test fixture under tests/common name this crate by its
// public path.
#[cfg(test)]
extern crate self as sigpatch_core;

pub mod error;
pub(crate) mod hex;
pub mod memory;
pub mod offset;
pub mod patch;
pub mod pattern;
pub mod pipeline;
pub mod policy;
pub mod profile;
pub mod scan;
pub mod template;

pub use error::{Error, ErrorKind, Result};
pub use memory::{
    ImageRegion, MAX_STACK_DEPTH, MemoryImage, MemoryView, SparseMemory, StackFrame,
    StackSnapshot, load_image, save_image,
};
pub use offset::{FunctionAddressResolver, OffsetTable, ResolvedAddresses};
pub use patch::{InstallRequest, InstalledPatch, PatchInstaller, Placement, Redirect, place_before};
pub use pattern::MaskedPattern;
pub use pipeline::{
    DiagnosticEvent, DiagnosticSink, InjectionPipeline, Outcome, PipelineState, Session, Step,
    StepMask, TracingSink, symbols,
};
pub use policy::{AddressSpacePolicy, DEFAULT_MINIMUM_VALID_ADDRESS};
pub use profile::{Profile, ProfileSet, load_profile, save_profile};
pub use scan::{
    Anchor, AnchorQuery, AnchorScanner, AuxCheck, CallEncoding, CallSequenceConfig,
    CallSequenceMatch, CallSite, CodeAddressFilter, PrologueConfig, RelativeOperand,
    StringReference, decode_call_site, extract_call_target, find_last_call_before_terminator,
};
pub use template::{CodeTemplate, FixupKind, FixupSlot, FixupTarget, SiblingAddresses, TemplateId};
