//! Per-target configuration.
//!
//! A [`Profile`] carries everything that differs between target builds: the address
//! policy, scan windows and signatures, the offset table and the patch templates.
//! The engine itself holds no target-specific constants.

mod set;

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::MAX_STACK_DEPTH;
use crate::offset::OffsetTable;
use crate::patch::JUMP_LENGTH;
use crate::pattern::MaskedPattern;
use crate::pipeline::symbols;
use crate::policy::AddressSpacePolicy;
use crate::scan::{
    AuxCheck, CallEncoding, CallSequenceConfig, CodeAddressFilter, PrologueConfig, RelativeOperand,
};
use crate::template::{CodeTemplate, FixupTarget, TemplateId};

pub use set::ProfileSet;

pub const DEFAULT_JUMP_OPCODE: u8 = 0xE9;

fn default_stack_depth() -> usize {
    MAX_STACK_DEPTH
}

fn default_jump_opcode() -> u8 {
    DEFAULT_JUMP_OPCODE
}

/// First scan: a return address on the captured stack pointing into known code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorProfile {
    pub window_start: usize,
    pub window_end: usize,
    pub pattern: MaskedPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<AuxCheck>,
    /// Call inside the anchored code whose target is the offset table's base.
    pub base_call: RelativeOperand,
}

/// Second scan: the outer caller, found above the anchor's slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerProfile {
    /// Exclusive end of the window. The window starts right after the anchor's slot.
    pub window_end: usize,
    pub sequence: CallSequenceConfig,
}

/// The call inside the prologue-resolved function that the second patch hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSiteProfile {
    pub offset: usize,
    #[serde(default)]
    pub call: CallEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub policy: AddressSpacePolicy,
    #[serde(default = "default_stack_depth")]
    pub stack_depth: usize,
    #[serde(default)]
    pub code_filter: CodeAddressFilter,
    pub anchor: AnchorProfile,
    pub offsets: OffsetTable,
    pub caller: CallerProfile,
    pub prologue: PrologueConfig,
    pub call_site: CallSiteProfile,
    #[serde(default = "default_jump_opcode")]
    pub jump_opcode: u8,
    pub templates: Vec<CodeTemplate>,
    /// Templates installed before the anchor, redirected through its stack slot.
    pub patch1: Vec<TemplateId>,
    /// Templates installed before the caller, redirected from the hooked call site.
    pub patch2: Vec<TemplateId>,
}

impl Profile {
    pub fn template(&self, id: &TemplateId) -> Option<&CodeTemplate> {
        self.templates.iter().find(|t| t.id() == id)
    }

    /// Templates of one patch, in placement order.
    pub fn patch_templates(&self, ids: &[TemplateId]) -> Result<Vec<&CodeTemplate>> {
        ids.iter()
            .map(|id| {
                self.template(id)
                    .ok_or_else(|| Error::UnknownTarget(format!("template {}", id)))
            })
            .collect()
    }

    /// Check every structural invariant so a run can only fail on what it finds in memory.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("Profile has no name"));
        }
        if self.stack_depth == 0 || self.stack_depth > MAX_STACK_DEPTH {
            return Err(Error::config(format!(
                "Stack depth 0x{:X} must be within 1..=0x{:X}",
                self.stack_depth, MAX_STACK_DEPTH
            )));
        }

        let anchor = &self.anchor;
        if anchor.window_start >= anchor.window_end || anchor.window_end > self.stack_depth {
            return Err(Error::config(format!(
                "Anchor window 0x{:X}..0x{:X} must be non-empty and within 0x{:X} words",
                anchor.window_start, anchor.window_end, self.stack_depth
            )));
        }
        anchor.base_call.validate()?;
        if let Some(AuxCheck::StringReference(check)) = &anchor.aux
            && check.expected.is_empty()
        {
            return Err(Error::config("Auxiliary string check expects an empty string"));
        }

        self.offsets.validate()?;
        if let Some(name) = std::iter::once(self.offsets.base.as_str())
            .chain(self.offsets.iter().map(|(name, _)| name))
            .find(|name| symbols::ALL.contains(name))
        {
            return Err(Error::config(format!(
                "Offset entry '{}' shadows a discovered address",
                name
            )));
        }

        if self.caller.window_end <= anchor.window_start + 1
            || self.caller.window_end > self.stack_depth
        {
            return Err(Error::config(format!(
                "Caller window end 0x{:X} must lie after the anchor window start and within 0x{:X} words",
                self.caller.window_end, self.stack_depth
            )));
        }
        self.caller.sequence.validate()?;
        self.prologue.validate()?;
        self.call_site.call.validate()?;
        if self.call_site.call.length < JUMP_LENGTH {
            return Err(Error::config(format!(
                "Hooked call is {} bytes, too short for a {} byte jump",
                self.call_site.call.length, JUMP_LENGTH
            )));
        }

        let mut ids = BTreeSet::new();
        for template in &self.templates {
            if !ids.insert(template.id()) {
                return Err(Error::config(format!("Duplicate template id '{}'", template.id())));
            }
        }

        self.validate_patch(&self.patch1, &[symbols::ANCHOR], &[])?;
        self.validate_patch(&self.patch2, symbols::ALL, &self.patch1)?;
        Ok(())
    }

    fn validate_patch(
        &self,
        patch: &[TemplateId],
        discovered: &[&str],
        earlier: &[TemplateId],
    ) -> Result<()> {
        if patch.is_empty() {
            return Err(Error::config("Patch lists no templates"));
        }

        let mut placed = BTreeSet::new();
        for id in patch {
            if !placed.insert(id) || earlier.contains(id) {
                return Err(Error::config(format!("Template '{}' is placed twice", id)));
            }
        }

        for template in self.patch_templates(patch)? {
            for slot in template.slots() {
                let known = match &slot.target {
                    FixupTarget::Symbol(name) => {
                        *name == self.offsets.base
                            || self.offsets.get(name).is_some()
                            || discovered.contains(&name.as_str())
                    }
                    FixupTarget::SelfOffset(_) => true,
                    FixupTarget::Template(other) => placed.contains(other) || earlier.contains(other),
                };
                if !known {
                    return Err(Error::UnknownTarget(format!("{:?}", slot.target))
                        .in_entry(template.id().as_str()));
                }
            }
        }
        Ok(())
    }
}

/// Load a profile from `.toml` or JSON (any other extension) and validate it.
pub fn load_profile<P: AsRef<Path>>(path: P) -> Result<Profile> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let profile: Profile = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => toml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    profile.validate()?;
    debug!("Loaded profile '{}' ({})", profile.name, path.display());
    Ok(profile)
}

pub fn save_profile<P: AsRef<Path>>(path: P, profile: &Profile) -> Result<()> {
    let content = serde_json::to_string_pretty(profile)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
#[path = "../../tests/common/mod.rs"]
pub(crate) mod fixture;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::profile::fixture::sample_profile;
    use crate::template::{FixupKind, FixupSlot};

    #[test]
    fn test_sample_profile_is_valid() {
        sample_profile().validate().unwrap();
    }

    #[test]
    fn test_empty_anchor_window() {
        let mut profile = sample_profile();
        profile.anchor.window_end = profile.anchor.window_start;
        assert_eq!(profile.validate().unwrap_err().kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_window_beyond_depth() {
        let mut profile = sample_profile();
        profile.stack_depth = 0x40;
        assert_eq!(profile.validate().unwrap_err().kind(), ErrorKind::InvalidConfiguration);

        let mut profile = sample_profile();
        profile.stack_depth = MAX_STACK_DEPTH + 1;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_offset_shadowing_symbol() {
        let mut profile = sample_profile();
        profile.offsets = profile.offsets.clone().with_offset(symbols::CALLER, 0x10);
        assert_eq!(profile.validate().unwrap_err().kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_missing_template() {
        let mut profile = sample_profile();
        profile.patch2.push("nope".into());
        assert_eq!(profile.validate().unwrap_err().kind(), ErrorKind::UnknownTarget);
    }

    #[test]
    fn test_duplicate_placement() {
        let mut profile = sample_profile();
        let first = profile.patch1[0].clone();
        profile.patch2.push(first);
        assert_eq!(profile.validate().unwrap_err().kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_unknown_symbol_in_template() {
        let mut profile = sample_profile();
        let template = CodeTemplate::new(
            "stray",
            vec![0xE8, 0, 0, 0, 0],
            0,
            vec![FixupSlot::new(
                1,
                FixupKind::Relative32 { instruction_length: 4 },
                FixupTarget::Symbol("printk_ratelimit".into()),
            )],
        )
        .unwrap();
        profile.templates.push(template);
        profile.patch2.push("stray".into());

        let err = profile.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTarget);
        assert!(err.to_string().contains("stray"));
    }

    #[test]
    fn test_patch1_cannot_use_later_symbols() {
        let mut profile = sample_profile();
        let template = CodeTemplate::new(
            "early",
            vec![0xE9, 0, 0, 0, 0],
            0,
            vec![FixupSlot::new(
                1,
                FixupKind::Relative32 { instruction_length: 4 },
                FixupTarget::Symbol(symbols::CALL_SITE.into()),
            )],
        )
        .unwrap();
        profile.templates.push(template);
        profile.patch1.push("early".into());
        assert_eq!(profile.validate().unwrap_err().kind(), ErrorKind::UnknownTarget);
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        let profile = sample_profile();

        save_profile(&path, &profile).unwrap();
        let loaded = load_profile(&path).unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        fs::write(&path, crate::profile::fixture::SAMPLE_TOML).unwrap();

        let profile = load_profile(&path).unwrap();
        assert_eq!(profile.name, "synthetic");
        assert_eq!(profile.policy, AddressSpacePolicy::default());
        assert_eq!(profile.stack_depth, MAX_STACK_DEPTH);
        assert_eq!(profile.jump_opcode, DEFAULT_JUMP_OPCODE);
        assert_eq!(profile.offsets.get("alloc"), Some(-0x800));
        assert_eq!(profile.templates.len(), 2);
    }

    #[test]
    fn test_load_oversized_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        let oversized = [
            (r#""min_consecutive_calls": 10"#, r#""min_consecutive_calls": 9223372036854775807"#),
            (r#""displacement_offset": 10"#, r#""displacement_offset": 18446744073709551615"#),
            (r#""operand_offset": 16"#, r#""operand_offset": 18446744073709551615"#),
        ];

        for (from, to) in oversized {
            let json = crate::profile::fixture::SAMPLE_JSON.replace(from, to);
            assert_ne!(json, crate::profile::fixture::SAMPLE_JSON);
            fs::write(&path, json).unwrap();

            let err = load_profile(&path).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration, "{}", to);
        }
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_profile(dir.path().join("absent.json")).unwrap_err();
        assert!(err.is_missing_file());
    }
}
