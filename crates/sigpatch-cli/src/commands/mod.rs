//! CLI command implementations.

pub mod check;
pub mod scan;
pub mod simulate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use sigpatch_core::{Profile, ProfileSet, load_profile};

/// Load every profile; the first becomes the default.
pub(crate) fn load_profiles(paths: &[PathBuf]) -> Result<ProfileSet> {
    let profiles = paths
        .iter()
        .map(|path| load_profile(path).with_context(|| format!("loading {}", path.display())))
        .collect::<Result<Vec<Profile>>>()?;
    Ok(ProfileSet::new(profiles)?)
}
