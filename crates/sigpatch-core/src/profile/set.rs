use tracing::debug;

use crate::error::{Error, Result};
use crate::profile::Profile;

/// Profiles for several target builds plus the one to use when nothing else decides.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    default: usize,
    profiles: Vec<Profile>,
}

impl ProfileSet {
    /// The first profile is the default.
    pub fn new(profiles: Vec<Profile>) -> Result<Self> {
        if profiles.is_empty() {
            return Err(Error::config("No profiles configured"));
        }
        Ok(Self {
            default: 0,
            profiles,
        })
    }

    pub fn with_default(mut self, name: &str) -> Result<Self> {
        self.default = self
            .profiles
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(format!("profile '{}'", name)))?;
        Ok(self)
    }

    pub fn default_profile(&self) -> &Profile {
        &self.profiles[self.default]
    }

    /// Profile whose `version` matches exactly.
    pub fn select(&self, version: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.version == version)
    }

    /// Pick the profile for the running target.
    ///
    /// Version probing is not implemented; this always yields the default profile.
    pub fn detect_version(&self, base_address: u64) -> &Profile {
        let profile = self.default_profile();
        debug!(
            "Using default profile '{}' for base 0x{:X}",
            profile.name, base_address
        );
        profile
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::profile::fixture::sample_profile;

    fn two_profiles() -> ProfileSet {
        let first = sample_profile();
        let mut second = sample_profile();
        second.name = "other".to_string();
        second.version = "2.0".to_string();
        ProfileSet::new(vec![first, second]).unwrap()
    }

    #[test]
    fn test_detect_returns_default() {
        let set = two_profiles();
        assert_eq!(set.detect_version(0).name, "synthetic");

        let set = set.with_default("other").unwrap();
        assert_eq!(set.detect_version(0).name, "other");
    }

    #[test]
    fn test_select_by_version() {
        let set = two_profiles();
        assert_eq!(set.select("2.0").map(|p| p.name.as_str()), Some("other"));
        assert!(set.select("3.0").is_none());
    }

    #[test]
    fn test_empty_and_unknown_default() {
        assert!(ProfileSet::new(vec![]).is_err());
        let err = two_profiles().with_default("missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
