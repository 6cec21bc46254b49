use std::collections::BTreeMap;

use curio_shared::log::warn;
use serde::{Deserialize, Serialize};

use crate::{hasher::StableHasher, Error, Result};

/// A target platform. Each profile has its own set of transformed outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub name: String,
    /// Free-form settings that are passed on to the transformers.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl PlatformProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Stable hash of the name and the settings. Changing a setting invalidates all
    /// outputs of the profile.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = StableHasher::new();
        hasher.update_str(&self.name);
        for (key, value) in &self.settings {
            hasher.update_str(key).update_str(value);
        }
        hasher.finish()
    }
}

/// The profiles of a session. Never empty.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    profiles: Vec<PlatformProfile>,
    active: usize,
}

impl ProfileSet {
    /// Fails with [`Error::InvalidConfig`] when `profiles` is empty or contains two
    /// profiles whose names differ only in case.
    pub fn new(profiles: Vec<PlatformProfile>) -> Result<Self> {
        if profiles.is_empty() {
            return Err(Error::InvalidConfig("at least one platform profile is required".to_owned()));
        }
        for (index, profile) in profiles.iter().enumerate() {
            let duplicate = profiles[..index]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&profile.name));
            if duplicate {
                return Err(Error::InvalidConfig(format!("duplicate platform profile '{}'", profile.name)));
            }
        }
        Ok(Self { profiles, active: 0 })
    }

    /// Finds a profile by its name, ignoring the case.
    pub fn find_by_name(&self, name: &str) -> Option<&PlatformProfile> {
        self.profiles.iter().find(|profile| profile.name.eq_ignore_ascii_case(name))
    }

    /// Like [`ProfileSet::find_by_name`] but fails with [`Error::UnknownPlatformProfile`].
    pub fn resolve(&self, name: &str) -> Result<&PlatformProfile> {
        self.find_by_name(name)
            .ok_or_else(|| Error::UnknownPlatformProfile(name.to_owned()))
    }

    /// Returns the profile at `index`. An index that is out of range falls back to the first profile.
    pub fn get(&self, index: usize) -> &PlatformProfile {
        &self.profiles[self.clamp_index(index)]
    }

    fn clamp_index(&self, index: usize) -> usize {
        if index < self.profiles.len() {
            index
        } else {
            warn!("Platform profile index {index} is out of range. Falling back to index 0");
            0
        }
    }

    pub fn active(&self) -> &PlatformProfile {
        &self.profiles[self.active]
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Sets the active profile and returns it. Out-of-range indices select the first profile.
    pub fn set_active(&mut self, index: usize) -> &PlatformProfile {
        self.active = self.clamp_index(index);
        self.active()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlatformProfile> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
