//! Mod compatibility policy for the modded handshake extension

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A mod declared by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModInfo {
    pub id: String,
    pub version: String,
}

impl ModInfo {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModRule {
    /// Version pattern, `*` and `?` wildcards allowed
    pub version: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub banned: bool,
}

/// A bare version string means "required, matching this version"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModRequirement {
    Version(String),
    Rule(ModRule),
}

impl ModRequirement {
    pub fn version(&self) -> &str {
        match self {
            ModRequirement::Version(version) => version,
            ModRequirement::Rule(rule) => &rule.version,
        }
    }

    pub fn is_required(&self) -> bool {
        match self {
            ModRequirement::Version(_) => true,
            ModRequirement::Rule(rule) => rule.required,
        }
    }

    pub fn is_banned(&self) -> bool {
        matches!(self, ModRequirement::Rule(rule) if rule.banned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModPolicy {
    #[serde(default)]
    pub mods: BTreeMap<String, ModRequirement>,
    /// Tolerate mods the policy does not mention
    #[serde(default)]
    pub allow_extra_mods: bool,
}

/// Why a client's mod set was refused; the message is shown to the client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModViolation {
    #[error("Failed to declare mods.")]
    NotDeclared,
    #[error("Invalid mod loaded: {id} ({version}).")]
    Banned { id: String, version: String },
    #[error("Invalid version for mod {id}: {version} (Needs {expected}).")]
    WrongVersion {
        id: String,
        version: String,
        expected: String,
    },
    #[error("Missing mod: {id} ({version}).")]
    Missing { id: String, version: String },
    #[error("Invalid mod loaded: {id} ({version}).")]
    Unexpected { id: String, version: String },
}

impl ModPolicy {
    /// Check a declared mod list against the policy
    pub fn check(&self, declared: Option<&[ModInfo]>) -> Result<(), ModViolation> {
        let declared = declared.ok_or(ModViolation::NotDeclared)?;

        for (id, requirement) in &self.mods {
            match declared.iter().find(|m| &m.id == id) {
                Some(found) => {
                    if requirement.is_banned() {
                        return Err(ModViolation::Banned {
                            id: found.id.clone(),
                            version: found.version.clone(),
                        });
                    }
                    if !version_matches(requirement.version(), &found.version) {
                        return Err(ModViolation::WrongVersion {
                            id: found.id.clone(),
                            version: found.version.clone(),
                            expected: requirement.version().to_string(),
                        });
                    }
                }
                None if requirement.is_required() => {
                    return Err(ModViolation::Missing {
                        id: id.clone(),
                        version: requirement.version().to_string(),
                    });
                }
                None => {}
            }
        }

        if !self.allow_extra_mods {
            if let Some(extra) = declared.iter().find(|m| !self.mods.contains_key(&m.id)) {
                return Err(ModViolation::Unexpected {
                    id: extra.id.clone(),
                    version: extra.version.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Glob match supporting `*` (any run) and `?` (any single character)
pub fn version_matches(pattern: &str, version: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = version.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
