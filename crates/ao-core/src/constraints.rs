use std::collections::BTreeSet;

use semver::VersionReq;
use serde::{Deserialize, Serialize};

use crate::types::AgentDefinition;

/// Placement constraints a task carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Semver range such as `^1.2` or `>=1.0, <2.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Capabilities the serving agent must all declare.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capabilities: BTreeSet<String>,
}

impl Constraints {
    pub fn with_version(mut self, range: impl Into<String>) -> Self {
        self.version = Some(range.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Parse the version range once so matching a pool is cheap.
    pub fn compile(&self) -> Result<CompiledConstraints, String> {
        let version = match self.version.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                VersionReq::parse(raw).map_err(|e| format!("invalid version range `{raw}`: {e}"))?,
            ),
        };
        Ok(CompiledConstraints {
            version,
            capabilities: self.capabilities.clone(),
        })
    }
}

/// Constraints with the version range already parsed.
#[derive(Debug, Clone, Default)]
pub struct CompiledConstraints {
    version: Option<VersionReq>,
    capabilities: BTreeSet<String>,
}

impl CompiledConstraints {
    pub fn is_unconstrained(&self) -> bool {
        self.version.is_none() && self.capabilities.is_empty()
    }

    pub fn matches(&self, def: &AgentDefinition) -> bool {
        if let Some(req) = &self.version {
            if !req.matches(&def.version) {
                return false;
            }
        }
        self.capabilities.is_subset(&def.capabilities)
    }
}
