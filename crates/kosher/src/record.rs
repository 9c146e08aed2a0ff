// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Environment records and the lifecycle state machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::language::Language;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./record_test.rs"]
mod record_test;

/// Maximum length of an environment name.
pub const MAX_NAME_LEN: usize = 63;

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvState {
    Declared,
    Provisioning,
    Ready,
    Active,
    Failed,
    Deleting,
    Deleted,
}

impl EnvState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    /// Anything but a `Deleted` tombstone counts as live.
    pub fn is_live(self) -> bool {
        self != Self::Deleted
    }

    /// States in which the record owns a running container.
    pub fn holds_container(self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: EnvState) -> bool {
        use EnvState::*;
        match (self, next) {
            (Declared, Provisioning)
            | (Provisioning, Ready)
            | (Provisioning, Failed)
            | (Ready, Active)
            | (Active, Ready)
            | (Deleting, Deleted) => true,
            (Deleted, _) => false,
            (_, Deleting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of provisioning at which a create failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Resolve,
    Provision,
    Dependencies,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "runtime resolution",
            Self::Provision => "container provisioning",
            Self::Dependencies => "dependency installation",
        })
    }
}

/// Why an environment ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FailureInfo {
    pub stage: FailureStage,
    pub message: String,
}

/// Reference to an isolated context owned by the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ContainerHandle {
    /// Engine-assigned identifier.
    pub id: String,
    /// Human-readable container name.
    pub name: String,
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.id.chars().take(12).collect();
        write!(f, "{} ({short})", self.name)
    }
}

/// Declared dependency manifest, handed verbatim to the package manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementsRef {
    /// A manifest file on the host (requirements.txt, package.json, Gemfile).
    File(PathBuf),
    /// An inline list of package specs.
    Inline(Vec<String>),
}

impl fmt::Display for RequirementsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Inline(packages) => f.write_str(&packages.join(", ")),
        }
    }
}

/// The durable entity representing one named environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvironmentRecord {
    pub name: String,
    pub language: Language,

    /// Version spec as declared by the user.
    pub requested_version: String,

    /// Concrete runtime version, set once resolution succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<RequirementsRef>,

    /// SHA-256 of the manifest file at provisioning time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_digest: Option<String>,

    pub state: EnvState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerHandle>,

    /// A context whose removal has not been confirmed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_cleanup: Option<ContainerHandle>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated_at: Option<DateTime<Utc>>,

    /// Machine the environment was created on.
    #[serde(default)]
    pub host: String,

    /// Bumped by the registry on every write.
    #[serde(default)]
    pub revision: u64,
}

impl EnvironmentRecord {
    /// Create a fresh `Declared` record.
    pub fn declare(
        name: impl Into<String>,
        language: Language,
        requested_version: impl Into<String>,
        requirements: Option<RequirementsRef>,
    ) -> Self {
        Self {
            name: name.into(),
            language,
            requested_version: requested_version.into(),
            version: None,
            requirements,
            requirements_digest: None,
            state: EnvState::Declared,
            container: None,
            pending_cleanup: None,
            failure: None,
            created_at: Utc::now(),
            last_activated_at: None,
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            revision: 0,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    ///
    /// Leaving `Failed` clears the failure details.
    pub fn transition(&mut self, next: EnvState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidRecord(format!(
                "illegal transition for '{}': {} -> {}",
                self.name, self.state, next
            )));
        }
        if next != EnvState::Failed {
            self.failure = None;
        }
        self.state = next;
        Ok(())
    }

    /// Check the structural invariants every stored record must satisfy.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.state.holds_container() != self.container.is_some() {
            return Err(Error::InvalidRecord(format!(
                "'{}' is {} but {} a container handle",
                self.name,
                self.state,
                if self.container.is_some() { "has" } else { "lacks" }
            )));
        }

        if (self.state == EnvState::Failed) != self.failure.is_some() {
            return Err(Error::InvalidRecord(format!(
                "'{}' is {} but failure details are {}",
                self.name,
                self.state,
                if self.failure.is_some() { "present" } else { "missing" }
            )));
        }

        if self.state == EnvState::Deleted && self.pending_cleanup.is_some() {
            return Err(Error::InvalidRecord(format!(
                "'{}' cannot be deleted while {:?} awaits removal",
                self.name, self.pending_cleanup
            )));
        }

        if self.state.holds_container() && self.version.is_none() {
            return Err(Error::InvalidRecord(format!(
                "'{}' is {} without a resolved version",
                self.name, self.state
            )));
        }

        Ok(())
    }

    /// Version to display: resolved if known, otherwise the declared spec.
    pub fn display_version(&self) -> &str {
        self.version.as_deref().unwrap_or(&self.requested_version)
    }
}

/// Ensure a name is usable as a file name and container name.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => chars
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
        _ => false,
    };
    if !valid || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}
