// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Layered configuration: built-in defaults, then `<root>/config.yaml`,
//! then `KOSHER_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::language::Language;
use crate::registry::ENVIRONMENTS_DIR;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

/// Environment variable overriding the state root.
pub const ROOT_ENV_VAR: &str = "KOSHER_ROOT";

/// Prefix of environment variables overriding config keys.
pub const ENV_PREFIX: &str = "KOSHER";

/// Name of the optional config file below the root.
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Root directory name below the user's home.
const DEFAULT_ROOT_DIR: &str = ".kosher";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding all kosher state.
    #[serde(skip)]
    pub root: PathBuf,
    pub engine: EngineConfig,
    pub timeouts: TimeoutConfig,
    pub defaults: DefaultVersions,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container CLI to invoke.
    pub program: String,
    /// Working directory inside every context.
    pub container_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            container_dir: "/app".to_string(),
        }
    }
}

/// Time budgets for external operations, in seconds. Unset means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn provision(&self) -> Option<Duration> {
        self.provision_secs.map(Duration::from_secs)
    }

    pub fn install(&self) -> Option<Duration> {
        self.install_secs.map(Duration::from_secs)
    }

    pub fn exec(&self) -> Option<Duration> {
        self.exec_secs.map(Duration::from_secs)
    }

    pub fn teardown(&self) -> Option<Duration> {
        self.teardown_secs.map(Duration::from_secs)
    }
}

/// Version used by `create` when none is given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultVersions {
    pub python: String,
    pub node: String,
    pub ruby: String,
}

impl Default for DefaultVersions {
    fn default() -> Self {
        Self {
            python: "3.10".to_string(),
            node: "20".to_string(),
            ruby: "3.3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Retries of a write that lost a compare-and-swap race.
    pub max_cas_retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_cas_retries: 3 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT_DIR),
            engine: EngineConfig::default(),
            timeouts: TimeoutConfig::default(),
            defaults: DefaultVersions::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration for the root named by `KOSHER_ROOT`, or `~/.kosher`.
    pub fn load() -> Result<Self> {
        Self::load_from(default_root()?)
    }

    /// Load configuration for an explicit state root.
    pub fn load_from<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::load_layered(root.as_ref(), environment())
    }

    fn load_layered(root: &Path, env: ::config::Environment) -> Result<Self> {
        let file = root.join(CONFIG_FILENAME);
        tracing::debug!("loading config from {}", file.display());

        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Config::default())?)
            .add_source(
                ::config::File::from(file)
                    .format(::config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(env)
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        config.root = root.to_path_buf();
        Ok(config)
    }

    pub fn environments_dir(&self) -> PathBuf {
        self.root.join(ENVIRONMENTS_DIR)
    }

    pub fn default_version(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.defaults.python,
            Language::Node => &self.defaults.node,
            Language::Ruby => &self.defaults.ruby,
        }
    }
}

/// `KOSHER_ENGINE__PROGRAM=podman` sets `engine.program`.
///
/// Values stay strings so that versions like `3.10` are not read as floats.
fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

/// The state root: `KOSHER_ROOT` when set, otherwise `~/.kosher`.
pub fn default_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os(ROOT_ENV_VAR).filter(|r| !r.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_ROOT_DIR))
        .ok_or_else(|| {
            Error::Config(::config::ConfigError::Message(format!(
                "cannot determine the home directory; set {ROOT_ENV_VAR}"
            )))
        })
}
