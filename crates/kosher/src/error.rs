// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for kosher operations.

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::engine::EngineError;
use crate::language::Language;
use crate::record::{EnvState, FailureStage};

/// Convenience Result type with kosher Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during environment lifecycle operations.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// Environment name cannot be used as a record key
    #[error("Invalid environment name {0:?}")]
    #[diagnostic(
        code(kosher::invalid_name),
        help("Names start with a letter or digit and contain only letters, digits, '.', '_' or '-' (max 63 characters)")
    )]
    InvalidName(String),

    /// A live environment already uses this name
    #[error("Environment '{0}' already exists")]
    #[diagnostic(
        code(kosher::duplicate_name),
        help("Delete the existing environment first or pick another name")
    )]
    DuplicateName(String),

    /// No live environment with this name
    #[error("Environment '{0}' does not exist")]
    #[diagnostic(
        code(kosher::not_found),
        help("Run 'kosher list' to see available environments")
    )]
    NotFound(String),

    /// Environment cannot be activated in its current state
    #[error("Environment '{name}' is not ready (state: {state})")]
    #[diagnostic(
        code(kosher::not_ready),
        help("Only ready environments can be activated; failed environments must be deleted and re-created")
    )]
    NotReady { name: String, state: EnvState },

    /// Environment must be activated before running commands in it
    #[error("Environment '{name}' is not active (state: {state})")]
    #[diagnostic(
        code(kosher::not_active),
        help("Activate it first with 'kosher activate {name}'")
    )]
    NotActive { name: String, state: EnvState },

    /// Unsupported language family
    #[error("Unsupported language: {0}")]
    #[diagnostic(
        code(kosher::unsupported_language),
        help("Supported languages: python, node, ruby")
    )]
    UnsupportedLanguage(String),

    /// Version spec could not be parsed
    #[error("Invalid version spec {spec:?}: {reason}")]
    #[diagnostic(
        code(kosher::invalid_version),
        help("Use an exact version (3.11.4), a partial version (3.11) or a range (>=3.10)")
    )]
    InvalidVersion { spec: String, reason: String },

    /// No runtime satisfies the request and none could be installed
    #[error("No {language} runtime available for {spec:?}: {cause}")]
    #[diagnostic(code(kosher::runtime_unavailable))]
    RuntimeUnavailable {
        language: Language,
        spec: String,
        cause: String,
    },

    /// The container engine rejected creation of the isolated context
    #[error("Failed to provision environment '{name}': {cause}")]
    #[diagnostic(code(kosher::provision_failed))]
    ProvisionFailed { name: String, cause: String },

    /// The package manager reported an error installing dependencies
    #[error("Failed to install dependencies for '{name}': {cause}")]
    #[diagnostic(code(kosher::dependency_install_failed))]
    DependencyInstallFailed { name: String, cause: String },

    /// Provisioning of a new environment failed at a given stage
    #[error("Creating environment '{name}' failed during {stage}{}", teardown_suffix(.teardown))]
    #[diagnostic(
        code(kosher::create_failed),
        help("The environment is kept in the failed state; remove it with 'kosher delete {name}'")
    )]
    CreateFailed {
        name: String,
        stage: FailureStage,
        #[source]
        source: Box<Error>,
        teardown: Option<Box<Error>>,
    },

    /// The stored record changed between read and write
    #[error("Environment '{0}' was modified concurrently")]
    #[diagnostic(code(kosher::concurrent_modification))]
    ConcurrentModification(String),

    /// An external operation exceeded its time budget
    #[error("{operation} timed out after {}s", .after.as_secs())]
    #[diagnostic(code(kosher::timeout))]
    Timeout { operation: String, after: Duration },

    /// An external operation was interrupted by the caller
    #[error("{operation} was cancelled")]
    #[diagnostic(code(kosher::cancelled))]
    Cancelled { operation: String },

    /// Removing an isolated context failed
    #[error("Failed to remove container {handle}: {cause}")]
    #[diagnostic(
        code(kosher::teardown_failed),
        help("The environment was kept so the removal can be retried with 'kosher delete'")
    )]
    TeardownFailed { handle: String, cause: String },

    /// The language build tool exited unsuccessfully
    #[error("Build in '{name}' failed with exit code {code}")]
    #[diagnostic(code(kosher::build_failed), help("{diagnostic}"))]
    BuildFailed {
        name: String,
        code: i32,
        diagnostic: String,
    },

    /// A record write would break a record invariant
    #[error("Invalid environment record: {0}")]
    #[diagnostic(code(kosher::invalid_record))]
    InvalidRecord(String),

    /// A collaborator call failed outside of provisioning
    #[error("{operation} failed")]
    #[diagnostic(code(kosher::engine_error))]
    Engine {
        operation: String,
        #[source]
        source: EngineError,
    },

    /// Configuration could not be loaded
    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(kosher::config),
        help("Check ~/.kosher/config.yaml and KOSHER_* environment variables")
    )]
    Config(#[from] ::config::ConfigError),

    /// Failed to read file
    #[error("Failed to read file: {path:?}")]
    #[diagnostic(code(kosher::read_failed))]
    ReadFailed {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// Invalid YAML in a stored record
    #[error("Invalid environment record file {path:?}: {error}")]
    #[diagnostic(
        code(kosher::invalid_yaml),
        help("The record was likely edited by hand; fix or remove the file")
    )]
    InvalidYaml {
        path: PathBuf,
        #[source]
        error: serde_yaml::Error,
    },

    /// IO error passthrough
    #[error(transparent)]
    #[diagnostic(code(kosher::io_error))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the interruption variants (`Cancelled` and `Timeout`).
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Timeout { .. })
    }

    /// The innermost error, looking through `CreateFailed`.
    pub fn root(&self) -> &Error {
        match self {
            Self::CreateFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

fn teardown_suffix(teardown: &Option<Box<Error>>) -> String {
    match teardown {
        Some(err) => format!(" (cleanup also failed: {err})"),
        None => String::new(),
    }
}
