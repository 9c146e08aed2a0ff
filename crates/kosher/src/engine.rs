// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Capability interfaces for the external collaborators.
//!
//! The orchestrator never talks to a container runtime, version manager or
//! package manager directly. It goes through these narrow traits, which are
//! implemented by the docker adapters in [`crate::docker`] and by the
//! deterministic doubles in `crate::fake`.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::language::Language;
use crate::record::{ContainerHandle, RequirementsRef};

#[cfg(test)]
#[path = "./engine_test.rs"]
mod engine_test;

/// Label carrying the owning environment name on every context we create.
pub const ENV_LABEL: &str = "kosher.env";

/// Error reported by a collaborator, carrying its own diagnostic text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything the engine needs to create an isolated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSpec {
    pub env_name: String,
    pub image: String,
    pub workdir: String,
    pub labels: BTreeMap<String, String>,
}

impl ContextSpec {
    pub fn new(env_name: &str, image: String, workdir: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(ENV_LABEL.to_string(), env_name.to_string());
        Self {
            env_name: env_name.to_string(),
            image,
            workdir: workdir.to_string(),
            labels,
        }
    }
}

/// A command to execute inside a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    /// Attach the caller's terminal instead of capturing output.
    pub interactive: bool,
    /// Forward the caller's standard input to a captured command.
    pub stdin: bool,
}

impl ExecRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn in_dir<S: Into<String>>(mut self, workdir: S) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// One line of output from a remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

impl OutputChunk {
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(text) | Self::Stderr(text) => text,
        }
    }
}

/// A process running inside a context.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Next chunk of output, or `None` once both streams are closed.
    ///
    /// Must be cancel safe: dropping the future loses no output.
    async fn next_chunk(&mut self) -> Option<OutputChunk>;

    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> Result<i32, EngineError>;

    /// Signal the process to terminate.
    async fn kill(&mut self) -> Result<(), EngineError>;
}

/// Container runtime primitives.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create_context(&self, spec: &ContextSpec) -> Result<ContainerHandle, EngineError>;

    /// Start a created context; starting a running one is a no-op.
    async fn start_context(&self, handle: &ContainerHandle) -> Result<(), EngineError>;

    /// Remove a context. Removing one that no longer exists succeeds.
    async fn remove_context(&self, handle: &ContainerHandle) -> Result<(), EngineError>;

    /// Contexts created by us, optionally only those of one environment.
    async fn list_contexts(
        &self,
        env_name: Option<&str>,
    ) -> Result<Vec<ContainerHandle>, EngineError>;

    async fn exec(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Box<dyn RemoteProcess>, EngineError>;

    /// Copy a host file or directory to `dest` inside the context.
    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        src: &Path,
        dest: &str,
    ) -> Result<(), EngineError>;

    /// Copy `src` from inside the context to a host directory.
    async fn copy_out(
        &self,
        handle: &ContainerHandle,
        src: &str,
        dest: &Path,
    ) -> Result<(), EngineError>;
}

/// Language runtime version manager.
#[async_trait]
pub trait VersionManager: Send + Sync {
    /// Versions available locally. Floating entries such as `3.11` may be
    /// listed but only concrete `X.Y.Z` ones are ever selected.
    async fn list_installed(&self, language: Language) -> Result<Vec<String>, EngineError>;

    /// Install the newest release matching `version` and return its concrete
    /// `X.Y.Z` version.
    async fn install(&self, language: Language, version: &str) -> Result<String, EngineError>;
}

/// Per-language package manager.
#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn install_deps(
        &self,
        handle: &ContainerHandle,
        language: Language,
        manifest: &RequirementsRef,
    ) -> Result<(), EngineError>;
}

/// Drain a process to completion, returning its exit code and the last
/// `keep` lines of its merged output.
pub async fn run_to_completion(
    mut process: Box<dyn RemoteProcess>,
    keep: usize,
) -> Result<(i32, String), EngineError> {
    let mut tail = OutputTail::new(keep);
    while let Some(chunk) = process.next_chunk().await {
        tail.push(chunk.text());
    }
    let code = process.wait().await?;
    Ok((code, tail.render()))
}

/// The last few lines of some tool output, kept for error messages.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, text: &str) {
        if self.capacity == 0 {
            return;
        }
        for line in text.split('\n') {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}
