// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Creation and teardown of the isolated context backing an environment.
//!
//! Provisioning never leaves a context behind silently: whatever step fails
//! or is interrupted, the partially created context is removed before the
//! error is returned, and if that removal fails too the handle is reported
//! back so it can be recorded for a later retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::bridge::{self, ExecStatus, ExecStream};
use crate::cancel::{CancelToken, run_guarded};
use crate::engine::{
    ContainerEngine, ContextSpec, EngineError, ExecRequest, OutputChunk, OutputTail,
    PackageManager, run_to_completion,
};
use crate::record::{ContainerHandle, EnvironmentRecord, FailureStage};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./provision_test.rs"]
mod provision_test;

/// Scratch area for builds inside a context.
pub const BUILD_ROOT: &str = "/kosher/build";

/// Where script files are copied before they are run.
pub const RUN_DIR: &str = "/kosher/run";

/// Lines of build output kept as the failure diagnostic.
const DIAGNOSTIC_LINES: usize = 40;

/// A failed provision, after best-effort cleanup.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub stage: FailureStage,
    pub error: Error,
    /// Why the partially created context could not be removed.
    pub teardown: Option<Error>,
    /// A context that may still exist and needs removing later.
    pub leaked: Option<ContainerHandle>,
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub output_dir: PathBuf,
    /// Files copied into `output_dir`, sorted by name.
    pub artifacts: Vec<PathBuf>,
}

/// A script copied into a context along with its directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedScript {
    /// Where the script's directory landed.
    pub dir: String,
    /// Path of the script itself.
    pub path: String,
}

#[derive(Debug, Default)]
struct Progress {
    stage: Option<FailureStage>,
    handle: Option<ContainerHandle>,
}

/// Isolation provisioner over a [`ContainerEngine`] and [`PackageManager`].
#[derive(Clone)]
pub struct Provisioner {
    engine: Arc<dyn ContainerEngine>,
    packages: Arc<dyn PackageManager>,
    container_dir: String,
    teardown_timeout: Option<Duration>,
}

impl Provisioner {
    pub fn new<S: Into<String>>(
        engine: Arc<dyn ContainerEngine>,
        packages: Arc<dyn PackageManager>,
        container_dir: S,
    ) -> Self {
        Self {
            engine,
            packages,
            container_dir: container_dir.into(),
            teardown_timeout: None,
        }
    }

    /// Bound every removal of a context by `timeout`.
    pub fn with_teardown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Create, start and populate the context for `record` at `version`.
    pub async fn provision(
        &self,
        record: &EnvironmentRecord,
        version: &str,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> std::result::Result<ContainerHandle, ProvisionFailure> {
        let mut progress = Progress::default();
        let operation = format!("Provisioning '{}'", record.name);
        let outcome = run_guarded(
            &operation,
            cancel,
            timeout,
            self.provision_steps(record, version, &mut progress),
        )
        .await;

        let error = match outcome {
            Ok(handle) => return Ok(handle),
            Err(error) => error,
        };
        let stage = progress.stage.unwrap_or(FailureStage::Provision);
        tracing::warn!("Provisioning '{}' failed during {stage}: {error}", record.name);

        // The caller's token may be the reason we are here, so cleanup gets
        // its own.
        let cleanup = CancelToken::new();
        let (teardown, leaked) = match progress.handle {
            Some(handle) => match self.teardown(&handle, &cleanup).await {
                Ok(()) => (None, None),
                Err(err) => (Some(err), Some(handle)),
            },
            // An interrupted create may still have produced a context.
            None if error.is_interruption() => match self.sweep(&record.name, &cleanup).await {
                Ok(_) => (None, None),
                Err(err) => (Some(err), None),
            },
            None => (None, None),
        };
        Err(ProvisionFailure {
            stage,
            error,
            teardown,
            leaked,
        })
    }

    async fn provision_steps(
        &self,
        record: &EnvironmentRecord,
        version: &str,
        progress: &mut Progress,
    ) -> Result<ContainerHandle> {
        let name = &record.name;
        let provision_failed = |err: EngineError| Error::ProvisionFailed {
            name: name.clone(),
            cause: err.message,
        };

        progress.stage = Some(FailureStage::Provision);
        let spec = ContextSpec::new(name, record.language.image_for(version), &self.container_dir);
        tracing::debug!("creating context for '{name}' from {}", spec.image);
        let handle = self
            .engine
            .create_context(&spec)
            .await
            .map_err(provision_failed)?;
        progress.handle = Some(handle.clone());

        self.engine
            .start_context(&handle)
            .await
            .map_err(provision_failed)?;

        if let Some(requirements) = &record.requirements {
            progress.stage = Some(FailureStage::Dependencies);
            self.packages
                .install_deps(&handle, record.language, requirements)
                .await
                .map_err(|err| Error::DependencyInstallFailed {
                    name: name.clone(),
                    cause: err.message,
                })?;
        }
        tracing::debug!("context {handle} ready for '{name}'");
        Ok(handle)
    }

    /// Remove a context. Removing one that is already gone succeeds.
    pub async fn teardown(&self, handle: &ContainerHandle, cancel: &CancelToken) -> Result<()> {
        let operation = format!("Removing container {handle}");
        run_guarded(&operation, cancel, self.teardown_timeout, async {
            self.engine
                .remove_context(handle)
                .await
                .map_err(|err| Error::TeardownFailed {
                    handle: handle.to_string(),
                    cause: err.message,
                })
        })
        .await?;
        tracing::debug!("removed container {handle}");
        Ok(())
    }

    /// Remove every context labelled with `env_name`, returning how many.
    pub async fn sweep(&self, env_name: &str, cancel: &CancelToken) -> Result<usize> {
        let operation = format!("Listing containers of '{env_name}'");
        let strays = run_guarded(&operation, cancel, self.teardown_timeout, async {
            self.engine
                .list_contexts(Some(env_name))
                .await
                .map_err(|source| Error::Engine {
                    operation: operation.clone(),
                    source,
                })
        })
        .await?;

        let mut first_error = None;
        let mut removed = 0;
        for handle in &strays {
            match self.teardown(handle, cancel).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!("{err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    /// Make sure the context is running.
    pub async fn start(
        &self,
        handle: &ContainerHandle,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let operation = format!("Starting container {handle}");
        run_guarded(&operation, cancel, timeout, async {
            self.engine
                .start_context(handle)
                .await
                .map_err(|source| Error::Engine {
                    operation: operation.clone(),
                    source,
                })
        })
        .await
    }

    /// Start `request` in the context, streaming its output.
    pub async fn exec(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
        cancel: CancelToken,
        timeout: Option<Duration>,
    ) -> Result<ExecStream> {
        let process = self
            .engine
            .exec(handle, request)
            .await
            .map_err(|source| Error::Engine {
                operation: format!("Starting '{}'", request.argv.join(" ")),
                source,
            })?;
        Ok(bridge::stream(process, cancel, timeout))
    }

    /// Copy a host script and the directory around it into the context.
    ///
    /// The whole parent directory is staged so the script can load sibling
    /// modules and data files relative to itself.
    pub async fn stage_script(
        &self,
        handle: &ContainerHandle,
        script: &Path,
    ) -> Result<StagedScript> {
        let file_name = script
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::ReadFailed {
                path: script.to_path_buf(),
                error: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file name"),
            })?;
        if !script.is_file() {
            return Err(Error::ReadFailed {
                path: script.to_path_buf(),
                error: std::io::Error::new(std::io::ErrorKind::NotFound, "script not found"),
            });
        }
        let source_dir = match script.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tracing::debug!("staging {} into {RUN_DIR}", source_dir.display());
        self.engine
            .copy_in(handle, &source_dir, RUN_DIR)
            .await
            .map_err(|source| Error::Engine {
                operation: format!("Copying {}", source_dir.display()),
                source,
            })?;
        Ok(StagedScript {
            dir: RUN_DIR.to_string(),
            path: format!("{RUN_DIR}/{file_name}"),
        })
    }

    /// Copy a host directory into the context's working directory.
    pub async fn stage_workdir(&self, handle: &ContainerHandle, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Err(Error::ReadFailed {
                path: dir.to_path_buf(),
                error: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            });
        }
        self.engine
            .copy_in(handle, dir, &self.container_dir)
            .await
            .map_err(|source| Error::Engine {
                operation: format!("Copying {}", dir.display()),
                source,
            })
    }

    /// Build `source_dir` inside the environment's context and collect the
    /// artifacts into `output_dir`.
    ///
    /// Build output is passed to `on_output` as it is produced.
    pub async fn build_invoke(
        &self,
        record: &EnvironmentRecord,
        source_dir: &Path,
        output_dir: &Path,
        cancel: CancelToken,
        timeout: Option<Duration>,
        on_output: &mut (dyn FnMut(&OutputChunk) + Send),
    ) -> Result<BuildReport> {
        let handle = record.container.as_ref().ok_or_else(|| Error::NotActive {
            name: record.name.clone(),
            state: record.state,
        })?;
        if !source_dir.is_dir() {
            return Err(Error::ReadFailed {
                path: source_dir.to_path_buf(),
                error: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "source directory not found",
                ),
            });
        }
        let engine_error = |operation: &str| {
            let operation = operation.to_string();
            move |source| Error::Engine { operation, source }
        };

        let work_dir = format!("{BUILD_ROOT}/src");
        let operation = format!("Preparing build in '{}'", record.name);
        run_guarded(&operation, &cancel, timeout, async {
            let reset = ExecRequest::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("rm -rf {BUILD_ROOT} && mkdir -p {work_dir}"),
            ]);
            let process = self
                .engine
                .exec(handle, &reset)
                .await
                .map_err(engine_error(&operation))?;
            let (code, output) = run_to_completion(process, DIAGNOSTIC_LINES)
                .await
                .map_err(engine_error(&operation))?;
            if code != 0 {
                return Err(Error::Engine {
                    operation: operation.clone(),
                    source: EngineError::new(output),
                });
            }
            self.engine
                .copy_in(handle, source_dir, &work_dir)
                .await
                .map_err(engine_error(&operation))
        })
        .await?;

        let recipe = record.language.build_recipe();
        tracing::info!("Building {} in '{}'", source_dir.display(), record.name);
        let request = ExecRequest::new(recipe.argv.clone()).in_dir(work_dir.as_str());
        let mut stream = self.exec(handle, &request, cancel, timeout).await?;

        let mut output = OutputTail::new(DIAGNOSTIC_LINES);
        while let Some(chunk) = stream.next().await {
            on_output(&chunk);
            output.push(chunk.text());
        }
        let operation = format!("Build in '{}'", record.name);
        match stream.finish().await? {
            ExecStatus::Exited(0) => {}
            ExecStatus::Exited(code) => {
                return Err(Error::BuildFailed {
                    name: record.name.clone(),
                    code,
                    diagnostic: output.render(),
                });
            }
            ExecStatus::Cancelled => return Err(Error::Cancelled { operation }),
            ExecStatus::TimedOut => {
                return Err(Error::Timeout {
                    operation,
                    after: timeout.unwrap_or_default(),
                });
            }
        }

        let artifact_dir = format!("{work_dir}/{}", recipe.artifact_dir);
        self.engine
            .copy_out(handle, &artifact_dir, output_dir)
            .await
            .map_err(engine_error("Collecting build artifacts"))?;

        let mut artifacts = Vec::new();
        for entry in std::fs::read_dir(output_dir).map_err(|error| Error::ReadFailed {
            path: output_dir.to_path_buf(),
            error,
        })? {
            artifacts.push(entry?.path());
        }
        artifacts.sort();
        Ok(BuildReport {
            output_dir: output_dir.to_path_buf(),
            artifacts,
        })
    }
}
