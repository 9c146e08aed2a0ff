// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! The lifecycle orchestrator: the single entry point for every operation
//! on an environment.
//!
//! State changes are written through compare-and-swap on the registry and
//! checked against the transition table in [`crate::record`]. Operations that
//! change an environment's state (`create`, `activate`, `deactivate` and
//! `delete`) are serialized per name; `run`, `build` and reads are not.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::bridge::{ExecStatus, ExecStream, RunOutput};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::docker::{DockerEngine, DockerImages};
use crate::engine::{ContainerEngine, ExecRequest, OutputChunk, PackageManager, VersionManager};
use crate::language::Language;
use crate::packages::ContainerPackageManager;
use crate::provision::{BuildReport, Provisioner};
use crate::record::{
    ContainerHandle, EnvState, EnvironmentRecord, FailureInfo, FailureStage, RequirementsRef,
    validate_name,
};
use crate::registry::{FsRegistry, Registry};
use crate::resolver::RuntimeResolver;
use crate::version::VersionSpec;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./orchestrator_test.rs"]
mod orchestrator_test;

/// Shell started by [`Orchestrator::shell`] when none is given.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Parameters of a new environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub language: Language,
    /// Version spec; the configured default for the language when unset.
    pub version: Option<String>,
    pub requirements: Option<RequirementsRef>,
}

impl CreateRequest {
    pub fn new<S: Into<String>>(name: S, language: Language) -> Self {
        Self {
            name: name.into(),
            language,
            version: None,
            requirements: None,
        }
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_requirements(mut self, requirements: RequirementsRef) -> Self {
        self.requirements = Some(requirements);
        self
    }
}

/// Cancellation and time budget of one operation.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub cancel: CancelToken,
    /// Overrides the configured timeout for the operation.
    pub timeout: Option<Duration>,
}

impl OperationOptions {
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What to run inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Source code evaluated by the language interpreter.
    Inline(String),
    /// A host script, copied into the context and run by the interpreter.
    Script(PathBuf),
    /// A raw command line.
    Argv(Vec<String>),
}

/// Outcome of [`Orchestrator::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// There was nothing to delete.
    Absent,
}

/// Removes a name from the in-flight map when provisioning ends.
struct InFlight<'a> {
    map: &'a DashMap<String, CancelToken>,
    name: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.name);
    }
}

pub struct Orchestrator {
    registry: Arc<dyn Registry>,
    resolver: RuntimeResolver,
    provisioner: Provisioner,
    config: Config,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    in_flight: DashMap<String, CancelToken>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn Registry>,
        engine: Arc<dyn ContainerEngine>,
        versions: Arc<dyn VersionManager>,
        packages: Arc<dyn PackageManager>,
        config: Config,
    ) -> Self {
        let provisioner = Provisioner::new(engine, packages, config.engine.container_dir.as_str())
            .with_teardown_timeout(config.timeouts.teardown());
        Self {
            registry,
            resolver: RuntimeResolver::new(versions),
            provisioner,
            config,
            locks: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// An orchestrator over the file registry and the docker CLI.
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = Arc::new(FsRegistry::open(&config.root)?);
        let engine: Arc<dyn ContainerEngine> =
            Arc::new(DockerEngine::new(config.engine.program.as_str()));
        let versions = Arc::new(DockerImages::new(config.engine.program.as_str()));
        let packages = Arc::new(ContainerPackageManager::new(
            Arc::clone(&engine),
            config.engine.container_dir.as_str(),
        ));
        Ok(Self::new(registry, engine, versions, packages, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.locks.entry(name.to_string()).or_default())
    }

    /// Forget the lock of `name` unless another operation still holds it.
    fn release_name_lock(&self, name: &str) {
        self.locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Registry update, retried when another writer got there first.
    fn update<F>(&self, name: &str, mut mutator: F) -> Result<EnvironmentRecord>
    where
        F: FnMut(&mut EnvironmentRecord) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            match self.registry.update(name, &mut mutator) {
                Err(Error::ConcurrentModification(_))
                    if attempt < self.config.registry.max_cas_retries =>
                {
                    attempt += 1;
                    tracing::debug!("'{name}' changed underneath us, retrying ({attempt})");
                }
                other => return other,
            }
        }
    }

    /// Declare and provision a new environment.
    ///
    /// On failure the environment is left `Failed`, recording the stage, and
    /// [`Error::CreateFailed`] is returned.
    #[tracing::instrument(skip_all, fields(name = %request.name))]
    pub async fn create(
        &self,
        request: CreateRequest,
        opts: OperationOptions,
    ) -> Result<EnvironmentRecord> {
        validate_name(&request.name)?;
        let requested = match &request.version {
            Some(version) => version.clone(),
            None => self.config.default_version(request.language).to_string(),
        };
        let spec: VersionSpec = requested.parse()?;

        let lock = self.name_lock(&request.name);
        let _guard = lock.lock().await;

        let cancel = opts.cancel.child();
        self.in_flight.insert(request.name.clone(), cancel.clone());
        let _in_flight = InFlight {
            map: &self.in_flight,
            name: request.name.clone(),
        };

        let record = EnvironmentRecord::declare(
            &request.name,
            request.language,
            requested,
            request.requirements,
        );
        self.registry.put(record)?;
        tracing::info!("Declared {} environment '{}'", request.language, request.name);

        self.drive_create(&request.name, request.language, &spec, &cancel, opts.timeout)
            .await
    }

    async fn drive_create(
        &self,
        name: &str,
        language: Language,
        spec: &VersionSpec,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<EnvironmentRecord> {
        let record = self.update(name, |r| r.transition(EnvState::Provisioning))?;
        tracing::info!("Provisioning '{name}'");

        let install_timeout = timeout.or(self.config.timeouts.install());
        let version = match self
            .resolver
            .resolve(language, spec, cancel, install_timeout)
            .await
        {
            Ok(version) => version,
            Err(error) => return self.fail_create(name, FailureStage::Resolve, error, None, None),
        };
        tracing::info!("Resolved {language} {spec} to {version}");

        let digest = record.requirements.as_ref().and_then(manifest_digest);
        let record = self.update(name, |r| {
            r.version = Some(version.clone());
            r.requirements_digest = digest.clone();
            Ok(())
        })?;

        let provision_timeout = timeout.or(self.config.timeouts.provision());
        let handle = match self
            .provisioner
            .provision(&record, &version, cancel, provision_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(failure) => {
                return self.fail_create(
                    name,
                    failure.stage,
                    failure.error,
                    failure.teardown,
                    failure.leaked,
                );
            }
        };

        let ready = self.update(name, |r| {
            r.transition(EnvState::Ready)?;
            r.container = Some(handle.clone());
            Ok(())
        });
        match ready {
            Ok(record) => {
                tracing::info!("Environment '{name}' is ready in {handle}");
                Ok(record)
            }
            Err(error) => {
                // The container is unknown to the registry; remove it.
                let (teardown, leaked) =
                    match self.provisioner.teardown(&handle, &CancelToken::new()).await {
                        Ok(()) => (None, None),
                        Err(err) => (Some(err), Some(handle)),
                    };
                self.fail_create(name, FailureStage::Provision, error, teardown, leaked)
            }
        }
    }

    fn fail_create(
        &self,
        name: &str,
        stage: FailureStage,
        error: Error,
        teardown: Option<Error>,
        leaked: Option<ContainerHandle>,
    ) -> Result<EnvironmentRecord> {
        let message = error.to_string();
        let recorded = self.update(name, |r| {
            r.transition(EnvState::Failed)?;
            r.container = None;
            r.pending_cleanup = leaked.clone();
            r.failure = Some(FailureInfo {
                stage,
                message: message.clone(),
            });
            Ok(())
        });
        match recorded {
            Ok(_) => tracing::info!("Environment '{name}' failed during {stage}"),
            Err(err) => tracing::error!("Failed to record failure of '{name}': {err}"),
        }
        Err(Error::CreateFailed {
            name: name.to_string(),
            stage,
            source: Box::new(error),
            teardown: teardown.map(Box::new),
        })
    }

    /// Make an environment the active one, starting its context if needed.
    ///
    /// Activating an already active environment refreshes its timestamp.
    #[tracing::instrument(skip(self, opts))]
    pub async fn activate(&self, name: &str, opts: OperationOptions) -> Result<EnvironmentRecord> {
        // Unknown names never get a lock entry.
        self.registry.get(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let record = self.registry.get(name)?;
        let handle = match (record.state, &record.container) {
            (EnvState::Ready | EnvState::Active, Some(handle)) => handle.clone(),
            (state, _) => {
                return Err(Error::NotReady {
                    name: name.to_string(),
                    state,
                });
            }
        };
        let timeout = opts.timeout.or(self.config.timeouts.provision());
        self.provisioner.start(&handle, &opts.cancel, timeout).await?;

        let now = Utc::now();
        let record = self.update(name, |r| {
            match r.state {
                EnvState::Active => {}
                EnvState::Ready => r.transition(EnvState::Active)?,
                state => {
                    return Err(Error::NotReady {
                        name: r.name.clone(),
                        state,
                    });
                }
            }
            r.last_activated_at = Some(now);
            Ok(())
        })?;
        tracing::info!("Activated '{name}'");
        Ok(record)
    }

    /// Return an active environment to `Ready`. A ready one is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn deactivate(&self, name: &str) -> Result<EnvironmentRecord> {
        self.registry.get(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let record = self.registry.get(name)?;
        match record.state {
            EnvState::Ready => Ok(record),
            EnvState::Active => {
                let record = self.update(name, |r| r.transition(EnvState::Ready))?;
                tracing::info!("Deactivated '{name}'");
                Ok(record)
            }
            state => Err(Error::NotReady {
                name: name.to_string(),
                state,
            }),
        }
    }

    fn active_handle<'a>(&self, record: &'a EnvironmentRecord) -> Result<&'a ContainerHandle> {
        match (record.state, &record.container) {
            (EnvState::Active, Some(handle)) => Ok(handle),
            (state, _) => Err(Error::NotActive {
                name: record.name.clone(),
                state,
            }),
        }
    }

    /// Start a command in an active environment, streaming its output.
    ///
    /// The environment stays active however the command ends.
    #[tracing::instrument(skip(self, opts))]
    pub async fn run(
        &self,
        name: &str,
        command: CommandSpec,
        opts: OperationOptions,
    ) -> Result<ExecStream> {
        let record = self.registry.get(name)?;
        let handle = self.active_handle(&record)?;
        let mut workdir = self.config.engine.container_dir.clone();
        let argv = match command {
            CommandSpec::Inline(code) => record.language.inline_command(&code),
            CommandSpec::Script(path) => {
                let script = self.provisioner.stage_script(handle, &path).await?;
                workdir = script.dir;
                record.language.script_command(&script.path)
            }
            CommandSpec::Argv(argv) => argv,
        };
        tracing::debug!("running {argv:?} in '{name}'");
        let mut request = ExecRequest::new(argv).in_dir(workdir.as_str());
        request.stdin = true;
        let timeout = opts.timeout.or(self.config.timeouts.exec());
        self.provisioner
            .exec(handle, &request, opts.cancel, timeout)
            .await
    }

    /// Run a command and collect all of its output.
    pub async fn run_captured(
        &self,
        name: &str,
        command: CommandSpec,
        opts: OperationOptions,
    ) -> Result<RunOutput> {
        self.run(name, command, opts).await?.collect().await
    }

    /// Build the project in `source_dir` and copy its artifacts to
    /// `output_dir`.
    #[tracing::instrument(skip(self, opts, on_output))]
    pub async fn build<F>(
        &self,
        name: &str,
        source_dir: &Path,
        output_dir: &Path,
        opts: OperationOptions,
        mut on_output: F,
    ) -> Result<BuildReport>
    where
        F: FnMut(&OutputChunk) + Send,
    {
        let record = self.registry.get(name)?;
        self.active_handle(&record)?;
        let timeout = opts.timeout.or(self.config.timeouts.exec());
        let report = self
            .provisioner
            .build_invoke(
                &record,
                source_dir,
                output_dir,
                opts.cancel,
                timeout,
                &mut on_output,
            )
            .await?;
        tracing::info!(
            "Built {} artifact(s) into {}",
            report.artifacts.len(),
            report.output_dir.display()
        );
        Ok(report)
    }

    /// Attach an interactive shell to an active environment.
    ///
    /// When `workspace` is given, its contents are copied into the
    /// environment's working directory first. Returns the shell's exit code.
    #[tracing::instrument(skip(self))]
    pub async fn shell(
        &self,
        name: &str,
        shell: Option<&str>,
        workspace: Option<&Path>,
    ) -> Result<i32> {
        let record = self.registry.get(name)?;
        let handle = self.active_handle(&record)?;
        if let Some(dir) = workspace {
            self.provisioner.stage_workdir(handle, dir).await?;
        }
        let mut request = ExecRequest::new(vec![shell.unwrap_or(DEFAULT_SHELL).to_string()])
            .in_dir(self.config.engine.container_dir.as_str());
        request.interactive = true;
        request
            .env
            .push(("KOSHER_ENV".to_string(), record.name.clone()));

        let stream = self
            .provisioner
            .exec(handle, &request, CancelToken::new(), None)
            .await?;
        match stream.finish().await? {
            ExecStatus::Exited(code) => Ok(code),
            ExecStatus::Cancelled => Err(Error::Cancelled {
                operation: format!("Shell in '{name}'"),
            }),
            ExecStatus::TimedOut => Err(Error::Timeout {
                operation: format!("Shell in '{name}'"),
                after: Duration::default(),
            }),
        }
    }

    /// Remove an environment and every context it owns.
    ///
    /// Deleting a missing environment succeeds. A provision in flight for
    /// the name is cancelled first. If a held context cannot be removed the
    /// record stays `Deleting` so a later delete can retry.
    #[tracing::instrument(skip(self, opts))]
    pub async fn delete(&self, name: &str, opts: OperationOptions) -> Result<DeleteOutcome> {
        validate_name(name)?;
        let in_flight = self.in_flight.get(name).map(|token| token.clone());
        if let Some(token) = in_flight {
            tracing::info!("Cancelling provisioning of '{name}'");
            token.cancel();
        }

        let lock = self.name_lock(name);
        let outcome = {
            let _guard = lock.lock().await;
            self.delete_locked(name, &opts).await
        };
        drop(lock);
        self.release_name_lock(name);
        outcome
    }

    async fn delete_locked(&self, name: &str, opts: &OperationOptions) -> Result<DeleteOutcome> {
        let record = match self.registry.get(name) {
            Ok(record) => record,
            Err(Error::NotFound(_)) => {
                self.sweep_strays(name, &opts.cancel).await;
                return Ok(DeleteOutcome::Absent);
            }
            Err(err) => return Err(err),
        };

        let held: Vec<ContainerHandle> = record
            .container
            .iter()
            .chain(record.pending_cleanup.iter())
            .cloned()
            .collect();
        if record.state != EnvState::Deleting {
            self.update(name, |r| {
                r.transition(EnvState::Deleting)?;
                if let Some(handle) = r.container.take() {
                    r.pending_cleanup = Some(handle);
                }
                Ok(())
            })?;
            tracing::info!("Deleting '{name}'");
        }

        for handle in &held {
            if let Err(err) = self.provisioner.teardown(handle, &opts.cancel).await {
                let pending = handle.clone();
                if let Err(update) = self.update(name, |r| {
                    r.pending_cleanup = Some(pending.clone());
                    Ok(())
                }) {
                    tracing::error!("Failed to record pending cleanup of '{name}': {update}");
                }
                return Err(err);
            }
        }
        self.sweep_strays(name, &opts.cancel).await;

        let record = self.update(name, |r| {
            r.pending_cleanup = None;
            r.transition(EnvState::Deleted)
        })?;
        if let Err(err) = self.registry.remove(name, record.revision) {
            tracing::warn!("Left a tombstone for '{name}': {err}");
        }
        tracing::info!("Deleted '{name}'");
        Ok(DeleteOutcome::Deleted)
    }

    /// Remove unrecorded contexts labelled with `name`; failures only warn.
    async fn sweep_strays(&self, name: &str, cancel: &CancelToken) {
        match self.provisioner.sweep(name, cancel).await {
            Ok(0) => {}
            Ok(count) => tracing::info!("Removed {count} stray container(s) of '{name}'"),
            Err(err) => tracing::warn!("Could not sweep containers of '{name}': {err}"),
        }
    }

    /// All live environments, oldest first.
    pub fn list(&self) -> Result<Vec<EnvironmentRecord>> {
        self.registry.list()?.iter().collect()
    }

    pub fn get(&self, name: &str) -> Result<EnvironmentRecord> {
        self.registry.get(name)
    }
}

/// SHA-256 of a manifest file, for drift reporting.
fn manifest_digest(requirements: &RequirementsRef) -> Option<String> {
    match requirements {
        RequirementsRef::File(path) => {
            let content = std::fs::read(path).ok()?;
            Some(format!("{:x}", Sha256::digest(&content)))
        }
        RequirementsRef::Inline(_) => None,
    }
}
