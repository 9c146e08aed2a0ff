// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic in-memory collaborators for tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::engine::{
    ContainerEngine, ContextSpec, ENV_LABEL, EngineError, ExecRequest, OutputChunk,
    PackageManager, RemoteProcess, VersionManager,
};
use crate::language::Language;
use crate::record::{ContainerHandle, RequirementsRef};
use crate::version::parse_lenient;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted behavior of a command run in a [`FakeEngine`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeExec {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    /// Keep running after the scripted output until killed.
    pub hang: bool,
}

impl FakeExec {
    pub fn stdout<S: Into<String>>(line: S) -> Self {
        Self {
            stdout: vec![line.into()],
            ..Default::default()
        }
    }

    pub fn failing<S: Into<String>>(exit_code: i32, stderr: S) -> Self {
        Self {
            stderr: vec![stderr.into()],
            exit_code,
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }
}

/// A context held by the [`FakeEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContext {
    pub handle: ContainerHandle,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    contexts: BTreeMap<String, FakeContext>,
    created: usize,
    responses: Vec<(Vec<String>, FakeExec)>,
    execs: Vec<ExecRequest>,
    copies_in: Vec<(PathBuf, String)>,
    artifacts: Vec<(String, String)>,
    fail_create: Option<String>,
    fail_start: Option<String>,
    fail_remove: Option<String>,
}

/// In-memory container engine.
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    kills: Arc<AtomicUsize>,
    gate_creates: AtomicBool,
    create_entered: Notify,
    create_release: Notify,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result of commands whose argv starts with `prefix`.
    ///
    /// Later scripts take precedence over earlier ones.
    pub fn respond<I, S>(&self, prefix: I, exec: FakeExec)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = prefix.into_iter().map(Into::into).collect();
        lock(&self.state).responses.push((prefix, exec));
    }

    /// Files `copy_out` writes into its destination, as `(name, content)`.
    pub fn set_artifacts(&self, files: &[(&str, &str)]) {
        lock(&self.state).artifacts = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.to_string()))
            .collect();
    }

    pub fn fail_create<S: Into<String>>(&self, message: S) {
        lock(&self.state).fail_create = Some(message.into());
    }

    pub fn fail_start<S: Into<String>>(&self, message: S) {
        lock(&self.state).fail_start = Some(message.into());
    }

    pub fn fail_remove<S: Into<String>>(&self, message: S) {
        lock(&self.state).fail_remove = Some(message.into());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.fail_create = None;
        state.fail_start = None;
        state.fail_remove = None;
    }

    /// Make `create_context` block after registering the context until
    /// [`FakeEngine::release_creates`] is called.
    pub fn hold_creates(&self) {
        self.gate_creates.store(true, Ordering::SeqCst);
    }

    pub fn release_creates(&self) {
        self.gate_creates.store(false, Ordering::SeqCst);
        self.create_release.notify_waiters();
    }

    /// Resolves once a held create has registered its context.
    pub async fn create_entered(&self) {
        self.create_entered.notified().await;
    }

    pub fn contexts(&self) -> Vec<FakeContext> {
        lock(&self.state).contexts.values().cloned().collect()
    }

    pub fn context_count(&self) -> usize {
        lock(&self.state).contexts.len()
    }

    /// Total number of contexts ever created.
    pub fn created_count(&self) -> usize {
        lock(&self.state).created
    }

    pub fn is_running(&self, handle: &ContainerHandle) -> bool {
        lock(&self.state)
            .contexts
            .get(&handle.id)
            .is_some_and(|c| c.running)
    }

    pub fn execs(&self) -> Vec<ExecRequest> {
        lock(&self.state).execs.clone()
    }

    pub fn copies_in(&self) -> Vec<(PathBuf, String)> {
        lock(&self.state).copies_in.clone()
    }

    /// Number of processes killed through [`RemoteProcess::kill`].
    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    fn missing(handle: &ContainerHandle) -> EngineError {
        EngineError::new(format!("No such container: {}", handle.id))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_context(&self, spec: &ContextSpec) -> Result<ContainerHandle, EngineError> {
        let handle = {
            let mut state = lock(&self.state);
            if let Some(message) = &state.fail_create {
                return Err(EngineError::new(message.clone()));
            }
            state.created += 1;
            let handle = ContainerHandle {
                id: format!("{:064x}", state.created),
                name: format!("kosher-{}-{}", spec.env_name, state.created),
            };
            state.contexts.insert(
                handle.id.clone(),
                FakeContext {
                    handle: handle.clone(),
                    image: spec.image.clone(),
                    labels: spec.labels.clone(),
                    running: false,
                },
            );
            handle
        };
        if self.gate_creates.load(Ordering::SeqCst) {
            let released = self.create_release.notified();
            self.create_entered.notify_one();
            released.await;
        }
        Ok(handle)
    }

    async fn start_context(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        if let Some(message) = &state.fail_start {
            return Err(EngineError::new(message.clone()));
        }
        let context = state
            .contexts
            .get_mut(&handle.id)
            .ok_or_else(|| Self::missing(handle))?;
        context.running = true;
        Ok(())
    }

    async fn remove_context(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        if let Some(message) = &state.fail_remove {
            return Err(EngineError::new(message.clone()));
        }
        state.contexts.remove(&handle.id);
        Ok(())
    }

    async fn list_contexts(
        &self,
        env_name: Option<&str>,
    ) -> Result<Vec<ContainerHandle>, EngineError> {
        Ok(lock(&self.state)
            .contexts
            .values()
            .filter(|c| match env_name {
                Some(name) => c.labels.get(ENV_LABEL).map(String::as_str) == Some(name),
                None => c.labels.contains_key(ENV_LABEL),
            })
            .map(|c| c.handle.clone())
            .collect())
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Box<dyn RemoteProcess>, EngineError> {
        let mut state = lock(&self.state);
        match state.contexts.get(&handle.id) {
            None => return Err(Self::missing(handle)),
            Some(context) if !context.running => {
                return Err(EngineError::new(format!(
                    "container {} is not running",
                    handle.id
                )));
            }
            Some(_) => {}
        }
        state.execs.push(request.clone());
        let script = state
            .responses
            .iter()
            .rev()
            .find(|(prefix, _)| request.argv.starts_with(prefix))
            .map(|(_, exec)| exec.clone())
            .unwrap_or_default();

        let mut chunks: VecDeque<OutputChunk> = script
            .stdout
            .into_iter()
            .map(OutputChunk::Stdout)
            .collect();
        chunks.extend(script.stderr.into_iter().map(OutputChunk::Stderr));
        Ok(Box::new(FakeProcess {
            chunks,
            exit_code: script.exit_code,
            hang: script.hang,
            kills: Arc::clone(&self.kills),
        }))
    }

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        src: &Path,
        dest: &str,
    ) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        if !state.contexts.contains_key(&handle.id) {
            return Err(Self::missing(handle));
        }
        if !src.exists() {
            return Err(EngineError::new(format!(
                "no such file or directory: {}",
                src.display()
            )));
        }
        state.copies_in.push((src.to_path_buf(), dest.to_string()));
        Ok(())
    }

    async fn copy_out(
        &self,
        handle: &ContainerHandle,
        _src: &str,
        dest: &Path,
    ) -> Result<(), EngineError> {
        let artifacts = {
            let state = lock(&self.state);
            if !state.contexts.contains_key(&handle.id) {
                return Err(Self::missing(handle));
            }
            state.artifacts.clone()
        };
        let io = |e: std::io::Error| EngineError::new(e.to_string());
        std::fs::create_dir_all(dest).map_err(io)?;
        for (name, content) in artifacts {
            std::fs::write(dest.join(name), content).map_err(io)?;
        }
        Ok(())
    }
}

struct FakeProcess {
    chunks: VecDeque<OutputChunk>,
    exit_code: i32,
    hang: bool,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteProcess for FakeProcess {
    async fn next_chunk(&mut self) -> Option<OutputChunk> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Some(chunk);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn wait(&mut self) -> Result<i32, EngineError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn kill(&mut self) -> Result<(), EngineError> {
        self.hang = false;
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory runtime version manager.
#[derive(Debug, Default)]
pub struct FakeVersionManager {
    installed: Mutex<BTreeMap<Language, Vec<String>>>,
    installs: Mutex<Vec<(Language, String)>>,
    releases: Mutex<BTreeMap<(Language, String), String>>,
    fail_install: Mutex<Option<String>>,
    hang_install: AtomicBool,
}

impl FakeVersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager with `versions` already installed for `language`.
    pub fn with_installed(language: Language, versions: &[&str]) -> Self {
        let manager = Self::default();
        manager.add_installed(language, versions);
        manager
    }

    pub fn add_installed(&self, language: Language, versions: &[&str]) {
        lock(&self.installed)
            .entry(language)
            .or_default()
            .extend(versions.iter().map(|v| v.to_string()));
    }

    /// Make installing `requested` yield the concrete `version`.
    ///
    /// Without a release, a partial request is padded with zeros.
    pub fn release(&self, language: Language, requested: &str, version: &str) {
        lock(&self.releases).insert((language, requested.to_string()), version.to_string());
    }

    pub fn fail_install<S: Into<String>>(&self, message: S) {
        *lock(&self.fail_install) = Some(message.into());
    }

    /// Make every install block until cancelled.
    pub fn hang_install(&self) {
        self.hang_install.store(true, Ordering::SeqCst);
    }

    /// Versions requested from `install`, in order.
    pub fn installs(&self) -> Vec<(Language, String)> {
        lock(&self.installs).clone()
    }
}

#[async_trait]
impl VersionManager for FakeVersionManager {
    async fn list_installed(&self, language: Language) -> Result<Vec<String>, EngineError> {
        Ok(lock(&self.installed)
            .get(&language)
            .cloned()
            .unwrap_or_default())
    }

    async fn install(&self, language: Language, version: &str) -> Result<String, EngineError> {
        lock(&self.installs).push((language, version.to_string()));
        if self.hang_install.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failure = lock(&self.fail_install).clone();
        if let Some(message) = failure {
            return Err(EngineError::new(message));
        }
        let release = lock(&self.releases)
            .get(&(language, version.to_string()))
            .cloned();
        let concrete = match release {
            Some(concrete) => concrete,
            None => parse_lenient(version)
                .ok_or_else(|| EngineError::new(format!("no release of {language} {version}")))?
                .to_string(),
        };
        self.add_installed(language, &[concrete.as_str()]);
        Ok(concrete)
    }
}

/// In-memory package manager.
#[derive(Debug, Default)]
pub struct FakePackageManager {
    installs: Mutex<Vec<(ContainerHandle, Language, RequirementsRef)>>,
    fail: Mutex<Option<String>>,
}

impl FakePackageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail<S: Into<String>>(&self, message: S) {
        *lock(&self.fail) = Some(message.into());
    }

    pub fn installs(&self) -> Vec<(ContainerHandle, Language, RequirementsRef)> {
        lock(&self.installs).clone()
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    async fn install_deps(
        &self,
        handle: &ContainerHandle,
        language: Language,
        manifest: &RequirementsRef,
    ) -> Result<(), EngineError> {
        let failure = lock(&self.fail).clone();
        if let Some(message) = failure {
            return Err(EngineError::new(message));
        }
        lock(&self.installs).push((handle.clone(), language, manifest.clone()));
        Ok(())
    }
}
