// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Collaborator adapters backed by the `docker` command line client.
//!
//! Runtime versions are container base images (`python:3.11-slim`), so the
//! docker image cache doubles as the version manager: "installed" versions
//! are the locally pulled tags and installing a version pulls its image.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::engine::{
    ContainerEngine, ContextSpec, ENV_LABEL, EngineError, ExecRequest, OutputChunk,
    RemoteProcess, VersionManager,
};
use crate::language::Language;
use crate::record::ContainerHandle;

#[cfg(test)]
#[path = "./docker_test.rs"]
mod docker_test;

/// Prefix of every container name we create.
const CONTAINER_PREFIX: &str = "kosher";

/// Where pid files of exec'd processes are kept inside the container.
const PID_DIR: &str = "/tmp/kosher-exec";

static EXEC_COUNTER: AtomicU64 = AtomicU64::new(0);

/// [`ContainerEngine`] driving `docker` (or a compatible CLI such as podman).
#[derive(Debug, Clone)]
pub struct DockerEngine {
    program: String,
}

impl DockerEngine {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run a docker subcommand to completion and return its stdout.
    async fn docker(&self, args: &[&str]) -> Result<String, EngineError> {
        run_docker(self.command(), &self.program, args).await
    }

    fn create_args(spec: &ContextSpec, container_name: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--workdir".to_string(),
            spec.workdir.clone(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        // Keep the context alive between execs.
        args.extend(["tail", "-f", "/dev/null"].map(String::from));
        args
    }

    fn exec_args(handle: &ContainerHandle, request: &ExecRequest, pid_file: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if request.interactive {
            args.push("--interactive".to_string());
            args.push("--tty".to_string());
        } else if request.stdin {
            args.push("--interactive".to_string());
        }
        if let Some(workdir) = &request.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &request.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(handle.id.clone());
        if request.interactive {
            args.extend(request.argv.iter().cloned());
        } else {
            // Record the pid so an interrupted command can be signalled inside
            // the container; killing the docker client alone leaves it running.
            args.extend(
                [
                    "sh",
                    "-c",
                    "mkdir -p \"$(dirname \"$0\")\" && echo $$ > \"$0\" && exec \"$@\"",
                    pid_file,
                ]
                .map(String::from),
            );
            args.extend(request.argv.iter().cloned());
        }
        args
    }
}

async fn run_docker(mut cmd: Command, program: &str, args: &[&str]) -> Result<String, EngineError> {
    tracing::debug!("{program} {}", args.join(" "));
    let output = cmd
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::new(format!("failed to run {program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::new(format!(
            "{program} {} exited with {}: {}",
            args.first().copied().unwrap_or_default(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn is_missing_container(err: &EngineError) -> bool {
    err.message.contains("No such container")
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_context(&self, spec: &ContextSpec) -> Result<ContainerHandle, EngineError> {
        let container_name = format!(
            "{CONTAINER_PREFIX}-{}-{}",
            spec.env_name,
            chrono::Utc::now().timestamp_millis()
        );
        let args = Self::create_args(spec, &container_name);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.docker(&args).await?;
        tracing::debug!("created container {container_name} ({id})");
        Ok(ContainerHandle {
            id,
            name: container_name,
        })
    }

    async fn start_context(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        self.docker(&["start", &handle.id]).await.map(|_| ())
    }

    async fn remove_context(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        match self.docker(&["rm", "--force", &handle.id]).await {
            Ok(_) => Ok(()),
            Err(err) if is_missing_container(&err) => {
                tracing::debug!("container {handle} already removed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn list_contexts(
        &self,
        env_name: Option<&str>,
    ) -> Result<Vec<ContainerHandle>, EngineError> {
        let filter = match env_name {
            Some(name) => format!("label={ENV_LABEL}={name}"),
            None => format!("label={ENV_LABEL}"),
        };
        let listing = self
            .docker(&[
                "ps",
                "--all",
                "--no-trunc",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}",
            ])
            .await?;
        Ok(listing
            .lines()
            .filter_map(|line| {
                let (id, name) = line.split_once('\t')?;
                Some(ContainerHandle {
                    id: id.trim().to_string(),
                    name: name.trim().to_string(),
                })
            })
            .collect())
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Box<dyn RemoteProcess>, EngineError> {
        let pid_file = format!(
            "{PID_DIR}/{}-{}.pid",
            std::process::id(),
            EXEC_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let args = Self::exec_args(handle, request, &pid_file);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).kill_on_drop(true);
        if request.interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            let stdin = if request.stdin {
                Stdio::inherit()
            } else {
                Stdio::null()
            };
            cmd.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        tracing::debug!("{} {}", self.program, args.join(" "));
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::new(format!("failed to run {}: {e}", self.program)))?;

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        Ok(Box::new(DockerProcess {
            engine: self.clone(),
            container: handle.id.clone(),
            pid_file: (!request.interactive).then_some(pid_file),
            child,
            stdout,
            stderr,
        }))
    }

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        src: &Path,
        dest: &str,
    ) -> Result<(), EngineError> {
        let parent = dest.rsplit_once('/').map(|(p, _)| p).unwrap_or_default();
        if !parent.is_empty() {
            self.docker(&["exec", &handle.id, "mkdir", "-p", parent])
                .await?;
        }
        // A trailing `/.` copies directory contents rather than the directory.
        let src = if src.is_dir() {
            format!("{}/.", src.display())
        } else {
            src.display().to_string()
        };
        let target = format!("{}:{dest}", handle.id);
        self.docker(&["cp", &src, &target]).await.map(|_| ())
    }

    async fn copy_out(
        &self,
        handle: &ContainerHandle,
        src: &str,
        dest: &Path,
    ) -> Result<(), EngineError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::new(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let source = format!("{}:{}/.", handle.id, src.trim_end_matches('/'));
        let dest = dest.display().to_string();
        self.docker(&["cp", &source, &dest]).await.map(|_| ())
    }
}

/// A `docker exec` client process.
struct DockerProcess {
    engine: DockerEngine,
    container: String,
    pid_file: Option<String>,
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

enum ReadEvent {
    Stdout(std::io::Result<Option<String>>),
    Stderr(std::io::Result<Option<String>>),
}

#[async_trait]
impl RemoteProcess for DockerProcess {
    async fn next_chunk(&mut self) -> Option<OutputChunk> {
        loop {
            let event = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return None,
                (Some(out), None) => ReadEvent::Stdout(out.next_line().await),
                (None, Some(err)) => ReadEvent::Stderr(err.next_line().await),
                (Some(out), Some(err)) => tokio::select! {
                    line = out.next_line() => ReadEvent::Stdout(line),
                    line = err.next_line() => ReadEvent::Stderr(line),
                },
            };
            match event {
                ReadEvent::Stdout(Ok(Some(line))) => return Some(OutputChunk::Stdout(line)),
                ReadEvent::Stderr(Ok(Some(line))) => return Some(OutputChunk::Stderr(line)),
                ReadEvent::Stdout(result) => {
                    if let Err(e) = result {
                        tracing::error!("Error reading stdout: {e}");
                    }
                    self.stdout = None;
                }
                ReadEvent::Stderr(result) => {
                    if let Err(e) = result {
                        tracing::error!("Error reading stderr: {e}");
                    }
                    self.stderr = None;
                }
            }
        }
    }

    async fn wait(&mut self) -> Result<i32, EngineError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| EngineError::new(format!("failed to wait for docker exec: {e}")))?;
        if let Some(pid_file) = &self.pid_file {
            if let Err(err) = self
                .engine
                .docker(&["exec", &self.container, "rm", "-f", pid_file])
                .await
            {
                tracing::debug!("Failed to remove {pid_file} in {}: {err}", self.container);
            }
        }
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<(), EngineError> {
        if let Some(pid_file) = &self.pid_file {
            let script = format!("kill -TERM \"$(cat '{pid_file}')\" && rm -f '{pid_file}'");
            if let Err(err) = self
                .engine
                .docker(&["exec", &self.container, "sh", "-c", &script])
                .await
            {
                tracing::warn!("Failed to signal process in {}: {err}", self.container);
            }
        }
        self.child
            .kill()
            .await
            .map_err(|e| EngineError::new(format!("failed to stop docker exec: {e}")))
    }
}

/// [`VersionManager`] over locally pulled base images.
#[derive(Debug, Clone)]
pub struct DockerImages {
    engine: DockerEngine,
}

impl DockerImages {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            engine: DockerEngine::new(program),
        }
    }
}

#[async_trait]
impl VersionManager for DockerImages {
    async fn list_installed(&self, language: Language) -> Result<Vec<String>, EngineError> {
        let tags = self
            .engine
            .docker(&[
                "image",
                "ls",
                language.image_repository(),
                "--format",
                "{{.Tag}}",
            ])
            .await?;
        Ok(tags
            .lines()
            .filter_map(|tag| language.version_from_tag(tag.trim()))
            .collect())
    }

    async fn install(&self, language: Language, version: &str) -> Result<String, EngineError> {
        let image = language.image_for(version);
        tracing::info!("Pulling {image}");
        self.engine.docker(&["pull", &image]).await?;

        let env = self
            .engine
            .docker(&[
                "image",
                "inspect",
                &image,
                "--format",
                "{{range .Config.Env}}{{println .}}{{end}}",
            ])
            .await?;
        let concrete = concrete_version_from_env(language, &env).ok_or_else(|| {
            EngineError::new(format!(
                "{image} does not report a concrete {} version",
                language.version_env_var()
            ))
        })?;

        // Pin the pulled image under its exact tag so it can be provisioned
        // and listed by concrete version later.
        let pinned = language.image_for(&concrete);
        if pinned != image {
            self.engine.docker(&["tag", &image, &pinned]).await?;
        }
        tracing::debug!("{image} is {language} {concrete}");
        Ok(concrete)
    }
}

/// Find the concrete runtime version in `KEY=value` lines of an image's
/// environment.
fn concrete_version_from_env(language: Language, env: &str) -> Option<String> {
    let key = language.version_env_var();
    env.lines()
        .filter_map(|line| line.trim().split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| crate::version::parse_concrete(value).is_some())
}
