// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! kosher - reproducible, container-backed developer environments
//!
//! This crate provides the core library for declaring named environments
//! (a language, a runtime version and a set of dependencies) and driving
//! them through their lifecycle against a container engine.
//!
//! # Overview
//!
//! Every environment is described by an [`EnvironmentRecord`] stored in a
//! [`Registry`]. The [`Orchestrator`] is the only component that changes
//! records: it resolves the requested runtime version, provisions an
//! isolated container for it, and mediates activation, command execution,
//! builds and deletion.
//!
//! ```text
//! create -> activate -> run / build -> delete
//!
//! Declared -> Provisioning -> Ready <-> Active -> Deleting -> Deleted
//!                  \-> Failed
//! ```
//!
//! External tools are reached through the traits in [`engine`]; the
//! [`docker`] module implements them on top of the `docker` CLI.
//!
//! # Example
//!
//! ```yaml
//! # ~/.kosher/environments/api.yaml
//! name: api
//! language: python
//! requested_version: "3.11"
//! version: 3.11.9
//! requirements:
//!   file: /home/me/api/requirements.txt
//! state: ready
//! container:
//!   id: 4f1c...
//!   name: kosher-api-1718000000000
//! ```

pub mod bridge;
pub mod cancel;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "fakes"))]
pub mod fake;
pub mod language;
pub mod orchestrator;
pub mod packages;
pub mod provision;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod version;

pub use bridge::{ExecStatus, ExecStream, RunOutput};
pub use cancel::CancelToken;
pub use crate::config::Config;
pub use engine::{ContainerEngine, OutputChunk, PackageManager, VersionManager};
pub use error::{Error, Result};
pub use language::Language;
pub use orchestrator::{CommandSpec, CreateRequest, DeleteOutcome, OperationOptions, Orchestrator};
pub use provision::BuildReport;
pub use record::{ContainerHandle, EnvState, EnvironmentRecord, FailureStage, RequirementsRef};
pub use registry::{FsRegistry, MemoryRegistry, Registry};
pub use version::VersionSpec;
