// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Maps a declared version spec to a concrete installed runtime version.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::{CancelToken, run_guarded};
use crate::engine::{EngineError, VersionManager};
use crate::language::Language;
use crate::version::VersionSpec;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./resolver_test.rs"]
mod resolver_test;

/// Runtime resolver over a [`VersionManager`].
#[derive(Clone)]
pub struct RuntimeResolver {
    versions: Arc<dyn VersionManager>,
}

impl RuntimeResolver {
    pub fn new(versions: Arc<dyn VersionManager>) -> Self {
        Self { versions }
    }

    /// Resolve `spec` to an installed version, installing it when missing.
    ///
    /// Only exact and partial specs are handed to the installer; a range
    /// with no installed match fails with [`Error::RuntimeUnavailable`].
    pub async fn resolve(
        &self,
        language: Language,
        spec: &VersionSpec,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let operation = format!("Resolving {language} {spec}");
        run_guarded(&operation, cancel, timeout, self.resolve_inner(language, spec)).await
    }

    async fn resolve_inner(&self, language: Language, spec: &VersionSpec) -> Result<String> {
        let unavailable = |cause: String| Error::RuntimeUnavailable {
            language,
            spec: spec.to_string(),
            cause,
        };
        let engine_failure = |err: EngineError| unavailable(err.message);

        let installed = self
            .versions
            .list_installed(language)
            .await
            .map_err(engine_failure)?;
        if let Some(version) = spec.select(&installed) {
            tracing::debug!("{language} {spec} resolved to installed {version}");
            return Ok(version.to_string());
        }

        if !spec.is_installable() {
            return Err(unavailable(format!(
                "no installed version matches and ranges cannot be installed (installed: {})",
                display_list(&installed)
            )));
        }

        tracing::info!("Installing {language} {spec}");
        let version = self
            .versions
            .install(language, spec.as_str())
            .await
            .map_err(engine_failure)?;
        match spec.select(std::slice::from_ref(&version)) {
            Some(version) => {
                tracing::debug!("{language} {spec} resolved to {version} after install");
                Ok(version.to_string())
            }
            None => Err(unavailable(format!(
                "installing {spec} produced {version}, which does not satisfy it"
            ))),
        }
    }
}

fn display_list(versions: &[String]) -> String {
    if versions.is_empty() {
        "none".to_string()
    } else {
        versions.join(", ")
    }
}
