// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Dependency installation inside a provisioned context.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::{
    ContainerEngine, EngineError, ExecRequest, PackageManager, run_to_completion,
};
use crate::language::Language;
use crate::record::{ContainerHandle, RequirementsRef};

#[cfg(test)]
#[path = "./packages_test.rs"]
mod packages_test;

/// Lines of installer output kept in error messages.
const DIAGNOSTIC_LINES: usize = 20;

/// [`PackageManager`] that runs the language's own installer in the context.
pub struct ContainerPackageManager {
    engine: Arc<dyn ContainerEngine>,
    container_dir: String,
}

impl ContainerPackageManager {
    pub fn new<S: Into<String>>(engine: Arc<dyn ContainerEngine>, container_dir: S) -> Self {
        Self {
            engine,
            container_dir: container_dir.into(),
        }
    }

    /// The installer command for `manifest`, copying manifest files in first.
    async fn prepare(
        &self,
        handle: &ContainerHandle,
        language: Language,
        manifest: &RequirementsRef,
    ) -> Result<Vec<String>, EngineError> {
        match manifest {
            RequirementsRef::Inline(packages) => Ok(language.package_install_command(packages)),
            RequirementsRef::File(path) => {
                if !path.is_file() {
                    return Err(EngineError::new(format!(
                        "requirements file not found: {}",
                        path.display()
                    )));
                }
                let dest = format!(
                    "{}/{}",
                    self.container_dir.trim_end_matches('/'),
                    language.manifest_file_name()
                );
                self.engine.copy_in(handle, path, &dest).await?;
                Ok(language.manifest_install_command(&dest))
            }
        }
    }
}

#[async_trait]
impl PackageManager for ContainerPackageManager {
    async fn install_deps(
        &self,
        handle: &ContainerHandle,
        language: Language,
        manifest: &RequirementsRef,
    ) -> Result<(), EngineError> {
        if matches!(manifest, RequirementsRef::Inline(packages) if packages.is_empty()) {
            return Ok(());
        }
        let argv = self.prepare(handle, language, manifest).await?;
        tracing::info!("Installing dependencies from {manifest}");

        let request = ExecRequest::new(argv.clone()).in_dir(self.container_dir.as_str());
        let process = self.engine.exec(handle, &request).await?;
        let (code, output) = run_to_completion(process, DIAGNOSTIC_LINES).await?;
        if code != 0 {
            return Err(EngineError::new(format!(
                "'{}' exited with code {code}\n{}",
                argv.join(" "),
                output
            )));
        }
        Ok(())
    }
}
