// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher shell` command.

use clap::Args;
use kosher::Orchestrator;
use miette::{IntoDiagnostic, Result};

/// Enter an interactive shell in an active environment
#[derive(Debug, Args)]
pub struct CmdShell {
    /// Name of the environment
    pub name: String,

    /// Shell to start inside the container
    #[clap(long)]
    pub shell: Option<String>,

    /// Start in the environment's working directory as is, without copying
    /// the current directory into it
    #[clap(long)]
    pub bare: bool,
}

impl CmdShell {
    pub async fn run(&mut self, orchestrator: &Orchestrator) -> Result<i32> {
        let workspace = if self.bare {
            None
        } else {
            Some(std::env::current_dir().into_diagnostic()?)
        };
        Ok(orchestrator
            .shell(&self.name, self.shell.as_deref(), workspace.as_deref())
            .await?)
    }
}
