// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher activate` command.

use clap::Args;
use colored::Colorize;
use kosher::{CancelToken, OperationOptions, Orchestrator};
use miette::Result;

/// Make an environment active
#[derive(Debug, Args)]
pub struct CmdActivate {
    /// Name of the environment
    pub name: String,
}

impl CmdActivate {
    pub async fn run(&mut self, orchestrator: &Orchestrator, cancel: CancelToken) -> Result<i32> {
        let opts = OperationOptions::default().with_cancel(cancel);
        let record = orchestrator.activate(&self.name, opts).await?;
        println!(
            "{} {} ({} {})",
            "Activated".green(),
            record.name.bold(),
            record.language,
            record.display_version()
        );
        Ok(0)
    }
}
