// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher deactivate` command.

use clap::Args;
use colored::Colorize;
use kosher::Orchestrator;
use miette::Result;

/// Return an active environment to ready
#[derive(Debug, Args)]
pub struct CmdDeactivate {
    /// Name of the environment
    pub name: String,
}

impl CmdDeactivate {
    pub async fn run(&mut self, orchestrator: &Orchestrator) -> Result<i32> {
        let record = orchestrator.deactivate(&self.name).await?;
        println!("{} {}", "Deactivated".yellow(), record.name.bold());
        Ok(0)
    }
}
