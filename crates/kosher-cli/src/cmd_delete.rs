// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher delete` command.

use clap::Args;
use colored::Colorize;
use kosher::{CancelToken, DeleteOutcome, OperationOptions, Orchestrator};
use miette::Result;

/// Remove an environment and its container
#[derive(Debug, Args)]
pub struct CmdDelete {
    /// Name of the environment
    pub name: String,
}

impl CmdDelete {
    pub async fn run(&mut self, orchestrator: &Orchestrator, cancel: CancelToken) -> Result<i32> {
        let opts = OperationOptions::default().with_cancel(cancel);
        match orchestrator.delete(&self.name, opts).await? {
            DeleteOutcome::Deleted => println!("{} {}", "Deleted".red(), self.name.bold()),
            DeleteOutcome::Absent => println!(
                "{}",
                format!("No environment named '{}'", self.name).dimmed()
            ),
        }
        Ok(0)
    }
}
