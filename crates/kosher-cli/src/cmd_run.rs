// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher run` command.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args};
use futures::StreamExt;
use kosher::{CancelToken, CommandSpec, ExecStatus, OperationOptions, Orchestrator, OutputChunk};
use miette::Result;

use crate::exit;

/// Run code, a script or a command in an active environment
#[derive(Debug, Args)]
#[clap(group(ArgGroup::new("command").required(true).args(["code", "script", "argv"])))]
pub struct CmdRun {
    /// Name of the environment
    pub name: String,

    /// Source code for the language interpreter, or a path to a code file
    #[clap(short, long)]
    pub code: Option<String>,

    /// Host script to copy into the environment and run
    pub script: Option<PathBuf>,

    /// Command line to run as is, given after `--`
    #[clap(last = true)]
    pub argv: Vec<String>,

    /// Stop the command after this many seconds
    #[clap(long)]
    pub timeout: Option<u64>,
}

impl CmdRun {
    pub fn command(&mut self) -> CommandSpec {
        if let Some(code) = self.code.take() {
            let path = PathBuf::from(&code);
            if path.is_file() {
                CommandSpec::Script(path)
            } else {
                CommandSpec::Inline(code)
            }
        } else if let Some(script) = self.script.take() {
            CommandSpec::Script(script)
        } else {
            CommandSpec::Argv(std::mem::take(&mut self.argv))
        }
    }

    pub async fn run(&mut self, orchestrator: &Orchestrator, cancel: CancelToken) -> Result<i32> {
        let mut opts = OperationOptions::default().with_cancel(cancel);
        if let Some(secs) = self.timeout {
            opts = opts.with_timeout(Duration::from_secs(secs));
        }

        let command = self.command();
        let mut stream = orchestrator.run(&self.name, command, opts).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                OutputChunk::Stdout(line) => println!("{line}"),
                OutputChunk::Stderr(line) => eprintln!("{line}"),
            }
        }

        let status = stream.finish().await?;
        match status {
            ExecStatus::Exited(_) => {}
            ExecStatus::Cancelled => tracing::warn!("Command in '{}' was cancelled", self.name),
            ExecStatus::TimedOut => tracing::warn!("Command in '{}' timed out", self.name),
        }
        Ok(exit::for_status(status))
    }
}
