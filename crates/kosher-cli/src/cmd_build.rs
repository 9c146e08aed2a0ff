// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher build` command.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use colored::Colorize;
use kosher::{CancelToken, OperationOptions, Orchestrator, OutputChunk};
use miette::Result;

/// Build a project inside an active environment
#[derive(Debug, Args)]
pub struct CmdBuild {
    /// Name of the environment
    pub name: String,

    /// Project directory to build
    #[clap(short, long)]
    pub source: PathBuf,

    /// Where to copy the built artifacts
    #[clap(short, long, default_value = "./dist")]
    pub output: PathBuf,

    /// Stop the build after this many seconds
    #[clap(long)]
    pub timeout: Option<u64>,
}

impl CmdBuild {
    pub async fn run(&mut self, orchestrator: &Orchestrator, cancel: CancelToken) -> Result<i32> {
        let mut opts = OperationOptions::default().with_cancel(cancel);
        if let Some(secs) = self.timeout {
            opts = opts.with_timeout(Duration::from_secs(secs));
        }

        let report = orchestrator
            .build(&self.name, &self.source, &self.output, opts, |chunk| {
                match chunk {
                    OutputChunk::Stdout(line) => println!("{line}"),
                    OutputChunk::Stderr(line) => eprintln!("{line}"),
                }
            })
            .await?;

        println!();
        println!(
            "{} {} artifact(s) into {}",
            "Built".green(),
            report.artifacts.len(),
            report.output_dir.display().to_string().cyan()
        );
        for artifact in &report.artifacts {
            let file = artifact
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| artifact.display().to_string());
            println!("  {file}");
        }
        Ok(0)
    }
}
