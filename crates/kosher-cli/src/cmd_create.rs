// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher create` command.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use colored::Colorize;
use kosher::{CancelToken, CreateRequest, Language, OperationOptions, Orchestrator, RequirementsRef};
use miette::{IntoDiagnostic, Result};

/// Declare and provision a new environment
#[derive(Debug, Args)]
pub struct CmdCreate {
    /// Name of the new environment
    pub name: String,

    /// Language runtime: python, node or ruby
    #[clap(short, long)]
    pub language: Language,

    /// Runtime version: exact (3.11.4), partial (3.11) or range (>=3.10)
    ///
    /// Defaults to the configured version for the language.
    #[clap(short, long)]
    pub version: Option<String>,

    /// Dependency manifest to install (requirements.txt, package.json, Gemfile)
    #[clap(short, long, conflicts_with = "packages")]
    pub requirements: Option<PathBuf>,

    /// Package to install, may be repeated
    #[clap(short = 'p', long = "package")]
    pub packages: Vec<String>,

    /// Give up after this many seconds per provisioning step
    #[clap(long)]
    pub timeout: Option<u64>,
}

impl CmdCreate {
    pub async fn run(&mut self, orchestrator: &Orchestrator, cancel: CancelToken) -> Result<i32> {
        let mut request = CreateRequest::new(self.name.clone(), self.language);
        if let Some(version) = &self.version {
            request = request.with_version(version.clone());
        }
        if let Some(path) = &self.requirements {
            let path = std::path::absolute(path).into_diagnostic()?;
            request = request.with_requirements(RequirementsRef::File(path));
        } else if !self.packages.is_empty() {
            request = request.with_requirements(RequirementsRef::Inline(self.packages.clone()));
        }

        let mut opts = OperationOptions::default().with_cancel(cancel);
        if let Some(secs) = self.timeout {
            opts = opts.with_timeout(Duration::from_secs(secs));
        }

        let record = orchestrator.create(request, opts).await?;
        println!(
            "{} {} ({} {})",
            "Created".green(),
            record.name.bold(),
            record.language,
            record.display_version()
        );
        println!(
            "{}",
            format!("Activate it with 'kosher activate {}'", record.name).dimmed()
        );
        Ok(0)
    }
}
