// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher inspect` command.

use clap::Args;
use colored::Colorize;
use kosher::{EnvironmentRecord, Orchestrator};
use miette::{IntoDiagnostic, Result};

use crate::cmd_list::{Format, paint};

/// Show the full record of an environment
#[derive(Debug, Args)]
pub struct CmdInspect {
    /// Name of the environment
    pub name: String,

    /// Output format
    #[clap(long, value_enum, default_value_t)]
    pub format: Format,
}

impl CmdInspect {
    pub fn run(&mut self, orchestrator: &Orchestrator) -> Result<i32> {
        let record = orchestrator.get(&self.name)?;
        match self.format {
            Format::Table => show_record(&record),
            Format::Yaml => print!("{}", serde_yaml::to_string(&record).into_diagnostic()?),
            Format::Json => {
                println!("{}", serde_json::to_string_pretty(&record).into_diagnostic()?)
            }
        }
        Ok(0)
    }
}

fn show_record(record: &EnvironmentRecord) {
    let field = |name: &str, value: &dyn std::fmt::Display| {
        println!("  {:<14} {}", format!("{name}:").bold(), value);
    };

    println!("{}", record.name.bold());
    field("state", &paint(record.state, record.state.as_str()));
    field("language", &record.language);
    field("requested", &record.requested_version);
    field("version", &record.version.as_deref().unwrap_or("-"));
    if let Some(requirements) = &record.requirements {
        field("requirements", requirements);
    }
    if let Some(digest) = &record.requirements_digest {
        field("digest", &digest.get(..12).unwrap_or(digest));
    }
    if let Some(handle) = &record.container {
        field("container", handle);
    }
    if let Some(handle) = &record.pending_cleanup {
        field("pending", &handle.to_string().yellow());
    }
    if let Some(failure) = &record.failure {
        field(
            "failed",
            &format!("during {}: {}", failure.stage, failure.message).red(),
        );
    }
    field("created", &record.created_at.to_rfc3339());
    if let Some(at) = record.last_activated_at {
        field("activated", &at.to_rfc3339());
    }
    field("host", &record.host);
    field("revision", &record.revision);
}
