// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Implementation of the `kosher list` command.

use clap::{Args, ValueEnum};
use colored::{ColoredString, Colorize};
use kosher::{EnvState, EnvironmentRecord, Orchestrator};
use miette::{IntoDiagnostic, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    #[default]
    Table,
    Yaml,
    Json,
}

/// List environments
#[derive(Debug, Args)]
pub struct CmdList {
    /// Output format
    #[clap(long, value_enum, default_value_t)]
    pub format: Format,
}

impl CmdList {
    pub fn run(&mut self, orchestrator: &Orchestrator) -> Result<i32> {
        let records = orchestrator.list()?;
        match self.format {
            Format::Table => show_table(&records),
            Format::Yaml => print!("{}", serde_yaml::to_string(&records).into_diagnostic()?),
            Format::Json => {
                println!("{}", serde_json::to_string_pretty(&records).into_diagnostic()?)
            }
        }
        Ok(0)
    }
}

/// `text` colored by the state it describes.
pub fn paint(state: EnvState, text: &str) -> ColoredString {
    match state {
        EnvState::Active => text.green().bold(),
        EnvState::Ready => text.green(),
        EnvState::Failed => text.red(),
        EnvState::Deleting => text.yellow(),
        EnvState::Declared | EnvState::Provisioning => text.cyan(),
        EnvState::Deleted => text.dimmed(),
    }
}

fn show_table(records: &[EnvironmentRecord]) {
    if records.is_empty() {
        println!("{}", "(no environments)".dimmed());
        return;
    }

    let width = records
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or_default()
        .max("NAME".len());
    println!(
        "{}",
        format!(
            "{:<width$}  {:<8}  {:<10}  {:<12}  {}",
            "NAME", "LANGUAGE", "VERSION", "STATE", "CREATED"
        )
        .bold()
    );
    for record in records {
        // Pad before coloring so escape codes do not skew the columns.
        let state = paint(record.state, &format!("{:<12}", record.state.as_str()));
        println!(
            "{:<width$}  {:<8}  {:<10}  {}  {}",
            record.name,
            record.language.as_str(),
            record.display_version(),
            state,
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    println!("Total: {} environment(s)", records.len());
}
