// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! kosher - Language Environment Manager CLI

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kosher::{CancelToken, Config, Orchestrator};
use miette::Result;

mod cmd_activate;
mod cmd_build;
mod cmd_create;
mod cmd_deactivate;
mod cmd_delete;
mod cmd_inspect;
mod cmd_list;
mod cmd_run;
mod cmd_shell;
mod exit;

use cmd_activate::CmdActivate;
use cmd_build::CmdBuild;
use cmd_create::CmdCreate;
use cmd_deactivate::CmdDeactivate;
use cmd_delete::CmdDelete;
use cmd_inspect::CmdInspect;
use cmd_list::CmdList;
use cmd_run::CmdRun;
use cmd_shell::CmdShell;

#[cfg(test)]
#[path = "./cli_test.rs"]
mod cli_test;

#[derive(Parser)]
#[clap(
    name = "kosher",
    about = "Language Environment Manager",
    version,
    long_about = "Create, activate and run commands in named, version-pinned language environments"
)]
struct Opt {
    #[clap(flatten)]
    logging: Logging,

    /// Directory holding environment records and config.yaml [default: ~/.kosher]
    #[clap(long, env = "KOSHER_ROOT", global = true)]
    root: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Parser)]
struct Logging {
    /// Increase verbosity (-v, -vv, -vvv)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[clap(short, long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Declare and provision a new environment
    Create(CmdCreate),

    /// Make an environment active
    Activate(CmdActivate),

    /// Return an active environment to ready
    Deactivate(CmdDeactivate),

    /// Run code, a script or a command in an active environment
    Run(CmdRun),

    /// Build a project inside an active environment
    Build(CmdBuild),

    /// Enter an interactive shell in an active environment
    Shell(CmdShell),

    /// Remove an environment and its container
    Delete(CmdDelete),

    /// List environments
    #[clap(visible_alias = "ls")]
    List(CmdList),

    /// Show the full record of an environment
    Inspect(CmdInspect),
}

impl Command {
    async fn run(self, orchestrator: &Orchestrator, cancel: CancelToken) -> Result<i32> {
        match self {
            Command::Create(mut cmd) => cmd.run(orchestrator, cancel).await,
            Command::Activate(mut cmd) => cmd.run(orchestrator, cancel).await,
            Command::Deactivate(mut cmd) => cmd.run(orchestrator).await,
            Command::Run(mut cmd) => cmd.run(orchestrator, cancel).await,
            Command::Build(mut cmd) => cmd.run(orchestrator, cancel).await,
            Command::Shell(mut cmd) => cmd.run(orchestrator).await,
            Command::Delete(mut cmd) => cmd.run(orchestrator, cancel).await,
            Command::List(mut cmd) => cmd.run(orchestrator),
            Command::Inspect(mut cmd) => cmd.run(orchestrator),
        }
    }
}

impl Opt {
    async fn run(self) -> Result<i32> {
        // Setup logging
        let log_level = match (self.logging.quiet, self.logging.verbose) {
            (true, _) => tracing::Level::ERROR,
            (false, 0) => tracing::Level::WARN,
            (false, 1) => tracing::Level::INFO,
            (false, 2) => tracing::Level::DEBUG,
            (false, _) => tracing::Level::TRACE,
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .init();

        let config = match &self.root {
            Some(root) => Config::load_from(root)?,
            None => Config::load()?,
        };
        tracing::debug!("using state in {}", config.root.display());
        let orchestrator = Orchestrator::from_config(config)?;

        self.cmd.run(&orchestrator, interrupt_token()).await
    }
}

/// A token cancelled on the first Ctrl-C.
fn interrupt_token() -> CancelToken {
    let token = CancelToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();
    let code = match opt.run().await {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            exit::for_report(&report)
        }
    };
    std::process::exit(code);
}
