// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use kosher::fake::{FakeEngine, FakeExec, FakePackageManager, FakeVersionManager};
use kosher::{
    CancelToken, Config, EnvState, Error, ExecStatus, FailureStage, Language, MemoryRegistry,
    Orchestrator,
};
use rstest::rstest;
use tempfile::TempDir;

use super::{Command, Opt};
use crate::cmd_list::Format;
use crate::exit;

fn parse(args: &[&str]) -> Command {
    let argv = std::iter::once("kosher").chain(args.iter().copied());
    Opt::try_parse_from(argv).unwrap().cmd
}

fn parse_fails(args: &[&str]) -> bool {
    let argv = std::iter::once("kosher").chain(args.iter().copied());
    Opt::try_parse_from(argv).is_err()
}

struct Fixture {
    engine: Arc<FakeEngine>,
    packages: Arc<FakePackageManager>,
    orchestrator: Orchestrator,
}

fn fixture() -> Fixture {
    let engine = Arc::new(FakeEngine::new());
    let versions = Arc::new(FakeVersionManager::with_installed(
        Language::Python,
        &["3.10.14", "3.11.9"],
    ));
    let packages = Arc::new(FakePackageManager::new());
    let orchestrator = Orchestrator::new(
        Arc::new(MemoryRegistry::new()),
        engine.clone(),
        versions,
        packages.clone(),
        Config::default(),
    );
    Fixture {
        engine,
        packages,
        orchestrator,
    }
}

/// Run a command line the way `main` does, returning the exit code.
async fn kosher(fx: &Fixture, args: &[&str]) -> i32 {
    kosher_with(fx, args, CancelToken::new()).await
}

async fn kosher_with(fx: &Fixture, args: &[&str], cancel: CancelToken) -> i32 {
    match parse(args).run(&fx.orchestrator, cancel).await {
        Ok(code) => code,
        Err(report) => exit::for_report(&report),
    }
}

#[rstest]
fn test_cli_definition_is_consistent() {
    Opt::command().debug_assert();
}

#[rstest]
fn test_parse_create() {
    let Command::Create(cmd) = parse(&[
        "create", "api", "-l", "py", "-v", "3.11", "-p", "flask", "-p", "gunicorn",
    ]) else {
        panic!("expected create");
    };
    assert_eq!(cmd.name, "api");
    assert_eq!(cmd.language, Language::Python);
    assert_eq!(cmd.version.as_deref(), Some("3.11"));
    assert_eq!(cmd.packages, ["flask", "gunicorn"]);
    assert!(cmd.requirements.is_none());
}

#[rstest]
#[case(&["create", "api"])]
#[case(&["create", "api", "-l", "cobol"])]
#[case(&["create", "api", "-l", "python", "-r", "requirements.txt", "-p", "flask"])]
#[case(&["run", "api"])]
#[case(&["run", "api", "-c", "print(1)", "main.py"])]
#[case(&["build", "api"])]
#[case(&["list", "--format", "xml"])]
fn test_parse_rejects(#[case] args: &[&str]) {
    assert!(parse_fails(args), "{args:?} should not parse");
}

#[rstest]
fn test_parse_run_forms() {
    let Command::Run(mut cmd) = parse(&["run", "api", "-c", "print(1)"]) else {
        panic!("expected run");
    };
    assert_eq!(cmd.command(), kosher::CommandSpec::Inline("print(1)".into()));

    let Command::Run(mut cmd) = parse(&["run", "api", "main.py", "--timeout", "5"]) else {
        panic!("expected run");
    };
    assert_eq!(cmd.timeout, Some(5));
    assert_eq!(cmd.command(), kosher::CommandSpec::Script("main.py".into()));

    let Command::Run(mut cmd) = parse(&["run", "api", "--", "pip", "list", "-v"]) else {
        panic!("expected run");
    };
    assert_eq!(
        cmd.command(),
        kosher::CommandSpec::Argv(vec!["pip".into(), "list".into(), "-v".into()])
    );
}

#[rstest]
fn test_run_code_naming_a_file_runs_it_as_script() {
    let tmp = TempDir::new().unwrap();
    let script = tmp.path().join("app.py");
    std::fs::write(&script, "print(1)\n").unwrap();
    let path = script.to_str().unwrap();

    let Command::Run(mut cmd) = parse(&["run", "api", "-c", path]) else {
        panic!("expected run");
    };
    assert_eq!(cmd.command(), kosher::CommandSpec::Script(script.clone()));

    let missing = tmp.path().join("gone.py");
    let Command::Run(mut cmd) = parse(&["run", "api", "-c", missing.to_str().unwrap()]) else {
        panic!("expected run");
    };
    assert_eq!(
        cmd.command(),
        kosher::CommandSpec::Inline(missing.to_str().unwrap().into())
    );
}

#[rstest]
fn test_parse_build_defaults() {
    let Command::Build(cmd) = parse(&["build", "api", "-s", "."]) else {
        panic!("expected build");
    };
    assert_eq!(cmd.output, std::path::PathBuf::from("./dist"));
}

#[rstest]
fn test_parse_list_format() {
    let Command::List(cmd) = parse(&["ls", "--format", "json"]) else {
        panic!("expected list");
    };
    assert_eq!(cmd.format, Format::Json);
}

#[rstest]
#[case(Error::DuplicateName("api".into()), 2)]
#[case(
    Error::CreateFailed {
        name: "api".into(),
        stage: FailureStage::Dependencies,
        source: Box::new(Error::DependencyInstallFailed { name: "api".into(), cause: "boom".into() }),
        teardown: None,
    },
    3
)]
#[case(Error::NotFound("api".into()), 4)]
#[case(Error::NotReady { name: "api".into(), state: EnvState::Failed }, 5)]
#[case(Error::NotActive { name: "api".into(), state: EnvState::Ready }, 6)]
#[case(Error::Timeout { operation: "Run".into(), after: Duration::from_secs(1) }, 124)]
#[case(Error::Cancelled { operation: "Run".into() }, 130)]
#[case(Error::BuildFailed { name: "api".into(), code: 2, diagnostic: String::new() }, 2)]
#[case(Error::InvalidName("..".into()), 1)]
fn test_exit_codes(#[case] err: Error, #[case] code: i32) {
    assert_eq!(exit::for_error(&err), code);
    assert_eq!(exit::for_report(&miette::Report::new(err)), code);
}

#[rstest]
fn test_exit_codes_for_status() {
    assert_eq!(exit::for_status(ExecStatus::Exited(0)), 0);
    assert_eq!(exit::for_status(ExecStatus::Exited(42)), 42);
    assert_eq!(exit::for_status(ExecStatus::Cancelled), 130);
    assert_eq!(exit::for_status(ExecStatus::TimedOut), 124);
}

#[rstest]
#[tokio::test]
async fn test_lifecycle_exit_codes() {
    let fx = fixture();
    fx.engine
        .respond(["python", "-c", "print(1)"], FakeExec::stdout("1"));
    fx.engine
        .respond(["python", "-c", "exit(3)"], FakeExec::failing(3, ""));

    assert_eq!(kosher(&fx, &["create", "api", "-l", "python", "-v", "3.11"]).await, 0);
    assert_eq!(kosher(&fx, &["create", "api", "-l", "python"]).await, 2);
    assert_eq!(kosher(&fx, &["run", "api", "-c", "print(1)"]).await, 6);
    assert_eq!(kosher(&fx, &["activate", "api"]).await, 0);
    assert_eq!(kosher(&fx, &["run", "api", "-c", "print(1)"]).await, 0);
    assert_eq!(kosher(&fx, &["run", "api", "-c", "exit(3)"]).await, 3);
    assert_eq!(kosher(&fx, &["list", "--format", "yaml"]).await, 0);
    assert_eq!(kosher(&fx, &["inspect", "api"]).await, 0);
    assert_eq!(kosher(&fx, &["deactivate", "api"]).await, 0);
    assert_eq!(kosher(&fx, &["delete", "api"]).await, 0);
    assert_eq!(kosher(&fx, &["delete", "api"]).await, 0);
    assert_eq!(kosher(&fx, &["inspect", "api"]).await, 4);
    assert_eq!(kosher(&fx, &["activate", "api"]).await, 4);
    assert_eq!(fx.engine.context_count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_run_code_file_stages_its_directory() {
    let fx = fixture();
    let tmp = TempDir::new().unwrap();
    let script = tmp.path().join("app.py");
    std::fs::write(&script, "import helpers\n").unwrap();
    std::fs::write(tmp.path().join("helpers.py"), "").unwrap();

    assert_eq!(kosher(&fx, &["create", "api", "-l", "python"]).await, 0);
    assert_eq!(kosher(&fx, &["activate", "api"]).await, 0);
    assert_eq!(kosher(&fx, &["run", "api", "-c", script.to_str().unwrap()]).await, 0);

    assert_eq!(
        fx.engine.copies_in(),
        vec![(tmp.path().to_path_buf(), "/kosher/run".to_string())]
    );
    let exec = fx.engine.execs().pop().unwrap();
    assert_eq!(exec.argv, vec!["python", "/kosher/run/app.py"]);
}

#[rstest]
fn test_parse_shell_bare() {
    let Command::Shell(cmd) = parse(&["shell", "api", "--bare", "--shell", "bash"]) else {
        panic!("expected shell");
    };
    assert!(cmd.bare);
    assert_eq!(cmd.shell.as_deref(), Some("bash"));
}

#[rstest]
#[tokio::test]
async fn test_failed_create_exit_codes() {
    let fx = fixture();
    fx.packages.fail("no matching distribution");

    assert_eq!(
        kosher(&fx, &["create", "api", "-l", "python", "-p", "nope"]).await,
        3
    );
    assert_eq!(kosher(&fx, &["activate", "api"]).await, 5);
    assert_eq!(kosher(&fx, &["deactivate", "api"]).await, 5);
    assert_eq!(kosher(&fx, &["delete", "api"]).await, 0);
}

#[rstest]
#[tokio::test]
async fn test_cancelled_run_exits_130() {
    let fx = fixture();
    fx.engine.respond(["python", "-c"], FakeExec::hanging());
    assert_eq!(kosher(&fx, &["create", "api", "-l", "python"]).await, 0);
    assert_eq!(kosher(&fx, &["activate", "api"]).await, 0);

    let cancel = CancelToken::new();
    cancel.cancel();
    let code = kosher_with(&fx, &["run", "api", "-c", "while True: pass"], cancel).await;
    assert_eq!(code, 130);
    assert_eq!(
        fx.orchestrator.get("api").unwrap().state,
        EnvState::Active
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_timed_out_run_exits_124() {
    let fx = fixture();
    fx.engine.respond(["python", "-c"], FakeExec::hanging());
    assert_eq!(kosher(&fx, &["create", "api", "-l", "python"]).await, 0);
    assert_eq!(kosher(&fx, &["activate", "api"]).await, 0);

    let code = kosher(&fx, &["run", "api", "--timeout", "2", "-c", "while True: pass"]).await;
    assert_eq!(code, 124);
}

#[rstest]
#[tokio::test]
async fn test_build_exit_codes() {
    let fx = fixture();
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let source = source.path().to_str().unwrap();
    let output = output.path().to_str().unwrap();

    assert_eq!(kosher(&fx, &["create", "api", "-l", "python"]).await, 0);
    assert_eq!(kosher(&fx, &["build", "api", "-s", source, "-o", output]).await, 6);
    assert_eq!(kosher(&fx, &["activate", "api"]).await, 0);

    fx.engine.set_artifacts(&[("api-0.1.0.tar.gz", "sdist")]);
    assert_eq!(kosher(&fx, &["build", "api", "-s", source, "-o", output]).await, 0);

    fx.engine
        .respond(["pip", "wheel"], FakeExec::failing(2, "invalid pyproject.toml"));
    assert_eq!(kosher(&fx, &["build", "api", "-s", source, "-o", output]).await, 2);
}
