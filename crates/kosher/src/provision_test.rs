// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use tempfile::TempDir;

use crate::Error;
use crate::cancel::CancelToken;
use crate::engine::{ContainerEngine, ContextSpec, ENV_LABEL};
use crate::fake::{FakeEngine, FakeExec, FakePackageManager};
use crate::language::Language;
use crate::provision::{BUILD_ROOT, Provisioner};
use crate::record::{EnvState, EnvironmentRecord, FailureStage, RequirementsRef};

struct Fixture {
    engine: Arc<FakeEngine>,
    packages: Arc<FakePackageManager>,
    provisioner: Provisioner,
}

fn fixture() -> Fixture {
    let engine = Arc::new(FakeEngine::new());
    let packages = Arc::new(FakePackageManager::new());
    let provisioner = Provisioner::new(engine.clone(), packages.clone(), "/app");
    Fixture {
        engine,
        packages,
        provisioner,
    }
}

fn record(name: &str, requirements: Option<RequirementsRef>) -> EnvironmentRecord {
    EnvironmentRecord::declare(name, Language::Python, "3.11", requirements)
}

fn inline(packages: &[&str]) -> Option<RequirementsRef> {
    Some(RequirementsRef::Inline(
        packages.iter().map(|p| p.to_string()).collect(),
    ))
}

/// An active record holding a freshly provisioned context.
async fn active(fx: &Fixture, name: &str) -> EnvironmentRecord {
    let mut record = record(name, None);
    let handle = fx
        .provisioner
        .provision(&record, "3.11.9", &CancelToken::new(), None)
        .await
        .unwrap();
    record.state = EnvState::Active;
    record.version = Some("3.11.9".to_string());
    record.container = Some(handle);
    record
}

#[rstest]
#[tokio::test]
async fn test_provision_creates_labelled_running_context() {
    let fx = fixture();
    let record = record("api", inline(&["requests"]));

    let handle = fx
        .provisioner
        .provision(&record, "3.11.9", &CancelToken::new(), None)
        .await
        .unwrap();

    let contexts = fx.engine.contexts();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].handle, handle);
    assert_eq!(contexts[0].image, "python:3.11.9-slim");
    assert_eq!(contexts[0].labels.get(ENV_LABEL).map(String::as_str), Some("api"));
    assert!(fx.engine.is_running(&handle));

    let installs = fx.packages.installs();
    assert_eq!(installs.len(), 1);
    assert_eq!(installs[0].0, handle);
}

#[rstest]
#[tokio::test]
async fn test_create_rejection_leaves_nothing() {
    let fx = fixture();
    fx.engine.fail_create("image not found");

    let failure = fx
        .provisioner
        .provision(&record("api", None), "3.11.9", &CancelToken::new(), None)
        .await
        .unwrap_err();
    assert_eq!(failure.stage, FailureStage::Provision);
    assert!(matches!(failure.error, Error::ProvisionFailed { .. }));
    assert!(failure.teardown.is_none());
    assert!(failure.leaked.is_none());
    assert_eq!(fx.engine.context_count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_start_failure_removes_context() {
    let fx = fixture();
    fx.engine.fail_start("port already allocated");

    let failure = fx
        .provisioner
        .provision(&record("api", None), "3.11.9", &CancelToken::new(), None)
        .await
        .unwrap_err();
    assert_eq!(failure.stage, FailureStage::Provision);
    assert_eq!(fx.engine.created_count(), 1);
    assert_eq!(fx.engine.context_count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_dependency_failure_removes_context() {
    let fx = fixture();
    fx.packages.fail("could not resolve requests==99");

    let failure = fx
        .provisioner
        .provision(
            &record("api", inline(&["requests==99"])),
            "3.11.9",
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(failure.stage, FailureStage::Dependencies);
    assert!(matches!(
        failure.error,
        Error::DependencyInstallFailed { ref cause, .. } if cause.contains("requests==99")
    ));
    assert!(failure.leaked.is_none());
    assert_eq!(fx.engine.context_count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_failed_cleanup_reports_leaked_handle() {
    let fx = fixture();
    fx.packages.fail("boom");
    fx.engine.fail_remove("daemon unreachable");

    let failure = fx
        .provisioner
        .provision(&record("api", inline(&["x"])), "3.11.9", &CancelToken::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(failure.teardown, Some(Error::TeardownFailed { .. })));
    let leaked = failure.leaked.expect("handle of the stuck context");
    assert_eq!(fx.engine.contexts()[0].handle, leaked);
}

#[rstest]
#[tokio::test]
async fn test_cancel_during_create_sweeps_context() {
    let fx = fixture();
    fx.engine.hold_creates();
    let cancel = CancelToken::new();

    let provisioner = fx.provisioner.clone();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            provisioner
                .provision(&record("api", None), "3.11.9", &cancel, None)
                .await
        })
    };
    fx.engine.create_entered().await;
    assert_eq!(fx.engine.context_count(), 1);

    cancel.cancel();
    let failure = task.await.unwrap().unwrap_err();
    assert!(matches!(failure.error, Error::Cancelled { .. }));
    assert!(failure.teardown.is_none());
    assert_eq!(fx.engine.context_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_timeout_during_create_sweeps_context() {
    let fx = fixture();
    fx.engine.hold_creates();

    let failure = fx
        .provisioner
        .provision(
            &record("api", None),
            "3.11.9",
            &CancelToken::new(),
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap_err();
    assert!(matches!(failure.error, Error::Timeout { .. }));
    assert_eq!(fx.engine.context_count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_teardown_is_idempotent() {
    let fx = fixture();
    let record = active(&fx, "api").await;
    let handle = record.container.unwrap();

    fx.provisioner.teardown(&handle, &CancelToken::new()).await.unwrap();
    fx.provisioner.teardown(&handle, &CancelToken::new()).await.unwrap();
    assert_eq!(fx.engine.context_count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_sweep_only_touches_own_label() {
    let fx = fixture();
    for name in ["api", "api", "web"] {
        let spec = ContextSpec::new(name, "python:3.11-slim".to_string(), "/app");
        fx.engine.create_context(&spec).await.unwrap();
    }

    let removed = fx.provisioner.sweep("api", &CancelToken::new()).await.unwrap();
    assert_eq!(removed, 2);
    let remaining = fx.engine.contexts();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].labels.get(ENV_LABEL).map(String::as_str), Some("web"));
}

#[rstest]
#[tokio::test]
async fn test_stage_script_copies_its_directory() {
    let fx = fixture();
    let record = active(&fx, "api").await;
    let tmp = TempDir::new().unwrap();
    let script = tmp.path().join("hello.py");
    std::fs::write(&script, "print('hi')\n").unwrap();

    let staged = fx
        .provisioner
        .stage_script(record.container.as_ref().unwrap(), &script)
        .await
        .unwrap();
    assert_eq!(staged.path, "/kosher/run/hello.py");
    assert_eq!(staged.dir, "/kosher/run");
    assert_eq!(
        fx.engine.copies_in(),
        vec![(tmp.path().to_path_buf(), staged.dir)]
    );
}

#[rstest]
#[tokio::test]
async fn test_stage_missing_script_fails() {
    let fx = fixture();
    let record = active(&fx, "api").await;
    let tmp = TempDir::new().unwrap();

    let err = fx
        .provisioner
        .stage_script(record.container.as_ref().unwrap(), &tmp.path().join("nope.py"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadFailed { .. }), "{err:?}");
    assert!(fx.engine.copies_in().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_build_collects_artifacts_and_streams_output() {
    let fx = fixture();
    let record = active(&fx, "api").await;
    fx.engine.respond(
        ["pip", "wheel"],
        FakeExec::stdout("Successfully built api"),
    );
    fx.engine.set_artifacts(&[("api-0.1.0-py3-none-any.whl", "wheel")]);

    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let out_dir = output.path().join("dist");
    let mut lines = Vec::new();

    let report = fx
        .provisioner
        .build_invoke(
            &record,
            source.path(),
            &out_dir,
            CancelToken::new(),
            None,
            &mut |chunk| lines.push(chunk.text().to_string()),
        )
        .await
        .unwrap();

    assert_eq!(lines, vec!["Successfully built api"]);
    assert!(fx.engine.execs().iter().all(|exec| !exec.stdin));
    assert_eq!(report.output_dir, out_dir);
    assert_eq!(report.artifacts, vec![out_dir.join("api-0.1.0-py3-none-any.whl")]);
    assert!(
        fx.engine
            .copies_in()
            .iter()
            .any(|(src, dest)| src == source.path() && dest == &format!("{BUILD_ROOT}/src"))
    );
}

#[rstest]
#[tokio::test]
async fn test_build_failure_reports_diagnostic() {
    let fx = fixture();
    let record = active(&fx, "api").await;
    fx.engine.respond(
        ["pip", "wheel"],
        FakeExec::failing(2, "error: invalid pyproject.toml"),
    );
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();

    let err = fx
        .provisioner
        .build_invoke(
            &record,
            source.path(),
            output.path(),
            CancelToken::new(),
            None,
            &mut |_| {},
        )
        .await
        .unwrap_err();
    match err {
        Error::BuildFailed {
            code, diagnostic, ..
        } => {
            assert_eq!(code, 2);
            assert!(diagnostic.contains("invalid pyproject.toml"));
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
}

#[rstest]
#[tokio::test]
async fn test_build_diagnostic_keeps_only_the_last_lines() {
    let fx = fixture();
    let record = active(&fx, "api").await;
    fx.engine.respond(
        ["pip", "wheel"],
        FakeExec {
            stdout: (0..500).map(|n| format!("line {n}")).collect(),
            exit_code: 1,
            ..Default::default()
        },
    );
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let mut streamed = 0;

    let err = fx
        .provisioner
        .build_invoke(
            &record,
            source.path(),
            output.path(),
            CancelToken::new(),
            None,
            &mut |_| streamed += 1,
        )
        .await
        .unwrap_err();
    assert_eq!(streamed, 500);
    let Error::BuildFailed { diagnostic, .. } = err else {
        panic!("expected BuildFailed, got {err:?}");
    };
    let lines: Vec<&str> = diagnostic.lines().collect();
    assert_eq!(lines.len(), 40);
    assert_eq!(lines.first(), Some(&"line 460"));
    assert_eq!(lines.last(), Some(&"line 499"));
}

#[rstest]
#[tokio::test]
async fn test_build_requires_source_dir() {
    let fx = fixture();
    let record = active(&fx, "api").await;
    let output = TempDir::new().unwrap();
    let err = fx
        .provisioner
        .build_invoke(
            &record,
            std::path::Path::new("/no/such/project"),
            output.path(),
            CancelToken::new(),
            None,
            &mut |_| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadFailed { .. }));
}
