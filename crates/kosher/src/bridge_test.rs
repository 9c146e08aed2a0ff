// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use futures::StreamExt;
use rstest::rstest;

use crate::bridge::{ExecStatus, stream};
use crate::cancel::CancelToken;
use crate::engine::{ContainerEngine, ContextSpec, ExecRequest, OutputChunk, RemoteProcess};
use crate::fake::{FakeEngine, FakeExec};
use crate::record::ContainerHandle;

async fn running_context(engine: &FakeEngine) -> ContainerHandle {
    let spec = ContextSpec::new("bridge", "python:3.11-slim".to_string(), "/app");
    let handle = engine.create_context(&spec).await.unwrap();
    engine.start_context(&handle).await.unwrap();
    handle
}

async fn spawn(engine: &FakeEngine, argv: &[&str]) -> Box<dyn RemoteProcess> {
    let handle = running_context(engine).await;
    let request = ExecRequest::new(argv.iter().map(|s| s.to_string()).collect());
    engine.exec(&handle, &request).await.unwrap()
}

#[rstest]
#[tokio::test]
async fn test_collect_separates_streams() {
    let engine = FakeEngine::new();
    engine.respond(
        ["python", "-c"],
        FakeExec {
            stdout: vec!["1".to_string(), "2".to_string()],
            stderr: vec!["warning".to_string()],
            exit_code: 0,
            hang: false,
        },
    );
    let process = spawn(&engine, &["python", "-c", "print(1); print(2)"]).await;

    let output = stream(process, CancelToken::new(), None)
        .collect()
        .await
        .unwrap();
    assert_eq!(output.status, ExecStatus::Exited(0));
    assert!(output.status.success());
    assert_eq!(output.stdout, "1\n2\n");
    assert_eq!(output.stderr, "warning\n");
}

#[rstest]
#[tokio::test]
async fn test_exit_code_is_reported() {
    let engine = FakeEngine::new();
    engine.respond(["false"], FakeExec::failing(3, "nope"));
    let process = spawn(&engine, &["false"]).await;

    let status = stream(process, CancelToken::new(), None)
        .finish()
        .await
        .unwrap();
    assert_eq!(status, ExecStatus::Exited(3));
    assert_eq!(status.code(), Some(3));
}

#[rstest]
#[tokio::test]
async fn test_output_is_streamed_in_order() {
    let engine = FakeEngine::new();
    engine.respond(
        ["seq"],
        FakeExec {
            stdout: (1..=5).map(|i| i.to_string()).collect(),
            ..Default::default()
        },
    );
    let process = spawn(&engine, &["seq", "5"]).await;

    let mut exec = stream(process, CancelToken::new(), None);
    let mut seen = Vec::new();
    while let Some(chunk) = exec.next().await {
        seen.push(chunk);
    }
    assert_eq!(
        seen,
        (1..=5)
            .map(|i| OutputChunk::Stdout(i.to_string()))
            .collect::<Vec<_>>()
    );
    assert_eq!(exec.finish().await.unwrap(), ExecStatus::Exited(0));
}

#[rstest]
#[tokio::test]
async fn test_cancel_kills_process() {
    let engine = FakeEngine::new();
    engine.respond(
        ["sleep"],
        FakeExec {
            stdout: vec!["started".to_string()],
            hang: true,
            ..Default::default()
        },
    );
    let process = spawn(&engine, &["sleep", "infinity"]).await;

    let mut exec = stream(process, CancelToken::new(), None);
    assert_eq!(
        exec.next().await,
        Some(OutputChunk::Stdout("started".to_string()))
    );
    exec.cancel();

    let status = tokio::time::timeout(Duration::from_secs(5), exec.finish())
        .await
        .expect("cancelled process should finish")
        .unwrap();
    assert_eq!(status, ExecStatus::Cancelled);
    assert_eq!(status.code(), None);
    assert_eq!(engine.kill_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_timeout_kills_process() {
    let engine = FakeEngine::new();
    engine.respond(["sleep"], FakeExec::hanging());
    let process = spawn(&engine, &["sleep", "infinity"]).await;

    let cancel = CancelToken::new();
    let status = stream(process, cancel.clone(), Some(Duration::from_secs(10)))
        .finish()
        .await
        .unwrap();
    assert_eq!(status, ExecStatus::TimedOut);
    assert_eq!(engine.kill_count(), 1);
    assert!(!cancel.is_cancelled(), "a timeout does not cancel the caller");
}

#[rstest]
#[tokio::test]
async fn test_parent_cancellation_reaches_stream() {
    let engine = FakeEngine::new();
    engine.respond(["sleep"], FakeExec::hanging());
    let process = spawn(&engine, &["sleep", "infinity"]).await;

    let parent = CancelToken::new();
    let exec = stream(process, parent.child(), None);
    parent.cancel();
    let status = tokio::time::timeout(Duration::from_secs(5), exec.finish())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, ExecStatus::Cancelled);
}

#[rstest]
#[tokio::test]
async fn test_stream_debug_shows_cancellation() {
    let engine = FakeEngine::new();
    engine.respond(["sleep"], FakeExec::hanging());
    let process = spawn(&engine, &["sleep", "infinity"]).await;
    let exec = stream(process, CancelToken::new(), None);

    assert_eq!(format!("{exec:?}"), "ExecStream { cancelled: false, .. }");
    exec.cancel();
    assert_eq!(format!("{exec:?}"), "ExecStream { cancelled: true, .. }");
    assert_eq!(exec.finish().await.unwrap(), ExecStatus::Cancelled);
}
