// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Process exit codes.

use kosher::{Error, ExecStatus};

pub const FAILURE: i32 = 1;
pub const DUPLICATE_NAME: i32 = 2;
pub const CREATE_FAILED: i32 = 3;
pub const NOT_FOUND: i32 = 4;
pub const NOT_READY: i32 = 5;
pub const NOT_ACTIVE: i32 = 6;
/// Same code `timeout(1)` uses.
pub const TIMED_OUT: i32 = 124;
/// 128 + SIGINT
pub const CANCELLED: i32 = 130;

pub fn for_error(err: &Error) -> i32 {
    match err {
        Error::DuplicateName(_) => DUPLICATE_NAME,
        Error::CreateFailed { .. } => CREATE_FAILED,
        Error::NotFound(_) => NOT_FOUND,
        Error::NotReady { .. } => NOT_READY,
        Error::NotActive { .. } => NOT_ACTIVE,
        Error::Timeout { .. } => TIMED_OUT,
        Error::Cancelled { .. } => CANCELLED,
        Error::BuildFailed { code, .. } if *code != 0 => *code,
        _ => FAILURE,
    }
}

pub fn for_report(report: &miette::Report) -> i32 {
    report
        .downcast_ref::<Error>()
        .map(for_error)
        .unwrap_or(FAILURE)
}

pub fn for_status(status: ExecStatus) -> i32 {
    match status {
        ExecStatus::Exited(code) => code,
        ExecStatus::Cancelled => CANCELLED,
        ExecStatus::TimedOut => TIMED_OUT,
    }
}
