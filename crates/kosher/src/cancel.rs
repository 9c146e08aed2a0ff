// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Cooperative cancellation and timeouts for blocking collaborator calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./cancel_test.rs"]
mod cancel_test;

/// A cloneable cancellation signal.
///
/// Clones share the same signal. A child token is cancelled when either it
/// or any of its ancestors is.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { tx, parent: None }),
        }
    }

    /// A new token that also observes this one.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
    }

    /// Resolves once the token (or an ancestor) is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.inner.tx.subscribe();
            let own = async move {
                // The sender lives as long as `self`, so `changed` cannot fail
                // while we are borrowed.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            };
            match &self.inner.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }
}

/// Run `fut`, giving up when `cancel` fires or `timeout` elapses.
///
/// The future is dropped on interruption, so it must not hold resources that
/// need explicit release; callers that can leave partial state behind clean
/// it up themselves.
pub async fn run_guarded<T, F>(
    operation: &str,
    cancel: &CancelToken,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let deadline = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled {
            operation: operation.to_string(),
        }),
        _ = deadline => Err(Error::Timeout {
            operation: operation.to_string(),
            after: timeout.unwrap_or_default(),
        }),
        result = fut => result,
    }
}
