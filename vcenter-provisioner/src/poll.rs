// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded polling of conditions on the management endpoint

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one check of the condition being waited on.
#[derive(Debug, thiserror::Error)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; check again later.
    #[error("poll condition not yet ready")]
    NotYet,
    /// Checking the condition failed and polling should stop.
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(#[source] E),
}

/// Invokes `cond` every `poll_interval` until it returns a value, fails, or
/// `poll_max` has elapsed since the first check.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => {}
        }
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }
        tokio::time::sleep(*poll_interval).await;
    }
}
