//! Cancellable delays.

use super::CancellationToken;
use crate::errors::PipeflowError;
use std::time::Duration;

/// Sleeps for `duration` unless `token` is cancelled first.
pub async fn sleep(duration: Duration, token: &CancellationToken) -> Result<(), PipeflowError> {
    if duration.is_zero() {
        return check(token);
    }

    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = token.cancelled() => Err(cancelled(token)),
    }
}

/// Fails if `token` was cancelled.
pub fn check(token: &CancellationToken) -> Result<(), PipeflowError> {
    if token.is_cancelled() {
        Err(cancelled(token))
    } else {
        Ok(())
    }
}

fn cancelled(token: &CancellationToken) -> PipeflowError {
    PipeflowError::Cancelled(token.reason().unwrap_or_else(|| "cancelled".to_string()))
}
