//! Cooperative cancellation.
//!
//! Each pipeline execution owns a [`CancellationToken`]. Cancelling or
//! ending the pipeline trips it, which interrupts queued retry delays,
//! blocked semaphore acquisition and running primitives that watch it.

mod sleep;
mod token;

pub use sleep::{check, sleep};
pub use token::CancellationToken;
