//! Identifier generation and timestamp helpers.

pub mod timestamps;
mod uuid_utils;

pub use timestamps::{not_before, now_utc, Timestamp};
pub use uuid_utils::{
    new_execution_id, new_pipeline_execution_id, new_step_execution_id, new_trigger_execution_id,
};
