//! The execution log: commands, events and their wire encoding.
//!
//! Every entry is written as one JSON object per line:
//!
//! ```text
//! {"event_type": "handler.step_finished", "payload": {"event": {"execution_id": "...", "created_at": "..."}, ...}}
//! ```
//!
//! [`Command`] and [`Event`] are closed unions. The tag doubles as the
//! routing key returned by `handler_name()`. Decoding reads the tag first and
//! deserializes the payload straight into the matching variant; tags this
//! build does not know are skipped.

mod command;
mod envelope;
mod event;

pub use command::{
    ExecutionFail, ExecutionFinish, ExecutionQueue, ExecutionStart, PipelineCancel, PipelineFail,
    PipelineFinish, PipelinePause, PipelinePlan, PipelineQueue, PipelineResume, PipelineStart,
    StepForEachPlan, StepPipelineFinish, StepQueue, StepStart, TriggerStart,
};
pub use envelope::Envelope;
pub use event::{
    ExecutionFailed, ExecutionFinished, ExecutionQueued, ExecutionStarted, PipelineCanceled,
    PipelineFailed, PipelineFinished, PipelinePaused, PipelinePlanned, PipelineQueued,
    PipelineResumed, PipelineStarted, StepFinished, StepForEachPlanned, StepPipelineStarted,
    StepQueued, TriggerStarted,
};

use crate::errors::PipeflowError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! log_union {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $tag:tt,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "event_type", content = "payload")]
        pub enum $name {
            $(
                #[doc = concat!("`", $tag, "`")]
                #[serde(rename = $tag)]
                $variant($variant),
            )+
        }

        impl $name {
            /// Every routing key of this union.
            pub const HANDLER_NAMES: &'static [&'static str] = &[$($tag),+];

            /// Stable routing key, also the `event_type` tag on the wire.
            #[must_use]
            pub const fn handler_name(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $tag,)+
                }
            }

            /// The event reference carried by the payload.
            #[must_use]
            pub fn envelope(&self) -> &Envelope {
                match self {
                    $(Self::$variant(inner) => &inner.event,)+
                }
            }
        }

        $(
            impl From<$variant> for $name {
                fn from(inner: $variant) -> Self {
                    Self::$variant(inner)
                }
            }
        )+
    };
}

log_union! {
    /// A request handled by exactly one command handler.
    pub enum Command {
        ExecutionQueue => "command.execution_queue",
        ExecutionStart => "command.execution_start",
        ExecutionFinish => "command.execution_finish",
        ExecutionFail => "command.execution_fail",
        PipelineQueue => "command.pipeline_queue",
        PipelineStart => "command.pipeline_start",
        PipelinePlan => "command.pipeline_plan",
        PipelineFinish => "command.pipeline_finish",
        PipelineFail => "command.pipeline_fail",
        PipelineCancel => "command.pipeline_cancel",
        PipelinePause => "command.pipeline_pause",
        PipelineResume => "command.pipeline_resume",
        StepForEachPlan => "command.step_for_each_plan",
        StepQueue => "command.step_queue",
        StepStart => "command.step_start",
        StepPipelineFinish => "command.step_pipeline_finish",
        TriggerStart => "command.trigger_start",
    }
}

log_union! {
    /// A fact consumed by zero or more event handlers.
    pub enum Event {
        ExecutionQueued => "handler.execution_queued",
        ExecutionStarted => "handler.execution_started",
        ExecutionFinished => "handler.execution_finished",
        ExecutionFailed => "handler.execution_failed",
        PipelineQueued => "handler.pipeline_queued",
        PipelineStarted => "handler.pipeline_started",
        PipelineResumed => "handler.pipeline_resumed",
        PipelinePlanned => "handler.pipeline_planned",
        PipelineCanceled => "handler.pipeline_canceled",
        PipelinePaused => "handler.pipeline_paused",
        PipelineFinished => "handler.pipeline_finished",
        PipelineFailed => "handler.pipeline_failed",
        StepForEachPlanned => "handler.step_for_each_planned",
        StepQueued => "handler.step_queued",
        StepPipelineStarted => "handler.step_pipeline_started",
        StepFinished => "handler.step_finished",
        TriggerStarted => "handler.trigger_started",
    }
}

impl Command {
    /// The pipeline execution this command targets, if any.
    #[must_use]
    pub fn pipeline_execution_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionQueue(_)
            | Self::ExecutionStart(_)
            | Self::ExecutionFinish(_)
            | Self::ExecutionFail(_)
            | Self::TriggerStart(_) => None,
            Self::PipelineQueue(cmd) => Some(&cmd.pipeline_execution_id),
            Self::PipelineStart(cmd) => Some(&cmd.pipeline_execution_id),
            Self::PipelinePlan(cmd) => Some(&cmd.pipeline_execution_id),
            Self::PipelineFinish(cmd) => Some(&cmd.pipeline_execution_id),
            Self::PipelineFail(cmd) => Some(&cmd.pipeline_execution_id),
            Self::PipelineCancel(cmd) => Some(&cmd.pipeline_execution_id),
            Self::PipelinePause(cmd) => Some(&cmd.pipeline_execution_id),
            Self::PipelineResume(cmd) => Some(&cmd.pipeline_execution_id),
            Self::StepForEachPlan(cmd) => Some(&cmd.pipeline_execution_id),
            Self::StepQueue(cmd) => Some(&cmd.pipeline_execution_id),
            Self::StepStart(cmd) => Some(&cmd.pipeline_execution_id),
            Self::StepPipelineFinish(cmd) => Some(&cmd.pipeline_execution_id),
        }
    }
}

impl Event {
    /// The pipeline execution this event concerns, if any.
    #[must_use]
    pub fn pipeline_execution_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionQueued(_)
            | Self::ExecutionStarted(_)
            | Self::ExecutionFinished(_)
            | Self::ExecutionFailed(_)
            | Self::TriggerStarted(_) => None,
            Self::PipelineQueued(event) => Some(&event.pipeline_execution_id),
            Self::PipelineStarted(event) => Some(&event.pipeline_execution_id),
            Self::PipelineResumed(event) => Some(&event.pipeline_execution_id),
            Self::PipelinePlanned(event) => Some(&event.pipeline_execution_id),
            Self::PipelineCanceled(event) => Some(&event.pipeline_execution_id),
            Self::PipelinePaused(event) => Some(&event.pipeline_execution_id),
            Self::PipelineFinished(event) => Some(&event.pipeline_execution_id),
            Self::PipelineFailed(event) => Some(&event.pipeline_execution_id),
            Self::StepForEachPlanned(event) => Some(&event.pipeline_execution_id),
            Self::StepQueued(event) => Some(&event.pipeline_execution_id),
            Self::StepPipelineStarted(event) => Some(&event.pipeline_execution_id),
            Self::StepFinished(event) => Some(&event.pipeline_execution_id),
        }
    }
}

/// One line of an execution log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogEntry {
    /// A command as it was received.
    Command(Command),
    /// An event as it was published.
    Event(Event),
}

impl LogEntry {
    /// Routing key and wire tag.
    #[must_use]
    pub const fn handler_name(&self) -> &'static str {
        match self {
            Self::Command(command) => command.handler_name(),
            Self::Event(event) => event.handler_name(),
        }
    }

    /// The event reference carried by the payload.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Command(command) => command.envelope(),
            Self::Event(event) => event.envelope(),
        }
    }

    /// Execution this entry belongs to.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.envelope().execution_id
    }

    /// Pipeline execution this entry concerns, if any.
    #[must_use]
    pub fn pipeline_execution_id(&self) -> Option<&str> {
        match self {
            Self::Command(command) => command.pipeline_execution_id(),
            Self::Event(event) => event.pipeline_execution_id(),
        }
    }

    /// Encodes the entry as one JSON line, without the trailing newline.
    pub fn encode(&self) -> Result<String, PipeflowError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes one JSON line.
    ///
    /// Returns `Ok(None)` for a well-formed entry whose tag is unknown.
    pub fn decode(line: &str) -> Result<Option<Self>, PipeflowError> {
        let value: Value = serde_json::from_str(line)?;
        let tag = value
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or_else(|| PipeflowError::bad_request("log entry has no event_type"))?;

        if Command::HANDLER_NAMES.contains(&tag) {
            Ok(Some(Self::Command(serde_json::from_value(value)?)))
        } else if Event::HANDLER_NAMES.contains(&tag) {
            Ok(Some(Self::Event(serde_json::from_value(value)?)))
        } else {
            tracing::debug!(event_type = tag, "Skipping unknown log entry");
            Ok(None)
        }
    }
}

impl From<Command> for LogEntry {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Event> for LogEntry {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}
