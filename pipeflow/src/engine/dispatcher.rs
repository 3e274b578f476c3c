//! Routes log entries to their handlers.

use crate::events::LogEntry;
use tokio::sync::mpsc;

/// Sending half of the engine's message channel.
pub type MessageSender = mpsc::UnboundedSender<LogEntry>;

/// Receiving half of the engine's message channel.
pub type MessageReceiver = mpsc::UnboundedReceiver<LogEntry>;

/// Hands commands and events to the engine's run loop.
///
/// Every dispatched entry is handled on its own task; ordering between
/// entries of one execution comes from the execution lock, not from the
/// channel.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: MessageSender,
}

impl Dispatcher {
    /// Creates a dispatcher and the receiver its run loop drains.
    #[must_use]
    pub fn channel() -> (Self, MessageReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues one entry. Returns false once the run loop has stopped.
    pub fn dispatch(&self, entry: impl Into<LogEntry>) -> bool {
        let entry = entry.into();
        let handler = entry.handler_name();
        match self.sender.send(entry) {
            Ok(()) => {
                tracing::trace!(handler, "Dispatched");
                true
            }
            Err(_) => {
                tracing::debug!(handler, "Dispatcher closed, dropping message");
                false
            }
        }
    }

    /// Queues every entry in order.
    pub fn dispatch_all(&self, entries: impl IntoIterator<Item = LogEntry>) {
        for entry in entries {
            if !self.dispatch(entry) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Command, Envelope, ExecutionFinish};

    fn finish() -> LogEntry {
        Command::from(ExecutionFinish {
            event: Envelope::new("exec_1"),
        })
        .into()
    }

    #[tokio::test]
    async fn test_dispatch_in_order() {
        let (dispatcher, mut receiver) = Dispatcher::channel();
        assert!(dispatcher.dispatch(finish()));
        dispatcher.dispatch_all(vec![finish(), finish()]);

        for _ in 0..3 {
            let entry = receiver.recv().await.unwrap();
            assert_eq!(entry.handler_name(), "command.execution_finish");
        }
    }

    #[test]
    fn test_dispatch_after_close() {
        let (dispatcher, receiver) = Dispatcher::channel();
        drop(receiver);
        assert!(!dispatcher.dispatch(finish()));
    }
}
