//! Notifications delivered to the application.
//!
//! Worker threads never call back into application code directly. They
//! push [`StreamEvent`]s onto an unbounded Tokio channel which the
//! application drains from whatever context it likes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Something the application may want to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The muxer finished opening. `code` is 0 on success.
    OpenConnectionResult { code: i32 },
    /// The muxer was closed. `code` is 0 on success.
    CloseConnectionResult { code: i32 },
    /// A write failed. Reported per failed write.
    WriteError { code: i32 },
}

impl StreamEvent {
    pub fn is_error(&self) -> bool {
        match self {
            Self::OpenConnectionResult { code } | Self::CloseConnectionResult { code } => *code != 0,
            Self::WriteError { .. } => true,
        }
    }
}

impl std::fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenConnectionResult { code } => write!(f, "open result {code}"),
            Self::CloseConnectionResult { code } => write!(f, "close result {code}"),
            Self::WriteError { code } => write!(f, "write error {code}"),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<StreamEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Create a connected event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(!StreamEvent::OpenConnectionResult { code: 0 }.is_error());
        assert!(StreamEvent::OpenConnectionResult { code: -1 }.is_error());
        assert!(StreamEvent::WriteError { code: 0 }.is_error());
    }

    #[test]
    fn events_cross_the_channel() {
        let (tx, mut rx) = channel();
        tx.send(StreamEvent::WriteError { code: 5 }).unwrap();
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::WriteError { code: 5 });
    }
}
