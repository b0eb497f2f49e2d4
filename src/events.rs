//! Status, warning, error and output events for whoever is watching
//!
//! The bus is a bounded broadcast: producers never wait, late subscribers see
//! nothing old, and a subscriber that falls behind loses the oldest events.

use futures_util::stream::{self, Stream};
use std::fmt;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber
pub const DEFAULT_CAPACITY: usize = 256;

/// Which output stream of the shell a chunk came from
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One event raised by the installer, orchestrator, or shell session
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TerminalEvent {
    Output { stream: StreamKind, text: String },
    Status { message: String },
    Warning { message: String },
    Error { message: String, cause: Option<String> },
    Exit { code: i32 },
}

impl TerminalEvent {
    pub fn status<S: Into<String>>(message: S) -> Self {
        TerminalEvent::Status {
            message: message.into(),
        }
    }

    pub fn warning<S: Into<String>>(message: S) -> Self {
        TerminalEvent::Warning {
            message: message.into(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        TerminalEvent::Error {
            message: message.into(),
            cause: None,
        }
    }

    /// An error event, with the display form of an underlying error as cause
    pub fn failure<S: Into<String>, E: fmt::Display>(message: S, cause: &E) -> Self {
        TerminalEvent::Error {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }
}

impl fmt::Display for TerminalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalEvent::Output { text, .. } => f.write_str(text),
            TerminalEvent::Status { message } => write!(f, "{}", message),
            TerminalEvent::Warning { message } => write!(f, "warning: {}", message),
            TerminalEvent::Error {
                message,
                cause: Some(cause),
            } => write!(f, "error: {} ({})", message, cause),
            TerminalEvent::Error {
                message,
                cause: None,
            } => write!(f, "error: {}", message),
            TerminalEvent::Exit { code } => write!(f, "exited with code {}", code),
        }
    }
}

/// Multi-consumer, non-blocking event broadcast
///
/// Cloning the bus gives another handle to the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<TerminalEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    /// Broadcast an event, without waiting for anyone to receive it
    pub fn emit(&self, event: TerminalEvent) {
        match &event {
            TerminalEvent::Output { stream, text } => log::trace!("{:?}: {:?}", stream, text),
            TerminalEvent::Status { .. } => log::info!("{}", event),
            TerminalEvent::Warning { .. } => log::warn!("{}", event),
            TerminalEvent::Error { .. } => log::error!("{}", event),
            TerminalEvent::Exit { .. } => log::debug!("{}", event),
        }
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Receive all events emitted from now on
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of an [EventBus]
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<TerminalEvent>,
}

impl EventSubscription {
    /// Wait for the next event
    ///
    /// Returns `None` once every [EventBus] handle is gone. Events that were
    /// overwritten while this subscriber lagged are skipped.
    pub async fn next(&mut self) -> Option<TerminalEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("event subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take an event if one is already waiting
    pub fn try_next(&mut self) -> Option<TerminalEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::debug!("event subscriber lagged, {} events dropped", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Convert into a [Stream] of events
    pub fn into_stream(self) -> impl Stream<Item = TerminalEvent> {
        stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(TerminalEvent::status("nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn late_subscriber_sees_nothing_old() {
        let bus = EventBus::new(4);
        bus.emit(TerminalEvent::status("early"));
        let mut sub = bus.subscribe();
        bus.emit(TerminalEvent::status("late"));
        assert_eq!(sub.next().await, Some(TerminalEvent::status("late")));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for code in 0..5 {
            bus.emit(TerminalEvent::Exit { code });
        }
        assert_eq!(sub.next().await, Some(TerminalEvent::Exit { code: 3 }));
        assert_eq!(sub.next().await, Some(TerminalEvent::Exit { code: 4 }));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn closed_bus_ends_subscription() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn json_shape() {
        let event = TerminalEvent::Output {
            stream: StreamKind::Stderr,
            text: "oops\n".into(),
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"kind":"output","stream":"stderr","text":"oops\n"}"#
        );
    }
}
