use tokio::sync::mpsc;
use tracing::debug;

use crate::TransportKind;

/// What the transport runtime reports alongside an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub response_body: String,
    pub state: String,
    pub error: Option<String>,
    pub transport: Option<TransportKind>,
}

impl TransportResponse {
    pub fn opened(transport: TransportKind) -> Self {
        Self {
            state: "opened".into(),
            transport: Some(transport),
            ..Self::default()
        }
    }

    pub fn message(transport: TransportKind, body: impl Into<String>) -> Self {
        Self {
            response_body: body.into(),
            state: "messageReceived".into(),
            transport: Some(transport),
            ..Self::default()
        }
    }

    pub fn error(transport: TransportKind, error: impl Into<String>) -> Self {
        Self {
            state: "error".into(),
            error: Some(error.into()),
            transport: Some(transport),
            ..Self::default()
        }
    }
}

/// A transport-side event queued for the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open(TransportResponse),
    Message(TransportResponse),
    Error(Option<TransportResponse>),
    TransportFailure { reason: String },
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Open(_) => "open",
            TransportEvent::Message(_) => "message",
            TransportEvent::Error(_) => "error",
            TransportEvent::TransportFailure { .. } => "transport_failure",
        }
    }
}

/// The four callback slots a subscriber hands to the transport.
///
/// Each slot only enqueues; the subscriber drains the queue on its own task,
/// so callbacks never run concurrently with each other or with the
/// subscriber's own operations.
#[derive(Debug, Clone)]
pub struct TransportCallbacks {
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportCallbacks {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    pub fn on_open(&self, response: TransportResponse) {
        self.emit(TransportEvent::Open(response));
    }

    pub fn on_message(&self, response: TransportResponse) {
        self.emit(TransportEvent::Message(response));
    }

    pub fn on_error(&self, response: Option<TransportResponse>) {
        self.emit(TransportEvent::Error(response));
    }

    pub fn on_transport_failure(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::TransportFailure {
            reason: reason.into(),
        });
    }

    /// True once the subscriber stopped listening.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn emit(&self, event: TransportEvent) {
        let kind = event.kind();
        if self.events.send(event).is_err() {
            debug!(target: "push.transport", event = kind, "subscriber gone; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_enqueue_in_call_order() {
        let (callbacks, mut rx) = TransportCallbacks::channel();
        callbacks.on_open(TransportResponse::opened(TransportKind::WebSocket));
        callbacks.on_message(TransportResponse::message(TransportKind::WebSocket, "for(;;);[1]"));
        callbacks.on_transport_failure("refused");
        callbacks.on_error(None);

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.kind())
            .collect();
        assert_eq!(kinds, ["open", "message", "transport_failure", "error"]);
    }

    #[test]
    fn emitting_after_receiver_drop_is_silent() {
        let (callbacks, rx) = TransportCallbacks::channel();
        drop(rx);
        assert!(callbacks.is_closed());
        callbacks.on_error(Some(TransportResponse::error(TransportKind::Streaming, "reset")));
    }
}
