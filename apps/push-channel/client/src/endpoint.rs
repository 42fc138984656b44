use std::fmt;
use std::sync::Arc;

use push_channel_core::decode_frame;
use push_transport::{
    PushTransport, SubscriptionHandle, TransportCallbacks, TransportConfig, TransportEvent,
    TransportResponse,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::UidlHandler;

/// Lifecycle of a [`PushEndpoint`]. Only moves forward; `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushState {
    New,
    ConnectPending,
    Connected,
    DisconnectPending,
    Disconnected,
}

impl PushState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushState::New => "NEW",
            PushState::ConnectPending => "CONNECT_PENDING",
            PushState::Connected => "CONNECTED",
            PushState::DisconnectPending => "DISCONNECT_PENDING",
            PushState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for PushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    /// The caller used the endpoint out of order.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// The transport reported an open the endpoint cannot be in.
    #[error("push connection opened in unexpected state {state}")]
    InvariantViolation { state: PushState },
}

/// Client end of the push channel.
///
/// Messages pushed while the subscription is still opening are queued and
/// flushed, in order, when the transport reports the open. Transport events
/// are queued by the [`TransportCallbacks`] handed to the transport and
/// applied one at a time through [`PushEndpoint::dispatch`], so callbacks
/// never interleave with the endpoint's own operations.
pub struct PushEndpoint {
    transport: Arc<dyn PushTransport>,
    handler: Box<dyn UidlHandler>,
    state: PushState,
    uri: Option<String>,
    handle: Option<SubscriptionHandle>,
    queue: Vec<String>,
    config: Option<TransportConfig>,
    callbacks: TransportCallbacks,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl PushEndpoint {
    pub fn new(transport: Arc<dyn PushTransport>, handler: impl UidlHandler + 'static) -> Self {
        let (callbacks, events) = TransportCallbacks::channel();
        Self {
            transport,
            handler: Box::new(handler),
            state: PushState::New,
            uri: None,
            handle: None,
            queue: Vec::new(),
            config: None,
            callbacks,
            events,
        }
    }

    /// Overrides the transport options used by [`PushEndpoint::connect`].
    /// The url is always replaced by the one passed to `connect`.
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn handle(&self) -> Option<SubscriptionHandle> {
        self.handle
    }

    pub fn queued(&self) -> &[String] {
        &self.queue
    }

    pub fn config(&self) -> Option<&TransportConfig> {
        self.config.as_ref()
    }

    /// Subscribes to `uri`. Allowed once, from `New` only.
    pub fn connect(&mut self, uri: impl Into<String>) -> Result<(), PushError> {
        if self.state != PushState::New {
            return Err(PushError::IllegalState("connect may only be called once"));
        }
        let uri = uri.into();
        if !self.transport.is_loaded() {
            warn!(target: "push.endpoint", uri = %uri, "connecting before the push runtime is loaded");
        }

        let config = self
            .config
            .get_or_insert_with(TransportConfig::default);
        config.url = Some(uri.clone());

        self.state = PushState::ConnectPending;
        info!(
            target: "push.endpoint",
            uri = %uri,
            transport = %config.transport,
            fallback = %config.fallback_transport,
            "establishing push connection"
        );
        let handle = self.transport.subscribe(config, self.callbacks.clone());
        self.uri = Some(uri);
        self.handle = Some(handle);
        Ok(())
    }

    /// Sends `message`, or queues it while the connection is still opening.
    pub fn push(&mut self, message: impl Into<String>) -> Result<(), PushError> {
        let message = message.into();
        match self.state {
            PushState::ConnectPending => {
                debug!(target: "push.endpoint", queued = self.queue.len() + 1, "queueing message until the connection opens");
                self.queue.push(message);
                Ok(())
            }
            PushState::Connected => match self.handle {
                Some(handle) => {
                    debug!(target: "push.endpoint", handle = %handle, bytes = message.len(), "sending message");
                    self.transport.push(&handle, &message);
                    Ok(())
                }
                None => Err(PushError::IllegalState("connected without a subscription")),
            },
            PushState::New => Err(PushError::IllegalState("cannot push before connecting")),
            PushState::DisconnectPending | PushState::Disconnected => {
                Err(PushError::IllegalState("cannot push after disconnecting"))
            }
        }
    }

    /// Tears the connection down. Safe to call in any state, any number of times.
    pub fn disconnect(&mut self) {
        match self.state {
            PushState::New => {
                self.state = PushState::Disconnected;
            }
            PushState::ConnectPending => {
                debug!(target: "push.endpoint", "disconnect requested while opening; deferring until open");
                self.state = PushState::DisconnectPending;
            }
            PushState::Connected => {
                self.state = PushState::Disconnected;
                if let Some(uri) = self.uri.as_deref() {
                    info!(target: "push.endpoint", uri = %uri, "closing push connection");
                    self.transport.unsubscribe_url(uri);
                }
                self.handle = None;
            }
            PushState::DisconnectPending | PushState::Disconnected => {}
        }
    }

    /// The transport finished opening (or reopened) the connection.
    ///
    /// The queue is flushed before the state is examined, so a reopen while
    /// already connected still sends anything that was waiting.
    pub fn on_open(&mut self, response: TransportResponse) -> Result<(), PushError> {
        info!(
            target: "push.endpoint",
            transport = ?response.transport,
            state = %self.state,
            "push connection established"
        );
        self.flush_queue();

        match self.state {
            PushState::ConnectPending => {
                self.state = PushState::Connected;
                Ok(())
            }
            PushState::DisconnectPending => {
                self.state = PushState::Connected;
                self.disconnect();
                Ok(())
            }
            PushState::Connected => Ok(()),
            state @ (PushState::New | PushState::Disconnected) => {
                Err(PushError::InvariantViolation { state })
            }
        }
    }

    /// Hands the payload of a guarded frame to the UIDL handler. Anything
    /// else is dropped.
    pub fn on_message(&mut self, response: &TransportResponse) {
        match decode_frame(&response.response_body) {
            Some(json) => {
                debug!(target: "push.endpoint", bytes = json.len(), "received push message");
                self.handler.handle_push_message(json);
            }
            None => {
                debug!(
                    target: "push.endpoint",
                    bytes = response.response_body.len(),
                    "ignoring push message without guard prefix"
                );
            }
        }
    }

    pub fn on_error(&mut self, response: Option<&TransportResponse>) {
        let detail = response.and_then(|response| response.error.as_deref());
        warn!(
            target: "push.endpoint",
            error = detail.unwrap_or("unknown"),
            state = %self.state,
            "push connection error; transport will reconnect"
        );
    }

    pub fn on_transport_failure(&mut self, reason: &str) {
        let fallback = self
            .config
            .as_ref()
            .map(|config| config.fallback_transport.as_str())
            .unwrap_or("fallback");
        warn!(
            target: "push.endpoint",
            reason = %reason,
            fallback,
            "push transport failed; transport will fall back"
        );
    }

    /// Applies one transport event. Events for a subscription that has
    /// already been released are discarded.
    pub fn dispatch(&mut self, event: TransportEvent) -> Result<(), PushError> {
        if self.state == PushState::Disconnected {
            debug!(target: "push.endpoint", event = event.kind(), "discarding event after disconnect");
            return Ok(());
        }
        match event {
            TransportEvent::Open(response) => self.on_open(response)?,
            TransportEvent::Message(response) => self.on_message(&response),
            TransportEvent::Error(response) => self.on_error(response.as_ref()),
            TransportEvent::TransportFailure { reason } => self.on_transport_failure(&reason),
        }
        Ok(())
    }

    /// Applies every event already waiting, without blocking. Returns how
    /// many were taken off the queue.
    pub fn dispatch_pending(&mut self) -> Result<usize, PushError> {
        let mut taken = 0;
        while let Ok(event) = self.events.try_recv() {
            taken += 1;
            self.dispatch(event)?;
        }
        Ok(taken)
    }

    /// Waits for the next transport event and applies it. Resolves to
    /// `false` when there is nothing left to wait for: the endpoint was never
    /// connected or has been disconnected.
    pub async fn next_event(&mut self) -> Result<bool, PushError> {
        if matches!(self.state, PushState::New | PushState::Disconnected) {
            return Ok(false);
        }
        match self.events.recv().await {
            Some(event) => {
                self.dispatch(event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(handle) = self.handle else {
            warn!(target: "push.endpoint", dropped = self.queue.len(), "no subscription to flush queued messages to");
            self.queue.clear();
            return;
        };
        debug!(target: "push.endpoint", handle = %handle, count = self.queue.len(), "flushing queued messages");
        for message in self.queue.drain(..) {
            self.transport.push(&handle, &message);
        }
    }
}

impl fmt::Debug for PushEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushEndpoint")
            .field("state", &self.state)
            .field("uri", &self.uri)
            .field("handle", &self.handle)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
