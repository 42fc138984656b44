//! Narrow facade over the push transport runtime.
//!
//! The push endpoint never talks to a socket directly. It drives a
//! [`PushTransport`] through four operations and receives transport-side
//! events through the [`TransportCallbacks`] it hands over at subscribe time.
//! Reconnects and primary/fallback negotiation belong to the transport.

use std::fmt;

mod config;
mod event;
mod loader;
mod local;
#[cfg(feature = "net-adapter")]
pub mod net;

pub use config::{TransportConfig, TransportKind, DEFAULT_CONTENT_TYPE, DEFAULT_RECONNECT_INTERVAL};
pub use event::{TransportCallbacks, TransportEvent, TransportResponse};
pub use loader::{LibraryLoader, LoadError, ResourceLoader};
pub use local::{LocalTransport, TransportCall};

/// Opaque reference to a live subscription, valid until it is unsubscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Operations the push endpoint needs from a transport runtime.
///
/// None of these fail synchronously: problems are reported through the
/// `on_error` and `on_transport_failure` callbacks of the subscription.
pub trait PushTransport: Send + Sync {
    /// True once the transport runtime is reachable.
    fn is_loaded(&self) -> bool;

    /// Opens a subscription to `config.url`; the open completes later via `on_open`.
    fn subscribe(&self, config: &TransportConfig, callbacks: TransportCallbacks)
        -> SubscriptionHandle;

    /// Sends one text frame on the subscription.
    fn push(&self, handle: &SubscriptionHandle, message: &str);

    /// Closes the subscription that was opened for `url`.
    fn unsubscribe_url(&self, url: &str);
}
