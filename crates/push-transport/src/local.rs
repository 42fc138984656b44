use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{
    PushTransport, SubscriptionHandle, TransportCallbacks, TransportConfig, TransportKind,
    TransportResponse,
};

/// One facade call observed by [`LocalTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Subscribe {
        handle: SubscriptionHandle,
        url: Option<String>,
    },
    Push {
        handle: SubscriptionHandle,
        message: String,
    },
    UnsubscribeUrl {
        url: String,
    },
}

#[derive(Debug)]
struct LocalSubscription {
    config: TransportConfig,
    callbacks: TransportCallbacks,
}

/// In-memory transport for tests and dev wiring. Records every facade call;
/// transport-side events are injected by hand through `open`, `deliver`,
/// `error` and `fail_transport`.
#[derive(Debug)]
pub struct LocalTransport {
    loaded: AtomicBool,
    next_handle: AtomicU64,
    calls: Mutex<Vec<TransportCall>>,
    subscriptions: Mutex<HashMap<String, LocalSubscription>>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self {
            loaded: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn subscription_config(&self, url: &str) -> Option<TransportConfig> {
        self.subscriptions
            .lock()
            .get(url)
            .map(|subscription| subscription.config.clone())
    }

    /// Fires `on_open` for the subscription on `url`. Returns false if none is live.
    pub fn open(&self, url: &str) -> bool {
        self.with_subscription(url, |subscription| {
            subscription
                .callbacks
                .on_open(TransportResponse::opened(subscription.config.transport));
        })
    }

    /// Fires `on_message` carrying `body` verbatim.
    pub fn deliver(&self, url: &str, body: &str) -> bool {
        self.with_subscription(url, |subscription| {
            subscription.callbacks.on_message(TransportResponse::message(
                subscription.config.transport,
                body,
            ));
        })
    }

    pub fn error(&self, url: &str, error: &str) -> bool {
        self.with_subscription(url, |subscription| {
            subscription.callbacks.on_error(Some(TransportResponse::error(
                subscription.config.transport,
                error,
            )));
        })
    }

    /// Fires `on_transport_failure` and switches the subscription to its
    /// fallback transport, as the real runtime does.
    pub fn fail_transport(&self, url: &str, reason: &str) -> bool {
        match self.subscriptions.lock().get_mut(url) {
            Some(subscription) => {
                subscription.callbacks.on_transport_failure(reason);
                subscription.config.transport = subscription.config.fallback_transport;
                true
            }
            None => false,
        }
    }

    pub fn active_transport(&self, url: &str) -> Option<TransportKind> {
        self.subscriptions
            .lock()
            .get(url)
            .map(|subscription| subscription.config.transport)
    }

    fn with_subscription<F>(&self, url: &str, f: F) -> bool
    where
        F: FnOnce(&LocalSubscription),
    {
        match self.subscriptions.lock().get(url) {
            Some(subscription) => {
                f(subscription);
                true
            }
            None => false,
        }
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }
}

impl PushTransport for LocalTransport {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn subscribe(
        &self,
        config: &TransportConfig,
        callbacks: TransportCallbacks,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.record(TransportCall::Subscribe {
            handle,
            url: config.url.clone(),
        });
        self.subscriptions.lock().insert(
            config.url.clone().unwrap_or_default(),
            LocalSubscription {
                config: config.clone(),
                callbacks,
            },
        );
        handle
    }

    fn push(&self, handle: &SubscriptionHandle, message: &str) {
        self.record(TransportCall::Push {
            handle: *handle,
            message: message.to_string(),
        });
    }

    fn unsubscribe_url(&self, url: &str) {
        self.record(TransportCall::UnsubscribeUrl {
            url: url.to_string(),
        });
        self.subscriptions.lock().remove(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportEvent;

    #[test]
    fn records_facade_calls_in_order() {
        let transport = LocalTransport::new();
        let (callbacks, _rx) = TransportCallbacks::channel();
        let config = TransportConfig::default().with_url("/push");

        let handle = transport.subscribe(&config, callbacks);
        transport.push(&handle, "A");
        transport.unsubscribe_url("/push");

        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Subscribe {
                    handle,
                    url: Some("/push".into())
                },
                TransportCall::Push {
                    handle,
                    message: "A".into()
                },
                TransportCall::UnsubscribeUrl { url: "/push".into() },
            ]
        );
        assert!(transport.subscription_config("/push").is_none());
    }

    #[test]
    fn injected_events_reach_the_subscriber() {
        let transport = LocalTransport::new();
        let (callbacks, mut rx) = TransportCallbacks::channel();
        transport.subscribe(&TransportConfig::default().with_url("/push"), callbacks);

        assert!(transport.open("/push"));
        assert!(transport.deliver("/push", "for(;;);[{}]"));
        assert!(!transport.deliver("/elsewhere", "ignored"));

        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Open(_))));
        match rx.try_recv() {
            Ok(TransportEvent::Message(response)) => {
                assert_eq!(response.response_body, "for(;;);[{}]");
                assert_eq!(response.transport, Some(TransportKind::WebSocket));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
