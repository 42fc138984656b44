//! Network-backed transport: WebSocket first, chunked HTTP streaming as the
//! fallback, with reconnects on the configured interval.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use push_channel_core::TrackedMessageDecoder;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    LibraryLoader, LoadError, PushTransport, ResourceLoader, SubscriptionHandle,
    TransportCallbacks, TransportConfig, TransportKind, TransportResponse,
};

mod streaming;
mod websocket;

pub const TRANSPORT_PARAM: &str = "X-Atmosphere-Transport";
pub const TRACK_MESSAGE_SIZE_PARAM: &str = "X-Atmosphere-TrackMessageSize";
pub const TRACKING_ID_PARAM: &str = "X-Atmosphere-tracking-id";

#[derive(Debug, Error)]
enum TransportError {
    #[error("could not negotiate {transport}: {reason}")]
    Negotiation {
        transport: TransportKind,
        reason: String,
    },
    #[error("{transport} connection dropped: {reason}")]
    Dropped {
        transport: TransportKind,
        reason: String,
    },
}

fn negotiation(transport: TransportKind, reason: impl fmt::Display) -> TransportError {
    TransportError::Negotiation {
        transport,
        reason: reason.to_string(),
    }
}

fn dropped(transport: TransportKind, reason: impl fmt::Display) -> TransportError {
    TransportError::Dropped {
        transport,
        reason: reason.to_string(),
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// [`PushTransport`] over real sockets. Each subscription runs on its own
/// tokio task; `subscribe` must be called from within a runtime.
///
/// Cookies set by the server (the push session among them) are kept in one
/// jar shared by every subscription and replayed on each reconnect.
pub struct NetTransport {
    loader: Option<LibraryLoader>,
    client: reqwest::Client,
    cookies: Arc<Jar>,
    next_handle: AtomicU64,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
}

impl Default for NetTransport {
    fn default() -> Self {
        Self {
            loader: None,
            client: reqwest::Client::new(),
            cookies: Arc::new(Jar::default()),
            next_handle: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

impl NetTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports loaded only after `loader` has fetched the runtime.
    pub fn with_loader(loader: LibraryLoader) -> Self {
        let mut transport = Self::default();
        transport.loader = Some(loader);
        transport
    }
}

impl PushTransport for NetTransport {
    fn is_loaded(&self) -> bool {
        self.loader.as_ref().map_or(true, LibraryLoader::is_loaded)
    }

    fn subscribe(
        &self,
        config: &TransportConfig,
        callbacks: TransportCallbacks,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let url = config.url.clone().unwrap_or_default();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let subscription = Subscription {
            config: config.clone(),
            callbacks,
            client: self.client.clone(),
            cookies: Arc::clone(&self.cookies),
            tracking_id: Uuid::new_v4(),
        };
        debug!(
            target: "push.transport",
            handle = %handle,
            url = %url,
            tracking_id = %subscription.tracking_id,
            "subscribing"
        );
        let task = tokio::spawn(subscription.run(outbound_rx));

        let previous = self.subscriptions.lock().insert(
            url.clone(),
            ActiveSubscription {
                handle,
                outbound,
                task,
            },
        );
        if let Some(previous) = previous {
            warn!(target: "push.transport", url = %url, "replacing existing subscription");
            previous.task.abort();
        }
        handle
    }

    fn push(&self, handle: &SubscriptionHandle, message: &str) {
        let subscriptions = self.subscriptions.lock();
        match subscriptions.values().find(|active| active.handle == *handle) {
            Some(active) => {
                if active.outbound.send(message.to_string()).is_err() {
                    warn!(target: "push.transport", handle = %handle, "subscription task gone; message dropped");
                }
            }
            None => {
                warn!(target: "push.transport", handle = %handle, "push on unknown subscription dropped");
            }
        }
    }

    fn unsubscribe_url(&self, url: &str) {
        // Dropping the outbound sender lets the task close its socket and exit.
        match self.subscriptions.lock().remove(url) {
            Some(active) => {
                info!(target: "push.transport", url = %url, handle = %active.handle, "unsubscribed");
            }
            None => {
                debug!(target: "push.transport", url = %url, "unsubscribe for unknown url ignored");
            }
        }
    }
}

impl Drop for NetTransport {
    fn drop(&mut self) {
        for (_, active) in self.subscriptions.lock().drain() {
            active.task.abort();
        }
    }
}

/// State owned by one subscription task.
struct Subscription {
    config: TransportConfig,
    callbacks: TransportCallbacks,
    client: reqwest::Client,
    cookies: Arc<Jar>,
    tracking_id: Uuid,
}

impl Subscription {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<String>) {
        let mut transport = self.config.transport;
        let mut opened = false;
        let mut pending = VecDeque::new();

        loop {
            let result = match transport {
                TransportKind::WebSocket => {
                    websocket::run_session(&self, &mut outbound, &mut pending, &mut opened).await
                }
                TransportKind::Streaming => {
                    streaming::run_session(&self, &mut outbound, &mut pending, &mut opened).await
                }
            };

            match result {
                Ok(()) => {
                    debug!(target: "push.transport", tracking_id = %self.tracking_id, "subscription closed");
                    return;
                }
                Err(TransportError::Negotiation { reason, .. })
                    if !opened && transport != self.config.fallback_transport =>
                {
                    warn!(
                        target: "push.transport",
                        primary = %transport,
                        fallback = %self.config.fallback_transport,
                        reason = %reason,
                        "primary transport failed; falling back"
                    );
                    self.callbacks.on_transport_failure(reason);
                    transport = self.config.fallback_transport;
                }
                Err(err) => {
                    warn!(
                        target: "push.transport",
                        error = %err,
                        retry_in_ms = self.config.reconnect_interval.as_millis() as u64,
                        "push connection failed; reconnecting"
                    );
                    self.callbacks
                        .on_error(Some(TransportResponse::error(transport, err.to_string())));
                    if !self.backoff(&mut outbound, &mut pending).await {
                        debug!(target: "push.transport", tracking_id = %self.tracking_id, "unsubscribed while reconnecting");
                        return;
                    }
                }
            }
        }
    }

    /// Waits out the reconnect interval, parking outbound messages in
    /// `pending`. Returns false if the subscription was closed meanwhile.
    async fn backoff(
        &self,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        pending: &mut VecDeque<String>,
    ) -> bool {
        let sleep = tokio::time::sleep(self.config.reconnect_interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                message = outbound.recv() => match message {
                    Some(message) => pending.push_back(message),
                    None => return false,
                },
            }
        }
    }

    fn endpoint_url(&self, transport: TransportKind) -> Result<Url, TransportError> {
        let raw = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| negotiation(transport, "subscription has no url"))?;
        let mut url = Url::parse(raw).map_err(|err| negotiation(transport, err))?;
        url.query_pairs_mut()
            .append_pair(TRANSPORT_PARAM, transport.as_str())
            .append_pair(
                TRACK_MESSAGE_SIZE_PARAM,
                if self.config.track_message_length {
                    "true"
                } else {
                    "false"
                },
            )
            .append_pair(TRACKING_ID_PARAM, &self.tracking_id.to_string());
        Ok(url)
    }

    /// `Cookie` header value the jar holds for `url`.
    fn cookie_header(&self, url: &Url) -> Option<String> {
        self.cookies
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    /// Records raw `Set-Cookie` values answered for `url`.
    fn store_cookies<'a>(&self, url: &Url, set_cookies: impl Iterator<Item = &'a [u8]>) {
        let values: Vec<HeaderValue> = set_cookies
            .filter_map(|raw| HeaderValue::from_bytes(raw).ok())
            .collect();
        if !values.is_empty() {
            self.cookies.set_cookies(&mut values.iter(), url);
        }
    }

    /// Hands inbound bytes to `on_message`, one call per complete message.
    ///
    /// Untracked payloads carry no delimiter, so each chunk or WebSocket
    /// frame is taken as exactly one message. A server that coalesces
    /// frames into one chunk must enable `trackMessageLength`.
    fn deliver(&self, transport: TransportKind, decoder: &mut TrackedMessageDecoder, bytes: &[u8]) {
        if !self.config.track_message_length {
            match std::str::from_utf8(bytes) {
                Ok(text) => self
                    .callbacks
                    .on_message(TransportResponse::message(transport, text)),
                Err(err) => {
                    warn!(target: "push.transport", error = %err, "dropping non-utf8 push frame");
                }
            }
            return;
        }

        match decoder.feed(bytes) {
            Ok(messages) => {
                for message in messages {
                    self.callbacks
                        .on_message(TransportResponse::message(transport, message));
                }
            }
            Err(err) => {
                warn!(target: "push.transport", error = %err, "dropping malformed tracked frame");
            }
        }
    }
}

/// Loads the runtime descriptor over HTTP; any non-success status fails.
#[derive(Debug, Clone, Default)]
pub struct HttpResourceLoader {
    client: reqwest::Client,
}

impl HttpResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceLoader for HttpResourceLoader {
    async fn load(&self, url: &str) -> Result<(), LoadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| LoadError::Fetch {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
