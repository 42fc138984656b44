use std::collections::VecDeque;

use futures_util::StreamExt;
use push_channel_core::TrackedMessageDecoder;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::{dropped, negotiation, Subscription, TransportError};
use crate::{TransportKind, TransportResponse};

const KIND: TransportKind = TransportKind::Streaming;

/// Inbound frames arrive on a long-lived chunked GET; outbound messages are
/// POSTed to the same url, keyed by the tracking id.
pub(super) async fn run_session(
    subscription: &Subscription,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    pending: &mut VecDeque<String>,
    opened: &mut bool,
) -> Result<(), TransportError> {
    let url = subscription.endpoint_url(KIND)?;
    let mut request = subscription.client.get(url.clone());
    if let Some(cookie) = subscription.cookie_header(&url) {
        request = request.header(COOKIE, cookie);
    }
    let response = request.send().await.map_err(|err| negotiation(KIND, err))?;
    subscription.store_cookies(
        &url,
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.as_bytes()),
    );
    let status = response.status();
    if !status.is_success() {
        return Err(negotiation(KIND, format!("server answered {status}")));
    }

    *opened = true;
    info!(target: "push.transport", url = %url, "streaming push connection open");
    subscription
        .callbacks
        .on_open(TransportResponse::opened(KIND));

    while let Some(message) = pending.pop_front() {
        if let Err(err) = post(subscription, &url, &message).await {
            pending.push_front(message);
            return Err(err);
        }
    }

    let body = response.bytes_stream();
    tokio::pin!(body);
    let mut decoder = TrackedMessageDecoder::new();
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(err) = post(subscription, &url, &message).await {
                        pending.push_back(message);
                        return Err(err);
                    }
                }
                None => {
                    debug!(target: "push.transport", "closing streaming push connection");
                    return Ok(());
                }
            },
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => subscription.deliver(KIND, &mut decoder, &bytes),
                Some(Err(err)) => return Err(dropped(KIND, err)),
                None => return Err(dropped(KIND, "stream ended")),
            },
        }
    }
}

async fn post(subscription: &Subscription, url: &Url, message: &str) -> Result<(), TransportError> {
    let mut request = subscription
        .client
        .post(url.clone())
        .header(CONTENT_TYPE, subscription.config.content_type.as_str());
    if let Some(cookie) = subscription.cookie_header(url) {
        request = request.header(COOKIE, cookie);
    }
    let response = request
        .body(message.to_string())
        .send()
        .await
        .map_err(|err| dropped(KIND, err))?;
    let status = response.status();
    if !status.is_success() {
        // A rejected message is dropped; only transport errors reconnect.
        warn!(target: "push.transport", status = %status, "server rejected pushed message");
    }
    Ok(())
}
