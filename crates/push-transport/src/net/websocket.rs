use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use push_channel_core::TrackedMessageDecoder;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{
            header::{COOKIE, SET_COOKIE},
            HeaderValue,
        },
        Message,
    },
};
use tracing::{debug, info};
use url::Url;

use super::{dropped, negotiation, Subscription, TransportError};
use crate::{TransportKind, TransportResponse};

const KIND: TransportKind = TransportKind::WebSocket;

/// Maps an http(s) endpoint onto ws(s); `wss` goes through native-tls.
fn websocket_url(origin: &Url) -> Result<Url, TransportError> {
    let mut url = origin.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| negotiation(KIND, format!("cannot use {scheme} for {origin}")))?;
    Ok(url)
}

pub(super) async fn run_session(
    subscription: &Subscription,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    pending: &mut VecDeque<String>,
    opened: &mut bool,
) -> Result<(), TransportError> {
    // Cookies are scoped to the http(s) origin; only the handshake uses ws(s).
    let origin = subscription.endpoint_url(KIND)?;
    let url = websocket_url(&origin)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| negotiation(KIND, err))?;
    if let Some(cookie) = subscription.cookie_header(&origin) {
        let value = HeaderValue::from_str(&cookie).map_err(|err| negotiation(KIND, err))?;
        request.headers_mut().insert(COOKIE, value);
    }

    let (stream, response) = connect_async(request)
        .await
        .map_err(|err| negotiation(KIND, err))?;
    subscription.store_cookies(
        &origin,
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.as_bytes()),
    );
    let (mut sink, mut inbound) = stream.split();

    *opened = true;
    info!(target: "push.transport", url = %url, "websocket push connection open");
    subscription
        .callbacks
        .on_open(TransportResponse::opened(KIND));

    while let Some(message) = pending.pop_front() {
        if let Err(err) = sink.send(Message::Text(message.clone())).await {
            pending.push_front(message);
            return Err(dropped(KIND, err));
        }
    }

    let mut decoder = TrackedMessageDecoder::new();
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(err) = sink.send(Message::Text(message.clone())).await {
                        pending.push_back(message);
                        return Err(dropped(KIND, err));
                    }
                }
                None => {
                    debug!(target: "push.transport", "closing websocket push connection");
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    subscription.deliver(KIND, &mut decoder, text.as_bytes());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    subscription.deliver(KIND, &mut decoder, &bytes);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Err(dropped(KIND, reason));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(dropped(KIND, err)),
                None => return Err(dropped(KIND, "stream ended")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_origins_negotiate_wss() {
        let secure: Url = "https://push.example.com/push?a=1".parse().expect("url");
        assert_eq!(
            websocket_url(&secure).expect("wss").as_str(),
            "wss://push.example.com/push?a=1"
        );
        let plain: Url = "http://127.0.0.1:8090/push".parse().expect("url");
        assert_eq!(websocket_url(&plain).expect("ws").scheme(), "ws");
    }
}
