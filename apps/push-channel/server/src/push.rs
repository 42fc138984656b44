use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use cookie::{Cookie, SameSite};
use futures_util::{stream, SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use push_channel_core::encode_tracked;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{SessionRegistry, WrappedSession};
use crate::uidl::{envelope_frame, handle_client_message, InboundError};
use crate::AppState;

/// Cookie carrying the push session id back on reconnects.
pub const SESSION_COOKIE: &str = "push-session";

const WEBSOCKET: &str = "websocket";
const STREAMING: &str = "streaming";

/// Negotiation parameters sent by the client transport.
#[derive(Debug, Default, Deserialize)]
pub struct PushQuery {
    #[serde(rename = "X-Atmosphere-Transport")]
    pub transport: Option<String>,
    #[serde(rename = "X-Atmosphere-TrackMessageSize")]
    pub track_message_size: Option<String>,
    #[serde(rename = "X-Atmosphere-tracking-id")]
    pub tracking_id: Option<Uuid>,
    pub session: Option<Uuid>,
}

/// The session a request asks to rejoin: the `session` query parameter,
/// else the session cookie.
fn requested_session(query: &PushQuery, headers: &HeaderMap) -> Option<Uuid> {
    query.session.or_else(|| {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|raw| Cookie::split_parse(raw))
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == SESSION_COOKIE)
            .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
    })
}

fn session_cookie(session: &WrappedSession) -> Option<HeaderValue> {
    let cookie = Cookie::build((SESSION_COOKIE, session.id().to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build();
    HeaderValue::from_str(&cookie.to_string()).ok()
}

impl PushQuery {
    fn tracks_length(&self) -> bool {
        self.track_message_size
            .as_deref()
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}

/// `GET /push`: WebSocket when the client asks for an upgrade, a chunked
/// stream otherwise.
pub async fn push_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PushQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let (session, created) = state
        .registry
        .resolve(requested_session(&query, &headers));
    let cookie = session_cookie(&session);
    let tracked = query.tracks_length();
    info!(
        target: "push.server",
        session_id = %session.id(),
        created,
        transport = query.transport.as_deref().unwrap_or("unspecified"),
        tracked,
        "push connection requested"
    );

    let mut response = match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| websocket_connection(socket, state, session, tracked))
            .into_response(),
        None => match query.tracking_id {
            Some(tracking_id) => streaming_response(&state, session, tracking_id, tracked),
            None => {
                return (StatusCode::BAD_REQUEST, "missing X-Atmosphere-tracking-id")
                    .into_response()
            }
        },
    };
    if let Some(cookie) = cookie {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// `POST /push`: a message sent by a streaming client, routed by tracking id.
pub async fn push_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PushQuery>,
    body: String,
) -> StatusCode {
    let Some(session) = query
        .tracking_id
        .and_then(|tracking_id| state.registry.stream_session(tracking_id))
    else {
        debug!(target: "push.server", tracking_id = ?query.tracking_id, "push for unknown stream");
        return StatusCode::NOT_FOUND;
    };

    match inbound(&state, &session, &body) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(InboundError::Rejected(_)) => StatusCode::FORBIDDEN,
        Err(InboundError::Malformed(_)) => StatusCode::BAD_REQUEST,
    }
}

async fn websocket_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    session: Arc<WrappedSession>,
    tracked: bool,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut frames = session.subscribe();
    record_connection_opened(WEBSOCKET);

    let hello = envelope_frame(&session, &state.token, &[]);
    if ws_tx
        .send(Message::Text(outbound(hello, tracked)))
        .await
        .is_err()
    {
        record_connection_closed(WEBSOCKET);
        return;
    }

    let writer_session = session.id();
    let writer = tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    if ws_tx
                        .send(Message::Text(outbound(frame, tracked)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "push.server", session_id = %writer_session, skipped, "connection lagged; frames skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let _ = inbound(&state, &session, &text);
            }
            Ok(Message::Close(frame)) => {
                debug!(
                    target: "push.server",
                    session_id = %session.id(),
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(target: "push.server", session_id = %session.id(), error = %err, "error receiving message");
                break;
            }
        }
    }

    writer.abort();
    let _ = writer.await;
    session.touch();
    record_connection_closed(WEBSOCKET);
    info!(target: "push.server", session_id = %session.id(), "websocket push connection closed");
}

/// Releases the tracking id once the streaming body is dropped.
struct StreamGuard {
    registry: SessionRegistry,
    session: Arc<WrappedSession>,
    tracking_id: Uuid,
    generation: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry
            .release_stream(self.tracking_id, self.generation);
        self.session.touch();
        record_connection_closed(STREAMING);
        info!(
            target: "push.server",
            session_id = %self.session.id(),
            tracking_id = %self.tracking_id,
            "streaming push connection closed"
        );
    }
}

fn streaming_response(
    state: &AppState,
    session: Arc<WrappedSession>,
    tracking_id: Uuid,
    tracked: bool,
) -> Response {
    let frames = session.subscribe();
    let hello = outbound(envelope_frame(&session, &state.token, &[]), tracked);
    let generation = state
        .registry
        .bind_stream(tracking_id, Arc::clone(&session));
    record_connection_opened(STREAMING);
    let guard = StreamGuard {
        registry: state.registry.clone(),
        session,
        tracking_id,
        generation,
    };

    let updates = stream::unfold((frames, guard), move |(mut frames, guard)| async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    return Some((Ok::<_, Infallible>(outbound(frame, tracked)), (frames, guard)))
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "push.server", tracking_id = %guard.tracking_id, skipped, "stream lagged; frames skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    let body = stream::once(async move { Ok::<_, Infallible>(hello) }).chain(updates);

    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=UTF-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

fn inbound(state: &AppState, session: &WrappedSession, raw: &str) -> Result<(), InboundError> {
    histogram!("push_channel_client_message_bytes", raw.len() as f64);
    match handle_client_message(session, &state.token, raw) {
        Ok(delivered) => {
            counter!("push_channel_client_messages_total", 1, "outcome" => "accepted");
            debug!(target: "push.server", session_id = %session.id(), delivered, "client message acknowledged");
            Ok(())
        }
        Err(err) => {
            let outcome = match err {
                InboundError::Rejected(_) => "rejected",
                InboundError::Malformed(_) => "malformed",
            };
            counter!("push_channel_client_messages_total", 1, "outcome" => outcome);
            warn!(target: "push.server", session_id = %session.id(), error = %err, "client message dropped");
            Err(err)
        }
    }
}

fn record_connection_opened(transport: &'static str) {
    counter!("push_channel_connections_opened_total", 1, "transport" => transport);
    increment_gauge!("push_channel_connections_active", 1.0, "transport" => transport);
}

fn record_connection_closed(transport: &'static str) {
    counter!("push_channel_connections_closed_total", 1, "transport" => transport);
    decrement_gauge!("push_channel_connections_active", 1.0, "transport" => transport);
}

fn outbound(frame: String, tracked: bool) -> String {
    if tracked {
        encode_tracked(&frame)
    } else {
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;

    fn cookies(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(raw).expect("header"));
        headers
    }

    #[test]
    fn session_is_read_from_query_then_cookie() {
        let from_cookie = Uuid::new_v4();
        let from_query = Uuid::new_v4();
        let headers = cookies(&format!("theme=dark; {SESSION_COOKIE}={from_cookie}"));

        assert_eq!(
            requested_session(&PushQuery::default(), &headers),
            Some(from_cookie)
        );
        let query = PushQuery {
            session: Some(from_query),
            ..PushQuery::default()
        };
        assert_eq!(requested_session(&query, &headers), Some(from_query));
        assert_eq!(
            requested_session(&PushQuery::default(), &cookies(&format!("{SESSION_COOKIE}=junk"))),
            None
        );
        assert_eq!(requested_session(&PushQuery::default(), &HeaderMap::new()), None);
    }

    #[test]
    fn session_cookie_names_the_session() {
        let (session, _) = SessionRegistry::new().resolve(None);
        let value = session_cookie(&session).expect("cookie");
        let cookie = Cookie::parse(value.to_str().expect("ascii")).expect("parse");
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), session.id().to_string());
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.path(), Some("/"));
    }
}
