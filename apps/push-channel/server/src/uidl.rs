use push_channel_core::encode_frame;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::security::{SecurityKeyError, SecurityToken};
use crate::session::WrappedSession;

/// A message pushed by the client over either transport.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "csrfToken")]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub rpc: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("malformed client message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("rejected client message: {0}")]
    Rejected(#[from] SecurityKeyError),
}

/// Renders a UIDL response object. `security_fragment` is interpolated as is
/// and must be empty or end with a comma.
pub fn render_envelope(sync_id: u64, security_fragment: &str, rpc: &[Value]) -> String {
    let rpc = Value::Array(rpc.to_vec());
    format!(r#"{{"syncId":{sync_id},{security_fragment}"changes":[],"rpc":{rpc}}}"#)
}

/// Next guarded envelope for `session`, carrying its security key.
pub fn envelope_frame(session: &WrappedSession, token: &SecurityToken, rpc: &[Value]) -> String {
    let envelope = render_envelope(
        session.next_sync_id(),
        &token.security_key_uidl(session),
        rpc,
    );
    encode_frame(&envelope)
}

/// Verifies an inbound message and acknowledges it with an envelope
/// broadcast to every connection of the session. Returns how many
/// connections received the acknowledgement.
pub fn handle_client_message(
    session: &WrappedSession,
    token: &SecurityToken,
    raw: &str,
) -> Result<usize, InboundError> {
    let message: ClientMessage = serde_json::from_str(raw)?;
    token.verify(session, message.csrf_token.as_deref())?;
    Ok(session.publish(envelope_frame(session, token, &message.rpc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use push_channel_core::decode_frame;
    use serde_json::json;

    #[test]
    fn envelope_interpolates_the_fragment() {
        assert_eq!(
            render_envelope(3, r#""uidlSecurityKey":"k","#, &[json!(["ping"])]),
            r#"{"syncId":3,"uidlSecurityKey":"k","changes":[],"rpc":[["ping"]]}"#
        );
        assert_eq!(
            render_envelope(0, "", &[]),
            r#"{"syncId":0,"changes":[],"rpc":[]}"#
        );
    }

    #[test]
    fn envelope_frames_are_guarded_and_numbered() {
        let token = SecurityToken::new(true);
        let (session, _) = SessionRegistry::new().resolve(None);
        let key = token.token(&session);

        let first = envelope_frame(&session, &token, &[]);
        let second = envelope_frame(&session, &token, &[]);
        let first: Value = serde_json::from_str(decode_frame(&first).expect("guarded")).expect("json");
        let second: Value =
            serde_json::from_str(decode_frame(&second).expect("guarded")).expect("json");
        assert_eq!(first["syncId"], json!(0));
        assert_eq!(second["syncId"], json!(1));
        assert_eq!(first["uidlSecurityKey"], json!(key));
    }

    #[tokio::test]
    async fn verified_messages_are_acknowledged_to_the_session() {
        let token = SecurityToken::new(true);
        let (session, _) = SessionRegistry::new().resolve(None);
        let key = token.token(&session);
        let mut connection = session.subscribe();

        let raw = json!({ "csrfToken": key, "rpc": [["ping"]] }).to_string();
        assert_eq!(handle_client_message(&session, &token, &raw).expect("accepted"), 1);

        let frame = connection.recv().await.expect("ack");
        let ack: Value = serde_json::from_str(decode_frame(&frame).expect("guarded")).expect("json");
        assert_eq!(ack["rpc"], json!([["ping"]]));
    }

    #[test]
    fn forged_or_malformed_messages_are_rejected() {
        let token = SecurityToken::new(true);
        let (session, _) = SessionRegistry::new().resolve(None);

        let forged = json!({ "csrfToken": "forged", "rpc": [] }).to_string();
        assert!(matches!(
            handle_client_message(&session, &token, &forged),
            Err(InboundError::Rejected(SecurityKeyError::Mismatch))
        ));
        assert!(matches!(
            handle_client_message(&session, &token, r#"{"rpc":[]}"#),
            Err(InboundError::Rejected(SecurityKeyError::Missing))
        ));
        assert!(matches!(
            handle_client_message(&session, &token, "not json"),
            Err(InboundError::Malformed(_))
        ));
    }
}
