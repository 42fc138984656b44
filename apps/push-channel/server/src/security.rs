use push_channel_core::{security_key_fragment, UIDL_SECURITY_TOKEN_ID};
use thiserror::Error;
use uuid::Uuid;

use crate::session::WrappedSession;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityKeyError {
    #[error("request carried no security key")]
    Missing,
    #[error("security key does not match the session")]
    Mismatch,
}

/// Per-session random key echoed into UIDL envelopes and expected back on
/// every client message.
#[derive(Debug, Clone, Copy)]
pub struct SecurityToken {
    enabled: bool,
}

impl SecurityToken {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the session's key, minting a v4 UUID on first use. The key
    /// never changes for the lifetime of the session.
    pub fn token(&self, session: &WrappedSession) -> String {
        session.attribute_or_insert_with(UIDL_SECURITY_TOKEN_ID, || Uuid::new_v4().to_string())
    }

    /// Envelope fragment `"uidlSecurityKey":"<key>",`; empty when disabled.
    pub fn security_key_uidl(&self, session: &WrappedSession) -> String {
        if !self.enabled {
            return String::new();
        }
        security_key_fragment(Some(&self.token(session)))
    }

    pub fn verify(
        &self,
        session: &WrappedSession,
        supplied: Option<&str>,
    ) -> Result<(), SecurityKeyError> {
        if !self.enabled {
            return Ok(());
        }
        let supplied = supplied.ok_or(SecurityKeyError::Missing)?;
        if supplied == self.token(session) {
            Ok(())
        } else {
            Err(SecurityKeyError::Mismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use std::sync::Arc;

    fn fresh_session() -> Arc<WrappedSession> {
        SessionRegistry::new().resolve(None).0
    }

    #[test]
    fn token_is_stable_within_a_session() {
        let token = SecurityToken::new(true);
        let session = fresh_session();
        let first = token.token(&session);
        assert_eq!(token.token(&session), first);

        let parsed = Uuid::parse_str(&first).expect("uuid");
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(first, first.to_lowercase());
        assert_eq!(first.len(), 36);

        let other = token.token(&fresh_session());
        assert_ne!(other, first);
        assert!(Uuid::parse_str(&other).is_ok());
    }

    #[test]
    fn concurrent_mint_settles_on_one_value() {
        let token = SecurityToken::new(true);
        let session = fresh_session();
        let minted: Vec<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| token.token(&session)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread"))
                .collect()
        });
        assert!(minted.iter().all(|value| *value == minted[0]));
        assert_eq!(token.token(&session), minted[0]);
    }

    #[test]
    fn fragment_embeds_the_session_key() {
        let token = SecurityToken::new(true);
        let session = fresh_session();
        let key = token.token(&session);
        assert_eq!(
            token.security_key_uidl(&session),
            format!("\"uidlSecurityKey\":\"{key}\",")
        );
    }

    #[test]
    fn verify_rejects_missing_and_foreign_keys() {
        let token = SecurityToken::new(true);
        let session = fresh_session();
        let key = token.token(&session);
        assert_eq!(token.verify(&session, Some(&key)), Ok(()));
        assert_eq!(token.verify(&session, None), Err(SecurityKeyError::Missing));
        assert_eq!(
            token.verify(&session, Some("not-the-key")),
            Err(SecurityKeyError::Mismatch)
        );
    }

    #[test]
    fn disabled_token_renders_nothing_and_accepts_anything() {
        let token = SecurityToken::new(false);
        let session = fresh_session();
        assert_eq!(token.security_key_uidl(&session), "");
        assert_eq!(token.verify(&session, None), Ok(()));
        assert_eq!(token.verify(&session, Some("whatever")), Ok(()));
    }
}
