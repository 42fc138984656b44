/// Session attribute and envelope property holding the UIDL security key.
pub const UIDL_SECURITY_TOKEN_ID: &str = "uidlSecurityKey";

/// Property under which clients echo the security key back to the server.
pub const CSRF_TOKEN_ID: &str = "csrfToken";

/// Renders the security key as a JSON property ready to be interpolated into
/// a larger object literal, trailing comma included. `None` renders nothing.
pub fn security_key_fragment(token: Option<&str>) -> String {
    match token {
        Some(token) => format!("\"{UIDL_SECURITY_TOKEN_ID}\":\"{token}\","),
        None => String::new(),
    }
}
