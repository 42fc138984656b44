use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Wire protocols the transport runtime can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportKind {
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "streaming")]
    Streaming,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Streaming => "streaming",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "websocket" => Ok(TransportKind::WebSocket),
            "streaming" => Ok(TransportKind::Streaming),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Subscription options handed to the transport runtime.
///
/// Typed on this side; [`TransportConfig::to_options`] flattens it into the
/// key/value bag the runtime understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub transport: TransportKind,
    pub fallback_transport: TransportKind,
    pub content_type: String,
    #[serde(serialize_with = "millis_as_string")]
    pub reconnect_interval: Duration,
    pub track_message_length: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::WebSocket,
            fallback_transport: TransportKind::Streaming,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            track_message_length: true,
            url: None,
        }
    }
}

impl TransportConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_fallback_transport(mut self, transport: TransportKind) -> Self {
        self.fallback_transport = transport;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_track_message_length(mut self, enabled: bool) -> Self {
        self.track_message_length = enabled;
        self
    }

    pub fn to_options(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(options)) => options,
            _ => Map::new(),
        }
    }
}

fn millis_as_string<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&interval.as_millis().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_runtime_expectations() {
        let options = TransportConfig::default().to_options();
        assert_eq!(options["transport"], json!("websocket"));
        assert_eq!(options["fallbackTransport"], json!("streaming"));
        assert_eq!(options["contentType"], json!("application/json; charset=UTF-8"));
        assert_eq!(options["reconnectInterval"], json!("5000"));
        assert_eq!(options["trackMessageLength"], json!(true));
        assert!(!options.contains_key("url"));
    }

    #[test]
    fn url_appears_once_set() {
        let options = TransportConfig::default()
            .with_url("/push")
            .with_reconnect_interval(Duration::from_millis(250))
            .to_options();
        assert_eq!(options["url"], json!("/push"));
        assert_eq!(options["reconnectInterval"], json!("250"));
    }

    #[test]
    fn transport_kind_parses_case_insensitively() {
        assert_eq!("WebSocket".parse::<TransportKind>(), Ok(TransportKind::WebSocket));
        assert_eq!("streaming".parse::<TransportKind>(), Ok(TransportKind::Streaming));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
