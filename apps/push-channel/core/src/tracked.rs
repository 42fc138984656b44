use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Separates the decimal length prefix from the message body.
pub const LENGTH_DELIMITER: u8 = b'|';

const MAX_LENGTH_DIGITS: usize = 10;

/// Errors raised while decoding length-tracked messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("length prefix is not a decimal number: {0:?}")]
    InvalidLength(String),
    #[error("length prefix exceeds {MAX_LENGTH_DIGITS} digits")]
    LengthOverflow,
    #[error("tracked message is not valid utf-8")]
    Utf8,
}

/// Frames one message as `<byte length>|<message>`.
pub fn encode_tracked(message: &str) -> String {
    format!("{}|{}", message.len(), message)
}

/// Reassembles length-tracked messages from arbitrarily split chunks.
///
/// Lengths count UTF-8 bytes, so a chunk boundary may fall anywhere,
/// including inside a multi-byte character. Whitespace between messages is
/// padding and is skipped. On error the buffered bytes are discarded so the
/// next chunk starts clean.
#[derive(Debug, Default)]
pub struct TrackedMessageDecoder {
    buffer: BytesMut,
}

impl TrackedMessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held back waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        loop {
            let padding = self
                .buffer
                .iter()
                .take_while(|byte| byte.is_ascii_whitespace())
                .count();
            self.buffer.advance(padding);

            let Some(delimiter) = self.buffer.iter().position(|b| *b == LENGTH_DELIMITER) else {
                self.check_partial_prefix()?;
                break;
            };

            let length = match parse_length(&self.buffer[..delimiter]) {
                Ok(length) => length,
                Err(err) => {
                    self.buffer.clear();
                    return Err(err);
                }
            };

            if self.buffer.len() < delimiter + 1 + length {
                break;
            }

            self.buffer.advance(delimiter + 1);
            let payload = self.buffer.split_to(length);
            match String::from_utf8(payload.to_vec()) {
                Ok(message) => messages.push(message),
                Err(_) => {
                    self.buffer.clear();
                    return Err(FrameError::Utf8);
                }
            }
        }

        Ok(messages)
    }

    fn check_partial_prefix(&mut self) -> Result<(), FrameError> {
        if let Some(byte) = self.buffer.iter().find(|b| !b.is_ascii_digit()) {
            let rendered = String::from_utf8_lossy(&[*byte]).into_owned();
            self.buffer.clear();
            return Err(FrameError::InvalidLength(rendered));
        }
        if self.buffer.len() > MAX_LENGTH_DIGITS {
            self.buffer.clear();
            return Err(FrameError::LengthOverflow);
        }
        Ok(())
    }
}

fn parse_length(prefix: &[u8]) -> Result<usize, FrameError> {
    if prefix.len() > MAX_LENGTH_DIGITS {
        return Err(FrameError::LengthOverflow);
    }
    if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidLength(
            String::from_utf8_lossy(prefix).into_owned(),
        ));
    }
    std::str::from_utf8(prefix)
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or(FrameError::LengthOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_concatenated_messages() {
        let mut decoder = TrackedMessageDecoder::new();
        let wire = format!("{}{}", encode_tracked("for(;;);[{}]"), encode_tracked("abc"));
        let messages = decoder.feed(wire.as_bytes()).expect("decode");
        assert_eq!(messages, vec!["for(;;);[{}]".to_string(), "abc".to_string()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn reassembles_messages_split_across_chunks() {
        let mut decoder = TrackedMessageDecoder::new();
        let wire = encode_tracked(r#"{"text":"héllo"}"#);
        let bytes = wire.as_bytes();
        // split inside the length prefix and again inside the two-byte 'é'
        let accent = wire.find('é').expect("accent") + 1;

        assert!(decoder.feed(&bytes[..1]).expect("prefix").is_empty());
        assert!(decoder.feed(&bytes[1..accent]).expect("head").is_empty());
        let messages = decoder.feed(&bytes[accent..]).expect("tail");
        assert_eq!(messages, vec![r#"{"text":"héllo"}"#.to_string()]);
    }

    #[test]
    fn skips_whitespace_padding() {
        let mut decoder = TrackedMessageDecoder::new();
        let messages = decoder.feed(b"  \n3|abc \n2|de").expect("decode");
        assert_eq!(messages, vec!["abc".to_string(), "de".to_string()]);
    }

    #[test]
    fn rejects_non_numeric_prefix_and_recovers() {
        let mut decoder = TrackedMessageDecoder::new();
        assert_eq!(
            decoder.feed(b"x1|a"),
            Err(FrameError::InvalidLength("x1".into()))
        );
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.feed(b"1|a").expect("decode"), vec!["a".to_string()]);
    }

    #[test]
    fn rejects_garbage_before_delimiter_arrives() {
        let mut decoder = TrackedMessageDecoder::new();
        assert_eq!(decoder.feed(b"12a"), Err(FrameError::InvalidLength("a".into())));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn rejects_overlong_prefix() {
        let mut decoder = TrackedMessageDecoder::new();
        assert_eq!(decoder.feed(b"12345678901"), Err(FrameError::LengthOverflow));
        assert_eq!(decoder.feed(b"12345678901|x"), Err(FrameError::LengthOverflow));
    }

    #[test]
    fn rejects_invalid_utf8_payload() {
        let mut decoder = TrackedMessageDecoder::new();
        assert_eq!(decoder.feed(b"2|\xff\xfe"), Err(FrameError::Utf8));
    }
}
