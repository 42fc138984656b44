/// Literal prepended to every server-to-client UIDL payload. A browser that
/// evaluates the response as a script spins forever instead of reading it.
pub const GUARD_PREFIX: &str = "for(;;);";

/// Shortest input that can carry a payload: the guard plus `[` and `]`.
const MIN_FRAME_LEN: usize = GUARD_PREFIX.len() + 2;

/// Extracts the payload from a `for(;;);[PAYLOAD]` frame.
///
/// Returns `None` when the guard is missing or the input is too short to
/// hold the surrounding brackets. The payload is returned verbatim; it is
/// not validated as JSON.
pub fn decode_frame(input: &str) -> Option<&str> {
    if !input.starts_with(GUARD_PREFIX) || input.len() < MIN_FRAME_LEN {
        return None;
    }
    input.get(GUARD_PREFIX.len() + 1..input.len() - 1)
}

/// Wraps a UIDL payload in the guarded single-element array.
pub fn encode_frame(json: &str) -> String {
    format!("{GUARD_PREFIX}[{json}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_guard_and_brackets() {
        assert_eq!(decode_frame(r#"for(;;);[{"x":1}]"#), Some(r#"{"x":1}"#));
    }

    #[test]
    fn ignores_unguarded_input() {
        assert_eq!(decode_frame("garbage"), None);
        assert_eq!(decode_frame(r#"[{"x":1}]"#), None);
        assert_eq!(decode_frame(""), None);
    }

    #[test]
    fn guard_without_brackets_is_not_a_frame() {
        assert_eq!(decode_frame("for(;;);"), None);
        assert_eq!(decode_frame("for(;;);["), None);
        assert_eq!(decode_frame("for(;;);[]"), Some(""));
    }

    #[test]
    fn payload_is_returned_verbatim() {
        let frame = r#"for(;;);[{"changes":[],"text":"héllo"}]"#;
        assert_eq!(decode_frame(frame), Some(r#"{"changes":[],"text":"héllo"}"#));
        assert_eq!(decode_frame("for(;;);[not json]"), Some("not json"));
    }

    #[test]
    fn encoded_frames_decode_to_the_original_payload() {
        let payload = r#"{"syncId":3,"rpc":[]}"#;
        let frame = encode_frame(payload);
        assert_eq!(frame, r#"for(;;);[{"syncId":3,"rpc":[]}]"#);
        assert_eq!(decode_frame(&frame), Some(payload));
    }
}
