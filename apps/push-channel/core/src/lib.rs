//! Wire-level primitives shared by both ends of the UIDL push channel.
//!
//! - guarded framing of server-to-client UIDL payloads (`for(;;);[...]`)
//! - length-tracked framing used when `trackMessageLength` is enabled
//! - the security key property names and its envelope fragment

mod frame;
mod security_key;
mod tracked;

pub use frame::{decode_frame, encode_frame, GUARD_PREFIX};
pub use security_key::{security_key_fragment, CSRF_TOKEN_ID, UIDL_SECURITY_TOKEN_ID};
pub use tracked::{encode_tracked, FrameError, TrackedMessageDecoder, LENGTH_DELIMITER};
