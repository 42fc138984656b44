//! Client side of the UIDL push channel.
//!
//! [`PushEndpoint`] owns one subscription on a [`push_transport::PushTransport`],
//! buffers outbound messages until the channel opens and hands every inbound
//! UIDL payload to a [`UidlHandler`].

mod endpoint;
mod handler;

pub use endpoint::{PushEndpoint, PushError, PushState};
pub use handler::{ForwardingHandler, UidlHandler};
