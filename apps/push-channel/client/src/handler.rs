use tokio::sync::mpsc;
use tracing::debug;

/// Receives the JSON body of every UIDL frame pushed by the server.
pub trait UidlHandler: Send {
    fn handle_push_message(&mut self, json: &str);
}

impl<F> UidlHandler for F
where
    F: FnMut(&str) + Send,
{
    fn handle_push_message(&mut self, json: &str) {
        (self)(json)
    }
}

/// Forwards payloads onto a channel so another task can consume them.
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    tx: mpsc::UnboundedSender<String>,
}

impl ForwardingHandler {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl UidlHandler for ForwardingHandler {
    fn handle_push_message(&mut self, json: &str) {
        if self.tx.send(json.to_string()).is_err() {
            debug!(target: "push.endpoint", "payload consumer gone; dropping UIDL message");
        }
    }
}
