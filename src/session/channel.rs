use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub type Rx = UnboundedReceiver<ChannelSignal>;

/// What a session's outbound task does with something pushed onto its
/// channel: either forward a text frame to the socket, or close it.
#[derive(Debug)]
pub enum ChannelSignal {
    Body(String),
    Close,
}

/// Cloneable handle other registries hold to reach a session without
/// knowing anything about its transport.
pub struct Tx(pub UnboundedSender<ChannelSignal>);

impl Tx {
    /// Enqueue a frame for delivery. A full or closed channel drops the
    /// frame silently — the session is already on its way out.
    pub fn send(&self, body: impl Into<String>) {
        let _ = self.0.send(ChannelSignal::Body(body.into()));
    }

    pub fn close(&self) {
        let _ = self.0.send(ChannelSignal::Close);
    }
}

impl Clone for Tx {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
