use super::probe::Traffic;
use super::ChannelIo;

/// A freshly-established channel, after dial and (optionally) TLS but before
/// it is bound to a pool. The id is process-unique and keys the shared
/// channel→connection registry.
pub struct Channel {
    pub(crate) id: u64,
    pub(crate) io: ChannelIo,
    /// Peer certificate fingerprint in `sha256:AA:BB:...` form.
    pub(crate) fingerprint: Option<String>,
    /// Byte counters when the activity probe is installed.
    pub(crate) traffic: Option<Traffic>,
}

impl Channel {
    pub(crate) fn new(id: u64, io: ChannelIo) -> Self {
        Self {
            id,
            io,
            fingerprint: None,
            traffic: None,
        }
    }

    /// Shut the channel down without ever binding it. Used on handshake
    /// failures and post-shutdown completions.
    pub(crate) async fn close(mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.io.shutdown().await;
    }
}
