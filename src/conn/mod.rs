pub mod channel;
pub mod connection;
pub mod probe;
pub mod stream;

pub use channel::Channel;
pub use connection::Connection;
pub use stream::Stream;

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Type alias for channel IO - any async read/write stream
pub type ChannelIo = Pin<Box<dyn AsyncReadWrite + Send>>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Per-connection lifecycle message, emitted when a stream finishes.
/// The owning queue routes `Reuse` to recycling and `Discard` to teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    Reuse,
    Discard,
}
