//! Error types used by all parts of the connection manager.

use std::io;

use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that may occur while dialing, handshaking, or exchanging messages
/// with a peer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection handle was disposed. Disposal is the universal
    /// cancellation primitive: every pending and future operation on the
    /// handle fails with this error at its next suspension point.
    #[error("connection disposed")]
    Disposed,

    /// The remote end closed the connection.
    #[error("connection closed by remote")]
    ConnectionClosed,

    /// The handshake did not start with the expected protocol string.
    #[error("invalid handshake protocol string")]
    InvalidProtocol,

    /// The info hash in the remote handshake does not match the torrent the
    /// connection was made for.
    #[error("invalid handshake info hash")]
    InvalidInfoHash,

    /// No encryption mode allowed by both policy and the peer could complete
    /// negotiation.
    #[error("encryption negotiation failed")]
    NegotiationFailed,

    /// A message frame advertised a length larger than the protocol allows.
    #[error("message frame too large")]
    FrameTooLarge,

    /// A message frame could not be parsed.
    #[error("invalid message frame")]
    InvalidMessage,

    /// The torrent mode rejected the peer at promotion.
    #[error("connection rejected by torrent mode")]
    ConnectionRejected,

    /// An operation referenced a torrent not registered with the subsystem.
    #[error("invalid torrent id")]
    InvalidTorrentId,

    /// A subsystem task (e.g. the disk task) has shut down and its command
    /// channel is closed.
    #[error("subsystem channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
