use club_transport::TransportError;

/// Why a fusion attempt failed. Delivered through the `on_fused` completion
/// callback; the socket is closed on every failure path.
#[derive(Debug, thiserror::Error)]
pub enum FuseError {
    #[error("handshake transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("handshake preamble could not be decoded")]
    ConnectionRefused,

    #[error("peer speaks protocol version {peer}, ours is {ours}")]
    NoProtocolOption { ours: u32, peer: u32 },

    #[error("peer is ourselves")]
    AlreadyConnected,
}
