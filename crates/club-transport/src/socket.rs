use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::TransportError;

/// Capacity of the unreliable lane. Frames that would overflow it are
/// silently dropped, which is the lane's contract.
const UNRELIABLE_QUEUE: usize = 64;

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// Identifies one end of an in-process socket pair.
///
/// Stands in for a network address: stable for the lifetime of the socket,
/// unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem:{}", self.0)
    }
}

/// Which lane a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Reliable,
    Unreliable,
}

/// One end of a connected duplex.
///
/// Created in pairs via [`Socket::pair`]. Usually [`split`](Socket::split)
/// into a sender half (kept by whoever owns the connection) and a reader half
/// (owned by a read loop).
pub struct Socket {
    sender: SocketSender,
    reader: SocketReader,
    local: EndpointId,
}

/// Send half of a [`Socket`].
pub struct SocketSender {
    reliable: mpsc::UnboundedSender<Bytes>,
    unreliable: mpsc::Sender<Bytes>,
    remote: EndpointId,
}

/// Receive half of a [`Socket`].
pub struct SocketReader {
    reliable: mpsc::UnboundedReceiver<Bytes>,
    unreliable: mpsc::Receiver<Bytes>,
    reliable_open: bool,
    unreliable_open: bool,
}

impl Socket {
    /// Build a connected pair of sockets.
    pub fn pair() -> (Socket, Socket) {
        let left_id = EndpointId(NEXT_ENDPOINT.fetch_add(2, Ordering::Relaxed));
        let right_id = EndpointId(left_id.0 + 1);

        let (rel_lr, rel_at_right) = mpsc::unbounded_channel();
        let (rel_rl, rel_at_left) = mpsc::unbounded_channel();
        let (unrel_lr, unrel_at_right) = mpsc::channel(UNRELIABLE_QUEUE);
        let (unrel_rl, unrel_at_left) = mpsc::channel(UNRELIABLE_QUEUE);

        let left = Socket {
            sender: SocketSender {
                reliable: rel_lr,
                unreliable: unrel_lr,
                remote: right_id,
            },
            reader: SocketReader::new(rel_at_left, unrel_at_left),
            local: left_id,
        };
        let right = Socket {
            sender: SocketSender {
                reliable: rel_rl,
                unreliable: unrel_rl,
                remote: left_id,
            },
            reader: SocketReader::new(rel_at_right, unrel_at_right),
            local: right_id,
        };
        (left, right)
    }

    /// This end's identity.
    pub fn local_endpoint(&self) -> EndpointId {
        self.local
    }

    /// The peer end's identity.
    pub fn remote_endpoint(&self) -> EndpointId {
        self.sender.remote
    }

    /// Send a frame on the reliable lane.
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.sender.send(frame)
    }

    /// Send a frame on the unreliable lane. `on_sent` fires once the frame
    /// has been handed off (or dropped).
    pub fn send_unreliable(&self, frame: Bytes, on_sent: impl FnOnce()) {
        self.sender.send_unreliable(frame, on_sent)
    }

    /// Receive the next frame from either lane. `None` means the peer closed.
    pub async fn recv(&mut self) -> Option<(Lane, Bytes)> {
        self.reader.recv().await
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (SocketSender, SocketReader) {
        (self.sender, self.reader)
    }
}

impl SocketSender {
    /// The peer end's identity.
    pub fn remote_endpoint(&self) -> EndpointId {
        self.remote
    }

    /// Send a frame on the reliable lane.
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.reliable
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    /// Send a frame on the unreliable lane.
    ///
    /// Lossy by contract: a full queue or a closed peer drops the frame.
    /// `on_sent` still fires — it signals completion of the send attempt,
    /// not delivery.
    pub fn send_unreliable(&self, frame: Bytes, on_sent: impl FnOnce()) {
        if let Err(err) = self.unreliable.try_send(frame) {
            tracing::trace!(remote = %self.remote, "unreliable frame dropped: {err}");
        }
        on_sent();
    }
}

impl SocketReader {
    fn new(reliable: mpsc::UnboundedReceiver<Bytes>, unreliable: mpsc::Receiver<Bytes>) -> Self {
        Self {
            reliable,
            unreliable,
            reliable_open: true,
            unreliable_open: true,
        }
    }

    /// Receive the next frame from either lane.
    ///
    /// Frames within one lane arrive in send order. Returns `None` once the
    /// peer has closed and both lanes are drained.
    pub async fn recv(&mut self) -> Option<(Lane, Bytes)> {
        loop {
            tokio::select! {
                frame = self.reliable.recv(), if self.reliable_open => match frame {
                    Some(frame) => return Some((Lane::Reliable, frame)),
                    None => self.reliable_open = false,
                },
                frame = self.unreliable.recv(), if self.unreliable_open => match frame {
                    Some(frame) => return Some((Lane::Unreliable, frame)),
                    None => self.unreliable_open = false,
                },
                else => return None,
            }
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("local", &self.local)
            .field("remote", &self.sender.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reliable_frames_arrive_in_order() {
        let (a, mut b) = Socket::pair();

        a.send(Bytes::from_static(b"one")).unwrap();
        a.send(Bytes::from_static(b"two")).unwrap();

        assert_eq!(b.recv().await, Some((Lane::Reliable, Bytes::from_static(b"one"))));
        assert_eq!(b.recv().await, Some((Lane::Reliable, Bytes::from_static(b"two"))));
    }

    #[tokio::test]
    async fn unreliable_lane_is_tagged() {
        let (a, mut b) = Socket::pair();

        let mut sent = false;
        a.send_unreliable(Bytes::from_static(b"blip"), || sent = true);
        assert!(sent);

        assert_eq!(
            b.recv().await,
            Some((Lane::Unreliable, Bytes::from_static(b"blip")))
        );
    }

    #[tokio::test]
    async fn unreliable_overflow_drops_but_completes() {
        let (a, _b) = Socket::pair();

        let mut completions = 0;
        for _ in 0..(UNRELIABLE_QUEUE + 8) {
            a.send_unreliable(Bytes::from_static(b"x"), || completions += 1);
        }
        assert_eq!(completions, UNRELIABLE_QUEUE + 8);
    }

    #[tokio::test]
    async fn recv_returns_none_after_peer_drop() {
        let (a, mut b) = Socket::pair();

        a.send(Bytes::from_static(b"last")).unwrap();
        drop(a);

        assert_eq!(b.recv().await, Some((Lane::Reliable, Bytes::from_static(b"last"))));
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn send_to_dropped_peer_fails() {
        let (a, b) = Socket::pair();
        drop(b);

        assert!(matches!(
            a.send(Bytes::from_static(b"void")),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn endpoints_pair_up() {
        let (a, b) = Socket::pair();
        assert_eq!(a.remote_endpoint(), b.local_endpoint());
        assert_eq!(b.remote_endpoint(), a.local_endpoint());
        assert_ne!(a.local_endpoint(), b.local_endpoint());
    }
}
