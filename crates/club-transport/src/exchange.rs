use bytes::Bytes;

use crate::socket::{Lane, Socket};
use crate::TransportError;

/// Atomic two-way swap over the reliable lane.
///
/// Both sides call this with their own payload; each side sends first, then
/// reads the counterpart's payload. The reliable lane is FIFO, so the frame
/// read here is guaranteed to be the first one the peer ever sent on this
/// socket — later traffic queues up behind it untouched.
///
/// Unreliable frames arriving mid-exchange are discarded.
pub async fn reliable_exchange(
    socket: &mut Socket,
    payload: Bytes,
) -> Result<Bytes, TransportError> {
    socket.send(payload)?;

    loop {
        match socket.recv().await {
            Some((Lane::Reliable, frame)) => return Ok(frame),
            Some((Lane::Unreliable, _)) => continue,
            None => return Err(TransportError::Closed),
        }
    }
}
