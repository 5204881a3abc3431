use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use bytes::Bytes;
use club_transport::{reliable_exchange, Lane, Socket, TransportError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::callbacks::Callbacks;
use crate::error::FuseError;
use crate::hub::HubState;
use crate::id::MemberId;
use crate::wire;

pub(crate) type OnFused = Box<dyn FnOnce(Result<MemberId, FuseError>)>;

/// Everything the hub task reacts to: operations from the handle, frames
/// and disconnects from the reader tasks, and continuations the hub posts
/// to itself.
pub(crate) enum HubEvent {
    Fuse {
        socket: Socket,
        on_fused: OnFused,
    },
    FuseExchanged {
        socket: Socket,
        outcome: Result<Bytes, TransportError>,
        on_fused: OnFused,
    },
    TotalOrder {
        payload: Vec<u8>,
    },
    Unreliable {
        payload: Vec<u8>,
        on_complete: Box<dyn FnOnce()>,
    },
    Frame {
        proxy: MemberId,
        lane: Lane,
        frame: Bytes,
    },
    Disconnected {
        peer: MemberId,
    },
    /// Run the commit engine on a fresh loop turn.
    Commit,
    /// Deferred completion of an operation that had nothing to wait for.
    Complete(Box<dyn FnOnce()>),
    Shutdown,
}

/// Handle to one club member.
///
/// Cheap to clone; all clones speak to the same hub. Dropping the *last*
/// clone destroys the hub: the event loop winds down, every socket closes.
/// This may happen from inside any callback — the hub aborts whatever work
/// remained for that event.
///
/// `Club` is single-threaded by design. Create and use it on a
/// [`tokio::task::LocalSet`]; the hub task is spawned there.
#[derive(Clone)]
pub struct Club {
    shared: Rc<Shared>,
}

struct Shared {
    id: MemberId,
    events: mpsc::UnboundedSender<HubEvent>,
    callbacks: Rc<Callbacks>,
    destroyed: Rc<Cell<bool>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.destroyed.set(true);
        let _ = self.events.send(HubEvent::Shutdown);
    }
}

impl Club {
    /// Create a hub with a fresh identity and spawn its event loop on the
    /// current `LocalSet`. The new club has one member: us.
    pub fn new() -> Club {
        let id = MemberId::random();
        let (events, queue) = mpsc::unbounded_channel();
        let callbacks = Rc::new(Callbacks::default());
        let destroyed = Rc::new(Cell::new(false));
        let hub = HubState::new(id, events.clone(), callbacks.clone(), destroyed.clone());
        tokio::task::spawn_local(hub_loop(hub, queue));
        Club {
            shared: Rc::new(Shared {
                id,
                events,
                callbacks,
                destroyed,
            }),
        }
    }

    /// Our identity within the club.
    pub fn id(&self) -> MemberId {
        self.shared.id
    }

    /// Induct the peer on the other end of `socket` into the club.
    ///
    /// Runs the preamble handshake, then announces the connection to the
    /// rest of the club. `on_fused` fires exactly once with the peer's
    /// identity or the reason the handshake failed; membership callbacks
    /// follow once the corresponding fuse commits.
    pub fn fuse(&self, socket: Socket, on_fused: impl FnOnce(Result<MemberId, FuseError>) + 'static) {
        let _ = self.shared.events.send(HubEvent::Fuse {
            socket,
            on_fused: Box::new(on_fused),
        });
    }

    /// Send `payload` to every member, ourselves included, in the club's
    /// single agreed order. Delivery happens through `on_receive` once the
    /// message commits.
    pub fn total_order_broadcast(&self, payload: Vec<u8>) {
        let _ = self.shared.events.send(HubEvent::TotalOrder { payload });
    }

    /// Best-effort fanout along the routing overlay. `on_complete` fires
    /// when the last local send attempt has finished — it says nothing
    /// about delivery.
    pub fn unreliable_broadcast(&self, payload: Vec<u8>, on_complete: impl FnOnce() + 'static) {
        let _ = self.shared.events.send(HubEvent::Unreliable {
            payload,
            on_complete: Box::new(on_complete),
        });
    }

    /// Install the handler for members joining the configuration.
    pub fn on_insert(&self, f: impl FnMut(BTreeSet<MemberId>) + 'static) {
        self.shared.callbacks.set_on_insert(Box::new(f));
    }

    /// Install the handler for members leaving the configuration.
    pub fn on_remove(&self, f: impl FnMut(BTreeSet<MemberId>) + 'static) {
        self.shared.callbacks.set_on_remove(Box::new(f));
    }

    /// Install the handler for committed, totally ordered payloads.
    pub fn on_receive(&self, f: impl FnMut(MemberId, Vec<u8>) + 'static) {
        self.shared.callbacks.set_on_receive(Box::new(f));
    }

    /// Install the handler for unreliable broadcast payloads.
    pub fn on_receive_unreliable(&self, f: impl FnMut(MemberId, Vec<u8>) + 'static) {
        self.shared.callbacks.set_on_receive_unreliable(Box::new(f));
    }

    /// Install the direct-connect hook. Reserved: nothing fires it yet.
    pub fn on_direct_connect(&self, f: impl FnMut(MemberId) + 'static) {
        self.shared.callbacks.set_on_direct_connect(Box::new(f));
    }
}

impl Default for Club {
    fn default() -> Self {
        Club::new()
    }
}

/// The hub task: one event at a time, no interleaving, until destruction.
async fn hub_loop(mut hub: HubState, mut queue: mpsc::UnboundedReceiver<HubEvent>) {
    while let Some(event) = queue.recv().await {
        if hub.is_destroyed() {
            break;
        }
        match event {
            HubEvent::Fuse { socket, on_fused } => start_fuse(&hub, socket, on_fused),
            HubEvent::FuseExchanged {
                socket,
                outcome,
                on_fused,
            } => hub.complete_fuse(socket, outcome, on_fused),
            HubEvent::TotalOrder { payload } => hub.total_order_broadcast(payload),
            HubEvent::Unreliable {
                payload,
                on_complete,
            } => hub.unreliable_broadcast(payload, on_complete),
            HubEvent::Frame {
                proxy,
                lane: Lane::Reliable,
                frame,
            } => hub.on_recv_raw(proxy, frame),
            HubEvent::Frame {
                lane: Lane::Unreliable,
                frame,
                ..
            } => hub.on_recv_unreliable_raw(frame),
            HubEvent::Disconnected { peer } => hub.handle_disconnect(peer),
            HubEvent::Commit => hub.commit_what_was_seen_by_everyone(),
            HubEvent::Complete(on_complete) => on_complete(),
            HubEvent::Shutdown => break,
        }
        if hub.is_destroyed() {
            break;
        }
    }
    debug!(id = %hub.id(), "club hub stopped");
}

/// Kick off the preamble exchange off-loop; the socket comes back through a
/// `FuseExchanged` event once both sides have spoken.
fn start_fuse(hub: &HubState, socket: Socket, on_fused: OnFused) {
    let events = hub.events();
    let preamble = wire::encode_preamble(hub.id());
    tokio::task::spawn_local(async move {
        let mut socket = socket;
        let outcome = reliable_exchange(&mut socket, preamble).await;
        let _ = events.send(HubEvent::FuseExchanged {
            socket,
            outcome,
            on_fused,
        });
    });
}
