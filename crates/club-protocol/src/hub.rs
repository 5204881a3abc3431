use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use bytes::Bytes;
use club_transport::{Socket, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::callbacks::Callbacks;
use crate::club::{HubEvent, OnFused};
use crate::config::ConfigStore;
use crate::error::FuseError;
use crate::id::{MemberId, MessageId, TimeStamp};
use crate::log::{AckableMessage, LogEntry, MessageLog};
use crate::node::NodeTable;
use crate::routing::{single_node_graph, Graph, RoutingTable};
use crate::seen::SeenMessages;
use crate::wire::{self, Ack, AckData, Fuse, Header, Message, PortOffer, UserData};

/// The per-member protocol state machine.
///
/// Owned by exactly one event-loop task and mutated only from there; every
/// entry point runs to completion before the next event is taken, so there
/// is no locking anywhere. User callbacks are the one excursion out of our
/// control — any of them may drop the last club handle, which flips the
/// shared `destroyed` flag. Paths that continue after a callback re-check
/// the flag and bail out.
pub(crate) struct HubState {
    id: MemberId,
    time_stamp: TimeStamp,
    log: MessageLog,
    configs: ConfigStore,
    nodes: NodeTable,
    seen: SeenMessages,
    routing: RoutingTable,
    callbacks: Rc<Callbacks>,
    destroyed: Rc<Cell<bool>>,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl HubState {
    pub(crate) fn new(
        id: MemberId,
        events: mpsc::UnboundedSender<HubEvent>,
        callbacks: Rc<Callbacks>,
        destroyed: Rc<Cell<bool>>,
    ) -> Self {
        let mut routing = RoutingTable::new(id);
        routing.recalculate(&single_node_graph(id));
        info!(%id, "club hub created");
        HubState {
            id,
            time_stamp: 0,
            log: MessageLog::new(id),
            configs: ConfigStore::new(id),
            nodes: NodeTable::new(id),
            seen: SeenMessages::new(),
            routing,
            callbacks,
            destroyed,
            events,
        }
    }

    pub(crate) fn id(&self) -> MemberId {
        self.id
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<HubEvent> {
        self.events.clone()
    }

    /// Run `f` (which ends in a user callback) and report whether it
    /// destroyed the hub.
    fn destroys_hub(&mut self, f: impl FnOnce(&mut Self)) -> bool {
        let destroyed = self.destroyed.clone();
        f(self);
        destroyed.get()
    }

    // ── Dispatcher ───────────────────────────────────────────────────

    /// Entry point for every reliable frame. A frame that does not decode
    /// is fatal for the proxy connection only.
    pub(crate) fn on_recv_raw(&mut self, proxy: MemberId, frame: Bytes) {
        match Message::decode(&frame) {
            Ok(message) => self.on_recv(message),
            Err(err) => {
                warn!(id = %self.id, %proxy, "undecodable frame ({err}), dropping the connection");
                self.handle_disconnect(proxy);
            }
        }
    }

    fn on_recv(&mut self, mut message: Message) {
        message.header_mut().visited.insert(self.id);

        let id = message.id();
        if self.seen.contains(&id) {
            trace!(%id, "duplicate suppressed");
            return;
        }
        self.seen.insert(id);

        self.time_stamp = self.time_stamp.max(message.header().time_stamp);

        let originator = message.originator();
        self.nodes.get_or_insert(originator);

        // We are in `visited` from the moment of composition, so a peer
        // handing us back our own frame is a protocol violation.
        debug_assert_ne!(originator, self.id, "peer echoed our own frame");
        if originator == self.id {
            warn!(%id, "dropping echoed own frame");
            return;
        }

        self.broadcast(&message);

        if self.destroys_hub(|hub| hub.process(message)) {
            return;
        }
        self.commit_what_was_seen_by_everyone();
    }

    // ── Per-variant handlers ─────────────────────────────────────────

    fn process(&mut self, message: Message) {
        match message {
            Message::Ack(ack) => self.log.apply_ack(ack.header.originator, ack.ack),
            Message::Fuse(fuse) => self.process_fuse(fuse),
            Message::PortOffer(offer) => self.process_port_offer(offer),
            Message::UserData(data) => {
                let ack = self.construct_ack(data.header.id());
                self.broadcast(&Message::Ack(ack));
                self.add_log_entry(AckableMessage::UserData(data));
            }
        }
    }

    /// Vote for a fuse only while it is the highest we hold. A stale fuse is
    /// a loser in the making and feeding it votes would only delay the
    /// winner; re-acking a fresh top accelerates convergence.
    fn process_fuse(&mut self, fuse: Fuse) {
        let id = fuse.header.id();
        self.add_log_entry(AckableMessage::Fuse(fuse));

        match self.log.find_highest_fuse() {
            Some(highest) if id < highest => {}
            _ => {
                let ack = self.construct_ack(id);
                self.broadcast(&Message::Ack(ack));
                self.commit_what_was_seen_by_everyone();
            }
        }
    }

    fn process_port_offer(&mut self, offer: PortOffer) {
        if offer.addressor != self.id {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&offer.header.originator) {
            debug!(peer = %node.id, "recording port offer");
            node.set_remote_ports(offer.internal_port, offer.external_port);
        }
    }

    // ── Message construction ─────────────────────────────────────────

    /// Ourselves plus everyone we hold an open socket to.
    fn neighbors(&self) -> BTreeSet<MemberId> {
        let mut ids: BTreeSet<MemberId> = self.nodes.connected().map(|node| node.id).collect();
        ids.insert(self.id);
        ids
    }

    fn construct_header(&mut self) -> Header {
        self.time_stamp += 1;
        Header {
            originator: self.id,
            time_stamp: self.time_stamp,
            config_id: self.configs.current_id(),
            visited: BTreeSet::from([self.id]),
        }
    }

    /// Header plus vote for a new ackable message. The neighbour set in the
    /// vote fixes the message's quorum for good.
    fn construct_ackable(&mut self) -> (Header, AckData) {
        let header = self.construct_header();
        let id = header.id();
        let ack = AckData {
            message_id: id,
            predecessor_id: self.log.predecessor_of(id),
            neighbors: self.neighbors(),
        };
        (header, ack)
    }

    fn construct_ack(&mut self, acked: MessageId) -> Ack {
        let predecessor_id = self.log.predecessor_of(acked);
        let neighbors = self.neighbors();
        let header = self.construct_header();
        let ack = Ack {
            header,
            ack: AckData {
                message_id: acked,
                predecessor_id,
                neighbors,
            },
        };
        // Our own broadcast never comes back to us, so the vote has to be
        // recorded here.
        self.log.apply_ack(self.id, ack.ack.clone());
        ack
    }

    fn add_log_entry(&mut self, message: AckableMessage) {
        if message.id() <= self.log.last_committed && !message.is_fuse() {
            debug_assert!(false, "log entry at or below the commit cursor");
            warn!(id = %message.id(), "dropping entry at or below the commit cursor");
            return;
        }
        self.log.insert_entry(message);
    }

    // ── Broadcaster ──────────────────────────────────────────────────

    /// Gossip a frame to every connected peer that has not already seen it.
    /// Encoded once; the buffer handle is shared across sends.
    fn broadcast(&self, message: &Message) {
        let frame = message.encode();
        let visited = &message.header().visited;
        for node in self.nodes.connected() {
            if visited.contains(&node.id) {
                continue;
            }
            debug_assert_ne!(message.originator(), node.id, "relaying back to the originator");
            if !node.send(frame.clone()) {
                debug!(peer = %node.id, "send failed, the reader will surface the disconnect");
            }
        }
    }

    // ── Fuser ────────────────────────────────────────────────────────

    /// Second half of a fusion: the preamble exchange has finished (or
    /// failed) and the socket is back in our hands.
    pub(crate) fn complete_fuse(
        &mut self,
        socket: Socket,
        outcome: Result<Bytes, TransportError>,
        on_fused: OnFused,
    ) {
        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => return on_fused(Err(err.into())),
        };
        let (version, peer_id) = match wire::decode_preamble(&raw) {
            Ok(preamble) => preamble,
            Err(_) => return on_fused(Err(FuseError::ConnectionRefused)),
        };
        if version != wire::PROTOCOL_VERSION {
            return on_fused(Err(FuseError::NoProtocolOption {
                ours: wire::PROTOCOL_VERSION,
                peer: version,
            }));
        }
        if peer_id == self.id {
            return on_fused(Err(FuseError::AlreadyConnected));
        }

        info!(id = %self.id, peer = %peer_id, "fused");

        let endpoint = socket.remote_endpoint();
        self.bind_socket(peer_id, socket);

        let (header, ack) = self.construct_ackable();
        let fuse = Fuse {
            header,
            ack,
            target: peer_id,
        };
        self.broadcast(&Message::Fuse(fuse.clone()));
        self.add_log_entry(AckableMessage::Fuse(fuse));

        self.nodes.self_node_mut().peers.insert(peer_id, endpoint);

        if self.destroys_hub(move |_| on_fused(Ok(peer_id))) {
            return;
        }
        self.commit_what_was_seen_by_everyone();
    }

    /// Hand the socket to its node and start the reader task feeding frames
    /// back into the event loop.
    fn bind_socket(&mut self, peer: MemberId, socket: Socket) {
        let (sender, mut reader) = socket.split();
        let cancel = CancellationToken::new();
        self.nodes.get_or_insert(peer).attach(sender, cancel.clone());

        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = reader.recv() => match frame {
                        Some((lane, frame)) => {
                            if events.send(HubEvent::Frame { proxy: peer, lane, frame }).is_err() {
                                return;
                            }
                        }
                        None => {
                            let _ = events.send(HubEvent::Disconnected { peer });
                            return;
                        }
                    },
                }
            }
        });
    }

    /// A peer's connection died: propose the reconfiguration that records
    /// the loss. The fuse carries our shrunken neighbour set, so the quorum
    /// it needs no longer includes the lost peer.
    pub(crate) fn handle_disconnect(&mut self, peer: MemberId) {
        let Some(node) = self.nodes.get_mut(&peer) else {
            return;
        };
        if !node.is_connected() {
            return;
        }
        node.disconnect();
        debug!(id = %self.id, %peer, "peer disconnected, proposing reconfiguration");

        let (header, ack) = self.construct_ackable();
        let fuse = Fuse {
            header,
            ack,
            target: peer,
        };
        self.broadcast(&Message::Fuse(fuse.clone()));
        self.add_log_entry(AckableMessage::Fuse(fuse));
        self.commit_what_was_seen_by_everyone();
    }

    // ── User sends ───────────────────────────────────────────────────

    pub(crate) fn total_order_broadcast(&mut self, payload: Vec<u8>) {
        let (header, ack) = self.construct_ackable();
        let data = UserData {
            header,
            ack,
            payload,
        };
        self.broadcast(&Message::UserData(data.clone()));
        self.add_log_entry(AckableMessage::UserData(data));
        // Commit on a fresh loop turn, behind whatever is already queued.
        let _ = self.events.send(HubEvent::Commit);
    }

    pub(crate) fn unreliable_broadcast(&mut self, payload: Vec<u8>, on_complete: Box<dyn FnOnce()>) {
        let frame = wire::encode_unreliable(self.id, &payload);

        let connected: Vec<_> = self.nodes.connected().collect();
        if connected.is_empty() {
            // No sends in flight; schedule the completion on the loop
            // rather than invoking it synchronously.
            let _ = self.events.send(HubEvent::Complete(on_complete));
            return;
        }

        let pending = Rc::new(Cell::new(connected.len()));
        let handler = Rc::new(RefCell::new(Some(on_complete)));
        for node in connected {
            let pending = pending.clone();
            let handler = handler.clone();
            node.send_unreliable(frame.clone(), move || {
                pending.set(pending.get() - 1);
                if pending.get() == 0 {
                    if let Some(on_complete) = handler.borrow_mut().take() {
                        on_complete();
                    }
                }
            });
        }
    }

    /// An unreliable frame arrived: relay it along the routing tree of its
    /// source, then surface the payload.
    pub(crate) fn on_recv_unreliable_raw(&mut self, frame: Bytes) {
        let Ok((source, payload)) = wire::decode_unreliable(&frame) else {
            warn!(id = %self.id, "undecodable unreliable frame");
            return;
        };
        if !self.nodes.contains(&source) {
            trace!(%source, "unreliable frame from an unknown source");
            return;
        }

        if let Some(targets) = self.routing.targets(&source) {
            for target in targets {
                let Some(node) = self.nodes.get(target) else {
                    continue;
                };
                if node.is_connected() {
                    node.send_unreliable(frame.clone(), || {});
                }
            }
        }

        let payload = payload.to_vec();
        self.callbacks.clone().receive_unreliable(source, payload);
    }

    // ── Commit engine ────────────────────────────────────────────────

    /// Advance the commit cursor over every entry the club agrees on.
    ///
    /// The newest fuse that is fully acked, if any, is the pivot: entries
    /// below it that the pivot's survivors no longer vouch for are
    /// concurrent losers and are discarded; everything else commits in
    /// message-id order until an entry is missing votes, is missing its
    /// causal predecessor, or sits above a fuse that cannot commit yet.
    pub(crate) fn commit_what_was_seen_by_everyone(&mut self) {
        let mut live = self.configs.current_members().clone();
        let mut committable_fuse: Option<MessageId> = None;
        for (id, entry) in self.log.iter().rev() {
            if entry.is_fuse() && entry.acked_by_quorum() {
                committable_fuse = Some(*id);
                live = entry.quorum.clone();
                break;
            }
        }

        enum Step {
            Stop,
            Discard,
            Commit,
        }

        loop {
            let Some(id) = self.log.first_id() else { break };
            let entry = self.log.get(&id).expect("first entry exists");

            let step = if entry.is_fuse() {
                match committable_fuse {
                    // The lowest entry is a fuse we know cannot commit.
                    None => Step::Stop,
                    Some(chosen) if id < chosen => {
                        if entry.acked_by_quorum_of(&live) {
                            // Everyone the chosen fuse keeps alive has voted
                            // for this older fuse: it commits ahead of it.
                            Step::Commit
                        } else {
                            // Concurrent loser: a vote it is missing can no
                            // longer arrive.
                            Step::Discard
                        }
                    }
                    Some(chosen) if id > chosen => Step::Stop,
                    Some(_) => Step::Commit,
                }
            } else if entry.acked_by_quorum_of(&live) {
                Step::Commit
            } else {
                // Also covers stubs: an entry whose message is still in
                // flight never counts as acked.
                Step::Stop
            };

            match step {
                Step::Stop => break,
                Step::Discard => {
                    let entry = self.log.remove(&id).expect("first entry exists");
                    debug!(id = %self.id, loser = %id, "discarding concurrent fuse");
                    self.log.last_committed = id;
                    self.log.last_commit_op =
                        entry.message.as_ref().expect("fuses are never stubs").originator();
                    continue;
                }
                Step::Commit => {}
            }

            // Causality gate: the reported predecessor must be committed
            // already, unless it predates the last committed fuse. With the
            // entry's configuration unknown to us, predecessor reports are
            // only trusted when one matches the cursor exactly.
            let entry = self.log.get(&id).expect("first entry exists");
            if !entry.predecessors.is_empty() {
                let config_known = entry
                    .message
                    .as_ref()
                    .is_some_and(|m| self.configs.contains(&m.header().config_id));
                let mut picked = None;
                for (&predecessor, _) in entry.predecessors.iter().rev() {
                    if predecessor == self.log.last_committed {
                        picked = Some(predecessor);
                        break;
                    }
                    if !config_known {
                        continue;
                    }
                    picked = Some(predecessor);
                    break;
                }
                if let Some(predecessor) = picked {
                    if predecessor != self.log.last_committed
                        && predecessor > self.log.last_fuse_commit
                    {
                        break;
                    }
                }
            }

            if committable_fuse == Some(id) {
                committable_fuse = None;
            }

            let entry = self.log.remove(&id).expect("first entry exists");
            self.seen.seen_everything_up_to(id);
            if entry.is_fuse() {
                self.log.last_fuse_commit = id;
            }
            self.log.last_committed = id;
            self.log.last_commit_op =
                entry.message.as_ref().expect("committed entries have messages").originator();
            debug!(id = %self.id, committed = %id, "commit");

            self.commit(entry);
            if self.destroyed.get() {
                return;
            }
        }
    }

    fn commit(&mut self, mut entry: LogEntry) {
        let fully_acked = entry.acked_by_quorum();
        match entry.message.take().expect("committed entries have messages") {
            AckableMessage::Fuse(fuse) => self.on_commit_fuse(fuse, entry, fully_acked),
            AckableMessage::UserData(data) => {
                // Payload of a member that already left the configuration
                // went down with its node.
                if self.nodes.contains(&data.header.originator) {
                    self.callbacks.clone().receive(data.header.originator, data.payload);
                }
            }
        }
    }

    // ── Reconfiguration ──────────────────────────────────────────────

    /// A fuse committed. If its whole quorum voted, its quorum *is* the next
    /// configuration: rebuild the routing overlay from the votes, install
    /// the member set, forget whoever fell out, and tell the user.
    fn on_commit_fuse(&mut self, fuse: Fuse, entry: LogEntry, fully_acked: bool) {
        if !fully_acked {
            return;
        }
        let id = fuse.header.id();

        let mut graph = Graph::default();
        for (voter, ack) in &entry.acks {
            graph.add_node(*voter);
            for neighbour in &ack.neighbors {
                graph.add_edge(*voter, *neighbour);
            }
        }
        self.routing.recalculate(&graph);

        let previous = self.configs.current_members().clone();
        let members = entry.quorum;
        let removed: BTreeSet<MemberId> = previous.difference(&members).copied().collect();
        let added: BTreeSet<MemberId> = members.difference(&previous).copied().collect();

        debug!(id = %self.id, config = %id, "installing configuration");
        self.configs.install(id, members);

        for member in &removed {
            self.seen.forget_messages_from(member);
            self.nodes.remove(member);
        }

        if !added.is_empty() {
            let callbacks = self.callbacks.clone();
            if self.destroys_hub(move |_| callbacks.insert(added)) {
                return;
            }
        }
        if !removed.is_empty() {
            let callbacks = self.callbacks.clone();
            if self.destroys_hub(move |_| callbacks.remove(removed)) {
                return;
            }
        }
    }
}
