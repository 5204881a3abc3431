use std::collections::BTreeMap;

use bytes::Bytes;
use club_transport::{EndpointId, SocketSender};
use tokio_util::sync::CancellationToken;

use crate::id::MemberId;

/// What we know about one club member, ourselves included.
///
/// A node may exist without a socket: members we only heard about through
/// gossip are placeholders until (and unless) a direct connection forms.
/// Erasing a connected node tears its reader task down with it.
pub struct Node {
    pub id: MemberId,
    sender: Option<SocketSender>,
    cancel: Option<CancellationToken>,
    /// Directly connected peers this node has reported, by their endpoint.
    pub peers: BTreeMap<MemberId, EndpointId>,
    /// Port hints received via a port offer addressed to us.
    remote_ports: Option<(u16, u16)>,
}

impl Node {
    pub fn new(id: MemberId) -> Self {
        Node {
            id,
            sender: None,
            cancel: None,
            peers: BTreeMap::new(),
            remote_ports: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_some()
    }

    /// Bind a socket to this node, replacing (and tearing down) any
    /// previous one.
    pub fn attach(&mut self, sender: SocketSender, cancel: CancellationToken) {
        self.disconnect();
        self.sender = Some(sender);
        self.cancel = Some(cancel);
    }

    /// Send on the reliable lane. Returns `false` when the connection is
    /// gone; the reader task surfaces the disconnect separately.
    pub fn send(&self, frame: Bytes) -> bool {
        match &self.sender {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Send on the unreliable lane; `on_sent` fires when the send attempt
    /// completes.
    pub fn send_unreliable(&self, frame: Bytes, on_sent: impl FnOnce()) {
        match &self.sender {
            Some(sender) => sender.send_unreliable(frame, on_sent),
            None => on_sent(),
        }
    }

    /// Drop the socket and stop its reader task.
    pub fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.sender = None;
    }

    pub fn set_remote_ports(&mut self, internal: u16, external: u16) {
        self.remote_ports = Some((internal, external));
    }

    pub fn remote_ports(&self) -> Option<(u16, u16)> {
        self.remote_ports
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Everyone we currently track, keyed by identity. Contains ourselves from
/// birth. Members are inserted on first contact (handshake or gossip from an
/// unknown originator) and erased only when a committed fuse drops them from
/// the configuration.
pub struct NodeTable {
    self_id: MemberId,
    nodes: BTreeMap<MemberId, Node>,
}

impl NodeTable {
    pub fn new(self_id: MemberId) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(self_id, Node::new(self_id));
        NodeTable { self_id, nodes }
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &MemberId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &MemberId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Fetch or create the record for `id`.
    pub fn get_or_insert(&mut self, id: MemberId) -> &mut Node {
        self.nodes.entry(id).or_insert_with(|| Node::new(id))
    }

    pub fn remove(&mut self, id: &MemberId) -> Option<Node> {
        self.nodes.remove(id)
    }

    /// All connected peers, in identity order. Never yields ourselves.
    pub fn connected(&self) -> impl Iterator<Item = &Node> {
        let self_id = self.self_id;
        self.nodes
            .values()
            .filter(move |node| node.id != self_id && node.is_connected())
    }

    pub fn self_node_mut(&mut self) -> &mut Node {
        self.nodes
            .get_mut(&self.self_id)
            .expect("own node is never erased")
    }
}
