use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::id::MemberId;

/// Membership graph as witnessed by the votes of a committed fuse: one node
/// per voter, one directed edge per reported neighbour. At commit time the
/// reports are symmetric, so the graph is undirected in practice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: BTreeSet<MemberId>,
    edges: BTreeMap<MemberId, BTreeSet<MemberId>>,
}

impl Graph {
    pub fn add_node(&mut self, id: MemberId) {
        self.nodes.insert(id);
    }

    pub fn add_edge(&mut self, from: MemberId, to: MemberId) {
        self.nodes.insert(from);
        self.nodes.insert(to);
        if from != to {
            self.edges.entry(from).or_default().insert(to);
        }
    }

    fn neighbours(&self, id: &MemberId) -> impl Iterator<Item = &MemberId> {
        self.edges.get(id).into_iter().flatten()
    }
}

/// A graph holding only ourselves; the state of a freshly created hub.
pub fn single_node_graph(id: MemberId) -> Graph {
    let mut g = Graph::default();
    g.add_node(id);
    g
}

/// Per-source relay sets for the unreliable broadcast overlay.
///
/// For every possible source the table answers: which of *my* neighbours must
/// I forward a frame of that source to? The answer is this node's children in
/// a breadth-first spanning tree rooted at the source. BFS explores members
/// in identifier order, so every club member derives the identical tree from
/// the same committed graph: each member is relayed to by exactly one parent
/// and the whole component is covered without duplicates.
#[derive(Debug)]
pub struct RoutingTable {
    id: MemberId,
    targets: BTreeMap<MemberId, BTreeSet<MemberId>>,
}

impl RoutingTable {
    pub fn new(id: MemberId) -> Self {
        RoutingTable {
            id,
            targets: BTreeMap::new(),
        }
    }

    /// Recompute all relay sets from a new membership graph.
    pub fn recalculate(&mut self, graph: &Graph) {
        self.targets.clear();
        for source in &graph.nodes {
            let children = self.children_of_self(graph, *source);
            self.targets.insert(*source, children);
        }
    }

    /// Neighbours this node must relay a frame of `source` to.
    pub fn targets(&self, source: &MemberId) -> Option<&BTreeSet<MemberId>> {
        self.targets.get(source)
    }

    fn children_of_self(&self, graph: &Graph, source: MemberId) -> BTreeSet<MemberId> {
        let mut parent: BTreeMap<MemberId, MemberId> = BTreeMap::new();
        let mut queue = VecDeque::from([source]);
        let mut discovered = BTreeSet::from([source]);

        while let Some(current) = queue.pop_front() {
            for next in graph.neighbours(&current) {
                if discovered.insert(*next) {
                    parent.insert(*next, current);
                    queue.push_back(*next);
                }
            }
        }

        parent
            .into_iter()
            .filter(|(_, p)| *p == self.id)
            .map(|(child, _)| child)
            .collect()
    }
}
