use std::collections::{BTreeMap, BTreeSet};

use crate::id::{MemberId, MessageId};
use crate::wire::{AckData, Fuse, Header, UserData};

/// A message whose commit requires quorum acknowledgement. Only these two
/// variants ever enter the log; port offers and acks are processed on
/// arrival and forgotten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckableMessage {
    Fuse(Fuse),
    UserData(UserData),
}

impl AckableMessage {
    pub fn header(&self) -> &Header {
        match self {
            AckableMessage::Fuse(m) => &m.header,
            AckableMessage::UserData(m) => &m.header,
        }
    }

    pub fn ack(&self) -> &AckData {
        match self {
            AckableMessage::Fuse(m) => &m.ack,
            AckableMessage::UserData(m) => &m.ack,
        }
    }

    pub fn id(&self) -> MessageId {
        self.header().id()
    }

    pub fn originator(&self) -> MemberId {
        self.header().originator
    }

    pub fn is_fuse(&self) -> bool {
        matches!(self, AckableMessage::Fuse(_))
    }
}

/// One not-yet-committed slot of the replicated log.
///
/// An entry may exist before its message has arrived: an ack routed here
/// ahead of the gossip creates a *stub* holding votes and causal
/// predecessors only. A stub can never commit and never counts as acked by
/// quorum; the real message merges into it on arrival, keeping everything
/// collected so far.
#[derive(Debug, Default)]
pub struct LogEntry {
    pub message: Option<AckableMessage>,
    /// Members whose votes commit this entry. Fixed when the message
    /// arrives, to the neighbour set its originator reported.
    pub quorum: BTreeSet<MemberId>,
    /// Latest vote per member that applies to this entry.
    pub acks: BTreeMap<MemberId, AckData>,
    /// Causal predecessors reported by the voters, by predecessor id.
    pub predecessors: BTreeMap<MessageId, MemberId>,
}

impl LogEntry {
    /// Attach the real message to this entry, seeding the originator's own
    /// vote (carried inside the message — the originator never receives its
    /// own broadcast back) and the quorum.
    fn absorb_message(&mut self, message: AckableMessage) {
        let originator = message.originator();
        let ack = message.ack().clone();
        self.quorum = ack.neighbors.clone();
        self.record_ack(originator, ack);
        self.message = Some(message);
    }

    fn record_ack(&mut self, voter: MemberId, ack: AckData) {
        self.predecessors.insert(ack.predecessor_id, voter);
        self.acks.insert(voter, ack);
    }

    pub fn is_fuse(&self) -> bool {
        self.message.as_ref().is_some_and(AckableMessage::is_fuse)
    }

    /// Every member of the quorum has voted for this exact message.
    pub fn acked_by_quorum(&self) -> bool {
        self.acked_by(self.quorum.iter())
    }

    /// Every *live* member of the quorum has voted. Used to judge entries
    /// concurrent with a newer committable fuse: votes that can still arrive
    /// are only those of members the fuse keeps alive.
    pub fn acked_by_quorum_of(&self, live: &BTreeSet<MemberId>) -> bool {
        self.acked_by(self.quorum.intersection(live))
    }

    fn acked_by<'a>(&self, mut voters: impl Iterator<Item = &'a MemberId>) -> bool {
        let Some(message) = &self.message else {
            return false;
        };
        let id = message.id();
        voters.all(|voter| {
            self.acks
                .get(voter)
                .is_some_and(|ack| ack.message_id == id)
        })
    }
}

/// Ordered map of not-yet-committed entries plus the commit cursors.
#[derive(Debug)]
pub struct MessageLog {
    entries: BTreeMap<MessageId, LogEntry>,
    /// Id of the most recently committed (or discarded) entry.
    pub last_committed: MessageId,
    /// Id of the most recently committed fuse.
    pub last_fuse_commit: MessageId,
    /// Originator of the entry at `last_committed`.
    pub last_commit_op: MemberId,
}

impl MessageLog {
    pub fn new(self_id: MemberId) -> Self {
        MessageLog {
            entries: BTreeMap::new(),
            last_committed: MessageId::ZERO,
            last_fuse_commit: MessageId::ZERO,
            last_commit_op: self_id,
        }
    }

    /// Create the entry for `message`, or merge it into the stub an early
    /// ack left behind. A re-insert of an already present message is a
    /// no-op.
    pub fn insert_entry(&mut self, message: AckableMessage) {
        let entry = self.entries.entry(message.id()).or_default();
        if entry.message.is_none() {
            entry.absorb_message(message);
        }
    }

    /// Record `voter`'s vote on the entry the ack names, creating a stub if
    /// the message itself has not arrived yet. Reapplying the same vote is
    /// idempotent.
    pub fn apply_ack(&mut self, voter: MemberId, ack: AckData) {
        self.entries
            .entry(ack.message_id)
            .or_default()
            .record_ack(voter, ack);
    }

    /// Latest entry that is a fuse, stubs excluded.
    pub fn find_highest_fuse(&self) -> Option<MessageId> {
        self.entries
            .iter()
            .rev()
            .find(|(_, entry)| entry.is_fuse())
            .map(|(id, _)| *id)
    }

    /// The causal predecessor of `id` in the local view: the greatest entry
    /// strictly below it, falling back to the commit cursor when the log
    /// holds nothing older.
    pub fn predecessor_of(&self, id: MessageId) -> MessageId {
        self.entries
            .range(..id)
            .next_back()
            .map(|(prior, _)| *prior)
            .unwrap_or(self.last_committed)
    }

    pub fn first_id(&self) -> Option<MessageId> {
        self.entries.keys().next().copied()
    }

    pub fn get(&self, id: &MessageId) -> Option<&LogEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<LogEntry> {
        self.entries.remove(id)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&MessageId, &LogEntry)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
