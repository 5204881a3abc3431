use std::collections::{BTreeMap, BTreeSet};

use crate::id::{MemberId, MessageId, TimeStamp};

/// Duplicate-suppression memory, one stream per originator.
///
/// Each stream is a committed floor plus the stamps seen above it. Once the
/// commit cursor passes a message, everything at or below its stamp in that
/// originator's stream collapses into the floor, so the set stays small no
/// matter how chatty the gossip is. Suppression only has to be best-effort:
/// redelivery of a processed frame is a no-op anyway.
#[derive(Debug, Default)]
pub struct SeenMessages {
    streams: BTreeMap<MemberId, Stream>,
}

#[derive(Debug, Default)]
struct Stream {
    /// Stamps at or below this are known seen.
    floor: TimeStamp,
    above: BTreeSet<TimeStamp>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: MessageId) {
        let stream = self.streams.entry(id.originator).or_default();
        if id.time_stamp > stream.floor {
            stream.above.insert(id.time_stamp);
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        match self.streams.get(&id.originator) {
            Some(stream) => {
                id.time_stamp <= stream.floor || stream.above.contains(&id.time_stamp)
            }
            None => false,
        }
    }

    /// Drop every record of messages originated by `member`. Called when the
    /// member leaves the committed configuration.
    pub fn forget_messages_from(&mut self, member: &MemberId) {
        self.streams.remove(member);
    }

    /// Mark the whole stream of `id.originator` up to and including `id` as
    /// seen, compacting the individual stamps it covers.
    pub fn seen_everything_up_to(&mut self, id: MessageId) {
        let stream = self.streams.entry(id.originator).or_default();
        if id.time_stamp > stream.floor {
            stream.floor = id.time_stamp;
        }
        let floor = stream.floor;
        stream.above.retain(|ts| *ts > floor);
    }

    #[cfg(test)]
    fn stamps_above_floor(&self, member: &MemberId) -> usize {
        self.streams.get(member).map_or(0, |s| s.above.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u128) -> MemberId {
        MemberId::from_bytes(n.to_be_bytes())
    }

    #[test]
    fn insert_then_contains() {
        let mut seen = SeenMessages::new();
        let id = MessageId::new(3, member(1));

        assert!(!seen.contains(&id));
        seen.insert(id);
        assert!(seen.contains(&id));
        assert!(!seen.contains(&MessageId::new(4, member(1))));
        assert!(!seen.contains(&MessageId::new(3, member(2))));
    }

    #[test]
    fn forgetting_a_member_clears_their_stream() {
        let mut seen = SeenMessages::new();
        seen.insert(MessageId::new(1, member(1)));
        seen.insert(MessageId::new(2, member(2)));

        seen.forget_messages_from(&member(1));

        assert!(!seen.contains(&MessageId::new(1, member(1))));
        assert!(seen.contains(&MessageId::new(2, member(2))));
    }

    #[test]
    fn compaction_keeps_coverage() {
        let mut seen = SeenMessages::new();
        for ts in 1..=10 {
            seen.insert(MessageId::new(ts, member(1)));
        }

        seen.seen_everything_up_to(MessageId::new(7, member(1)));

        // Everything at or below the floor still counts as seen.
        for ts in 1..=10 {
            assert!(seen.contains(&MessageId::new(ts, member(1))), "ts {ts}");
        }
        // But only the stamps above the floor are stored individually.
        assert_eq!(seen.stamps_above_floor(&member(1)), 3);
    }

    #[test]
    fn floor_covers_stamps_never_individually_inserted() {
        let mut seen = SeenMessages::new();
        seen.seen_everything_up_to(MessageId::new(5, member(1)));

        assert!(seen.contains(&MessageId::new(2, member(1))));
        assert!(!seen.contains(&MessageId::new(6, member(1))));
    }

    #[test]
    fn floor_never_moves_backwards() {
        let mut seen = SeenMessages::new();
        seen.seen_everything_up_to(MessageId::new(9, member(1)));
        seen.seen_everything_up_to(MessageId::new(4, member(1)));

        assert!(seen.contains(&MessageId::new(8, member(1))));
    }
}
