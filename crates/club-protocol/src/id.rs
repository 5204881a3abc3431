use std::fmt;

use uuid::Uuid;

/// The local logical clock. Monotone, bumped before composing any header and
/// advanced to at least the received value on every inbound message.
pub type TimeStamp = u64;

/// Identity of a club member. Opaque, totally ordered; the order is used for
/// tie-breaks between messages stamped at the same logical time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    pub const NIL: MemberId = MemberId(Uuid::nil());

    /// Allocate a fresh random identity.
    pub fn random() -> Self {
        MemberId(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        MemberId(Uuid::from_bytes(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group of the uuid is enough to tell members apart in logs.
        let s = self.0.as_simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({self})")
    }
}

/// Globally unique message identifier: logical time plus originator,
/// ordered lexicographically. This order *is* the club's total order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub time_stamp: TimeStamp,
    pub originator: MemberId,
}

impl MessageId {
    pub const ZERO: MessageId = MessageId {
        time_stamp: 0,
        originator: MemberId::NIL,
    };

    pub const fn new(time_stamp: TimeStamp, originator: MemberId) -> Self {
        MessageId {
            time_stamp,
            originator,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.time_stamp, self.originator)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u128) -> MemberId {
        MemberId(Uuid::from_u128(n))
    }

    #[test]
    fn message_id_orders_by_time_then_member() {
        let low = member(1);
        let high = member(2);

        assert!(MessageId::new(1, high) < MessageId::new(2, low));
        assert!(MessageId::new(3, low) < MessageId::new(3, high));
        assert_eq!(MessageId::new(3, low), MessageId::new(3, low));
    }

    #[test]
    fn zero_precedes_every_stamped_id() {
        assert!(MessageId::ZERO < MessageId::new(1, member(0)));
        assert!(MessageId::ZERO < MessageId::new(0, member(1)));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(MemberId::random(), MemberId::random());
    }
}
