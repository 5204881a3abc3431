//! Property tests: the wire codec is the identity on every message variant.

use std::collections::BTreeSet;

use proptest::prelude::*;

use club_protocol::wire::{
    decode_preamble, decode_unreliable, encode_preamble, encode_unreliable, Ack, AckData, Fuse,
    Header, Message, PortOffer, UserData,
};
use club_protocol::{MemberId, MessageId};

fn arb_member_id() -> impl Strategy<Value = MemberId> {
    any::<u128>().prop_map(|n| MemberId::from_bytes(n.to_be_bytes()))
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    (any::<u64>(), arb_member_id()).prop_map(|(ts, member)| MessageId::new(ts, member))
}

fn arb_id_set() -> impl Strategy<Value = BTreeSet<MemberId>> {
    prop::collection::btree_set(arb_member_id(), 0..8)
}

fn arb_header() -> impl Strategy<Value = Header> {
    (any::<u64>(), arb_member_id(), arb_message_id(), arb_id_set()).prop_map(
        |(time_stamp, originator, config_id, mut visited)| {
            visited.insert(originator);
            Header {
                originator,
                time_stamp,
                config_id,
                visited,
            }
        },
    )
}

fn arb_ack_data() -> impl Strategy<Value = AckData> {
    (arb_message_id(), arb_message_id(), arb_id_set()).prop_map(
        |(message_id, predecessor_id, neighbors)| AckData {
            message_id,
            predecessor_id,
            neighbors,
        },
    )
}

fn arb_message() -> impl Strategy<Value = Message> {
    let fuse = (arb_header(), arb_ack_data(), arb_member_id())
        .prop_map(|(header, ack, target)| Message::Fuse(Fuse { header, ack, target }));
    let user_data = (
        arb_header(),
        arb_ack_data(),
        prop::collection::vec(any::<u8>(), 0..2048),
    )
        .prop_map(|(header, ack, payload)| {
            Message::UserData(UserData {
                header,
                ack,
                payload,
            })
        });
    let port_offer = (arb_header(), arb_member_id(), any::<u16>(), any::<u16>()).prop_map(
        |(header, addressor, internal_port, external_port)| {
            Message::PortOffer(PortOffer {
                header,
                addressor,
                internal_port,
                external_port,
            })
        },
    );
    let ack = (arb_header(), arb_ack_data())
        .prop_map(|(header, ack)| Message::Ack(Ack { header, ack }));

    prop_oneof![fuse, user_data, port_offer, ack]
}

proptest! {
    /// Encode then decode is the identity, whatever the variant.
    #[test]
    fn message_roundtrip(message in arb_message()) {
        let bytes = message.encode();
        let decoded = Message::decode(&bytes).expect("decode");
        prop_assert_eq!(message, decoded);
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn decoder_is_total(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Message::decode(&bytes);
    }

    /// The handshake preamble round-trips.
    #[test]
    fn preamble_roundtrip(member in arb_member_id()) {
        let bytes = encode_preamble(member);
        let (version, decoded) = decode_preamble(&bytes).expect("decode");
        prop_assert_eq!(version, club_protocol::PROTOCOL_VERSION);
        prop_assert_eq!(member, decoded);
    }

    /// The unreliable frame round-trips.
    #[test]
    fn unreliable_roundtrip(
        source in arb_member_id(),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let bytes = encode_unreliable(source, &payload);
        let (decoded_source, decoded_payload) = decode_unreliable(&bytes).expect("decode");
        prop_assert_eq!(source, decoded_source);
        prop_assert_eq!(&payload[..], decoded_payload);
    }
}
