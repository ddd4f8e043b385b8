//! Property-based tests using proptest
//!
//! These tests validate codec and reliability invariants across randomly
//! generated inputs: every representable packet round-trips at every
//! negotiated version pair, and the ordered channel delivers in send order
//! no matter how the network reorders or duplicates datagrams.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use proptest::prelude::*;
use std::time::Instant;
use voxelnet::codec;
use voxelnet::codec::schema::{FieldSpec, COMMANDS};
use voxelnet::codec::value::{FieldType, FieldValue};
use voxelnet::transport::channel::Channel;
use voxelnet::transport::wire::WirePacket;

const LIMIT: usize = 64;

fn value_strategy(ty: FieldType, sv: u8, pv: u16) -> BoxedStrategy<FieldValue> {
    match ty {
        FieldType::U8 => any::<u8>().prop_map(FieldValue::U8).boxed(),
        FieldType::U16 => any::<u16>().prop_map(FieldValue::U16).boxed(),
        FieldType::U32 => any::<u32>().prop_map(FieldValue::U32).boxed(),
        FieldType::U64 => any::<u64>().prop_map(FieldValue::U64).boxed(),
        FieldType::I16 => any::<i16>().prop_map(FieldValue::I16).boxed(),
        FieldType::I32 => any::<i32>().prop_map(FieldValue::I32).boxed(),
        FieldType::Str => "[a-zA-Z0-9 _:/-]{0,40}".prop_map(FieldValue::Str).boxed(),
        FieldType::Blob => prop::collection::vec(any::<u8>(), 0..128)
            .prop_map(FieldValue::Blob)
            .boxed(),
        // Kept well inside f32's exact-integer range once scaled
        FieldType::Pos => (
            -1000.0f32..1000.0,
            -1000.0f32..1000.0,
            -1000.0f32..1000.0,
        )
            .prop_map(|(x, y, z)| FieldValue::quantized_pos([x, y, z]))
            .boxed(),
        FieldType::List(elems) => prop::collection::vec(
            fields_strategy(elems, sv, pv).prop_map(FieldValue::Group),
            0..4,
        )
        .prop_map(FieldValue::List)
        .boxed(),
    }
}

/// Values for exactly the fields present at the given version pair, in
/// schema order
fn fields_strategy(
    specs: &'static [FieldSpec],
    sv: u8,
    pv: u16,
) -> BoxedStrategy<Vec<FieldValue>> {
    let mut fields: BoxedStrategy<Vec<FieldValue>> = Just(Vec::new()).boxed();
    for field in specs.iter().filter(|field| field.present(sv, pv)) {
        fields = (fields, value_strategy(field.ty, sv, pv))
            .prop_map(|(mut values, value)| {
                values.push(value);
                values
            })
            .boxed();
    }
    fields
}

fn packet_strategy() -> impl Strategy<Value = (u16, u8, u16, Vec<FieldValue>)> {
    let versions = prop::sample::select(vec![(24u8, 32u16), (27, 39), (28, 36), (28, 39)]);
    let command = prop::sample::select((0..COMMANDS.len()).collect::<Vec<_>>());
    (command, versions).prop_flat_map(|(index, (sv, pv))| {
        let spec = &COMMANDS[index];
        fields_strategy(spec.fields, sv, pv).prop_map(move |fields| (spec.id, sv, pv, fields))
    })
}

// Property: every representable packet round-trips unchanged at every
// supported version pair
proptest! {
    #[test]
    fn prop_codec_roundtrip((command, sv, pv, fields) in packet_strategy()) {
        let bytes = codec::encode(command, &fields, sv, pv).expect("encode should not fail");
        let got = codec::decode(bytes, sv, pv).expect("decode should not fail");
        prop_assert_eq!(got.command, command);
        prop_assert_eq!(got.fields, fields);
    }
}

// Property: encoding is deterministic
proptest! {
    #[test]
    fn prop_codec_deterministic((command, sv, pv, fields) in packet_strategy()) {
        let first = codec::encode(command, &fields, sv, pv).unwrap();
        let second = codec::encode(command, &fields, sv, pv).unwrap();
        prop_assert_eq!(first, second);
    }
}

// Property: decoding arbitrary bytes never panics
proptest! {
    #[test]
    fn prop_codec_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode(Bytes::from(raw), 28, 39);
    }
}

// Property: datagram framing never panics on arbitrary input
proptest! {
    #[test]
    fn prop_wire_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = WirePacket::decode(Bytes::from(raw));
    }
}

/// A batch of reliable payloads plus a delivery schedule: a permutation of
/// the packet indices with extra duplicate deliveries mixed in
fn delivery_schedule() -> impl Strategy<Value = (Vec<Vec<u8>>, Vec<usize>)> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..10).prop_flat_map(
        |payloads| {
            let count = payloads.len();
            let schedule = (
                Just((0..count).collect::<Vec<usize>>()),
                prop::collection::vec(0..count, 0..count),
            )
                .prop_map(|(mut base, duplicates)| {
                    base.extend(duplicates);
                    base
                })
                .prop_shuffle();
            (Just(payloads), schedule)
        },
    )
}

// Property: the ordered channel releases payloads in send order for any
// arrival order with duplicates, acking every reliable delivery
proptest! {
    #[test]
    fn prop_reorder_and_dedup((payloads, schedule) in delivery_schedule()) {
        let now = Instant::now();
        let mut sender = Channel::new(0);
        let mut receiver = Channel::new(0);

        // Payloads fit the limit, so each becomes exactly one packet
        let packets: Vec<_> = payloads
            .iter()
            .map(|p| {
                sender
                    .send(1, true, Bytes::from(p.clone()), LIMIT, now)
                    .unwrap()
                    .remove(0)
            })
            .collect();

        let mut delivered = Vec::new();
        for index in schedule {
            let (ack, out) = receiver.receive(packets[index].clone(), now);
            prop_assert_eq!(ack, Some(packets[index].seq));
            delivered.extend(out);
        }

        let expected: Vec<Bytes> = payloads.into_iter().map(Bytes::from).collect();
        prop_assert_eq!(delivered, expected);
    }
}

// Property: split reassembly is byte-exact for any chunk arrival order
proptest! {
    #[test]
    fn prop_split_reassembly(
        payload in prop::collection::vec(any::<u8>(), 200..3000),
        arrival in Just((0..64usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let now = Instant::now();
        let mut sender = Channel::new(1);
        let mut receiver = Channel::new(1);

        let whole = Bytes::from(payload);
        let packets = sender.send(1, false, whole.clone(), LIMIT, now).unwrap();
        prop_assert!(packets.len() > 1);
        prop_assert!(packets.len() <= arrival.len());

        let mut delivered = Vec::new();
        for index in arrival.into_iter().filter(|i| *i < packets.len()) {
            let (_, out) = receiver.receive(packets[index].clone(), now);
            delivered.extend(out);
        }
        prop_assert_eq!(delivered, vec![whole]);
    }
}
