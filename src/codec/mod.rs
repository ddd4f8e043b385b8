//! # Versioned Packet Codec
//!
//! Stateless bidirectional mapping between wire bytes and [`LogicalPacket`]
//! values for every command in the schema table.
//!
//! ## Wire Format
//! ```text
//! [Command(2)] [Field 0] [Field 1] ... (fields gated by negotiated versions)
//! ```
//!
//! Round-trip law: for every field set representable at a version pair,
//! `decode(encode(c, f, sv, pv), sv, pv) == (c, f)`.
//!
//! Decode tolerates trailing bytes after the last field this build knows:
//! a newer peer may append fields behind a version gate we do not carry.

pub mod schema;
pub mod value;
pub mod wire;

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use schema::{command_by_id, FieldSpec};
use value::{FieldType, FieldValue, LogicalPacket};

/// Encode a command and its fields at the given negotiated versions.
///
/// `fields` must supply exactly the values present at those versions, in
/// schema order. Fields above the version threshold are omitted entirely.
///
/// # Errors
/// `UnsupportedCommand` for an unknown id; `FieldOutOfRange` when a value
/// does not match or fit its declared wire type.
pub fn encode(
    command: u16,
    fields: &[FieldValue],
    serialize_ver: u8,
    protocol_ver: u16,
) -> Result<Bytes> {
    let spec = command_by_id(command).ok_or(ProtocolError::UnsupportedCommand(command))?;

    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16(command);

    let mut supplied = fields.iter();
    for field in spec.fields {
        if !field.present(serialize_ver, protocol_ver) {
            continue;
        }
        let value = supplied
            .next()
            .ok_or(ProtocolError::FieldOutOfRange { field: field.name })?;
        encode_field(&mut buf, field, value, serialize_ver, protocol_ver)?;
    }
    if supplied.next().is_some() {
        // More values than the schema admits at this version pair
        return Err(ProtocolError::FieldOutOfRange { field: spec.name });
    }

    Ok(buf.freeze())
}

fn encode_field(
    buf: &mut BytesMut,
    field: &FieldSpec,
    value: &FieldValue,
    serialize_ver: u8,
    protocol_ver: u16,
) -> Result<()> {
    let mismatch = ProtocolError::FieldOutOfRange { field: field.name };
    match (field.ty, value) {
        (FieldType::U8, FieldValue::U8(v)) => buf.put_u8(*v),
        (FieldType::U16, FieldValue::U16(v)) => buf.put_u16(*v),
        (FieldType::U32, FieldValue::U32(v)) => buf.put_u32(*v),
        (FieldType::U64, FieldValue::U64(v)) => buf.put_u64(*v),
        (FieldType::I16, FieldValue::I16(v)) => buf.put_i16(*v),
        (FieldType::I32, FieldValue::I32(v)) => buf.put_i32(*v),
        (FieldType::Str, FieldValue::Str(s)) => wire::put_string(buf, s, field.name)?,
        (FieldType::Blob, FieldValue::Blob(b)) => wire::put_blob(buf, b, field.name)?,
        (FieldType::Pos, FieldValue::Pos(p)) => wire::put_pos(buf, *p, field.name)?,
        (FieldType::List(elem_spec), FieldValue::List(items)) => {
            if items.len() > u16::MAX as usize {
                return Err(mismatch);
            }
            buf.put_u16(items.len() as u16);
            for item in items {
                let FieldValue::Group(members) = item else {
                    return Err(mismatch);
                };
                let mut supplied = members.iter();
                for elem in elem_spec {
                    if !elem.present(serialize_ver, protocol_ver) {
                        continue;
                    }
                    let value = supplied
                        .next()
                        .ok_or(ProtocolError::FieldOutOfRange { field: elem.name })?;
                    encode_field(buf, elem, value, serialize_ver, protocol_ver)?;
                }
                if supplied.next().is_some() {
                    return Err(mismatch);
                }
            }
        }
        _ => return Err(mismatch),
    }
    Ok(())
}

/// Decode wire bytes into a [`LogicalPacket`] at the given versions.
///
/// # Errors
/// `MalformedPacket` when a length prefix overruns the buffer or a field
/// present at these versions is truncated; `UnsupportedCommand` for an id
/// missing from the schema table.
pub fn decode(mut bytes: Bytes, serialize_ver: u8, protocol_ver: u16) -> Result<LogicalPacket> {
    let command = wire::get_u16(&mut bytes)?;
    let spec = command_by_id(command).ok_or(ProtocolError::UnsupportedCommand(command))?;

    let mut fields = Vec::with_capacity(spec.fields.len());
    for field in spec.fields {
        if !field.present(serialize_ver, protocol_ver) {
            continue;
        }
        fields.push(decode_field(&mut bytes, field, serialize_ver, protocol_ver)?);
    }

    Ok(LogicalPacket { command, fields })
}

fn decode_field(
    bytes: &mut Bytes,
    field: &FieldSpec,
    serialize_ver: u8,
    protocol_ver: u16,
) -> Result<FieldValue> {
    Ok(match field.ty {
        FieldType::U8 => FieldValue::U8(wire::get_u8(bytes)?),
        FieldType::U16 => FieldValue::U16(wire::get_u16(bytes)?),
        FieldType::U32 => FieldValue::U32(wire::get_u32(bytes)?),
        FieldType::U64 => FieldValue::U64(wire::get_u64(bytes)?),
        FieldType::I16 => FieldValue::I16(wire::get_i16(bytes)?),
        FieldType::I32 => FieldValue::I32(wire::get_i32(bytes)?),
        FieldType::Str => FieldValue::Str(wire::get_string(bytes)?),
        FieldType::Blob => FieldValue::Blob(wire::get_blob(bytes)?),
        FieldType::Pos => FieldValue::Pos(wire::get_pos(bytes)?),
        FieldType::List(elem_spec) => {
            let count = wire::get_u16(bytes)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let mut members = Vec::with_capacity(elem_spec.len());
                for elem in elem_spec {
                    if !elem.present(serialize_ver, protocol_ver) {
                        continue;
                    }
                    members.push(decode_field(bytes, elem, serialize_ver, protocol_ver)?);
                }
                items.push(FieldValue::Group(members));
            }
            FieldValue::List(items)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::schema::*;
    use super::value::{FieldValue, LogicalPacket};
    use super::*;
    use crate::error::ProtocolError;

    fn roundtrip(command: u16, fields: Vec<FieldValue>, sv: u8, pv: u16) -> LogicalPacket {
        let bytes = encode(command, &fields, sv, pv).unwrap();
        decode(bytes, sv, pv).unwrap()
    }

    #[test]
    fn chat_roundtrip_current_versions() {
        let fields = vec![
            FieldValue::Str("alice".into()),
            FieldValue::Str("hello world".into()),
            FieldValue::U64(1_700_000_000),
        ];
        let got = roundtrip(CMD_CHAT_MESSAGE, fields.clone(), 28, 39);
        assert_eq!(got.command, CMD_CHAT_MESSAGE);
        assert_eq!(got.fields, fields);
    }

    #[test]
    fn chat_omits_timestamp_below_protocol_37() {
        let fields = vec![
            FieldValue::Str("alice".into()),
            FieldValue::Str("hi".into()),
        ];
        let bytes = encode(CMD_CHAT_MESSAGE, &fields, 28, 36).unwrap();
        let got = decode(bytes, 28, 36).unwrap();
        assert_eq!(got.fields, fields);
    }

    #[test]
    fn extra_field_below_threshold_is_caller_error() {
        let fields = vec![
            FieldValue::Str("alice".into()),
            FieldValue::Str("hi".into()),
            FieldValue::U64(1),
        ];
        let err = encode(CMD_CHAT_MESSAGE, &fields, 28, 36).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldOutOfRange { .. }));
    }

    #[test]
    fn block_data_gated_by_serialize_version() {
        let old = vec![
            FieldValue::I16(1),
            FieldValue::I16(-2),
            FieldValue::I16(3),
            FieldValue::Blob(vec![0xAB; 16]),
        ];
        assert_eq!(roundtrip(CMD_BLOCK_DATA, old.clone(), 27, 39).fields, old);

        let mut new = old;
        new.push(FieldValue::U8(2));
        assert_eq!(roundtrip(CMD_BLOCK_DATA, new.clone(), 28, 39).fields, new);
    }

    #[test]
    fn move_player_position_roundtrip() {
        let fields = vec![
            FieldValue::quantized_pos([103.5, -20.25, 7.125]),
            FieldValue::I32(-45_000),
            FieldValue::I32(180_000),
            FieldValue::U32(0b101),
        ];
        assert_eq!(roundtrip(CMD_MOVE_PLAYER, fields.clone(), 28, 39).fields, fields);
    }

    #[test]
    fn node_defs_nested_list_roundtrip() {
        let fields = vec![FieldValue::List(vec![
            FieldValue::Group(vec![
                FieldValue::U16(1),
                FieldValue::Str("stone".into()),
                FieldValue::Str("cracky=3".into()),
            ]),
            FieldValue::Group(vec![
                FieldValue::U16(2),
                FieldValue::Str("dirt".into()),
                FieldValue::Str("crumbly=1".into()),
            ]),
        ])];
        assert_eq!(roundtrip(CMD_NODE_DEFS, fields.clone(), 28, 39).fields, fields);
    }

    #[test]
    fn node_defs_list_gating_drops_group_field() {
        // Below protocol 36 the per-node "groups" string is absent
        let fields = vec![FieldValue::List(vec![FieldValue::Group(vec![
            FieldValue::U16(1),
            FieldValue::Str("stone".into()),
        ])])];
        assert_eq!(roundtrip(CMD_NODE_DEFS, fields.clone(), 28, 35).fields, fields);
    }

    #[test]
    fn unknown_command_rejected_both_ways() {
        assert!(matches!(
            encode(0x7777, &[], 28, 39).unwrap_err(),
            ProtocolError::UnsupportedCommand(0x7777)
        ));
        let mut raw = BytesMut::new();
        raw.put_u16(0x7777);
        assert!(matches!(
            decode(raw.freeze(), 28, 39).unwrap_err(),
            ProtocolError::UnsupportedCommand(0x7777)
        ));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let fields = vec![
            FieldValue::Str("alice".into()),
            FieldValue::Str("hello".into()),
            FieldValue::U64(7),
        ];
        let bytes = encode(CMD_CHAT_MESSAGE, &fields, 28, 39).unwrap();
        let cut = bytes.slice(..bytes.len() - 3);
        assert!(matches!(
            decode(cut, 28, 39).unwrap_err(),
            ProtocolError::MalformedPacket(_)
        ));
    }

    #[test]
    fn type_mismatch_is_field_out_of_range() {
        let err = encode(CMD_PLAYER_HP, &[FieldValue::Str("20".into())], 28, 39).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldOutOfRange { field: "hp" }));
    }
}
