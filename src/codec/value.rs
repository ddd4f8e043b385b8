//! Generic field values for decoded packets.
//!
//! The host sees every packet as a command id plus an ordered sequence of
//! these tagged values; the engine never interprets gameplay semantics.

use crate::config::POS_SCALE;

/// One decoded (or to-be-encoded) packet field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I16(i16),
    I32(i32),
    /// UTF-8 string, 16-bit length prefix on the wire
    Str(String),
    /// Raw bytes, 32-bit length prefix on the wire
    Blob(Vec<u8>),
    /// World position in world units; transmitted as three i32 fixed-point
    /// values scaled by [`POS_SCALE`]
    Pos([f32; 3]),
    /// Repeated nested block, 16-bit count prefix; each element is a
    /// `FieldValue::Group`
    List(Vec<FieldValue>),
    /// One nested structured block (only appears inside `List`)
    Group(Vec<FieldValue>),
}

impl FieldValue {
    /// Quantize a world position to its wire representation and back.
    /// Encoding then decoding a position yields exactly this value, so the
    /// round-trip law holds for positions a caller has pre-quantized.
    pub fn quantized_pos(pos: [f32; 3]) -> FieldValue {
        FieldValue::Pos(pos.map(|c| (c * POS_SCALE).round() / POS_SCALE))
    }
}

/// Wire type of a field, named by the schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I16,
    I32,
    Str,
    Blob,
    Pos,
    /// Nested blocks; the element schema lives in the command table
    List(&'static [super::schema::FieldSpec]),
}

/// One complete decoded packet: command id plus its field values in schema
/// order (version-gated fields absent when below threshold).
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalPacket {
    pub command: u16,
    pub fields: Vec<FieldValue>,
}

impl LogicalPacket {
    pub fn new(command: u16, fields: Vec<FieldValue>) -> Self {
        Self { command, fields }
    }
}
