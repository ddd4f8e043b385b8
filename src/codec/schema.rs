//! Command schema table.
//!
//! Every known command is described by one [`CommandSpec`] row: its wire id
//! and the ordered list of fields with the protocol/serialize version at
//! which each field first appears. Both encode and decode walk this table,
//! so version gating lives in exactly one place; there is deliberately no
//! per-field branching anywhere else in the codec.
//!
//! A field is on the wire iff `protocol_ver >= min_protocol` and
//! `serialize_ver >= min_serialize` for the peer's negotiated versions.

use super::value::FieldType;

/// One field of a command, with the versions gating its presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    /// Minimum negotiated protocol version for this field to exist
    pub min_protocol: u16,
    /// Minimum negotiated serialization version for this field to exist
    pub min_serialize: u8,
}

impl FieldSpec {
    const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            min_protocol: 0,
            min_serialize: 0,
        }
    }

    const fn since_protocol(name: &'static str, ty: FieldType, min_protocol: u16) -> Self {
        Self {
            name,
            ty,
            min_protocol,
            min_serialize: 0,
        }
    }

    const fn since_serialize(name: &'static str, ty: FieldType, min_serialize: u8) -> Self {
        Self {
            name,
            ty,
            min_protocol: 0,
            min_serialize,
        }
    }

    /// Whether this field is present at the given negotiated versions
    pub fn present(&self, serialize_ver: u8, protocol_ver: u16) -> bool {
        protocol_ver >= self.min_protocol && serialize_ver >= self.min_serialize
    }
}

/// One command row of the schema table.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub id: u16,
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

// Command ids. Auth commands occupy the low range and flow before the peer
// reaches Active; gameplay commands follow.
pub const CMD_AUTH_INIT: u16 = 0x0002;
pub const CMD_AUTH_CHALLENGE: u16 = 0x0003;
pub const CMD_AUTH_PROOF: u16 = 0x0004;
pub const CMD_AUTH_RESULT: u16 = 0x0005;
pub const CMD_ACCESS_DENIED: u16 = 0x000A;
pub const CMD_CHAT_MESSAGE: u16 = 0x0010;
pub const CMD_MOVE_PLAYER: u16 = 0x0011;
pub const CMD_TIME_OF_DAY: u16 = 0x0012;
pub const CMD_BLOCK_DATA: u16 = 0x0013;
pub const CMD_INVENTORY: u16 = 0x0014;
pub const CMD_NODE_DEFS: u16 = 0x0015;
pub const CMD_PLAYER_HP: u16 = 0x0016;

const NODE_DEF_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("content_id", FieldType::U16),
    FieldSpec::new("name", FieldType::Str),
    FieldSpec::since_protocol("groups", FieldType::Str, 36),
];

/// The full command table. Decode resolves ids against this; encode walks
/// the row for the requested command.
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        id: CMD_AUTH_INIT,
        name: "auth_init",
        fields: &[FieldSpec::new("player_name", FieldType::Str)],
    },
    CommandSpec {
        id: CMD_AUTH_CHALLENGE,
        name: "auth_challenge",
        fields: &[
            FieldSpec::new("salt", FieldType::Blob),
            FieldSpec::new("server_key", FieldType::Blob),
        ],
    },
    CommandSpec {
        id: CMD_AUTH_PROOF,
        name: "auth_proof",
        fields: &[
            FieldSpec::new("client_key", FieldType::Blob),
            FieldSpec::new("proof", FieldType::Blob),
        ],
    },
    CommandSpec {
        id: CMD_AUTH_RESULT,
        name: "auth_result",
        fields: &[FieldSpec::new("proof", FieldType::Blob)],
    },
    CommandSpec {
        id: CMD_ACCESS_DENIED,
        name: "access_denied",
        fields: &[
            FieldSpec::new("reason_code", FieldType::U8),
            FieldSpec::since_protocol("message", FieldType::Str, 35),
        ],
    },
    CommandSpec {
        id: CMD_CHAT_MESSAGE,
        name: "chat_message",
        fields: &[
            FieldSpec::new("sender", FieldType::Str),
            FieldSpec::new("message", FieldType::Str),
            FieldSpec::since_protocol("timestamp", FieldType::U64, 37),
        ],
    },
    CommandSpec {
        id: CMD_MOVE_PLAYER,
        name: "move_player",
        fields: &[
            FieldSpec::new("pos", FieldType::Pos),
            FieldSpec::new("pitch_millideg", FieldType::I32),
            FieldSpec::new("yaw_millideg", FieldType::I32),
            FieldSpec::since_protocol("pressed_keys", FieldType::U32, 37),
        ],
    },
    CommandSpec {
        id: CMD_TIME_OF_DAY,
        name: "time_of_day",
        fields: &[
            FieldSpec::new("time", FieldType::U16),
            FieldSpec::since_protocol("time_speed_milli", FieldType::I32, 34),
        ],
    },
    CommandSpec {
        id: CMD_BLOCK_DATA,
        name: "block_data",
        fields: &[
            FieldSpec::new("block_x", FieldType::I16),
            FieldSpec::new("block_y", FieldType::I16),
            FieldSpec::new("block_z", FieldType::I16),
            FieldSpec::new("data", FieldType::Blob),
            FieldSpec::since_serialize("compression", FieldType::U8, 28),
        ],
    },
    CommandSpec {
        id: CMD_INVENTORY,
        name: "inventory",
        fields: &[FieldSpec::new("contents", FieldType::Blob)],
    },
    CommandSpec {
        id: CMD_NODE_DEFS,
        name: "node_defs",
        fields: &[FieldSpec::new("defs", FieldType::List(NODE_DEF_FIELDS))],
    },
    CommandSpec {
        id: CMD_PLAYER_HP,
        name: "player_hp",
        fields: &[
            FieldSpec::new("hp", FieldType::U16),
            FieldSpec::since_protocol("damage_reason", FieldType::U8, 38),
        ],
    },
];

/// Look up a command row by wire id
pub fn command_by_id(id: u16) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        for (i, a) in COMMANDS.iter().enumerate() {
            for b in &COMMANDS[i + 1..] {
                assert_ne!(a.id, b.id, "duplicate command id 0x{:04x}", a.id);
            }
        }
    }

    #[test]
    fn lookup_finds_known_and_rejects_unknown() {
        assert_eq!(command_by_id(CMD_CHAT_MESSAGE).unwrap().name, "chat_message");
        assert!(command_by_id(0xFFFF).is_none());
    }

    #[test]
    fn version_gates() {
        let timestamp = &command_by_id(CMD_CHAT_MESSAGE).unwrap().fields[2];
        assert!(!timestamp.present(28, 36));
        assert!(timestamp.present(28, 37));

        let compression = &command_by_id(CMD_BLOCK_DATA).unwrap().fields[4];
        assert!(!compression.present(27, 39));
        assert!(compression.present(28, 39));
    }
}
