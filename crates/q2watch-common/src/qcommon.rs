// qcommon.rs — wire-level definitions shared by the connection layer and the decoder

pub type Vec3 = [f32; 3];

// ============================================================
// SizeBuf — byte buffer with an explicit read/write cursor
// ============================================================

/// Fixed-capacity message buffer. Reads past the end return -1 from the
/// msg_read_* helpers and leave `readcount > cursize`, which the decode
/// loops use to detect truncated payloads.
#[derive(Debug, Clone, Default)]
pub struct SizeBuf {
    pub allow_overflow: bool,
    pub overflowed: bool,
    pub data: Vec<u8>,
    pub maxsize: i32,
    pub cursize: i32,
    pub readcount: i32,
}

impl SizeBuf {
    pub fn new(maxsize: i32) -> Self {
        Self {
            allow_overflow: false,
            overflowed: false,
            data: vec![0u8; maxsize as usize],
            maxsize,
            cursize: 0,
            readcount: 0,
        }
    }

    /// Wrap an already-received datagram or inflated payload for reading.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            allow_overflow: false,
            overflowed: false,
            data: bytes.to_vec(),
            maxsize: bytes.len() as i32,
            cursize: bytes.len() as i32,
            readcount: 0,
        }
    }

    pub fn clear(&mut self) {
        self.cursize = 0;
        self.overflowed = false;
    }

    /// Bytes written so far, as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.cursize as usize]
    }

    /// Reserve `length` bytes, returning the start offset, or None when the
    /// buffer overflowed (only legal with allow_overflow set).
    pub fn get_space(&mut self, length: usize) -> Option<usize> {
        let cursize = self.cursize as usize;
        let maxsize = self.maxsize as usize;

        if cursize + length > maxsize {
            if !self.allow_overflow {
                panic!("SizeBuf::get_space: overflow without allow_overflow set");
            }
            if length > maxsize {
                panic!("SizeBuf::get_space: {} is > full buffer size", length);
            }
            self.clear();
            self.overflowed = true;
            return None;
        }

        let start = self.cursize as usize;
        self.cursize += length as i32;
        Some(start)
    }

    pub fn write(&mut self, src: &[u8]) {
        if let Some(start) = self.get_space(src.len()) {
            self.data[start..start + src.len()].copy_from_slice(src);
        }
    }
}

// ============================================================
// Protocol versions
// ============================================================

/// The wire protocol negotiated during the challenge exchange. Immutable
/// for the life of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// Original Quake 2 protocol (3.20)
    Vanilla,
    /// R1Q2 enhanced protocol: zlib packets, 1-byte qport, 4096 byte messages
    R1q2,
    /// Q2PRO protocol: extends R1Q2 with datagram fragmentation and gamestate
    Q2pro,
    /// AQtion (Action Quake 2) protocol, derived from Q2PRO
    Aqtion,
}

impl ProtocolVersion {
    pub const fn number(self) -> i32 {
        match self {
            ProtocolVersion::Vanilla => 34,
            ProtocolVersion::R1q2 => 35,
            ProtocolVersion::Q2pro => 36,
            ProtocolVersion::Aqtion => 38,
        }
    }

    pub fn from_number(n: i32) -> Option<Self> {
        match n {
            34 => Some(ProtocolVersion::Vanilla),
            35 => Some(ProtocolVersion::R1q2),
            36 => Some(ProtocolVersion::Q2pro),
            38 => Some(ProtocolVersion::Aqtion),
            _ => None,
        }
    }

    /// R1Q2 and later: 1-byte qport, zlib packets, bigger messages.
    pub fn is_extended(self) -> bool {
        !matches!(self, ProtocolVersion::Vanilla)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::Vanilla
    }
}

/// Retired 3.0x-era protocol number. Servers answering with this are
/// rejected rather than guessed at.
pub const PROTOCOL_VERSION_OLD: i32 = 26;

/// Minor version we advertise for R1Q2 servers.
pub const PROTOCOL_R1Q2_MINOR: u16 = 1905;
/// Minor version we advertise for Q2PRO and AQtion servers.
pub const PROTOCOL_Q2PRO_MINOR: u16 = 1021;

// ============================================================
// Message limits
// ============================================================

/// Maximum message length for the vanilla protocol.
pub const MAX_MSGLEN: usize = 1400;

/// Maximum message length for R1Q2 and later.
pub const MAX_MSGLEN_EXTENDED: usize = 4096;

pub const MAX_EDICTS: usize = 1024;
pub const MAX_CLIENTS: usize = 256;
pub const MAX_STATS: usize = 32;
pub const MAX_ITEMS: usize = 256;

pub const PORT_SERVER: u16 = 27910;

// ============================================================
// Configstrings
// ============================================================

/// Slot 0 carries the map name.
pub const CS_NAME: usize = 0;
/// One `name\info` line per connected client.
pub const CS_PLAYERSKINS: usize = 1408;
pub const MAX_CONFIGSTRINGS: usize = 2080;

// ============================================================
// Server-to-client ops
// ============================================================

pub const SVC_BAD: i32 = 0;
pub const SVC_MUZZLEFLASH: i32 = 1;
pub const SVC_MUZZLEFLASH2: i32 = 2;
pub const SVC_TEMP_ENTITY: i32 = 3;
pub const SVC_LAYOUT: i32 = 4;
pub const SVC_INVENTORY: i32 = 5;
pub const SVC_NOP: i32 = 6;
pub const SVC_DISCONNECT: i32 = 7;
pub const SVC_RECONNECT: i32 = 8;
pub const SVC_SOUND: i32 = 9;
pub const SVC_PRINT: i32 = 10;
pub const SVC_STUFFTEXT: i32 = 11;
pub const SVC_SERVERDATA: i32 = 12;
pub const SVC_CONFIGSTRING: i32 = 13;
pub const SVC_SPAWNBASELINE: i32 = 14;
pub const SVC_CENTERPRINT: i32 = 15;
pub const SVC_DOWNLOAD: i32 = 16;
pub const SVC_PLAYERINFO: i32 = 17;
pub const SVC_PACKETENTITIES: i32 = 18;
pub const SVC_DELTAPACKETENTITIES: i32 = 19;
pub const SVC_FRAME: i32 = 20;

// Protocol 35+ extensions
pub const SVC_ZPACKET: i32 = 21;
pub const SVC_ZDOWNLOAD: i32 = 22;
pub const SVC_GAMESTATE: i32 = 23;
pub const SVC_SETTING: i32 = 24;

/// The next byte carries an extended command id.
pub const SVC_EXTEND: i32 = 30;

/// Low 5 bits of the opcode byte are the command id; the top 3 are
/// per-command flag bits.
pub const SVC_CMD_MASK: i32 = 0x1F;

/// Sentinel index terminating the configstring block of a gamestate.
pub const GAMESTATE_END: i32 = 0x7FFF;

// ============================================================
// Client-to-server ops
// ============================================================

pub const CLC_BAD: u8 = 0;
pub const CLC_NOP: u8 = 1;
pub const CLC_MOVE: u8 = 2;
pub const CLC_USERINFO: u8 = 3;
pub const CLC_STRINGCMD: u8 = 4;

// ============================================================
// Print levels
// ============================================================

pub const PRINT_LOW: i32 = 0;
pub const PRINT_MEDIUM: i32 = 1;
pub const PRINT_HIGH: i32 = 2;
pub const PRINT_CHAT: i32 = 3;

// ============================================================
// Sound flags
// ============================================================

pub const SND_VOLUME: i32 = 1 << 0;
pub const SND_ATTENUATION: i32 = 1 << 1;
pub const SND_POS: i32 = 1 << 2;
pub const SND_ENT: i32 = 1 << 3;
pub const SND_OFFSET: i32 = 1 << 4;

// ============================================================
// Entity state delta bits
// ============================================================

// First byte
pub const U_ORIGIN1: u32 = 1 << 0;
pub const U_ORIGIN2: u32 = 1 << 1;
pub const U_ANGLE2: u32 = 1 << 2;
pub const U_ANGLE3: u32 = 1 << 3;
pub const U_FRAME8: u32 = 1 << 4;
pub const U_EVENT: u32 = 1 << 5;
pub const U_REMOVE: u32 = 1 << 6;
pub const U_MOREBITS1: u32 = 1 << 7;

// Second byte
pub const U_NUMBER16: u32 = 1 << 8;
pub const U_ORIGIN3: u32 = 1 << 9;
pub const U_ANGLE1: u32 = 1 << 10;
pub const U_MODEL: u32 = 1 << 11;
pub const U_RENDERFX8: u32 = 1 << 12;
pub const U_EFFECTS8: u32 = 1 << 14;
pub const U_MOREBITS2: u32 = 1 << 15;

// Third byte
pub const U_SKIN8: u32 = 1 << 16;
pub const U_FRAME16: u32 = 1 << 17;
pub const U_RENDERFX16: u32 = 1 << 18;
pub const U_EFFECTS16: u32 = 1 << 19;
pub const U_MODEL2: u32 = 1 << 20;
pub const U_MODEL3: u32 = 1 << 21;
pub const U_MODEL4: u32 = 1 << 22;
pub const U_MOREBITS3: u32 = 1 << 23;

// Fourth byte
pub const U_OLDORIGIN: u32 = 1 << 24;
pub const U_SKIN16: u32 = 1 << 25;
pub const U_SOUND: u32 = 1 << 26;
pub const U_SOLID: u32 = 1 << 27;

// ============================================================
// Player state delta bits
// ============================================================

pub const PS_M_TYPE: u32 = 1 << 0;
pub const PS_M_ORIGIN: u32 = 1 << 1;
pub const PS_M_VELOCITY: u32 = 1 << 2;
pub const PS_M_TIME: u32 = 1 << 3;
pub const PS_M_FLAGS: u32 = 1 << 4;
pub const PS_M_GRAVITY: u32 = 1 << 5;
pub const PS_M_DELTA_ANGLES: u32 = 1 << 6;
pub const PS_VIEWOFFSET: u32 = 1 << 7;
pub const PS_VIEWANGLES: u32 = 1 << 8;
pub const PS_KICKANGLES: u32 = 1 << 9;
pub const PS_BLEND: u32 = 1 << 10;
pub const PS_FOV: u32 = 1 << 11;
pub const PS_WEAPONINDEX: u32 = 1 << 12;
pub const PS_WEAPONFRAME: u32 = 1 << 13;
pub const PS_RDFLAGS: u32 = 1 << 14;

// ============================================================
// Effect / render flags used for entity classification
// ============================================================

pub const EF_ROTATE: u32 = 0x00000001;
pub const EF_GIB: u32 = 0x00000002;
pub const EF_BLASTER: u32 = 0x00000008;
pub const EF_ROCKET: u32 = 0x00000010;
pub const EF_GRENADE: u32 = 0x00000020;
pub const EF_HYPERBLASTER: u32 = 0x00000040;
pub const EF_BFG: u32 = 0x00000080;

pub const RF_BEAM: i32 = 0x00000002;

// ============================================================
// Entity state
// ============================================================

/// Network-visible state of one entity, zero-initialized from its
/// baseline and mutated in place by delta application.
#[derive(Debug, Clone, Default)]
pub struct EntityState {
    pub number: i32,
    pub origin: Vec3,
    pub angles: Vec3,
    pub old_origin: Vec3,
    pub modelindex: i32,
    pub modelindex2: i32,
    pub modelindex3: i32,
    pub modelindex4: i32,
    pub frame: i32,
    pub skinnum: i32,
    pub effects: u32,
    pub renderfx: i32,
    pub solid: i32,
    pub sound: i32,
    pub event: i32,
}

// ============================================================
// Player state
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PmType {
    #[default]
    Normal,
    Spectator,
    Dead,
    Gib,
    Freeze,
}

impl PmType {
    pub fn from_byte(b: i32) -> Self {
        match b {
            1 => PmType::Spectator,
            2 => PmType::Dead,
            3 => PmType::Gib,
            4 => PmType::Freeze,
            _ => PmType::Normal,
        }
    }
}

/// The movement block of the player state. Origin and velocity are kept
/// in the wire's 0.125-unit fixed point.
#[derive(Debug, Clone, Default)]
pub struct PmoveState {
    pub pm_type: PmType,
    pub origin: [i16; 3],
    pub velocity: [i16; 3],
    pub pm_flags: u8,
    pub pm_time: u8,
    pub gravity: i16,
    pub delta_angles: [i16; 3],
}

#[derive(Debug, Clone)]
pub struct PlayerState {
    pub pmove: PmoveState,
    pub viewangles: Vec3,
    pub viewoffset: Vec3,
    pub kick_angles: Vec3,
    pub gunindex: i32,
    pub gunframe: i32,
    pub blend: [f32; 4],
    pub fov: f32,
    pub rdflags: i32,
    pub stats: [i16; MAX_STATS],
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            pmove: PmoveState::default(),
            viewangles: [0.0; 3],
            viewoffset: [0.0; 3],
            kick_angles: [0.0; 3],
            gunindex: 0,
            gunframe: 0,
            blend: [0.0; 4],
            fov: 90.0,
            rdflags: 0,
            stats: [0; MAX_STATS],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_numbers_round_trip() {
        for p in [
            ProtocolVersion::Vanilla,
            ProtocolVersion::R1q2,
            ProtocolVersion::Q2pro,
            ProtocolVersion::Aqtion,
        ] {
            assert_eq!(ProtocolVersion::from_number(p.number()), Some(p));
        }
        assert_eq!(ProtocolVersion::from_number(PROTOCOL_VERSION_OLD), None);
        assert_eq!(ProtocolVersion::from_number(37), None);
    }

    #[test]
    fn sizebuf_read_past_end_is_detectable() {
        let mut buf = SizeBuf::from_bytes(&[1, 2]);
        buf.readcount = 2;
        crate::msg::msg_read_byte(&mut buf);
        assert!(buf.readcount > buf.cursize);
    }

    #[test]
    fn sizebuf_write_and_slice() {
        let mut buf = SizeBuf::new(16);
        buf.write(&[0xDE, 0xAD]);
        assert_eq!(buf.as_slice(), &[0xDE, 0xAD]);
    }
}
