// cl_parse.rs — server message decoding
//
// A payload is a stream of one-byte opcodes, each followed by a
// variable-length argument block. The low five bits of the opcode byte
// are the command id; the top three are per-command flag bits that must
// not desync the stream. Truncation aborts the current payload only:
// whatever was decoded before the cut is delivered and the connection
// stays up.

use q2watch_common::compression::{inflate_sized, sniff_inflate};
use q2watch_common::msg::{
    clean_display_text, msg_read_byte, msg_read_data, msg_read_long, msg_read_pos, msg_read_short,
    msg_read_string,
};
use q2watch_common::qcommon::*;

use crate::client::{Client, ConnState, HandshakeFlags};
use crate::events::{EventPayload, PrintLevel, ServerInfoEvent};

// Temp entity type ids, grouped by argument shape.
const TE_GUNSHOT: i32 = 0;
const TE_BLOOD: i32 = 1;
const TE_BLASTER: i32 = 2;
const TE_RAILTRAIL: i32 = 3;
const TE_SHOTGUN: i32 = 4;
const TE_EXPLOSION1: i32 = 5;
const TE_EXPLOSION2: i32 = 6;
const TE_ROCKET_EXPLOSION: i32 = 7;
const TE_GRENADE_EXPLOSION: i32 = 8;
const TE_SPARKS: i32 = 9;
const TE_SPLASH: i32 = 10;
const TE_BUBBLETRAIL: i32 = 11;
const TE_SCREEN_SPARKS: i32 = 12;
const TE_SHIELD_SPARKS: i32 = 13;
const TE_BULLET_SPARKS: i32 = 14;
const TE_LASER_SPARKS: i32 = 15;
const TE_PARASITE_ATTACK: i32 = 16;
const TE_ROCKET_EXPLOSION_WATER: i32 = 17;
const TE_GRENADE_EXPLOSION_WATER: i32 = 18;
const TE_MEDIC_CABLE_ATTACK: i32 = 19;
const TE_BFG_EXPLOSION: i32 = 20;
const TE_BFG_BIGEXPLOSION: i32 = 21;
const TE_BOSSTPORT: i32 = 22;
const TE_BFG_LASER: i32 = 23;
const TE_GRAPPLE_CABLE: i32 = 24;
const TE_WELDING_SPARKS: i32 = 25;
const TE_GREENBLOOD: i32 = 26;
const TE_BLUEHYPERBLASTER: i32 = 27;
const TE_PLASMA_EXPLOSION: i32 = 28;
const TE_TUNNEL_SPARKS: i32 = 29;
const TE_BLASTER2: i32 = 30;
const TE_RAILTRAIL2: i32 = 31;
const TE_FLAME: i32 = 32;
const TE_LIGHTNING: i32 = 33;
const TE_DEBUGTRAIL: i32 = 34;
const TE_PLAIN_EXPLOSION: i32 = 35;
const TE_FLASHLIGHT: i32 = 36;
const TE_FORCEWALL: i32 = 37;
const TE_HEATBEAM: i32 = 38;
const TE_MONSTER_HEATBEAM: i32 = 39;
const TE_STEAM: i32 = 40;
const TE_BUBBLETRAIL2: i32 = 41;
const TE_MOREBLOOD: i32 = 42;
const TE_HEATBEAM_SPARKS: i32 = 43;
const TE_HEATBEAM_STEAM: i32 = 44;
const TE_CHAINFIST_SMOKE: i32 = 45;
const TE_ELECTRIC_SPARKS: i32 = 46;
const TE_TRACKER_EXPLOSION: i32 = 47;
const TE_TELEPORT_EFFECT: i32 = 48;
const TE_DBALL_GOAL: i32 = 49;
const TE_WIDOWBEAMOUT: i32 = 50;
const TE_NUKEBLAST: i32 = 51;
const TE_WIDOWSPLASH: i32 = 52;
const TE_EXPLOSION1_BIG: i32 = 53;
const TE_EXPLOSION1_NP: i32 = 54;
const TE_FLECHETTE: i32 = 55;

/// A payload normally begins with a plain opcode byte. Compressed bodies
/// start with deflate block headers, which land well outside that range.
fn is_known_opcode(byte: u8) -> bool {
    let cmd = byte as i32;
    (SVC_MUZZLEFLASH..=SVC_SETTING).contains(&cmd) || cmd == SVC_EXTEND
}

impl Client {
    /// Entry point for one reassembled application payload. Servers may
    /// compress an entire payload without framing, so sniff for deflate
    /// when the first byte is not a known opcode.
    pub(crate) fn process_server_data(&mut self, payload: &[u8], now: i64) {
        if payload.is_empty() {
            return;
        }

        if !is_known_opcode(payload[0]) {
            if let Some(inflated) = sniff_inflate(payload) {
                let mut msg = SizeBuf::from_bytes(&inflated);
                self.parse_server_message(&mut msg, now);
                return;
            }
        }

        let mut msg = SizeBuf::from_bytes(payload);
        self.parse_server_message(&mut msg, now);
    }

    /// The opcode dispatch loop. Recursively entered for the inflated
    /// body of an svc_zpacket.
    pub(crate) fn parse_server_message(&mut self, msg: &mut SizeBuf, now: i64) {
        loop {
            if msg.readcount > msg.cursize {
                // ran past the end mid-argument: the payload is cut short
                self.debug_note("truncated server message");
                break;
            }

            let byte = msg_read_byte(msg);
            if byte == -1 {
                break; // clean end of message
            }

            let mut cmd = byte & SVC_CMD_MASK;
            if cmd == SVC_EXTEND {
                cmd = msg_read_byte(msg);
                if cmd == -1 {
                    break;
                }
            }

            match cmd {
                SVC_NOP => {}

                SVC_DISCONNECT => {
                    self.server_dropped("server disconnected", now);
                    break;
                }

                SVC_RECONNECT => {
                    self.begin_soft_reconnect("server requested reconnect", now);
                    break;
                }

                SVC_PRINT => {
                    let level = msg_read_byte(msg);
                    let text = msg_read_string(msg);
                    if msg.readcount > msg.cursize {
                        break;
                    }
                    self.emit(EventPayload::ConsoleMessage {
                        level: PrintLevel::from_byte(level),
                        text: clean_display_text(&text),
                    });
                }

                SVC_CENTERPRINT => {
                    let text = msg_read_string(msg);
                    if msg.readcount > msg.cursize {
                        break;
                    }
                    self.emit(EventPayload::ConsoleMessage {
                        level: PrintLevel::High,
                        text: clean_display_text(&text),
                    });
                }

                SVC_STUFFTEXT => {
                    let text = msg_read_string(msg);
                    if msg.readcount > msg.cursize {
                        break;
                    }
                    self.handle_stufftext(&text, now);
                }

                SVC_SERVERDATA => {
                    if !self.parse_server_data(msg, now) {
                        break;
                    }
                }

                SVC_CONFIGSTRING => {
                    if !self.parse_config_string(msg) {
                        break;
                    }
                }

                SVC_SOUND => self.skip_sound(msg),

                SVC_SPAWNBASELINE => self.parse_baseline(msg),

                SVC_TEMP_ENTITY => {
                    if !self.skip_temp_entity(msg) {
                        break;
                    }
                }

                SVC_MUZZLEFLASH | SVC_MUZZLEFLASH2 => {
                    let ent = msg_read_short(msg);
                    let _effect = msg_read_byte(msg);
                    if ent < 1 || ent >= MAX_EDICTS as i32 {
                        self.debug_note("muzzleflash for bad entity");
                        break;
                    }
                }

                SVC_LAYOUT => {
                    self.game.layout = msg_read_string(msg);
                }

                SVC_INVENTORY => {
                    for _ in 0..MAX_ITEMS {
                        msg_read_short(msg);
                    }
                }

                SVC_DOWNLOAD => {
                    let size = msg_read_short(msg);
                    let _percent = msg_read_byte(msg);
                    if size > 0 {
                        msg_read_data(msg, size as usize);
                    }
                }

                SVC_ZDOWNLOAD => {
                    let size = msg_read_short(msg);
                    let _uncompressed = msg_read_short(msg);
                    let _percent = msg_read_byte(msg);
                    if size > 0 {
                        msg_read_data(msg, size as usize);
                    }
                }

                SVC_FRAME => self.parse_frame(msg),

                SVC_ZPACKET => {
                    let inlen = msg_read_short(msg) as u16 as usize;
                    let outlen = msg_read_short(msg) as u16 as usize;
                    let data = msg_read_data(msg, inlen);
                    if msg.readcount > msg.cursize {
                        break;
                    }
                    match inflate_sized(&data, outlen) {
                        Ok(inflated) => {
                            let mut inner = SizeBuf::from_bytes(&inflated);
                            self.parse_server_message(&mut inner, now);
                        }
                        Err(e) => {
                            self.debug_note(&format!("zpacket inflate failed: {}", e));
                            break;
                        }
                    }
                }

                SVC_GAMESTATE => {
                    if !self.parse_game_state(msg) {
                        break;
                    }
                }

                SVC_SETTING => {
                    let _index = msg_read_long(msg);
                    let _value = msg_read_long(msg);
                }

                SVC_PLAYERINFO | SVC_PACKETENTITIES | SVC_DELTAPACKETENTITIES => {
                    self.debug_note("out of place frame data");
                    break;
                }

                _ => {
                    self.debug_note(&format!("unknown server command {}", cmd));
                    break;
                }
            }
        }
    }

    /// svc_serverdata. Returns false when the rest of the payload has to
    /// be abandoned.
    fn parse_server_data(&mut self, msg: &mut SizeBuf, now: i64) -> bool {
        let protocol = msg_read_long(msg);
        let server_count = msg_read_long(msg);
        let _attract_loop = msg_read_byte(msg);
        let game_dir = msg_read_string(msg);
        let player_num = msg_read_short(msg);
        let map_name = msg_read_string(msg);

        if msg.readcount > msg.cursize {
            return false;
        }

        let version = match ProtocolVersion::from_number(protocol) {
            Some(v) => v,
            None => {
                self.server_dropped(&format!("unsupported protocol {}", protocol), now);
                return false;
            }
        };

        // the negotiated protocol must not change mid-connection
        if version != self.protocol {
            self.debug_note(&format!(
                "serverdata protocol {} disagrees with negotiated {}",
                protocol,
                self.protocol.number()
            ));
        }

        // protocol-specific tail; these bytes must always be consumed
        match version {
            ProtocolVersion::Vanilla => {}
            ProtocolVersion::R1q2 => {
                let _enhanced = msg_read_byte(msg);
                self.minor_version = msg_read_short(msg) as u16;
                let _advanced_deltas = msg_read_byte(msg);
                let _strafejump_hack = msg_read_byte(msg);
            }
            ProtocolVersion::Q2pro => {
                self.minor_version = msg_read_short(msg) as u16;
                let _server_state = msg_read_byte(msg);
                if self.minor_version >= 1024 {
                    let _flags = msg_read_short(msg);
                } else {
                    let _strafejump = msg_read_byte(msg);
                    let _qw_mode = msg_read_byte(msg);
                    let _waterjump = msg_read_byte(msg);
                }
            }
            ProtocolVersion::Aqtion => {
                self.minor_version = msg_read_short(msg) as u16;
                let _server_state = msg_read_byte(msg);
                let _strafejump = msg_read_byte(msg);
                let _qw_mode = msg_read_byte(msg);
                let _waterjump = msg_read_byte(msg);
            }
        }

        if msg.readcount > msg.cursize {
            return false;
        }

        let had_server_data = self.flags.contains(HandshakeFlags::HAS_SERVER_DATA);
        let previous_map = self.game.map_name.clone();

        if had_server_data && self.state == ConnState::Spawned && previous_map != map_name {
            // mid-session map change: wipe the game tables, keep the
            // netchan, and run the handshake again
            self.game.reset();
            self.flags = HandshakeFlags::HAS_SERVER_DATA;
            self.pending_commands.clear();
            self.enqueue_command("new");
            self.flags |= HandshakeFlags::SENT_NEW;
            self.set_state(ConnState::Handshaking, Some("map change".to_string()));
            self.emit(EventPayload::ServerInfo(ServerInfoEvent::MapChange {
                previous_map,
                map: map_name.clone(),
            }));
        } else {
            self.flags |= HandshakeFlags::HAS_SERVER_DATA;
            self.emit(EventPayload::ServerInfo(ServerInfoEvent::Connected {
                map: map_name.clone(),
                game_dir: game_dir.clone(),
                protocol,
            }));
        }

        self.game.server_count = server_count;
        self.game.game_dir = game_dir;
        self.game.player_num = player_num;
        self.game.map_name = map_name;

        true
    }

    fn parse_config_string(&mut self, msg: &mut SizeBuf) -> bool {
        let index = msg_read_short(msg) as u16 as usize;
        let value = msg_read_string(msg);
        if msg.readcount > msg.cursize {
            return false;
        }
        if index >= MAX_CONFIGSTRINGS {
            self.debug_note(&format!("configstring index {} out of range", index));
            return false;
        }
        self.set_config_string(index, value);
        true
    }

    /// Store a configstring and emit join/leave transitions for the
    /// player-info slots.
    pub(crate) fn set_config_string(&mut self, index: usize, value: String) {
        let old = std::mem::replace(&mut self.game.configstrings[index], value);
        let new = &self.game.configstrings[index];

        if (CS_PLAYERSKINS..CS_PLAYERSKINS + MAX_CLIENTS).contains(&index) && old != *new {
            let name_of = |cs: &str| match cs.find('\\') {
                Some(pos) => cs[..pos].to_string(),
                None => cs.to_string(),
            };
            if old.is_empty() && !new.is_empty() {
                let name = name_of(new);
                self.emit(EventPayload::ServerInfo(ServerInfoEvent::PlayerJoin { name }));
            } else if !old.is_empty() && new.is_empty() {
                let name = name_of(&old);
                self.emit(EventPayload::ServerInfo(ServerInfoEvent::PlayerLeave { name }));
            }
        }
    }

    /// svc_gamestate: the Q2PRO batched form of the configstring dump
    /// plus the baseline table.
    fn parse_game_state(&mut self, msg: &mut SizeBuf) -> bool {
        loop {
            let index = msg_read_short(msg);
            if msg.readcount > msg.cursize {
                return false;
            }
            if index == GAMESTATE_END {
                break;
            }
            let index = index as u16 as usize;
            let value = msg_read_string(msg);
            if msg.readcount > msg.cursize {
                return false;
            }
            if index >= MAX_CONFIGSTRINGS {
                self.debug_note("gamestate configstring index out of range");
                return false;
            }
            self.set_config_string(index, value);
        }

        // baseline table, terminated like packet entities
        loop {
            if msg.readcount > msg.cursize {
                return false;
            }
            let mut bits: u32 = 0;
            let number = crate::cl_ents::parse_entity_bits(msg, &mut bits);
            if msg.readcount > msg.cursize {
                return false;
            }
            if number == 0 {
                break;
            }
            if number < 0 || number as usize >= MAX_EDICTS {
                return false;
            }
            let nullstate = EntityState::default();
            let mut baseline = EntityState::default();
            crate::cl_ents::parse_delta(&nullstate, &mut baseline, number, bits, msg);
            self.game.entities[number as usize].baseline = baseline;
        }

        true
    }

    /// svc_sound carries a flag byte that gates every following field.
    /// Nothing here is surfaced; the bytes just have to leave the stream.
    fn skip_sound(&mut self, msg: &mut SizeBuf) {
        let flags = msg_read_byte(msg);
        let _sound_num = msg_read_byte(msg);
        if flags & SND_VOLUME != 0 {
            msg_read_byte(msg);
        }
        if flags & SND_ATTENUATION != 0 {
            msg_read_byte(msg);
        }
        if flags & SND_OFFSET != 0 {
            msg_read_byte(msg);
        }
        if flags & SND_ENT != 0 {
            msg_read_short(msg);
        }
        if flags & SND_POS != 0 {
            msg_read_pos(msg);
        }
    }

    /// svc_temp_entity argument shapes, by effect type. Returns false for
    /// types we cannot size, which forces a payload abort.
    fn skip_temp_entity(&mut self, msg: &mut SizeBuf) -> bool {
        let te = msg_read_byte(msg);
        match te {
            // position + direction byte
            TE_GUNSHOT | TE_BLOOD | TE_BLASTER | TE_SHOTGUN | TE_SPARKS | TE_SCREEN_SPARKS
            | TE_SHIELD_SPARKS | TE_BULLET_SPARKS | TE_GREENBLOOD | TE_BLASTER2 | TE_MOREBLOOD
            | TE_HEATBEAM_SPARKS | TE_HEATBEAM_STEAM | TE_ELECTRIC_SPARKS | TE_FLECHETTE => {
                msg_read_pos(msg);
                msg_read_byte(msg);
            }

            // count + position + direction + color
            TE_SPLASH | TE_LASER_SPARKS | TE_WELDING_SPARKS | TE_TUNNEL_SPARKS => {
                msg_read_byte(msg);
                msg_read_pos(msg);
                msg_read_byte(msg);
                msg_read_byte(msg);
            }

            // position only
            TE_EXPLOSION1 | TE_EXPLOSION2 | TE_ROCKET_EXPLOSION | TE_GRENADE_EXPLOSION
            | TE_ROCKET_EXPLOSION_WATER | TE_GRENADE_EXPLOSION_WATER | TE_BFG_EXPLOSION
            | TE_BFG_BIGEXPLOSION | TE_BOSSTPORT | TE_PLASMA_EXPLOSION | TE_PLAIN_EXPLOSION
            | TE_CHAINFIST_SMOKE | TE_TRACKER_EXPLOSION | TE_TELEPORT_EFFECT | TE_DBALL_GOAL
            | TE_NUKEBLAST | TE_WIDOWSPLASH | TE_EXPLOSION1_BIG | TE_EXPLOSION1_NP => {
                msg_read_pos(msg);
            }

            // two positions
            TE_RAILTRAIL | TE_RAILTRAIL2 | TE_BUBBLETRAIL | TE_BUBBLETRAIL2 | TE_BFG_LASER
            | TE_DEBUGTRAIL | TE_BLUEHYPERBLASTER => {
                msg_read_pos(msg);
                msg_read_pos(msg);
            }

            // entity + two positions
            TE_PARASITE_ATTACK | TE_MEDIC_CABLE_ATTACK | TE_MONSTER_HEATBEAM => {
                msg_read_short(msg);
                msg_read_pos(msg);
                msg_read_pos(msg);
            }

            // entity + two positions + view offset
            TE_GRAPPLE_CABLE | TE_HEATBEAM => {
                msg_read_short(msg);
                msg_read_pos(msg);
                msg_read_pos(msg);
                msg_read_pos(msg);
            }

            TE_FLAME => {
                msg_read_short(msg);
                msg_read_pos(msg);
            }

            TE_LIGHTNING => {
                msg_read_short(msg);
                msg_read_short(msg);
                msg_read_pos(msg);
                msg_read_pos(msg);
            }

            TE_FLASHLIGHT => {
                msg_read_pos(msg);
                msg_read_short(msg);
            }

            TE_FORCEWALL => {
                msg_read_pos(msg);
                msg_read_pos(msg);
                msg_read_byte(msg);
            }

            TE_STEAM => {
                let id = msg_read_short(msg);
                msg_read_byte(msg);
                msg_read_pos(msg);
                msg_read_byte(msg);
                msg_read_byte(msg);
                msg_read_short(msg);
                if id != -1 {
                    msg_read_long(msg);
                }
            }

            TE_WIDOWBEAMOUT => {
                msg_read_short(msg);
                msg_read_pos(msg);
            }

            _ => {
                self.debug_note(&format!("unknown temp entity {}", te));
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Config;
    use crate::events::{Event, EventMask, PacketDirection};
    use crossbeam::channel::Receiver;
    use flate2::read::DeflateEncoder;
    use flate2::Compression;
    use std::io::Read;

    fn make_client() -> (Client, Receiver<Event>) {
        let client = Client::new(Config::default());
        let events = client.events();
        (client, events)
    }

    fn drain(events: &Receiver<Event>) -> Vec<EventPayload> {
        events.try_iter().map(|e| e.payload).collect()
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(data, Compression::default());
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn empty_payload_is_a_no_op() {
        let (mut client, events) = make_client();
        client.process_server_data(&[], 0);
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn vanilla_serverdata_golden_bytes() {
        let (mut client, events) = make_client();
        let mut payload: Vec<u8> = vec![0x0C];
        payload.extend_from_slice(&34i32.to_le_bytes());
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.push(0x00);
        payload.extend_from_slice(b"baseq2\0");
        payload.extend_from_slice(&5i16.to_le_bytes());
        payload.extend_from_slice(b"q2dm1\0");

        client.process_server_data(&payload, 0);

        assert_eq!(client.current_map_name(), "q2dm1");
        assert_eq!(client.game.game_dir, "baseq2");
        assert_eq!(client.game.player_num, 5);

        let connected = drain(&events)
            .into_iter()
            .find_map(|p| match p {
                EventPayload::ServerInfo(ServerInfoEvent::Connected {
                    map,
                    game_dir,
                    protocol,
                }) => Some((map, game_dir, protocol)),
                _ => None,
            })
            .unwrap();
        assert_eq!(connected, ("q2dm1".to_string(), "baseq2".to_string(), 34));
    }

    #[test]
    fn serverdata_protocol_26_is_rejected() {
        let (mut client, events) = make_client();
        let mut payload: Vec<u8> = vec![0x0C];
        payload.extend_from_slice(&26i32.to_le_bytes());
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.push(0x00);
        payload.extend_from_slice(b"baseq2\0");
        payload.extend_from_slice(&5i16.to_le_bytes());
        payload.extend_from_slice(b"base1\0");

        client.process_server_data(&payload, 0);
        assert!(client.current_map_name().is_empty());
        // a connection event fires for the drop, never a connected one
        assert!(drain(&events).iter().all(|p| !matches!(
            p,
            EventPayload::ServerInfo(ServerInfoEvent::Connected { .. })
        )));
    }

    #[test]
    fn r1q2_serverdata_tail_is_consumed() {
        let (mut client, _events) = make_client();
        client.protocol = ProtocolVersion::R1q2;

        let mut payload: Vec<u8> = vec![0x0C];
        payload.extend_from_slice(&35i32.to_le_bytes());
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.push(0x00);
        payload.extend_from_slice(b"baseq2\0");
        payload.extend_from_slice(&0i16.to_le_bytes());
        payload.extend_from_slice(b"q2dm8\0");
        payload.push(1); // enhanced
        payload.extend_from_slice(&1905u16.to_le_bytes());
        payload.push(1); // advanced deltas
        payload.push(0); // strafejump hack
        payload.push(0x06); // trailing svc_nop must still parse

        client.process_server_data(&payload, 0);
        assert_eq!(client.minor_version, 1905);
        assert_eq!(client.current_map_name(), "q2dm8");
    }

    #[test]
    fn print_record_golden_bytes() {
        let (mut client, events) = make_client();
        let mut payload: Vec<u8> = vec![0x0A, 0x03];
        payload.extend_from_slice(b"Player: hi\0");

        client.process_server_data(&payload, 0);

        let (level, text) = drain(&events)
            .into_iter()
            .find_map(|p| match p {
                EventPayload::ConsoleMessage { level, text } => Some((level, text)),
                _ => None,
            })
            .unwrap();
        assert_eq!(level, PrintLevel::Chat);
        assert_eq!(text, "Player: hi");
    }

    #[test]
    fn zpacket_golden_bytes() {
        let (mut client, events) = make_client();

        let mut inner: Vec<u8> = vec![0x0A, 0x00];
        inner.extend_from_slice(b"hello\0");
        let compressed = deflate(&inner);

        let mut payload: Vec<u8> = vec![0x15];
        payload.extend_from_slice(&(compressed.len() as u16).to_le_bytes());
        payload.extend_from_slice(&(inner.len() as u16).to_le_bytes());
        payload.extend_from_slice(&compressed);

        client.process_server_data(&payload, 0);

        let (level, text) = drain(&events)
            .into_iter()
            .find_map(|p| match p {
                EventPayload::ConsoleMessage { level, text } => Some((level, text)),
                _ => None,
            })
            .unwrap();
        assert_eq!(level, PrintLevel::Low);
        assert_eq!(text, "hello");
    }

    #[test]
    fn whole_payload_compression_is_sniffed() {
        let (mut client, events) = make_client();
        // long and repetitive, so deflate emits a huffman block whose
        // leading byte cannot be mistaken for an opcode
        let text = "spam ".repeat(40);
        let mut inner: Vec<u8> = vec![0x0A, 0x02];
        inner.extend_from_slice(text.as_bytes());
        inner.push(0);
        client.process_server_data(&deflate(&inner), 0);

        let texts: Vec<String> = drain(&events)
            .into_iter()
            .filter_map(|p| match p {
                EventPayload::ConsoleMessage { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec![text]);
    }

    #[test]
    fn configstring_round_trip_and_range_check() {
        let (mut client, _events) = make_client();

        for (index, value) in [(0usize, "The Edge"), (2079, "last slot"), (700, "météo")] {
            let mut payload: Vec<u8> = vec![0x0D];
            payload.extend_from_slice(&(index as u16).to_le_bytes());
            for ch in value.chars() {
                payload.push(ch as u8);
            }
            payload.push(0);
            client.process_server_data(&payload, 0);
            assert_eq!(client.game.configstrings[index], *value);
        }

        // out of range index aborts without storing anything
        let mut payload: Vec<u8> = vec![0x0D];
        payload.extend_from_slice(&2080u16.to_le_bytes());
        payload.extend_from_slice(b"x\0");
        client.process_server_data(&payload, 0);
    }

    #[test]
    fn playerskin_configstrings_emit_join_and_leave() {
        let (mut client, events) = make_client();
        client.set_config_string(CS_PLAYERSKINS + 4, "newguy\\male/grunt".to_string());
        client.set_config_string(CS_PLAYERSKINS + 4, String::new());

        let names: Vec<EventPayload> = drain(&events);
        assert!(names.iter().any(|p| matches!(
            p,
            EventPayload::ServerInfo(ServerInfoEvent::PlayerJoin { name }) if name == "newguy"
        )));
        assert!(names.iter().any(|p| matches!(
            p,
            EventPayload::ServerInfo(ServerInfoEvent::PlayerLeave { name }) if name == "newguy"
        )));
    }

    #[test]
    fn gamestate_stops_at_sentinel() {
        let (mut client, _events) = make_client();
        let mut payload: Vec<u8> = vec![0x17];
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(b"The Edge\0");
        payload.extend_from_slice(&5u16.to_le_bytes());
        payload.extend_from_slice(b"statusbar\0");
        payload.extend_from_slice(&0x7FFFu16.to_le_bytes());
        // baseline table: entity 30 at origin.x = 4.0, then terminator
        payload.push(0x01); // U_ORIGIN1
        payload.push(30);
        payload.extend_from_slice(&32i16.to_le_bytes());
        payload.push(0);
        payload.push(0);
        // bytes after the message must stay untouched by the
        // configstring loop
        payload.push(0x06); // svc_nop

        client.process_server_data(&payload, 0);
        assert_eq!(client.game.configstrings[0], "The Edge");
        assert_eq!(client.game.configstrings[5], "statusbar");
        assert_eq!(client.game.entities[30].baseline.origin[0], 4.0);
    }

    #[test]
    fn truncation_keeps_earlier_messages() {
        let (mut client, events) = make_client();
        let mut payload: Vec<u8> = vec![0x0A, 0x00];
        payload.extend_from_slice(b"first\0");
        payload.push(0x0D); // configstring cut off mid-index
        payload.push(0x05);

        client.process_server_data(&payload, 0);

        let texts: Vec<String> = drain(&events)
            .into_iter()
            .filter_map(|p| match p {
                EventPayload::ConsoleMessage { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first".to_string()]);
    }

    #[test]
    fn extra_bits_do_not_desync() {
        let (mut client, events) = make_client();
        // svc_print with flag bits set in the opcode's top three bits
        let mut payload: Vec<u8> = vec![0x0A | 0xA0, 0x00];
        payload.extend_from_slice(b"flagged\0");
        client.process_server_data(&payload, 0);
        assert!(drain(&events).iter().any(|p| matches!(
            p,
            EventPayload::ConsoleMessage { text, .. } if text == "flagged"
        )));
    }

    #[test]
    fn sound_and_tent_records_are_skipped_cleanly() {
        let (mut client, events) = make_client();

        let mut payload: Vec<u8> = vec![0x09]; // svc_sound
        payload.push((SND_VOLUME | SND_ENT | SND_POS) as u8);
        payload.push(3); // sound index
        payload.push(255); // volume
        payload.extend_from_slice(&((7 << 3) as i16).to_le_bytes()); // ent/chan
        for _ in 0..3 {
            payload.extend_from_slice(&0i16.to_le_bytes());
        }
        // svc_temp_entity, splash type
        payload.push(0x03);
        payload.push(TE_SPLASH as u8);
        payload.push(8); // count
        for _ in 0..3 {
            payload.extend_from_slice(&0i16.to_le_bytes());
        }
        payload.push(5); // direction
        payload.push(1); // color
        // a print must still decode after both skips
        payload.push(0x0A);
        payload.push(0x00);
        payload.extend_from_slice(b"after\0");

        client.process_server_data(&payload, 0);
        assert!(drain(&events).iter().any(|p| matches!(
            p,
            EventPayload::ConsoleMessage { text, .. } if text == "after"
        )));
    }

    #[test]
    fn raw_events_only_with_debug_subscription() {
        let (mut client, events) = make_client();
        client.subscribe(EventMask::RAW_MESSAGE);
        client.emit(EventPayload::RawMessage {
            direction: PacketDirection::Incoming,
            data: vec![1, 2, 3],
        });
        assert!(matches!(
            events.try_recv().unwrap().payload,
            EventPayload::RawMessage { .. }
        ));
    }
}
