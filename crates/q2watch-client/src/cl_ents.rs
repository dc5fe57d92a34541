// cl_ents.rs — entity and player state delta decoding
//
// Baselines are written once per map by svc_spawnbaseline (or the
// gamestate baseline table) and are what a freshly visible entity starts
// from. After that, frame deltas always apply on top of the current
// table. U_REMOVE takes the entity out of the world without touching its
// baseline.

use q2watch_common::msg::{
    msg_read_angle, msg_read_angle16, msg_read_byte, msg_read_char, msg_read_coord, msg_read_data,
    msg_read_long, msg_read_pos, msg_read_short,
};
use q2watch_common::qcommon::*;

use crate::client::Client;
use crate::events::{EntityUpdate, EventPayload, PlayerUpdate};

/// Read the delta bit mask and the entity number it applies to. The mask
/// arrives one byte at a time, each U_MOREBITS flag pulling in the next
/// byte; U_NUMBER16 widens the entity number to sixteen bits.
pub fn parse_entity_bits(msg: &mut SizeBuf, bits: &mut u32) -> i32 {
    let mut total = msg_read_byte(msg) as u32 & 0xFF;
    if total & U_MOREBITS1 != 0 {
        total |= (msg_read_byte(msg) as u32 & 0xFF) << 8;
    }
    if total & U_MOREBITS2 != 0 {
        total |= (msg_read_byte(msg) as u32 & 0xFF) << 16;
    }
    if total & U_MOREBITS3 != 0 {
        total |= (msg_read_byte(msg) as u32 & 0xFF) << 24;
    }

    let number = if total & U_NUMBER16 != 0 {
        msg_read_short(msg)
    } else {
        msg_read_byte(msg)
    };

    *bits = total;
    number
}

/// Apply a delta record on top of `from`, producing `to`. Field order on
/// the wire is fixed; the bits only say which fields are present.
pub fn parse_delta(from: &EntityState, to: &mut EntityState, number: i32, bits: u32, msg: &mut SizeBuf) {
    *to = from.clone();
    to.old_origin = from.origin;
    to.number = number;

    if bits & U_MODEL != 0 {
        to.modelindex = msg_read_byte(msg);
    }
    if bits & U_MODEL2 != 0 {
        to.modelindex2 = msg_read_byte(msg);
    }
    if bits & U_MODEL3 != 0 {
        to.modelindex3 = msg_read_byte(msg);
    }
    if bits & U_MODEL4 != 0 {
        to.modelindex4 = msg_read_byte(msg);
    }

    if bits & U_FRAME8 != 0 {
        to.frame = msg_read_byte(msg);
    }
    if bits & U_FRAME16 != 0 {
        to.frame = msg_read_short(msg);
    }

    if (bits & (U_SKIN8 | U_SKIN16)) == (U_SKIN8 | U_SKIN16) {
        // both bits together mean the full 32-bit form (laser colors)
        to.skinnum = msg_read_long(msg);
    } else if bits & U_SKIN8 != 0 {
        to.skinnum = msg_read_byte(msg);
    } else if bits & U_SKIN16 != 0 {
        to.skinnum = msg_read_short(msg);
    }

    if (bits & (U_EFFECTS8 | U_EFFECTS16)) == (U_EFFECTS8 | U_EFFECTS16) {
        to.effects = msg_read_long(msg) as u32;
    } else if bits & U_EFFECTS8 != 0 {
        to.effects = msg_read_byte(msg) as u32;
    } else if bits & U_EFFECTS16 != 0 {
        to.effects = msg_read_short(msg) as u32;
    }

    if (bits & (U_RENDERFX8 | U_RENDERFX16)) == (U_RENDERFX8 | U_RENDERFX16) {
        to.renderfx = msg_read_long(msg);
    } else if bits & U_RENDERFX8 != 0 {
        to.renderfx = msg_read_byte(msg);
    } else if bits & U_RENDERFX16 != 0 {
        to.renderfx = msg_read_short(msg);
    }

    if bits & U_ORIGIN1 != 0 {
        to.origin[0] = msg_read_coord(msg);
    }
    if bits & U_ORIGIN2 != 0 {
        to.origin[1] = msg_read_coord(msg);
    }
    if bits & U_ORIGIN3 != 0 {
        to.origin[2] = msg_read_coord(msg);
    }

    if bits & U_ANGLE1 != 0 {
        to.angles[0] = msg_read_angle(msg);
    }
    if bits & U_ANGLE2 != 0 {
        to.angles[1] = msg_read_angle(msg);
    }
    if bits & U_ANGLE3 != 0 {
        to.angles[2] = msg_read_angle(msg);
    }

    if bits & U_OLDORIGIN != 0 {
        to.old_origin = msg_read_pos(msg);
    }

    if bits & U_SOUND != 0 {
        to.sound = msg_read_byte(msg);
    }

    if bits & U_EVENT != 0 {
        to.event = msg_read_byte(msg);
    } else {
        to.event = 0;
    }

    if bits & U_SOLID != 0 {
        to.solid = msg_read_short(msg);
    }
}

impl Client {
    /// svc_spawnbaseline: one entity-delta record written into the
    /// baseline table.
    pub(crate) fn parse_baseline(&mut self, msg: &mut SizeBuf) {
        let mut bits: u32 = 0;
        let nullstate = EntityState::default();

        let number = parse_entity_bits(msg, &mut bits);
        if number <= 0 || number as usize >= MAX_EDICTS {
            return;
        }
        let mut baseline = EntityState::default();
        parse_delta(&nullstate, &mut baseline, number, bits, msg);
        self.game.entities[number as usize].baseline = baseline;
    }

    /// The packet-entities block of a frame: entity-delta records until an
    /// all-zero bits/number pair.
    pub(crate) fn parse_packet_entities(&mut self, msg: &mut SizeBuf) {
        loop {
            if msg.readcount > msg.cursize {
                // truncated: abandon the rest of the payload
                return;
            }

            let mut bits: u32 = 0;
            let number = parse_entity_bits(msg, &mut bits);
            if msg.readcount > msg.cursize {
                return;
            }
            if number == 0 {
                break;
            }
            if number < 0 || number as usize >= MAX_EDICTS {
                return;
            }

            let idx = number as usize;

            if bits & U_REMOVE != 0 {
                let update = {
                    let ent = &mut self.game.entities[idx];
                    ent.active = false;
                    EntityUpdate {
                        number,
                        class: Client::classify_entity(number, &ent.current),
                        origin: ent.current.origin,
                        angles: ent.current.angles,
                        model_index: ent.current.modelindex,
                        effects: ent.current.effects,
                        removed: true,
                    }
                };
                self.emit(EventPayload::EntityUpdate(update));
                continue;
            }

            // fresh entities start from their baseline, live ones delta
            // from the current table
            let from = if self.game.entities[idx].active {
                self.game.entities[idx].current.clone()
            } else {
                self.game.entities[idx].baseline.clone()
            };
            let mut to = EntityState::default();
            parse_delta(&from, &mut to, number, bits, msg);

            if msg.readcount > msg.cursize {
                return;
            }

            let update = EntityUpdate {
                number,
                class: Client::classify_entity(number, &to),
                origin: to.origin,
                angles: to.angles,
                model_index: to.modelindex,
                effects: to.effects,
                removed: false,
            };
            let ent = &mut self.game.entities[idx];
            ent.current = to;
            ent.active = true;
            self.emit(EventPayload::EntityUpdate(update));
        }
    }

    /// The player-state delta inside a frame.
    pub(crate) fn parse_playerstate(&mut self, msg: &mut SizeBuf) {
        let flags = msg_read_short(msg) as u16 as u32;
        let state = &mut self.game.playerstate;

        if flags & PS_M_TYPE != 0 {
            state.pmove.pm_type = PmType::from_byte(msg_read_byte(msg));
        }

        if flags & PS_M_ORIGIN != 0 {
            state.pmove.origin[0] = msg_read_short(msg) as i16;
            state.pmove.origin[1] = msg_read_short(msg) as i16;
            state.pmove.origin[2] = msg_read_short(msg) as i16;
        }

        if flags & PS_M_VELOCITY != 0 {
            state.pmove.velocity[0] = msg_read_short(msg) as i16;
            state.pmove.velocity[1] = msg_read_short(msg) as i16;
            state.pmove.velocity[2] = msg_read_short(msg) as i16;
        }

        if flags & PS_M_TIME != 0 {
            state.pmove.pm_time = msg_read_byte(msg) as u8;
        }

        if flags & PS_M_FLAGS != 0 {
            state.pmove.pm_flags = msg_read_byte(msg) as u8;
        }

        if flags & PS_M_GRAVITY != 0 {
            state.pmove.gravity = msg_read_short(msg) as i16;
        }

        if flags & PS_M_DELTA_ANGLES != 0 {
            state.pmove.delta_angles[0] = msg_read_short(msg) as i16;
            state.pmove.delta_angles[1] = msg_read_short(msg) as i16;
            state.pmove.delta_angles[2] = msg_read_short(msg) as i16;
        }

        if flags & PS_VIEWOFFSET != 0 {
            state.viewoffset[0] = msg_read_char(msg) as f32 * 0.25;
            state.viewoffset[1] = msg_read_char(msg) as f32 * 0.25;
            state.viewoffset[2] = msg_read_char(msg) as f32 * 0.25;
        }

        if flags & PS_VIEWANGLES != 0 {
            state.viewangles[0] = msg_read_angle16(msg);
            state.viewangles[1] = msg_read_angle16(msg);
            state.viewangles[2] = msg_read_angle16(msg);
        }

        if flags & PS_KICKANGLES != 0 {
            state.kick_angles[0] = msg_read_char(msg) as f32 * 0.25;
            state.kick_angles[1] = msg_read_char(msg) as f32 * 0.25;
            state.kick_angles[2] = msg_read_char(msg) as f32 * 0.25;
        }

        if flags & PS_WEAPONINDEX != 0 {
            state.gunindex = msg_read_byte(msg);
        }

        if flags & PS_WEAPONFRAME != 0 {
            state.gunframe = msg_read_byte(msg);
            // gun offset and gun angles, 0.25-unit signed bytes
            for _ in 0..6 {
                msg_read_char(msg);
            }
        }

        if flags & PS_BLEND != 0 {
            state.blend[0] = msg_read_byte(msg) as f32 / 255.0;
            state.blend[1] = msg_read_byte(msg) as f32 / 255.0;
            state.blend[2] = msg_read_byte(msg) as f32 / 255.0;
            state.blend[3] = msg_read_byte(msg) as f32 / 255.0;
        }

        if flags & PS_FOV != 0 {
            state.fov = msg_read_byte(msg) as f32;
        }

        if flags & PS_RDFLAGS != 0 {
            state.rdflags = msg_read_byte(msg);
        }

        // stats: the vanilla protocol always writes all 32 words, the
        // extended ones gate them behind a bitmask
        if self.protocol.is_extended() {
            let statbits = msg_read_long(msg) as u32;
            for i in 0..MAX_STATS {
                if statbits & (1 << i) != 0 {
                    state.stats[i] = msg_read_short(msg) as i16;
                }
            }
        } else {
            for i in 0..MAX_STATS {
                state.stats[i] = msg_read_short(msg) as i16;
            }
        }
    }

    /// svc_frame: header, area mask, player-state delta, packet entities.
    pub(crate) fn parse_frame(&mut self, msg: &mut SizeBuf) {
        let framenum;
        let _delta_num;
        if self.protocol.is_extended() {
            let packed = msg_read_long(msg) as u32;
            framenum = (packed & 0x07FF_FFFF) as i32;
            _delta_num = (packed >> 27) as i32;
            let _suppress_flags = msg_read_byte(msg);
        } else {
            framenum = msg_read_long(msg);
            _delta_num = msg_read_long(msg);
            let _suppress_count = msg_read_byte(msg);
        }

        let area_bytes = msg_read_byte(msg);
        if area_bytes < 0 || msg.readcount > msg.cursize {
            return;
        }
        let _area_mask = msg_read_data(msg, area_bytes as usize);

        if msg.readcount > msg.cursize {
            return;
        }

        self.parse_playerstate(msg);
        if msg.readcount > msg.cursize {
            return;
        }

        // echoed back to the server by subsequent move acks
        self.game.last_frame_num = framenum;

        let ps = &self.game.playerstate;
        let update = PlayerUpdate {
            is_local_player: true,
            pm_type: ps.pmove.pm_type,
            origin: self.player_origin(),
            velocity: [
                ps.pmove.velocity[0] as f32 * 0.125,
                ps.pmove.velocity[1] as f32 * 0.125,
                ps.pmove.velocity[2] as f32 * 0.125,
            ],
            view_angles: ps.viewangles,
            weapon_index: ps.gunindex,
            weapon_frame: ps.gunframe,
            fov: ps.fov,
        };
        self.emit(EventPayload::PlayerUpdate(update));

        self.parse_packet_entities(msg);
    }
}
