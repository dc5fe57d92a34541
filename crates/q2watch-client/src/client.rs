// client.rs — client state containers and the owning instance
//
// One Client owns everything for one connection: the socket, the netchan,
// the handshake bookkeeping, and the decoded game state. GameState is
// wiped on every map change; the connection block survives until
// disconnect or reconnect.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use q2watch_common::info::info_value_for_key;
use q2watch_common::net_chan::{netchan_setup, NetChan};
use q2watch_common::qcommon::{
    EntityState, PlayerState, ProtocolVersion, Vec3, CS_PLAYERSKINS, MAX_CLIENTS,
    MAX_CONFIGSTRINGS, MAX_EDICTS, PORT_SERVER,
};

use crate::cl_monitor::MonitorState;
use crate::events::{EntityClass, Event, EventMask, EventPayload, EventQueue, DEFAULT_EVENT_CAPACITY};

// ============================================================
// Configuration
// ============================================================

/// Consumer-supplied configuration. Everything else about the connection
/// is negotiated on the wire.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_ip: String,
    pub server_port: u16,
    /// Appears in the userinfo and in the anti-cheat version reply.
    pub player_name: String,
    /// Stop the handshake at precache and never send `begin`.
    pub passive_mode: bool,
    /// Connectionless status polling only; no netchan is set up.
    pub monitor_mode: bool,
    pub monitor_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Emit raw datagram events for every packet in either direction.
    pub debug: bool,
}

impl Config {
    pub fn new(server_ip: impl Into<String>) -> Self {
        Self {
            server_ip: server_ip.into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            server_port: PORT_SERVER,
            player_name: "q2watch".to_string(),
            passive_mode: false,
            monitor_mode: false,
            monitor_interval_ms: 5000,
            max_reconnect_attempts: 5,
            debug: false,
        }
    }
}

// ============================================================
// Connection state
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// Not talking to a server.
    Disconnected,
    /// getchallenge sent, waiting for the challenge value.
    Challenging,
    /// connect sent, waiting for client_connect.
    Connecting,
    /// Netchan established, waiting for serverdata.
    Connected,
    /// Server is driving us through configstrings/baselines/precache.
    Handshaking,
    /// begin sent (or passive); receiving frames.
    Spawned,
    /// Waiting out the backoff before another challenge.
    Reconnecting,
}

bitflags::bitflags! {
    /// One-shot milestones of the server-driven handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandshakeFlags: u16 {
        const HAS_SERVER_DATA    = 1 << 0;
        const SENT_NEW           = 1 << 1;
        const SENT_BEGIN         = 1 << 2;
        const PRECACHE_RECEIVED  = 1 << 3;
        const RESPONDED_VERSION  = 1 << 4;
        const RESPONDED_ACTOKEN  = 1 << 5;
        const SENT_CONFIGSTRINGS = 1 << 6;
        const SENT_BASELINES     = 1 << 7;
        const AWAITING_BEGIN     = 1 << 8;
    }
}

// ============================================================
// Game state
// ============================================================

/// One tracked entity slot: the spawn baseline, the running delta target,
/// and whether the entity is currently in the world.
#[derive(Debug, Clone, Default)]
pub struct CEntity {
    pub baseline: EntityState,
    pub current: EntityState,
    pub active: bool,
}

/// A player parsed out of the configstring table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    pub client_num: usize,
    pub name: String,
    pub info: String,
}

/// Everything the server's game stream populates. Reset on map change and
/// on disconnect.
pub struct GameState {
    pub configstrings: Vec<String>,
    pub entities: Vec<CEntity>,
    pub playerstate: PlayerState,
    pub map_name: String,
    pub game_dir: String,
    pub player_num: i32,
    pub server_count: i32,
    pub last_frame_num: i32,
    pub layout: String,
}

impl GameState {
    pub fn new() -> Self {
        Self {
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            entities: vec![CEntity::default(); MAX_EDICTS],
            playerstate: PlayerState::default(),
            map_name: String::new(),
            game_dir: String::new(),
            player_num: -1,
            server_count: 0,
            last_frame_num: 0,
            layout: String::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// The client instance
// ============================================================

pub struct Client {
    pub(crate) config: Config,
    pub(crate) events: EventQueue,

    pub(crate) socket: Option<UdpSocket>,
    pub(crate) server_addr: Option<SocketAddr>,

    pub(crate) state: ConnState,
    pub(crate) chan: NetChan,
    pub(crate) qport: u16,
    pub(crate) challenge: i32,
    pub(crate) protocol: ProtocolVersion,
    pub(crate) minor_version: u16,
    pub(crate) flags: HandshakeFlags,
    pub(crate) pending_commands: VecDeque<String>,
    pub(crate) spawn_count: i32,

    pub(crate) game: GameState,
    pub(crate) monitor: MonitorState,

    // timers, all in ms on the instance clock
    epoch: Instant,
    pub(crate) connect_deadline: i64,
    pub(crate) last_resend: i64,
    pub(crate) begin_at: i64,
    pub(crate) reconnect_at: i64,
    pub(crate) reconnect_attempts: u32,
    pub(crate) next_status_poll: i64,
    pub(crate) last_backup_nop: i64,
}

impl Client {
    pub fn new(config: Config) -> Self {
        // The qport survives reconnects so the server can keep matching us
        // up across NAT rebinds.
        let qport: u16 = rand::random();
        Self {
            config,
            events: EventQueue::new(DEFAULT_EVENT_CAPACITY),
            socket: None,
            server_addr: None,
            state: ConnState::Disconnected,
            chan: netchan_setup(ProtocolVersion::Vanilla, qport, 0),
            qport,
            challenge: 0,
            protocol: ProtocolVersion::Vanilla,
            minor_version: 0,
            flags: HandshakeFlags::default(),
            pending_commands: VecDeque::new(),
            spawn_count: 0,
            game: GameState::new(),
            monitor: MonitorState::default(),
            epoch: Instant::now(),
            connect_deadline: 0,
            last_resend: 0,
            begin_at: 0,
            reconnect_at: 0,
            reconnect_attempts: 0,
            next_status_poll: 0,
            last_backup_nop: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// The qport value as it appears on the wire: one byte on extended
    /// protocols, the full sixteen bits on vanilla.
    pub(crate) fn wire_qport(&self) -> u16 {
        if self.protocol.is_extended() {
            self.qport & 0xFF
        } else {
            self.qport
        }
    }

    // ========================================================
    // Event surface
    // ========================================================

    /// Consumer handle for the event stream.
    pub fn events(&self) -> crossbeam::channel::Receiver<Event> {
        self.events.receiver()
    }

    pub fn subscribe(&mut self, kinds: EventMask) {
        self.events.subscribe(kinds);
    }

    pub fn unsubscribe(&mut self, kinds: EventMask) {
        self.events.unsubscribe(kinds);
    }

    pub(crate) fn emit(&self, payload: EventPayload) {
        self.events.emit(self.now_ms(), payload);
    }

    // ========================================================
    // State accessors
    // ========================================================

    pub fn get_player_state(&self) -> &PlayerState {
        &self.game.playerstate
    }

    /// Current state of entity `n`, if it is in the world.
    pub fn get_entity(&self, n: usize) -> Option<&EntityState> {
        let ent = self.game.entities.get(n)?;
        if ent.active {
            Some(&ent.current)
        } else {
            None
        }
    }

    pub fn get_active_entities(&self) -> Vec<&EntityState> {
        self.game
            .entities
            .iter()
            .filter(|e| e.active)
            .map(|e| &e.current)
            .collect()
    }

    /// Players currently listed in the configstring table.
    pub fn get_players(&self) -> Vec<PlayerEntry> {
        let mut players = Vec::new();
        for i in 0..MAX_CLIENTS {
            let cs = &self.game.configstrings[CS_PLAYERSKINS + i];
            if cs.is_empty() {
                continue;
            }
            let name = match cs.find('\\') {
                Some(pos) => cs[..pos].to_string(),
                None => cs.clone(),
            };
            players.push(PlayerEntry {
                client_num: i,
                name,
                info: cs.clone(),
            });
        }
        players
    }

    pub fn current_map_name(&self) -> &str {
        &self.game.map_name
    }

    /// Classify an entity slot for event consumers.
    pub(crate) fn classify_entity(number: i32, state: &EntityState) -> EntityClass {
        use q2watch_common::qcommon::{
            EF_BFG, EF_BLASTER, EF_GRENADE, EF_HYPERBLASTER, EF_ROCKET, EF_ROTATE, RF_BEAM,
        };

        if number >= 1 && number <= MAX_CLIENTS as i32 {
            return EntityClass::Player;
        }
        if state.effects & (EF_BLASTER | EF_ROCKET | EF_GRENADE | EF_HYPERBLASTER | EF_BFG) != 0
            || state.renderfx & RF_BEAM != 0
        {
            return EntityClass::Projectile;
        }
        if state.effects & EF_ROTATE != 0 {
            return EntityClass::Item;
        }
        EntityClass::Other
    }

    /// Player origin in world units, expanded from pmove fixed point.
    pub fn player_origin(&self) -> Vec3 {
        let o = &self.game.playerstate.pmove.origin;
        [
            o[0] as f32 * 0.125,
            o[1] as f32 * 0.125,
            o[2] as f32 * 0.125,
        ]
    }

    /// Player name lookup by configstring slot, empty when unknown.
    pub fn player_name(&self, client_num: usize) -> String {
        if client_num >= MAX_CLIENTS {
            return String::new();
        }
        let cs = &self.game.configstrings[CS_PLAYERSKINS + client_num];
        match cs.find('\\') {
            Some(pos) => cs[..pos].to_string(),
            None => cs.clone(),
        }
    }

    /// Skin for a player line, mostly here for completeness of the
    /// configstring view.
    pub fn player_skin(&self, client_num: usize) -> String {
        if client_num >= MAX_CLIENTS {
            return String::new();
        }
        let cs = &self.game.configstrings[CS_PLAYERSKINS + client_num];
        info_value_for_key(cs, "skin")
    }
}
