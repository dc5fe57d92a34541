// events.rs — typed event surface toward embedding applications
//
// Decoded game traffic is translated into events and pushed through a
// bounded crossbeam channel. The producer side never blocks: when the
// consumer falls behind and the queue fills up, events are dropped. Kind
// filtering happens on the producer side so unsubscribed kinds cost
// nothing to the consumer.

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use q2watch_common::qcommon::{PmType, Vec3};

/// Queue depth before events are dropped. Sized for burst traffic around
/// map changes (a full configstring dump plus baselines).
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

bitflags::bitflags! {
    /// Subscription mask over event kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const CONSOLE_MESSAGE = 1 << 0;
        const PLAYER_UPDATE   = 1 << 1;
        const ENTITY_UPDATE   = 1 << 2;
        const SERVER_INFO     = 1 << 3;
        const CONNECTION      = 1 << 4;
        /// Verbose raw datagram dumps, only useful with Config::debug.
        const RAW_MESSAGE     = 1 << 5;
    }
}

/// svc_print levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintLevel {
    Low,
    Medium,
    High,
    Chat,
}

impl PrintLevel {
    pub fn from_byte(level: i32) -> Self {
        match level {
            1 => PrintLevel::Medium,
            2 => PrintLevel::High,
            3 => PrintLevel::Chat,
            _ => PrintLevel::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrintLevel::Low => "LOW",
            PrintLevel::Medium => "MEDIUM",
            PrintLevel::High => "HIGH",
            PrintLevel::Chat => "CHAT",
        }
    }
}

/// Rough classification of a tracked entity, derived from its slot number
/// and effect flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    Player,
    Item,
    Projectile,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Challenging,
    Connecting,
    Connected,
    Handshaking,
    Spawned,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct EntityUpdate {
    pub number: i32,
    pub class: EntityClass,
    pub origin: Vec3,
    pub angles: Vec3,
    pub model_index: i32,
    pub effects: u32,
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct PlayerUpdate {
    pub is_local_player: bool,
    pub pm_type: PmType,
    /// World units (fixed point already expanded).
    pub origin: Vec3,
    pub velocity: Vec3,
    pub view_angles: Vec3,
    pub weapon_index: i32,
    pub weapon_frame: i32,
    pub fov: f32,
}

/// One row of a status response player table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPlayer {
    pub score: i32,
    pub ping: i32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum ServerInfoEvent {
    Connected {
        map: String,
        game_dir: String,
        protocol: i32,
    },
    MapChange {
        previous_map: String,
        map: String,
    },
    PlayerJoin {
        name: String,
    },
    PlayerLeave {
        name: String,
    },
    Status {
        info: Vec<(String, String)>,
        players: Vec<StatusPlayer>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    ConsoleMessage {
        level: PrintLevel,
        text: String,
    },
    PlayerUpdate(PlayerUpdate),
    EntityUpdate(EntityUpdate),
    ServerInfo(ServerInfoEvent),
    Connection {
        status: ConnectionStatus,
        reason: Option<String>,
    },
    RawMessage {
        direction: PacketDirection,
        data: Vec<u8>,
    },
    /// Diagnostic notes from the protocol machinery, debug builds of a
    /// consumer only.
    Debug {
        text: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventMask {
        match self {
            EventPayload::ConsoleMessage { .. } => EventMask::CONSOLE_MESSAGE,
            EventPayload::PlayerUpdate(_) => EventMask::PLAYER_UPDATE,
            EventPayload::EntityUpdate(_) => EventMask::ENTITY_UPDATE,
            EventPayload::ServerInfo(_) => EventMask::SERVER_INFO,
            EventPayload::Connection { .. } => EventMask::CONNECTION,
            EventPayload::RawMessage { .. } | EventPayload::Debug { .. } => EventMask::RAW_MESSAGE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    /// Milliseconds since the client instance was created.
    pub timestamp_ms: i64,
    pub payload: EventPayload,
}

/// Bounded event queue between the protocol task and the consumer.
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    mask: EventMask,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            mask: EventMask::all() - EventMask::RAW_MESSAGE,
        }
    }

    pub fn subscribe(&mut self, kinds: EventMask) {
        self.mask |= kinds;
    }

    pub fn unsubscribe(&mut self, kinds: EventMask) {
        self.mask -= kinds;
    }

    pub fn is_subscribed(&self, kinds: EventMask) -> bool {
        self.mask.contains(kinds)
    }

    /// Emit an event. Returns false when it was filtered out or the queue
    /// was full; either way the caller carries on.
    pub fn emit(&self, timestamp_ms: i64, payload: EventPayload) -> bool {
        if !self.mask.intersects(payload.kind()) {
            return false;
        }
        match self.sender.try_send(Event {
            timestamp_ms,
            payload,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Consumer handle. Receivers can be cloned and moved to other threads.
    pub fn receiver(&self) -> Receiver<Event> {
        self.receiver.clone()
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}
