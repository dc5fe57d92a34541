// q2watch-client — headless Quake 2 spectator/monitor client
//
// The Client owns one UDP connection to a Quake 2 family server (vanilla
// 34, R1Q2 35, Q2PRO 36, AQtion 38), runs the spectator handshake,
// decodes the delta-compressed game stream, and surfaces typed events.
// Drive it cooperatively:
//
//     let mut client = Client::new(Config::new("203.0.113.9"));
//     let events = client.events();
//     client.connect()?;
//     loop {
//         client.run_frame();
//         while let Ok(event) = events.try_recv() { /* ... */ }
//         std::thread::sleep(std::time::Duration::from_millis(5));
//     }

pub mod cl_ents;
pub mod cl_main;
pub mod cl_monitor;
pub mod cl_parse;
pub mod client;
pub mod error;
pub mod events;

pub use client::{Client, Config, ConnState, PlayerEntry};
pub use error::{ClientError, ClientResult};
pub use events::{
    ConnectionStatus, EntityClass, EntityUpdate, Event, EventMask, EventPayload, PlayerUpdate,
    PrintLevel, ServerInfoEvent, StatusPlayer,
};

pub use q2watch_common as common;
