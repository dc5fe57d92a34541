// q2watch-common — Quake 2 wire protocol plumbing
//
// Everything in here is connection-agnostic: byte buffers and primitive
// reads, the netchan transport, zlib inflation, and infostring handling.
// The stateful client lives in q2watch-client.

pub mod compression;
pub mod info;
pub mod msg;
pub mod net_chan;
pub mod qcommon;
