// cl_monitor.rs — connectionless status polling
//
// Monitor mode never sets up a netchan. On an interval it sends the OOB
// `status` query and parses the reply: line one is the response token,
// line two a \key\value\ infostring, and each following line a
// `score ping "name"` player row. Two consecutive snapshots are diffed
// into join/leave/map-change events.

use q2watch_common::info::info_pairs;

use crate::client::Client;
use crate::events::{EventPayload, ServerInfoEvent, StatusPlayer};

/// An answered status query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub info: Vec<(String, String)>,
    pub players: Vec<StatusPlayer>,
}

impl StatusSnapshot {
    pub fn map_name(&self) -> String {
        for (k, v) in &self.info {
            if k == "mapname" {
                return v.clone();
            }
        }
        String::new()
    }
}

#[derive(Debug, Default)]
pub struct MonitorState {
    pub last: Option<StatusSnapshot>,
    /// Instance time of the unanswered query, 0 when none is in flight.
    pub pending_since: i64,
}

/// How long a status query may go unanswered before it counts as lost.
pub const STATUS_TIMEOUT_MS: i64 = 1000;

/// Parse the body of a status response (everything after the response
/// token line).
pub fn parse_status_body(body: &str) -> StatusSnapshot {
    let mut lines = body.lines();
    let info = match lines.next() {
        Some(line) => info_pairs(line),
        None => Vec::new(),
    };

    let mut players = Vec::new();
    for line in lines {
        if let Some(player) = parse_player_line(line) {
            players.push(player);
        }
    }

    StatusSnapshot { info, players }
}

/// One `score ping "name"` row. Rows that do not fit the shape are
/// ignored rather than aborting the whole response.
fn parse_player_line(line: &str) -> Option<StatusPlayer> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut rest = line;
    let score = take_int(&mut rest)?;
    let ping = take_int(&mut rest)?;

    let rest = rest.trim_start();
    let name = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.strip_suffix('"').unwrap_or(stripped).to_string()
    } else {
        rest.to_string()
    };

    Some(StatusPlayer { score, ping, name })
}

fn take_int(rest: &mut &str) -> Option<i32> {
    let trimmed = rest.trim_start();
    let end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let value = trimmed[..end].parse().ok()?;
    *rest = &trimmed[end..];
    Some(value)
}

/// Render a snapshot back into a status response body. The inverse of
/// `parse_status_body`, used by consumers that relay status text onward.
pub fn format_status_body(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    for (k, v) in &snapshot.info {
        out.push('\\');
        out.push_str(k);
        out.push('\\');
        out.push_str(v);
    }
    out.push('\n');
    for p in &snapshot.players {
        out.push_str(&format!("{} {} \"{}\"\n", p.score, p.ping, p.name));
    }
    out
}

impl Client {
    /// Send the periodic `status` query.
    pub(crate) fn monitor_poll(&mut self, now: i64) {
        self.send_oob("status\n");
        self.monitor.pending_since = now;
        self.next_status_poll = now + self.config.monitor_interval_ms as i64;
    }

    pub(crate) fn check_monitor_timeout(&mut self, now: i64) {
        if self.monitor.pending_since != 0 && now - self.monitor.pending_since > STATUS_TIMEOUT_MS {
            self.monitor.pending_since = 0;
            self.debug_note("status query timed out");
        }
    }

    /// A statusResponse (or bare info response) body arrived.
    pub(crate) fn handle_status_response(&mut self, body: &str) {
        let snapshot = parse_status_body(body);
        self.monitor.pending_since = 0;

        if let Some(previous) = self.monitor.last.take() {
            self.diff_snapshots(&previous, &snapshot);
        }

        self.emit(EventPayload::ServerInfo(ServerInfoEvent::Status {
            info: snapshot.info.clone(),
            players: snapshot.players.clone(),
        }));

        self.monitor.last = Some(snapshot);
    }

    fn diff_snapshots(&mut self, old: &StatusSnapshot, new: &StatusSnapshot) {
        let old_map = old.map_name();
        let new_map = new.map_name();
        if !old_map.is_empty() && old_map != new_map {
            self.emit(EventPayload::ServerInfo(ServerInfoEvent::MapChange {
                previous_map: old_map,
                map: new_map,
            }));
        }

        for player in &new.players {
            if !old.players.iter().any(|p| p.name == player.name) {
                self.emit(EventPayload::ServerInfo(ServerInfoEvent::PlayerJoin {
                    name: player.name.clone(),
                }));
            }
        }
        for player in &old.players {
            if !new.players.iter().any(|p| p.name == player.name) {
                self.emit(EventPayload::ServerInfo(ServerInfoEvent::PlayerLeave {
                    name: player.name.clone(),
                }));
            }
        }
    }
}
