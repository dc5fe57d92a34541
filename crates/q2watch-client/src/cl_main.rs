// cl_main.rs — connection lifecycle and the cooperative event loop
//
// Everything runs single-threaded: run_frame() drains the non-blocking
// socket, then services whichever timers the current state needs
// (challenge resends, the deferred begin, heartbeats, reconnect backoff,
// monitor polls). The server drives the handshake through stufftext
// commands; our side of it is a FIFO of reliable string commands drained
// one at a time as the reliable channel frees up.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use q2watch_common::info::info_set_value_for_key;
use q2watch_common::msg::{clean_display_text, msg_write_byte, msg_write_string};
use q2watch_common::net_chan::{
    is_out_of_band, netchan_can_reliable, netchan_out_of_band, netchan_process, netchan_setup,
    netchan_transmit,
};
use q2watch_common::qcommon::{
    ProtocolVersion, SizeBuf, CLC_NOP, CLC_STRINGCMD, MAX_MSGLEN_EXTENDED, PROTOCOL_Q2PRO_MINOR,
    PROTOCOL_R1Q2_MINOR,
};

use crate::client::{Client, ConnState, HandshakeFlags};
use crate::error::{ClientError, ClientResult};
use crate::events::{ConnectionStatus, EventPayload, PacketDirection, PrintLevel};

/// Wall-clock budget from connect() to the first client_connect.
const CONNECT_TIMEOUT_MS: i64 = 15_000;
/// Challenge/connect retransmit interval.
const RESEND_INTERVAL_MS: i64 = 3_000;
/// Delay between precache and the reliable begin.
const BEGIN_DELAY_MS: i64 = 500;
/// Empty keepalive packet interval while connected but not spawned.
const HEARTBEAT_PRESPAWN_MS: i64 = 300;
/// clc_nop interval while spawned.
const HEARTBEAT_SPAWNED_MS: i64 = 100;
/// Backup nop guarding against long silence in any connected state.
const BACKUP_NOP_MS: i64 = 10_000;
/// Give up on a silent server after this long.
const SERVER_TIMEOUT_MS: i64 = 30_000;
/// Reconnect backoff step and cap.
const RECONNECT_STEP_MS: i64 = 5_000;
const RECONNECT_MAX_MS: i64 = 30_000;
/// Delay before honoring a server-requested reconnect.
const SOFT_RECONNECT_DELAY_MS: i64 = 500;

fn status_of(state: ConnState) -> ConnectionStatus {
    match state {
        ConnState::Disconnected => ConnectionStatus::Disconnected,
        ConnState::Challenging => ConnectionStatus::Challenging,
        ConnState::Connecting => ConnectionStatus::Connecting,
        ConnState::Connected => ConnectionStatus::Connected,
        ConnState::Handshaking => ConnectionStatus::Handshaking,
        ConnState::Spawned => ConnectionStatus::Spawned,
        ConnState::Reconnecting => ConnectionStatus::Reconnecting,
    }
}

fn open_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(0x20000)?;
    socket.set_nonblocking(true)?;
    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

impl Client {
    // ========================================================
    // Public lifecycle
    // ========================================================

    /// Open the socket and start the handshake (or, in monitor mode, the
    /// status polling).
    pub fn connect(&mut self) -> ClientResult<()> {
        if self.state != ConnState::Disconnected {
            return Err(ClientError::AlreadyConnected);
        }

        let addr = (self.config.server_ip.as_str(), self.config.server_port)
            .to_socket_addrs()
            .map_err(|_| ClientError::BadAddress(self.config.server_ip.clone()))?
            .next()
            .ok_or_else(|| ClientError::BadAddress(self.config.server_ip.clone()))?;

        self.socket = Some(open_socket()?);
        self.server_addr = Some(addr);
        self.reconnect_attempts = 0;

        let now = self.now_ms();
        if self.config.monitor_mode {
            self.next_status_poll = now;
            return Ok(());
        }

        self.connect_deadline = now + CONNECT_TIMEOUT_MS;
        self.start_challenge(now);
        Ok(())
    }

    /// Tear the connection down: cancel every timer, tell the server
    /// best-effort, close the socket. The only event emitted is the final
    /// disconnected transition.
    pub fn disconnect(&mut self) {
        if self.state >= ConnState::Connected {
            self.send_oob("disconnect\n");
        }

        let now = self.now_ms();
        self.reset_connection_state(now);
        self.reconnect_at = 0;
        self.reconnect_attempts = 0;
        self.next_status_poll = 0;
        self.socket = None;
        self.server_addr = None;
        self.set_state(ConnState::Disconnected, Some("user".to_string()));
    }

    /// One iteration of the cooperative loop. Call this on a short cadence
    /// (a few milliseconds); it never blocks.
    pub fn run_frame(&mut self) {
        let now = self.now_ms();
        self.frame(now);
    }

    pub(crate) fn frame(&mut self, now: i64) {
        self.read_packets(now);

        if self.config.monitor_mode {
            if self.socket.is_some() {
                if now >= self.next_status_poll {
                    self.monitor_poll(now);
                }
                self.check_monitor_timeout(now);
            }
            return;
        }

        match self.state {
            ConnState::Disconnected => {}

            ConnState::Challenging | ConnState::Connecting => {
                if self.connect_deadline != 0 && now >= self.connect_deadline {
                    self.server_dropped("connect timed out", now);
                    return;
                }
                if now - self.last_resend >= RESEND_INTERVAL_MS {
                    self.last_resend = now;
                    if self.state == ConnState::Challenging {
                        self.send_oob("getchallenge\n");
                    } else {
                        self.send_connect();
                    }
                }
            }

            ConnState::Reconnecting => {
                if now >= self.reconnect_at {
                    self.connect_deadline = now + CONNECT_TIMEOUT_MS;
                    self.start_challenge(now);
                }
            }

            ConnState::Connected | ConnState::Handshaking | ConnState::Spawned => {
                if now - self.chan.last_received > SERVER_TIMEOUT_MS {
                    self.server_dropped("server timed out", now);
                    return;
                }
                self.drain_pending(now);
                self.check_begin(now);
                self.heartbeat(now);
            }
        }
    }

    // ========================================================
    // Socket plumbing
    // ========================================================

    fn read_packets(&mut self, now: i64) {
        let Some(socket) = &self.socket else {
            return;
        };

        // collect first, process after, so the borrow on the socket ends
        let mut datagrams: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
        let mut buf = [0u8; MAX_MSGLEN_EXTENDED + 64];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => datagrams.push((buf[..len].to_vec(), from)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        for (data, from) in datagrams {
            if Some(from) != self.server_addr {
                self.debug_note(&format!("packet from unexpected address {}", from));
                continue;
            }

            if self.config.debug {
                self.emit(EventPayload::RawMessage {
                    direction: PacketDirection::Incoming,
                    data: data.clone(),
                });
            }

            if is_out_of_band(&data) {
                self.handle_oob(&data[4..], now);
                continue;
            }

            if self.config.monitor_mode {
                continue; // monitor mode never has a sequenced stream
            }
            if self.state < ConnState::Connected {
                continue; // dump sequenced traffic until the netchan exists
            }
            if data.len() < 8 {
                self.debug_note("runt packet");
                continue;
            }

            let mut msg = SizeBuf::from_bytes(&data);
            if !netchan_process(&mut self.chan, &mut msg, now) {
                continue;
            }

            let payload = msg.data[msg.readcount as usize..msg.cursize as usize].to_vec();
            self.process_server_data(&payload, now);
        }
    }

    /// Send an application payload through the netchan.
    pub(crate) fn transmit(&mut self, data: &[u8], now: i64) {
        let packet = netchan_transmit(&mut self.chan, data, now);
        if self.config.debug {
            self.emit(EventPayload::RawMessage {
                direction: PacketDirection::Outgoing,
                data: packet.clone(),
            });
        }

        let result = match (&self.socket, self.server_addr) {
            (Some(socket), Some(addr)) => socket.send_to(&packet, addr).map(|_| ()),
            _ => Ok(()),
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::WouldBlock {
                self.server_dropped(&format!("send failed: {}", e), now);
            }
        }
    }

    pub(crate) fn send_oob(&mut self, text: &str) {
        let packet = netchan_out_of_band(text.as_bytes());
        if self.config.debug {
            self.emit(EventPayload::RawMessage {
                direction: PacketDirection::Outgoing,
                data: packet.clone(),
            });
        }
        if let (Some(socket), Some(addr)) = (&self.socket, self.server_addr) {
            let _ = socket.send_to(&packet, addr); // best effort
        }
    }

    /// Stage a reliable string command and push it out in its own packet.
    fn send_reliable_cmd(&mut self, cmd: &str, now: i64) {
        msg_write_byte(&mut self.chan.message, CLC_STRINGCMD as i32);
        msg_write_string(&mut self.chan.message, cmd);
        self.transmit(&[], now);
    }

    // ========================================================
    // Handshake
    // ========================================================

    fn start_challenge(&mut self, now: i64) {
        self.set_state(ConnState::Challenging, None);
        self.last_resend = now;
        self.send_oob("getchallenge\n");
    }

    /// Pick the best protocol the server offers: AQtion, then Q2PRO, then
    /// R1Q2, then vanilla.
    fn choose_protocol(list: &str) -> ProtocolVersion {
        let mut available = Vec::new();
        for part in list.split(',') {
            if let Ok(n) = part.trim().parse::<i32>() {
                if let Some(v) = ProtocolVersion::from_number(n) {
                    available.push(v);
                }
            }
        }
        for preference in [
            ProtocolVersion::Aqtion,
            ProtocolVersion::Q2pro,
            ProtocolVersion::R1q2,
            ProtocolVersion::Vanilla,
        ] {
            if available.contains(&preference) {
                return preference;
            }
        }
        ProtocolVersion::Vanilla
    }

    fn userinfo(&self) -> String {
        let mut info = String::new();
        info_set_value_for_key(&mut info, "name", &self.config.player_name);
        info_set_value_for_key(&mut info, "skin", "male/grunt");
        info_set_value_for_key(&mut info, "rate", "25000");
        info_set_value_for_key(&mut info, "msg", "1");
        info_set_value_for_key(&mut info, "hand", "2");
        info_set_value_for_key(&mut info, "fov", "90");
        info_set_value_for_key(&mut info, "spectator", "1");
        info
    }

    fn send_connect(&mut self) {
        let userinfo = self.userinfo();
        let qport = self.wire_qport();
        let cmd = match self.protocol {
            ProtocolVersion::Vanilla => format!(
                "connect 34 {} {} \"{}\"\n",
                qport, self.challenge, userinfo
            ),
            ProtocolVersion::R1q2 => format!(
                "connect 35 {} {} \"{}\" {} {}\n",
                qport, self.challenge, userinfo, MAX_MSGLEN_EXTENDED, PROTOCOL_R1Q2_MINOR
            ),
            ProtocolVersion::Q2pro | ProtocolVersion::Aqtion => format!(
                "connect {} {} {} \"{}\" {} 1 {}\n",
                self.protocol.number(),
                qport,
                self.challenge,
                userinfo,
                MAX_MSGLEN_EXTENDED,
                PROTOCOL_Q2PRO_MINOR
            ),
        };
        self.send_oob(&cmd);
    }

    /// One connectionless packet, minus the 0xFFFFFFFF prefix.
    fn handle_oob(&mut self, data: &[u8], now: i64) {
        let text: String = data.iter().map(|&b| b as char).collect();
        let (line, body) = match text.find('\n') {
            Some(pos) => (&text[..pos], &text[pos + 1..]),
            None => (text.as_str(), ""),
        };
        let mut tokens = line.split_whitespace();
        let cmd = tokens.next().unwrap_or("");

        match cmd {
            "challenge" => {
                if self.state != ConnState::Challenging {
                    return;
                }
                let challenge = match tokens.next().and_then(|t| t.parse::<i32>().ok()) {
                    Some(c) => c,
                    None => {
                        self.debug_note("malformed challenge");
                        return;
                    }
                };
                let mut protocol = ProtocolVersion::Vanilla;
                for token in tokens {
                    if let Some(list) = token.strip_prefix("p=") {
                        protocol = Self::choose_protocol(list);
                    }
                }
                self.challenge = challenge;
                self.protocol = protocol;
                self.set_state(ConnState::Connecting, None);
                self.last_resend = now;
                self.send_connect();
            }

            "client_connect" => {
                if self.state != ConnState::Connecting {
                    self.debug_note("duplicate client_connect ignored");
                    return;
                }
                // an nc=N token names the netchan variant; old and new both
                // map onto this channel
                self.chan = netchan_setup(self.protocol, self.wire_qport(), now);
                self.connect_deadline = 0;
                self.reconnect_attempts = 0;
                self.set_state(ConnState::Connected, None);
                self.enqueue_command("new");
                self.flags |= HandshakeFlags::SENT_NEW;
            }

            "print" => {
                let message = clean_display_text(body.trim_end_matches(['\n', '\0']));
                self.emit(EventPayload::ConsoleMessage {
                    level: PrintLevel::High,
                    text: message.clone(),
                });
                // a print during the handshake is how servers refuse us
                if matches!(self.state, ConnState::Challenging | ConnState::Connecting) {
                    self.server_dropped(&format!("rejected: {}", message), now);
                }
            }

            "disconnect" => {
                self.server_dropped("server disconnected", now);
            }

            "statusResponse" | "info" => {
                self.handle_status_response(body);
            }

            "ack" => {}

            "ping" => {
                self.send_oob("ack");
            }

            "echo" => {
                let rest = line.strip_prefix("echo").unwrap_or("").trim_start();
                self.send_oob(&format!("{}\n", rest));
            }

            _ => {
                self.debug_note(&format!("unknown oob command: {}", cmd));
            }
        }
    }

    /// The server drives us through the handshake by stuffing command
    /// strings. A stufftext may carry several newline-separated commands.
    pub(crate) fn handle_stufftext(&mut self, text: &str, now: i64) {
        for line in text.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            // anti-cheat probes get a fixed answer, exactly once each
            if line.contains("\u{7f}c version $version") {
                if !self.flags.contains(HandshakeFlags::RESPONDED_VERSION) {
                    self.flags |= HandshakeFlags::RESPONDED_VERSION;
                    let reply = format!("\u{7f}c version {} 1.0", self.config.player_name);
                    self.enqueue_command(&reply);
                }
                continue;
            }
            if line.contains("\u{7f}c actoken $actoken") {
                if !self.flags.contains(HandshakeFlags::RESPONDED_ACTOKEN) {
                    self.flags |= HandshakeFlags::RESPONDED_ACTOKEN;
                    self.enqueue_command("\u{7f}c actoken 0");
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("cmd ") {
                // `cmd X` asks us to echo X back over the reliable channel
                if rest.starts_with("configstrings") {
                    self.flags |= HandshakeFlags::SENT_CONFIGSTRINGS;
                    if self.state == ConnState::Connected {
                        self.set_state(ConnState::Handshaking, None);
                    }
                } else if rest.starts_with("baselines") {
                    self.flags |= HandshakeFlags::SENT_BASELINES;
                }
                self.enqueue_command(rest);
                continue;
            }

            if let Some(rest) = line.strip_prefix("precache") {
                let spawn_count = rest
                    .trim()
                    .parse::<i32>()
                    .unwrap_or(self.game.server_count);
                self.handle_precache(spawn_count, now);
                continue;
            }
            if line == "skins" {
                let spawn_count = self.game.server_count;
                self.handle_precache(spawn_count, now);
                continue;
            }

            if line == "reconnect" {
                self.begin_soft_reconnect("server requested reconnect", now);
                continue;
            }
            if line.starts_with("disconnect") {
                self.server_dropped("server stuffed disconnect", now);
                continue;
            }
            if line.starts_with("changing") {
                continue; // the follow-up serverdata does the real work
            }

            self.debug_note(&format!("unhandled stufftext: {}", line));
        }
    }

    fn handle_precache(&mut self, spawn_count: i32, now: i64) {
        self.flags |= HandshakeFlags::PRECACHE_RECEIVED;
        self.spawn_count = spawn_count;

        if self.config.passive_mode {
            // stay a silent observer: never send begin
            self.set_state(ConnState::Spawned, Some("passive".to_string()));
        } else {
            self.flags |= HandshakeFlags::AWAITING_BEGIN;
            self.begin_at = now + BEGIN_DELAY_MS;
        }
    }

    pub(crate) fn enqueue_command(&mut self, cmd: &str) {
        self.pending_commands.push_back(cmd.to_string());
    }

    /// Send queued reliable commands, strictly one in flight at a time.
    fn drain_pending(&mut self, now: i64) {
        while netchan_can_reliable(&self.chan) && self.chan.message.cursize == 0 {
            let Some(cmd) = self.pending_commands.pop_front() else {
                break;
            };
            self.send_reliable_cmd(&cmd, now);
        }
    }

    /// `begin` is held until every queued command (version/actoken
    /// replies included) has reached the server.
    fn check_begin(&mut self, now: i64) {
        if !self.flags.contains(HandshakeFlags::AWAITING_BEGIN) {
            return;
        }
        if self.begin_at == 0 || now < self.begin_at {
            return;
        }
        if !self.pending_commands.is_empty()
            || !netchan_can_reliable(&self.chan)
            || self.chan.message.cursize != 0
        {
            return;
        }

        self.flags -= HandshakeFlags::AWAITING_BEGIN;
        self.flags |= HandshakeFlags::SENT_BEGIN;
        self.begin_at = 0;
        let cmd = format!("begin {}", self.spawn_count);
        self.send_reliable_cmd(&cmd, now);
        self.set_state(ConnState::Spawned, None);
    }

    fn heartbeat(&mut self, now: i64) {
        if self.state == ConnState::Spawned {
            if now - self.chan.last_sent >= HEARTBEAT_SPAWNED_MS {
                self.transmit(&[CLC_NOP], now);
            }
        } else if now - self.chan.last_sent >= HEARTBEAT_PRESPAWN_MS {
            self.transmit(&[], now);
        }

        if now - self.last_backup_nop >= BACKUP_NOP_MS {
            self.last_backup_nop = now;
            self.transmit(&[CLC_NOP], now);
        }
    }

    // ========================================================
    // State transitions and teardown
    // ========================================================

    pub(crate) fn set_state(&mut self, state: ConnState, reason: Option<String>) {
        if state == self.state {
            return;
        }
        self.state = state;
        self.emit(EventPayload::Connection {
            status: status_of(state),
            reason,
        });
    }

    /// Everything tied to the current connection attempt, wiped. The
    /// socket, monitor state, and reconnect bookkeeping survive.
    fn reset_connection_state(&mut self, now: i64) {
        self.protocol = ProtocolVersion::Vanilla;
        self.minor_version = 0;
        self.challenge = 0;
        self.chan = netchan_setup(self.protocol, self.qport, now);
        self.flags = HandshakeFlags::default();
        self.pending_commands.clear();
        self.spawn_count = 0;
        self.begin_at = 0;
        self.connect_deadline = 0;
        self.game.reset();
    }

    /// The server went away (OOB disconnect, svc_disconnect, rejection,
    /// timeout). Runs the reconnect policy.
    pub(crate) fn server_dropped(&mut self, reason: &str, now: i64) {
        if self.config.monitor_mode || self.state == ConnState::Disconnected {
            return;
        }

        self.reconnect_attempts += 1;
        self.reset_connection_state(now);

        if self.reconnect_attempts > self.config.max_reconnect_attempts {
            self.socket = None;
            self.server_addr = None;
            self.set_state(
                ConnState::Disconnected,
                Some(format!("{} (reconnect attempts exhausted)", reason)),
            );
            return;
        }

        let delay = (RECONNECT_STEP_MS * self.reconnect_attempts as i64).min(RECONNECT_MAX_MS);
        self.reconnect_at = now + delay;
        self.set_state(ConnState::Reconnecting, Some(reason.to_string()));
    }

    /// A polite reconnect request (stufftext or svc_reconnect): not a
    /// failure, so the attempt counter is left alone.
    pub(crate) fn begin_soft_reconnect(&mut self, reason: &str, now: i64) {
        if self.config.monitor_mode || self.state == ConnState::Disconnected {
            return;
        }
        self.reset_connection_state(now);
        self.reconnect_at = now + SOFT_RECONNECT_DELAY_MS;
        self.set_state(ConnState::Reconnecting, Some(reason.to_string()));
    }

    pub(crate) fn debug_note(&self, text: &str) {
        if self.config.debug {
            self.emit(EventPayload::Debug {
                text: text.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Config;
    use crate::events::Event;
    use crossbeam::channel::Receiver;
    use q2watch_common::net_chan::{RELIABLE_BIT, SEQUENCE_MASK};
    use std::time::Duration;

    fn loopback_pair() -> (Client, Receiver<Event>, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let config = Config {
            server_ip: "127.0.0.1".to_string(),
            server_port: port,
            player_name: "tester".to_string(),
            ..Config::default()
        };
        let client = Client::new(config);
        let events = client.events();
        (client, events, server)
    }

    fn recv_packet(server: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 8192];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        (buf[..len].to_vec(), from)
    }

    fn pump_until(client: &mut Client, mut pred: impl FnMut(&Client) -> bool) -> bool {
        for _ in 0..500 {
            client.run_frame();
            if pred(client) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Pull the application payload out of a client packet: skip the two
    /// header words plus the qport.
    fn client_payload(packet: &[u8], protocol: ProtocolVersion) -> (u32, Vec<u8>) {
        let w1 = u32::from_le_bytes(packet[0..4].try_into().unwrap());
        let qport_len = if protocol.is_extended() { 1 } else { 2 };
        (w1, packet[8 + qport_len..].to_vec())
    }

    #[test]
    fn challenge_exchange_selects_aqtion() {
        let (mut client, _events, server) = loopback_pair();
        client.connect().unwrap();

        let (packet, client_addr) = recv_packet(&server);
        assert_eq!(&packet[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&packet[4..], b"getchallenge\n");

        server
            .send_to(b"\xFF\xFF\xFF\xFFchallenge 12345 p=34,35,36,38\n", client_addr)
            .unwrap();
        assert!(pump_until(&mut client, |c| c.state() == ConnState::Connecting));
        assert_eq!(client.protocol(), ProtocolVersion::Aqtion);
        assert_eq!(client.challenge, 12345);

        let (packet, _) = recv_packet(&server);
        let text = String::from_utf8_lossy(&packet[4..]).to_string();
        let expected_prefix = format!("connect 38 {} 12345 \"", client.wire_qport());
        assert!(
            text.starts_with(&expected_prefix),
            "unexpected connect command: {}",
            text
        );
        assert!(text.contains("\\name\\tester"));
        assert!(text.contains("\\spectator\\1"));
    }

    #[test]
    fn client_connect_establishes_netchan_and_sends_new() {
        let (mut client, _events, server) = loopback_pair();
        client.connect().unwrap();
        let (_, client_addr) = recv_packet(&server);

        server
            .send_to(b"\xFF\xFF\xFF\xFFchallenge 999 p=36\n", client_addr)
            .unwrap();
        assert!(pump_until(&mut client, |c| c.state() == ConnState::Connecting));
        recv_packet(&server); // the connect command

        server
            .send_to(b"\xFF\xFF\xFF\xFFclient_connect nc=1\n", client_addr)
            .unwrap();
        assert!(pump_until(&mut client, |c| c.state() == ConnState::Connected));
        assert_eq!(client.protocol(), ProtocolVersion::Q2pro);

        // the first reliable packet carries stringcmd "new"
        loop {
            let (packet, _) = recv_packet(&server);
            let (w1, payload) = client_payload(&packet, ProtocolVersion::Q2pro);
            if w1 & RELIABLE_BIT != 0 {
                assert_eq!(payload[0], CLC_STRINGCMD);
                assert_eq!(&payload[1..5], b"new\0");
                assert!(w1 & SEQUENCE_MASK >= 1);
                break;
            }
        }
    }

    #[test]
    fn precache_defers_begin_by_half_a_second() {
        let (mut client, _events, server) = loopback_pair();
        client.connect().unwrap();
        let (_, _client_addr) = recv_packet(&server);

        // fake an established session without the full exchange
        client.protocol = ProtocolVersion::Q2pro;
        client.chan = netchan_setup(ProtocolVersion::Q2pro, client.wire_qport(), 1000);
        client.chan.last_received = 1000;
        client.state = ConnState::Handshaking;

        client.handle_stufftext("precache 7", 1000);
        assert_eq!(client.spawn_count, 7);
        assert!(client.flags.contains(HandshakeFlags::AWAITING_BEGIN));

        // before the delay: heartbeats only, no begin
        client.frame(1200);
        assert_ne!(client.state(), ConnState::Spawned);

        client.frame(1501);
        assert_eq!(client.state(), ConnState::Spawned);
        assert!(client.flags.contains(HandshakeFlags::SENT_BEGIN));

        // find the reliable packet among the heartbeats
        loop {
            let (packet, _) = recv_packet(&server);
            let (w1, payload) = client_payload(&packet, ProtocolVersion::Q2pro);
            if w1 & RELIABLE_BIT != 0 {
                assert_eq!(payload[0], CLC_STRINGCMD);
                assert_eq!(&payload[1..], b"begin 7\0");
                break;
            }
        }
    }

    #[test]
    fn passive_mode_spawns_without_begin() {
        let (mut client, _events, server) = loopback_pair();
        client.config.passive_mode = true;
        client.connect().unwrap();
        recv_packet(&server);

        client.state = ConnState::Handshaking;
        client.handle_stufftext("precache 3", 500);
        assert_eq!(client.state(), ConnState::Spawned);
        assert!(!client.flags.contains(HandshakeFlags::AWAITING_BEGIN));
        assert!(!client.flags.contains(HandshakeFlags::SENT_BEGIN));
    }

    #[test]
    fn version_and_actoken_replies_are_one_shot() {
        let (mut client, _events, _server) = loopback_pair();
        client.handle_stufftext("cmd \u{7f}c version $version", 0);
        client.handle_stufftext("cmd \u{7f}c version $version", 0);
        client.handle_stufftext("\u{7f}c actoken $actoken", 0);
        client.handle_stufftext("\u{7f}c actoken $actoken", 0);

        let commands: Vec<String> = client.pending_commands.iter().cloned().collect();
        assert_eq!(
            commands,
            vec![
                "\u{7f}c version tester 1.0".to_string(),
                "\u{7f}c actoken 0".to_string()
            ]
        );
    }

    #[test]
    fn stufftext_cmd_lines_are_echoed_reliably() {
        let (mut client, _events, _server) = loopback_pair();
        client.state = ConnState::Connected;
        client.handle_stufftext("cmd configstrings 5 0\ncmd baselines 5 0", 0);

        assert_eq!(client.state(), ConnState::Handshaking);
        assert!(client.flags.contains(HandshakeFlags::SENT_CONFIGSTRINGS));
        assert!(client.flags.contains(HandshakeFlags::SENT_BASELINES));
        let commands: Vec<String> = client.pending_commands.iter().cloned().collect();
        assert_eq!(
            commands,
            vec!["configstrings 5 0".to_string(), "baselines 5 0".to_string()]
        );
    }

    #[test]
    fn reconnect_backoff_escalates_and_exhausts() {
        let (mut client, events, _server) = loopback_pair();
        client.config.max_reconnect_attempts = 2;
        client.state = ConnState::Spawned;

        client.server_dropped("test drop", 1000);
        assert_eq!(client.state(), ConnState::Reconnecting);
        assert_eq!(client.reconnect_at, 1000 + 5000);

        client.state = ConnState::Spawned;
        client.server_dropped("test drop", 2000);
        assert_eq!(client.reconnect_at, 2000 + 10000);

        client.state = ConnState::Spawned;
        client.server_dropped("test drop", 3000);
        assert_eq!(client.state(), ConnState::Disconnected);

        let last = events.try_iter().last().unwrap();
        match last.payload {
            EventPayload::Connection { status, reason } => {
                assert_eq!(status, ConnectionStatus::Disconnected);
                assert!(reason.unwrap().contains("exhausted"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn map_change_resets_tables_and_requeues_new() {
        let (mut client, events, _server) = loopback_pair();
        client.protocol = ProtocolVersion::Vanilla;
        client.state = ConnState::Spawned;

        let serverdata = |map: &str| {
            let mut payload: Vec<u8> = vec![0x0C];
            payload.extend_from_slice(&34i32.to_le_bytes());
            payload.extend_from_slice(&1i32.to_le_bytes());
            payload.push(0x00);
            payload.extend_from_slice(b"baseq2\0");
            payload.extend_from_slice(&5i16.to_le_bytes());
            payload.extend_from_slice(map.as_bytes());
            payload.push(0);
            payload
        };

        client.process_server_data(&serverdata("q2dm1"), 0);
        client.state = ConnState::Spawned;
        client.game.entities[42].active = true;

        client.process_server_data(&serverdata("q2dm5"), 100);

        assert!(!client.game.entities[42].active);
        assert_eq!(client.current_map_name(), "q2dm5");
        assert_eq!(client.state(), ConnState::Handshaking);
        assert!(client.pending_commands.contains(&"new".to_string()));

        let changed = events
            .try_iter()
            .find_map(|e| match e.payload {
                EventPayload::ServerInfo(crate::events::ServerInfoEvent::MapChange {
                    previous_map,
                    map,
                }) => Some((previous_map, map)),
                _ => None,
            })
            .unwrap();
        assert_eq!(changed, ("q2dm1".to_string(), "q2dm5".to_string()));
    }

    #[test]
    fn protocol_choice_prefers_newest() {
        assert_eq!(
            Client::choose_protocol("34,35,36,38"),
            ProtocolVersion::Aqtion
        );
        assert_eq!(Client::choose_protocol("34,35,36"), ProtocolVersion::Q2pro);
        assert_eq!(Client::choose_protocol("34,35"), ProtocolVersion::R1q2);
        assert_eq!(Client::choose_protocol("34"), ProtocolVersion::Vanilla);
        assert_eq!(Client::choose_protocol("junk"), ProtocolVersion::Vanilla);
    }

    #[test]
    fn oob_ping_answered_with_ack() {
        let (mut client, _events, server) = loopback_pair();
        client.connect().unwrap();
        let (_, client_addr) = recv_packet(&server); // getchallenge

        server.send_to(b"\xFF\xFF\xFF\xFFping\n", client_addr).unwrap();
        for _ in 0..50 {
            client.run_frame();
            std::thread::sleep(Duration::from_millis(2));
        }

        let (packet, _) = recv_packet(&server);
        assert_eq!(&packet[4..], b"ack");
    }

    #[test]
    fn user_disconnect_emits_final_event_only() {
        let (mut client, events, _server) = loopback_pair();
        client.connect().unwrap();
        events.try_iter().count(); // drain connect-time events

        client.disconnect();
        assert_eq!(client.state(), ConnState::Disconnected);

        let payloads: Vec<_> = events.try_iter().map(|e| e.payload).collect();
        assert_eq!(payloads.len(), 1);
        assert!(matches!(
            &payloads[0],
            EventPayload::Connection {
                status: ConnectionStatus::Disconnected,
                reason: Some(r)
            } if r == "user"
        ));
    }
}
