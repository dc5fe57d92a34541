// net_chan.rs — sequenced/reliable message channel over UDP
//
// Packet header, little-endian:
//   bytes 0..3   sequence word: bit 31 reliable, bit 30 fragment (extended
//                protocols only), bits 0..29 sequence number
//   bytes 4..7   ack word: bit 31 remote reliable-ack, bits 0..29 remote
//                sequence-ack
//   bytes 8..9   (fragmented packets only) bit 15 more-fragments,
//                bits 0..14 byte offset of this fragment
// Client-to-server packets carry a trailing qport after the ack word:
// one byte on R1Q2 and later, two bytes on the vanilla protocol. Packets
// from the server carry none.

use crate::msg::{msg_read_long, msg_read_short, msg_write_byte, msg_write_long, msg_write_short};
use crate::qcommon::{ProtocolVersion, SizeBuf, MAX_MSGLEN, MAX_MSGLEN_EXTENDED};

/// Bit 31 of the sequence word marks a reliable packet.
pub const RELIABLE_BIT: u32 = 1 << 31;
/// Bit 30 of the sequence word marks a fragmented packet.
pub const FRAGMENT_BIT: u32 = 1 << 30;
/// Sequence numbers occupy the low 30 bits.
pub const SEQUENCE_MASK: u32 = FRAGMENT_BIT - 1;

/// Bit 15 of the fragment header means more fragments follow.
pub const FRAGMENT_MORE: u16 = 1 << 15;
/// The low 15 bits of the fragment header carry the byte offset.
pub const FRAGMENT_OFFSET_MASK: u16 = FRAGMENT_MORE - 1;

/// Out-of-band packets replace the sequence word with all ones.
pub const OOB_SEQUENCE: u32 = 0xFFFF_FFFF;

// ============================================================
// Channel state
// ============================================================

/// Reassembly state for the single in-progress fragmented message.
#[derive(Debug, Clone, Default)]
pub struct FragmentState {
    pub in_progress: bool,
    /// Sequence number shared by all fragments of the message.
    pub sequence: u32,
    pub buffer: Vec<u8>,
}

impl FragmentState {
    pub fn reset(&mut self) {
        self.in_progress = false;
        self.sequence = 0;
        self.buffer.clear();
    }
}

#[derive(Debug)]
pub struct NetChan {
    pub protocol: ProtocolVersion,
    /// Port-shadow identifier sent with every client packet so the server
    /// can track us across NAT rewrites.
    pub qport: u16,

    pub outgoing_sequence: u32,
    pub incoming_sequence: u32,
    pub incoming_acknowledged: u32,
    pub incoming_reliable_sequence: u32,
    pub incoming_reliable_acknowledged: u32,
    pub reliable_sequence: u32,
    pub last_reliable_sequence: u32,
    pub dropped: u32,

    /// Reliable data staged for the next transmit.
    pub message: SizeBuf,
    /// Reliable payload currently in flight, retransmitted until acked.
    pub reliable_buf: Vec<u8>,

    pub fragment_in: FragmentState,

    pub last_received: i64,
    pub last_sent: i64,
}

pub fn netchan_setup(protocol: ProtocolVersion, qport: u16, now: i64) -> NetChan {
    let mut message = SizeBuf::new((MAX_MSGLEN - 16) as i32);
    message.allow_overflow = true;
    NetChan {
        protocol,
        qport,
        outgoing_sequence: 1,
        incoming_sequence: 0,
        incoming_acknowledged: 0,
        incoming_reliable_sequence: 0,
        incoming_reliable_acknowledged: 0,
        reliable_sequence: 0,
        last_reliable_sequence: 0,
        dropped: 0,
        message,
        reliable_buf: Vec::new(),
        fragment_in: FragmentState::default(),
        last_received: now,
        last_sent: now,
    }
}

/// The previous reliable transmission has been acknowledged, so another
/// reliable message may be staged.
pub fn netchan_can_reliable(chan: &NetChan) -> bool {
    chan.reliable_buf.is_empty()
}

pub fn netchan_need_reliable(chan: &NetChan) -> bool {
    // the remote side dropped the last reliable packet: resend it
    if chan.incoming_acknowledged > chan.last_reliable_sequence
        && chan.incoming_reliable_acknowledged != chan.reliable_sequence
    {
        return true;
    }

    // newly staged reliable data waiting for an empty transmit buffer
    if chan.reliable_buf.is_empty() && chan.message.cursize > 0 {
        return true;
    }

    false
}

// ============================================================
// Transmit
// ============================================================

/// Build the next outgoing packet: header, qport, any pending reliable
/// payload, then `data` if it fits. Returns the datagram for the caller
/// to put on the wire.
pub fn netchan_transmit(chan: &mut NetChan, data: &[u8], now: i64) -> Vec<u8> {
    let send_reliable = netchan_need_reliable(chan);

    if chan.reliable_buf.is_empty() && chan.message.cursize > 0 {
        chan.reliable_buf.extend_from_slice(chan.message.as_slice());
        chan.message.clear();
        chan.reliable_sequence ^= 1;
    }

    let max = if chan.protocol.is_extended() {
        MAX_MSGLEN_EXTENDED
    } else {
        MAX_MSGLEN
    };
    let mut send = SizeBuf::new(max as i32);

    let w1 = (chan.outgoing_sequence & SEQUENCE_MASK) | ((send_reliable as u32) << 31);
    let w2 = (chan.incoming_sequence & SEQUENCE_MASK) | (chan.incoming_reliable_sequence << 31);

    msg_write_long(&mut send, w1 as i32);
    msg_write_long(&mut send, w2 as i32);

    if chan.protocol.is_extended() {
        msg_write_byte(&mut send, (chan.qport & 0xFF) as i32);
    } else {
        msg_write_short(&mut send, chan.qport as i32);
    }

    if send_reliable {
        send.write(&chan.reliable_buf);
        chan.last_reliable_sequence = chan.outgoing_sequence;
    }

    let remaining = (send.maxsize - send.cursize) as usize;
    if remaining >= data.len() {
        send.write(data);
    }

    chan.outgoing_sequence += 1;
    chan.last_sent = now;

    send.as_slice().to_vec()
}

// ============================================================
// Receive
// ============================================================

/// Process an incoming sequenced packet. Returns true when `msg` now holds
/// a complete application payload positioned past the header; false when
/// the packet was a duplicate, a bad fragment, or a not-yet-complete
/// fragment.
pub fn netchan_process(chan: &mut NetChan, msg: &mut SizeBuf, now: i64) -> bool {
    msg.readcount = 0;
    let mut sequence = msg_read_long(msg) as u32;
    let mut sequence_ack = msg_read_long(msg) as u32;

    let reliable_message = sequence >> 31;
    let reliable_ack = sequence_ack >> 31;

    let fragmented = chan.protocol.is_extended() && (sequence & FRAGMENT_BIT) != 0;

    sequence &= SEQUENCE_MASK;
    sequence_ack &= SEQUENCE_MASK;

    // stale or duplicated packets are dropped without acking; fragments of
    // the in-progress message share one sequence number and are exempt
    if sequence <= chan.incoming_sequence && !fragmented {
        return false;
    }

    chan.dropped = sequence.wrapping_sub(chan.incoming_sequence + 1);

    // the server's view of our stream
    chan.incoming_acknowledged = sequence_ack;
    chan.incoming_reliable_acknowledged = reliable_ack;
    if reliable_ack == chan.reliable_sequence {
        chan.reliable_buf.clear(); // acked, channel free again
    }

    if fragmented {
        let frag_header = msg_read_short(msg) as u16;
        let more = frag_header & FRAGMENT_MORE != 0;
        let offset = (frag_header & FRAGMENT_OFFSET_MASK) as usize;

        if msg.readcount > msg.cursize {
            chan.fragment_in.reset();
            return false;
        }

        if !chan.fragment_in.in_progress || chan.fragment_in.sequence != sequence {
            chan.fragment_in.reset();
            chan.fragment_in.in_progress = true;
            chan.fragment_in.sequence = sequence;
        }

        if offset != chan.fragment_in.buffer.len() {
            // out of order: abandon the reassembly, an in-order fragment
            // restarts it
            chan.fragment_in.reset();
            return false;
        }

        let start = msg.readcount as usize;
        let end = msg.cursize as usize;
        chan.fragment_in.buffer.extend_from_slice(&msg.data[start..end]);

        if more {
            return false;
        }

        // complete: promote the reassembled buffer to the message payload
        let complete = std::mem::take(&mut chan.fragment_in.buffer);
        chan.fragment_in.reset();
        msg.data = complete;
        msg.cursize = msg.data.len() as i32;
        msg.maxsize = msg.cursize;
        msg.readcount = 0;
    }

    chan.incoming_sequence = sequence;
    if reliable_message != 0 {
        chan.incoming_reliable_sequence ^= 1;
    }
    chan.last_received = now;

    true
}

// ============================================================
// Out of band
// ============================================================

/// Build a connectionless datagram: four 0xFF bytes followed by the data.
pub fn netchan_out_of_band(data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + data.len());
    packet.extend_from_slice(&OOB_SEQUENCE.to_le_bytes());
    packet.extend_from_slice(data);
    packet
}

/// True when a received datagram is connectionless.
pub fn is_out_of_band(packet: &[u8]) -> bool {
    packet.len() >= 4 && packet[..4] == [0xFF, 0xFF, 0xFF, 0xFF]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_chan(protocol: ProtocolVersion) -> NetChan {
        netchan_setup(protocol, 0xBEEF, 0)
    }

    /// Server-to-client packet: header only, no qport.
    fn server_packet(sequence: u32, reliable: bool, ack: u32, ack_reliable: u32, payload: &[u8]) -> SizeBuf {
        let mut bytes = Vec::new();
        let w1 = (sequence & SEQUENCE_MASK) | ((reliable as u32) << 31);
        let w2 = (ack & SEQUENCE_MASK) | (ack_reliable << 31);
        bytes.extend_from_slice(&w1.to_le_bytes());
        bytes.extend_from_slice(&w2.to_le_bytes());
        bytes.extend_from_slice(payload);
        SizeBuf::from_bytes(&bytes)
    }

    fn fragment_packet(sequence: u32, offset: u16, more: bool, payload: &[u8]) -> SizeBuf {
        let mut bytes = Vec::new();
        let w1 = (sequence & SEQUENCE_MASK) | FRAGMENT_BIT;
        bytes.extend_from_slice(&w1.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let header = offset | if more { FRAGMENT_MORE } else { 0 };
        bytes.extend_from_slice(&header.to_le_bytes());
        bytes.extend_from_slice(payload);
        SizeBuf::from_bytes(&bytes)
    }

    #[test]
    fn accepts_in_order_sequences() {
        let mut chan = make_chan(ProtocolVersion::Q2pro);
        let mut msg = server_packet(1, false, 0, 0, b"a");
        assert!(netchan_process(&mut chan, &mut msg, 10));
        assert_eq!(chan.incoming_sequence, 1);
        assert_eq!(chan.last_received, 10);
    }

    #[test]
    fn duplicate_is_dropped_without_state_change() {
        let mut chan = make_chan(ProtocolVersion::Q2pro);
        let mut msg = server_packet(5, false, 0, 0, b"a");
        assert!(netchan_process(&mut chan, &mut msg, 0));

        let before_ack = chan.incoming_acknowledged;
        let before_rel = chan.incoming_reliable_sequence;
        let mut dup = server_packet(5, true, 3, 1, b"a");
        assert!(!netchan_process(&mut chan, &mut dup, 0));
        assert_eq!(chan.incoming_sequence, 5);
        assert_eq!(chan.incoming_acknowledged, before_ack);
        assert_eq!(chan.incoming_reliable_sequence, before_rel);
    }

    #[test]
    fn gaps_are_accepted() {
        let mut chan = make_chan(ProtocolVersion::Vanilla);
        let mut msg = server_packet(1, false, 0, 0, b"");
        assert!(netchan_process(&mut chan, &mut msg, 0));
        let mut msg = server_packet(7, false, 0, 0, b"");
        assert!(netchan_process(&mut chan, &mut msg, 0));
        assert_eq!(chan.incoming_sequence, 7);
        assert_eq!(chan.dropped, 5);
    }

    #[test]
    fn reliable_flag_toggles_incoming_bit_once() {
        let mut chan = make_chan(ProtocolVersion::R1q2);
        let mut msg = server_packet(1, true, 0, 0, b"x");
        assert!(netchan_process(&mut chan, &mut msg, 0));
        assert_eq!(chan.incoming_reliable_sequence, 1);
        let mut msg = server_packet(2, true, 0, 0, b"x");
        assert!(netchan_process(&mut chan, &mut msg, 0));
        assert_eq!(chan.incoming_reliable_sequence, 0);
    }

    #[test]
    fn outgoing_sequence_is_monotonic() {
        let mut chan = make_chan(ProtocolVersion::Q2pro);
        for i in 1..5u32 {
            let packet = netchan_transmit(&mut chan, b"data", 0);
            let w1 = u32::from_le_bytes(packet[0..4].try_into().unwrap());
            assert_eq!(w1 & SEQUENCE_MASK, i);
        }
        assert_eq!(chan.outgoing_sequence, 5);
    }

    #[test]
    fn qport_width_depends_on_protocol() {
        let mut chan = make_chan(ProtocolVersion::Vanilla);
        let packet = netchan_transmit(&mut chan, b"", 0);
        assert_eq!(packet.len(), 10);
        assert_eq!(&packet[8..10], &0xBEEFu16.to_le_bytes());

        let mut chan = make_chan(ProtocolVersion::Q2pro);
        let packet = netchan_transmit(&mut chan, b"", 0);
        assert_eq!(packet.len(), 9);
        assert_eq!(packet[8], 0xEF);
    }

    #[test]
    fn reliable_send_toggles_and_retransmits_until_acked() {
        let mut chan = make_chan(ProtocolVersion::Q2pro);
        chan.message.write(&[4, b'n', b'e', b'w', 0]);

        let packet = netchan_transmit(&mut chan, b"", 0);
        let w1 = u32::from_le_bytes(packet[0..4].try_into().unwrap());
        assert!(w1 & RELIABLE_BIT != 0);
        assert_eq!(chan.reliable_sequence, 1);
        assert_eq!(chan.last_reliable_sequence, 1);
        assert!(!netchan_can_reliable(&chan));

        // the server acks our reliable bit: buffer clears
        let mut ack = server_packet(1, false, 1, 1, b"");
        assert!(netchan_process(&mut chan, &mut ack, 0));
        assert!(netchan_can_reliable(&chan));
    }

    #[test]
    fn fragments_reassemble_in_offset_order() {
        let mut chan = make_chan(ProtocolVersion::Q2pro);
        let mut f1 = fragment_packet(3, 0, true, b"hello ");
        assert!(!netchan_process(&mut chan, &mut f1, 0));
        assert_eq!(chan.incoming_sequence, 0); // not promoted yet

        let mut f2 = fragment_packet(3, 6, false, b"world");
        assert!(netchan_process(&mut chan, &mut f2, 0));
        assert_eq!(f2.as_slice(), b"hello world");
        assert_eq!(chan.incoming_sequence, 3);
    }

    #[test]
    fn out_of_order_fragment_discards_reassembly() {
        let mut chan = make_chan(ProtocolVersion::Q2pro);
        let mut f1 = fragment_packet(3, 0, true, b"abc");
        assert!(!netchan_process(&mut chan, &mut f1, 0));

        let mut bad = fragment_packet(3, 9, false, b"zzz");
        assert!(!netchan_process(&mut chan, &mut bad, 0));
        assert!(!chan.fragment_in.in_progress);
        assert!(chan.fragment_in.buffer.is_empty());

        // an in-order pair restarts reassembly of the same sequence
        let mut f1 = fragment_packet(3, 0, true, b"abc");
        assert!(!netchan_process(&mut chan, &mut f1, 0));
        let mut f2 = fragment_packet(3, 3, false, b"def");
        assert!(netchan_process(&mut chan, &mut f2, 0));
        assert_eq!(f2.as_slice(), b"abcdef");
    }

    #[test]
    fn oob_prefix() {
        let packet = netchan_out_of_band(b"getchallenge\n");
        assert!(is_out_of_band(&packet));
        assert_eq!(&packet[4..], b"getchallenge\n");
    }
}
