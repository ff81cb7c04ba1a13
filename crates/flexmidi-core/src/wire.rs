//! flexmidi wire format: on-wire types for every datagram a session emits.
//!
//! Three things travel over the socket:
//!   * RTP-MIDI style data datagrams: a 12-byte `RtpHeader` followed by one
//!     or more 16-byte Universal MIDI Packets (`Ump128`).
//!   * The 21-byte `NegotiationMessage`, exchanged once per connection.
//!   * `DiscoveryAnnouncement`, multicast on the discovery group.
//!
//! Fixed-size structs use zerocopy derives for allocation-free
//! serialization. Multi-byte integers are big-endian on the wire.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Universal MIDI Packet ─────────────────────────────────────────────────────

/// Size of one 128-bit UMP in bytes.
pub const UMP_BYTES: usize = 16;

/// A 128-bit Universal MIDI Packet: always exactly four 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ump128 {
    pub words: [u32; 4],
}

impl Ump128 {
    pub const fn from_words(words: [u32; 4]) -> Self {
        Self { words }
    }

    /// Build from a word slice. Returns None unless exactly four words are given.
    pub fn from_slice(words: &[u32]) -> Option<Self> {
        let words: [u32; 4] = words.try_into().ok()?;
        Some(Self { words })
    }

    /// Parse 16 big-endian bytes.
    pub fn from_be_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != UMP_BYTES {
            return None;
        }
        let mut words = [0u32; 4];
        for (word, raw) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Some(Self { words })
    }

    pub fn to_be_bytes(&self) -> [u8; UMP_BYTES] {
        let mut out = [0u8; UMP_BYTES];
        for (dst, word) in out.chunks_exact_mut(4).zip(self.words.iter()) {
            dst.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// The 4-bit message type in the top nibble of word 0.
    pub fn message_type(&self) -> u8 {
        (self.words[0] >> 28) as u8
    }

    pub fn group(&self) -> u8 {
        ((self.words[0] >> 24) & 0x0F) as u8
    }
}

// ── Flex Data ─────────────────────────────────────────────────────────────────

/// UMP message type for Flex Data (free-form text and metadata).
pub const FLEX_DATA_MT: u8 = 0xD;

/// Text bytes carried by one Flex Data packet (words 1..=3).
pub const FLEX_TEXT_BYTES: usize = 12;

/// Status bank / status used for envelope text.
pub const TEXT_STATUS_BANK: u8 = 0x01;
pub const TEXT_STATUS: u8 = 0x01;

/// Position of a Flex Data packet within a multi-packet run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlexForm {
    /// Whole message in a single packet.
    Complete = 0x0,
    Start = 0x1,
    Continue = 0x2,
    End = 0x3,
}

impl TryFrom<u8> for FlexForm {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(FlexForm::Complete),
            0x1 => Ok(FlexForm::Start),
            0x2 => Ok(FlexForm::Continue),
            0x3 => Ok(FlexForm::End),
            other => Err(WireError::UnknownFlexForm(other)),
        }
    }
}

/// Addressing field of a Flex Data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlexAddress {
    Channel = 0x0,
    Group = 0x1,
}

/// One decoded Flex Data packet.
///
/// Word 0: `mt(4) | group(4) | form(2) | addrs(2) | channel(4) | status_bank(8) | status(8)`.
/// Words 1..=3: twelve payload bytes, NUL padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexPacket {
    pub group: u8,
    pub form: FlexForm,
    pub address: FlexAddress,
    pub channel: u8,
    pub status_bank: u8,
    pub status: u8,
    pub payload: [u8; FLEX_TEXT_BYTES],
}

impl FlexPacket {
    pub fn to_ump(&self) -> Ump128 {
        let word0 = (u32::from(FLEX_DATA_MT) << 28)
            | (u32::from(self.group & 0x0F) << 24)
            | (u32::from(self.form as u8) << 22)
            | (u32::from(self.address as u8) << 20)
            | (u32::from(self.channel & 0x0F) << 16)
            | (u32::from(self.status_bank) << 8)
            | u32::from(self.status);
        let p = &self.payload;
        let word = |i: usize| u32::from_be_bytes([p[i], p[i + 1], p[i + 2], p[i + 3]]);
        Ump128::from_words([word0, word(0), word(4), word(8)])
    }

    pub fn from_ump(ump: &Ump128) -> Result<Self, WireError> {
        let mt = ump.message_type();
        if mt != FLEX_DATA_MT {
            return Err(WireError::NotFlexData(mt));
        }
        let word0 = ump.words[0];
        let form = FlexForm::try_from(((word0 >> 22) & 0x03) as u8)?;
        let address = if (word0 >> 20) & 0x03 == 0 {
            FlexAddress::Channel
        } else {
            FlexAddress::Group
        };
        let mut payload = [0u8; FLEX_TEXT_BYTES];
        for (dst, word) in payload.chunks_exact_mut(4).zip(ump.words[1..].iter()) {
            dst.copy_from_slice(&word.to_be_bytes());
        }
        Ok(Self {
            group: ump.group(),
            form,
            address,
            channel: ((word0 >> 16) & 0x0F) as u8,
            status_bank: ((word0 >> 8) & 0xFF) as u8,
            status: (word0 & 0xFF) as u8,
            payload,
        })
    }

    /// Payload with NUL padding stripped.
    pub fn text(&self) -> &[u8] {
        let end = self
            .payload
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.payload[..end]
    }

    pub fn is_text(&self) -> bool {
        self.status_bank == TEXT_STATUS_BANK && self.status == TEXT_STATUS
    }
}

// ── RTP datagram header ───────────────────────────────────────────────────────

/// Header preceding every data datagram.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct RtpHeader {
    /// Version 2, no padding, no extension, no CSRCs: always 0x80.
    pub flags: u8,
    /// Dynamic payload type used for MIDI (0x61).
    pub payload_type: u8,
    /// Incremented once per datagram sent on the session.
    pub sequence: U16<BigEndian>,
    /// Milliseconds since session open, wrapping.
    pub timestamp: U32<BigEndian>,
    /// Derived from the local endpoint id.
    pub ssrc: U32<BigEndian>,
}

assert_eq_size!(RtpHeader, [u8; 12]);

pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_FLAGS: u8 = 0x80;
pub const RTP_PAYLOAD_TYPE: u8 = 0x61;

impl RtpHeader {
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            flags: RTP_FLAGS,
            payload_type: RTP_PAYLOAD_TYPE,
            sequence: U16::new(sequence),
            timestamp: U32::new(timestamp),
            ssrc: U32::new(ssrc),
        }
    }
}

// ── Capability negotiation ────────────────────────────────────────────────────

/// Exchanged once per connection before application data flows.
///
/// `"MC"` + protocol version + endpoint UUID + group + channel.
/// Wire size: 21 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct NegotiationMessage {
    pub magic: [u8; 2],
    pub version: u8,
    pub endpoint_id: [u8; 16],
    pub group: u8,
    pub channel: u8,
}

assert_eq_size!(NegotiationMessage, [u8; 21]);

pub const NEGOTIATION_MAGIC: [u8; 2] = *b"MC";
pub const NEGOTIATION_LEN: usize = 21;

impl NegotiationMessage {
    pub fn new(version: u8, endpoint_id: [u8; 16], group: u8, channel: u8) -> Self {
        Self {
            magic: NEGOTIATION_MAGIC,
            version,
            endpoint_id,
            group,
            channel,
        }
    }

    /// True if `data` starts with the negotiation magic. Data datagrams start
    /// with 0x80 so the two never collide.
    pub fn is_negotiation(data: &[u8]) -> bool {
        data.len() >= 2 && data[..2] == NEGOTIATION_MAGIC
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != NEGOTIATION_LEN {
            return Err(WireError::BadLength {
                kind: "negotiation",
                expected: NEGOTIATION_LEN,
                actual: data.len(),
            });
        }
        let msg = Self::read_from(data).ok_or(WireError::BadLength {
            kind: "negotiation",
            expected: NEGOTIATION_LEN,
            actual: data.len(),
        })?;
        if msg.magic != NEGOTIATION_MAGIC {
            return Err(WireError::BadMagic);
        }
        Ok(msg)
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Service type advertised on the discovery group.
pub const SERVICE_TYPE: &str = "_rtp-midi._udp";

/// BLAKE3 hash of a service type string. Carried in announcements so
/// browsers can filter without parsing names.
pub type ServiceHash = [u8; 32];

pub fn service_hash(name: &[u8]) -> ServiceHash {
    *blake3::hash(name).as_bytes()
}

pub fn rtp_midi_hash() -> ServiceHash {
    service_hash(SERVICE_TYPE.as_bytes())
}

/// Maximum instance name length carried in an announcement.
pub const ANNOUNCE_NAME_LEN: usize = 32;

/// Multicast by every session with discovery enabled, once per interval.
///
/// Wire size: 84 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DiscoveryAnnouncement {
    /// `rtp_midi_hash()` for every session announcement.
    pub service_hash: [u8; 32],
    /// Endpoint UUID of the announcing session.
    pub endpoint_id: [u8; 16],
    /// UDP port the session's data socket is bound to.
    pub session_port: U16<BigEndian>,
    pub protocol_version: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    /// UTF-8 instance name, NUL padded, truncated to 32 bytes.
    pub name: [u8; ANNOUNCE_NAME_LEN],
}

assert_eq_size!(DiscoveryAnnouncement, [u8; 84]);

impl DiscoveryAnnouncement {
    pub fn new(endpoint_id: [u8; 16], session_port: u16, protocol_version: u8, name: &str) -> Self {
        let mut padded = [0u8; ANNOUNCE_NAME_LEN];
        let mut len = name.len().min(ANNOUNCE_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        padded[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            service_hash: rtp_midi_hash(),
            endpoint_id,
            session_port: U16::new(session_port),
            protocol_version,
            flags: 0,
            name: padded,
        }
    }

    pub fn instance_name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(ANNOUNCE_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current negotiation protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Default outbound frame size limit.
pub const DEFAULT_MTU: usize = 1500;

/// Smallest MTU that still fits one header plus one packet.
pub const MIN_MTU: usize = RTP_HEADER_LEN + UMP_BYTES;

/// Largest UDP payload over IPv4; no frame may exceed it.
pub const MAX_MTU: usize = 65_507;

/// Default discovery multicast group and port.
pub const DISCOVERY_MULTICAST_ADDR: &str = "239.255.77.77";
pub const DISCOVERY_PORT: u16 = 5008;

/// Default announcement interval in seconds.
pub const ANNOUNCE_INTERVAL_SECS: u64 = 2;

/// Peers not seen within this window are removed from the registry.
pub const PEER_TTL_SECS: u64 = 10;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("not a flex data packet (message type 0x{0:x})")]
    NotFlexData(u8),

    #[error("unknown flex form: 0x{0:x}")]
    UnknownFlexForm(u8),

    #[error("{kind} datagram has {actual} bytes, expected {expected}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("bad negotiation magic")]
    BadMagic,

    #[error("unexpected datagram header byte: 0x{0:02x}")]
    BadHeader(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
