//! MTU-aware datagram framing.
//!
//! An outbound datagram is a 12-byte `RtpHeader` followed by whole UMPs.
//! `FramePacker` groups packets so that no frame exceeds the MTU: whenever
//! the next packet would push the payload past `mtu - 12`, the buffered
//! frame is flushed first.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{AsBytes, FromBytes};

use flexmidi_core::transport::{validate_mtu, TransportError};
use flexmidi_core::wire::{
    NegotiationMessage, RtpHeader, Ump128, WireError, RTP_FLAGS, RTP_HEADER_LEN, UMP_BYTES,
};

/// Groups packets into frames bounded by an MTU.
#[derive(Debug)]
pub struct FramePacker {
    capacity: usize,
    pending: Vec<Ump128>,
}

impl FramePacker {
    pub fn new(mtu: usize) -> Result<Self, TransportError> {
        Ok(Self {
            capacity: frame_capacity(mtu)?,
            pending: Vec::new(),
        })
    }

    /// Packets that fit in one frame.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffer one packet. Returns the previous frame if this packet would
    /// have overflowed it.
    pub fn push(&mut self, ump: Ump128) -> Option<Vec<Ump128>> {
        let flushed = if self.pending.len() == self.capacity {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        };
        self.pending.push(ump);
        flushed
    }

    /// True when the buffered frame is full.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Take whatever is buffered.
    pub fn flush(&mut self) -> Option<Vec<Ump128>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Pack a whole slice at once.
    pub fn pack(mtu: usize, packets: &[Ump128]) -> Result<Vec<Vec<Ump128>>, TransportError> {
        let mut packer = Self::new(mtu)?;
        let mut frames: Vec<Vec<Ump128>> = packets.iter().filter_map(|p| packer.push(*p)).collect();
        frames.extend(packer.flush());
        Ok(frames)
    }
}

/// Number of whole packets that fit after the header.
pub fn frame_capacity(mtu: usize) -> Result<usize, TransportError> {
    let mtu = validate_mtu(mtu)?;
    Ok((mtu - RTP_HEADER_LEN) / UMP_BYTES)
}

// ── Datagram encoding ─────────────────────────────────────────────────────────

/// Stamps outbound frames with RTP headers.
#[derive(Debug)]
pub struct FrameEncoder {
    sequence: u16,
    ssrc: u32,
    epoch: Instant,
}

impl FrameEncoder {
    pub fn new(ssrc: u32) -> Self {
        Self {
            sequence: 0,
            ssrc,
            epoch: Instant::now(),
        }
    }

    pub fn encode(&mut self, frame: &[Ump128]) -> Bytes {
        let timestamp = self.epoch.elapsed().as_millis() as u32;
        let header = RtpHeader::new(self.sequence, timestamp, self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);

        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + frame.len() * UMP_BYTES);
        buf.put_slice(header.as_bytes());
        for ump in frame {
            buf.put_slice(&ump.to_be_bytes());
        }
        buf.freeze()
    }
}

/// Fold a 16-byte endpoint id into an SSRC.
pub fn ssrc_from_id(id: &[u8; 16]) -> u32 {
    id.chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .fold(0, |acc, w| acc ^ w)
}

/// A demultiplexed inbound datagram.
#[derive(Debug)]
pub enum Datagram {
    Data {
        sequence: u16,
        ssrc: u32,
        packets: Vec<Ump128>,
    },
    Negotiation(NegotiationMessage),
}

/// Classify and parse an inbound datagram.
pub fn decode_datagram(data: &[u8]) -> Result<Datagram, WireError> {
    if NegotiationMessage::is_negotiation(data) {
        return NegotiationMessage::parse(data).map(Datagram::Negotiation);
    }
    if data.len() < RTP_HEADER_LEN {
        return Err(WireError::BadLength {
            kind: "data",
            expected: RTP_HEADER_LEN,
            actual: data.len(),
        });
    }
    let header = RtpHeader::read_from(&data[..RTP_HEADER_LEN]).ok_or(WireError::BadLength {
        kind: "data",
        expected: RTP_HEADER_LEN,
        actual: data.len(),
    })?;
    if header.flags != RTP_FLAGS {
        return Err(WireError::BadHeader(header.flags));
    }

    let payload = &data[RTP_HEADER_LEN..];
    if payload.len() % UMP_BYTES != 0 {
        return Err(WireError::BadLength {
            kind: "data payload",
            expected: payload.len() - payload.len() % UMP_BYTES,
            actual: payload.len(),
        });
    }
    let packets = payload
        .chunks_exact(UMP_BYTES)
        .filter_map(Ump128::from_be_bytes)
        .collect();

    Ok(Datagram::Data {
        sequence: header.sequence.get(),
        ssrc: header.ssrc.get(),
        packets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexmidi_core::wire::{MAX_MTU, MIN_MTU, PROTOCOL_VERSION};

    fn umps(n: u32) -> Vec<Ump128> {
        (0..n).map(|i| Ump128::from_words([0xD010_0101, i, 0, 0])).collect()
    }

    #[test]
    fn frames_never_exceed_mtu() {
        // 12 + 3 * 16 = 60, so a 64-byte MTU fits three packets.
        let frames = FramePacker::pack(64, &umps(7)).unwrap();
        let sizes: Vec<usize> = frames.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        for frame in &frames {
            assert!(RTP_HEADER_LEN + frame.len() * UMP_BYTES <= 64);
        }
    }

    #[test]
    fn packing_preserves_order() {
        let packets = umps(10);
        let frames = FramePacker::pack(1500, &packets).unwrap();
        assert_eq!(frames.len(), 1);
        let flat: Vec<Ump128> = FramePacker::pack(44, &packets).unwrap().concat();
        assert_eq!(flat, packets);
    }

    #[test]
    fn mtu_exactly_one_packet() {
        let frames = FramePacker::pack(MIN_MTU, &umps(3)).unwrap();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn mtu_below_minimum_is_rejected() {
        let err = FramePacker::new(MIN_MTU - 1).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMtu { .. }));
    }

    #[test]
    fn mtu_above_datagram_limit_is_rejected() {
        assert!(FramePacker::new(MAX_MTU).is_ok());
        let err = FramePacker::new(MAX_MTU + 1).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMtu { max: MAX_MTU, .. }));
    }

    #[test]
    fn push_flushes_before_overflow() {
        let mut packer = FramePacker::new(RTP_HEADER_LEN + 2 * UMP_BYTES).unwrap();
        let p = umps(3);
        assert!(packer.push(p[0]).is_none());
        assert!(packer.push(p[1]).is_none());
        assert!(packer.is_full());
        assert_eq!(packer.push(p[2]), Some(vec![p[0], p[1]]));
        assert_eq!(packer.flush(), Some(vec![p[2]]));
        assert_eq!(packer.flush(), None);
    }

    #[test]
    fn encoded_datagram_round_trips() {
        let mut encoder = FrameEncoder::new(0xAABBCCDD);
        let packets = umps(4);
        let bytes = encoder.encode(&packets);
        assert_eq!(bytes.len(), RTP_HEADER_LEN + 4 * UMP_BYTES);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x61);
        assert_eq!((bytes.len() - RTP_HEADER_LEN) % UMP_BYTES, 0);

        match decode_datagram(&bytes).unwrap() {
            Datagram::Data { sequence, ssrc, packets: got } => {
                assert_eq!(sequence, 0);
                assert_eq!(ssrc, 0xAABBCCDD);
                assert_eq!(got, packets);
            }
            other => panic!("expected data, got {other:?}"),
        }

        let second = encoder.encode(&packets);
        assert_eq!(u16::from_be_bytes([second[2], second[3]]), 1);
    }

    #[test]
    fn negotiation_datagram_is_demultiplexed() {
        let msg = NegotiationMessage::new(PROTOCOL_VERSION, [7; 16], 1, 2);
        match decode_datagram(msg.as_bytes()).unwrap() {
            Datagram::Negotiation(n) => assert_eq!(n.endpoint_id, [7; 16]),
            other => panic!("expected negotiation, got {other:?}"),
        }
    }

    #[test]
    fn ragged_payload_is_rejected() {
        let mut bytes = FrameEncoder::new(1).encode(&umps(1)).to_vec();
        bytes.push(0);
        assert!(matches!(
            decode_datagram(&bytes),
            Err(WireError::BadLength { .. })
        ));
    }

    #[test]
    fn short_and_foreign_datagrams_are_rejected() {
        assert!(decode_datagram(&[0x80, 0x61]).is_err());
        let mut bytes = FrameEncoder::new(1).encode(&umps(1)).to_vec();
        bytes[0] = 0x90;
        assert_eq!(decode_datagram(&bytes).unwrap_err(), WireError::BadHeader(0x90));
    }

    #[test]
    fn ssrc_folds_id_words() {
        let mut id = [0u8; 16];
        id[3] = 1;
        id[7] = 2;
        assert_eq!(ssrc_from_id(&id), 3);
    }
}
