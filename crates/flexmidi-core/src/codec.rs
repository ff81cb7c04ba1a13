//! Envelope codec: JSON text packed into Flex Data runs.
//!
//! A Flex Data packet carries twelve text bytes. An envelope is serialized
//! to UTF-8 JSON and split across a run of packets: a single `Complete`
//! packet when it fits, otherwise `Start`, zero or more `Continue`, `End`.
//! Padding is NUL; serde_json never emits a raw NUL, so stripping trailing
//! NULs on decode is lossless.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::{CommandEnvelope, StreamEnvelope};
use crate::wire::{
    FlexAddress, FlexForm, FlexPacket, Ump128, FLEX_TEXT_BYTES, TEXT_STATUS, TEXT_STATUS_BANK,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),
}

/// Packs envelopes into Flex Data runs addressed to one group/channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlexCodec {
    group: u8,
    channel: u8,
}

impl FlexCodec {
    pub fn new(group: u8, channel: u8) -> Self {
        Self {
            group: group & 0x0F,
            channel: channel & 0x0F,
        }
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn encode(&self, env: &CommandEnvelope) -> Result<Vec<Ump128>, CodecError> {
        self.encode_json(env)
    }

    pub fn decode(&self, packets: &[Ump128]) -> Result<CommandEnvelope, CodecError> {
        decode_json(packets)
    }

    pub fn encode_stream(&self, env: &StreamEnvelope) -> Result<Vec<Ump128>, CodecError> {
        self.encode_json(env)
    }

    pub fn decode_stream(&self, packets: &[Ump128]) -> Result<StreamEnvelope, CodecError> {
        decode_json(packets)
    }

    fn encode_json<T: Serialize>(&self, value: &T) -> Result<Vec<Ump128>, CodecError> {
        let text = serde_json::to_vec(value).map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        Ok(self.pack_text(&text))
    }

    /// Split raw text into a Flex Data run.
    pub fn pack_text(&self, text: &[u8]) -> Vec<Ump128> {
        if text.len() <= FLEX_TEXT_BYTES {
            return vec![self.packet(FlexForm::Complete, text)];
        }
        let chunks: Vec<&[u8]> = text.chunks(FLEX_TEXT_BYTES).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let form = match i {
                    0 => FlexForm::Start,
                    i if i == last => FlexForm::End,
                    _ => FlexForm::Continue,
                };
                self.packet(form, chunk)
            })
            .collect()
    }

    fn packet(&self, form: FlexForm, chunk: &[u8]) -> Ump128 {
        let mut payload = [0u8; FLEX_TEXT_BYTES];
        payload[..chunk.len()].copy_from_slice(chunk);
        FlexPacket {
            group: self.group,
            form,
            address: FlexAddress::Group,
            channel: self.channel,
            status_bank: TEXT_STATUS_BANK,
            status: TEXT_STATUS,
            payload,
        }
        .to_ump()
    }
}

/// Encode with the default addressing (group 0, channel 0).
pub fn encode(env: &CommandEnvelope) -> Result<Vec<Ump128>, CodecError> {
    FlexCodec::default().encode(env)
}

/// Decode a complete Flex Data run.
pub fn decode(packets: &[Ump128]) -> Result<CommandEnvelope, CodecError> {
    FlexCodec::default().decode(packets)
}

fn decode_json<T: DeserializeOwned>(packets: &[Ump128]) -> Result<T, CodecError> {
    let mut assembler = FlexAssembler::new();
    let mut text = None;
    for packet in packets {
        if let Some(result) = assembler.push(packet) {
            if text.is_some() {
                return Err(CodecError::DecodingFailed(
                    "more than one message in run".into(),
                ));
            }
            text = Some(result?);
        }
    }
    let text = text.ok_or_else(|| CodecError::DecodingFailed("incomplete flex data run".into()))?;
    parse_text(&text)
}

/// Parse reassembled text as `T`.
pub fn parse_text<T: DeserializeOwned>(text: &[u8]) -> Result<T, CodecError> {
    let text = std::str::from_utf8(text).map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
    serde_json::from_str(text).map_err(|e| CodecError::DecodingFailed(e.to_string()))
}

// ── Reassembly ────────────────────────────────────────────────────────────────

/// Incremental Flex Data reassembler.
///
/// Receive batches may split a run at any packet boundary, so one assembler
/// lives for the whole receive loop of a session. A `Start` or `Complete`
/// arriving mid-run discards the partial run (counted in
/// [`FlexAssembler::interrupted_runs`]) and the new packet is kept.
#[derive(Debug, Default)]
pub struct FlexAssembler {
    buffer: Vec<u8>,
    collecting: bool,
    interrupted: u64,
}

impl FlexAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet. Returns the reassembled text when a run completes,
    /// or an error for a packet that cannot belong to a text run.
    pub fn push(&mut self, ump: &Ump128) -> Option<Result<Vec<u8>, CodecError>> {
        let packet = match FlexPacket::from_ump(ump) {
            Ok(p) => p,
            Err(e) => return Some(Err(CodecError::DecodingFailed(e.to_string()))),
        };
        if !packet.is_text() {
            return Some(Err(CodecError::DecodingFailed(format!(
                "not a text message (bank 0x{:02x}, status 0x{:02x})",
                packet.status_bank, packet.status
            ))));
        }

        match packet.form {
            FlexForm::Complete => {
                self.reset();
                Some(Ok(packet.text().to_vec()))
            }
            FlexForm::Start => {
                self.reset();
                self.collecting = true;
                self.buffer.extend_from_slice(packet.text());
                None
            }
            FlexForm::Continue => {
                if !self.collecting {
                    return Some(Err(CodecError::DecodingFailed("continue without start".into())));
                }
                self.buffer.extend_from_slice(packet.text());
                None
            }
            FlexForm::End => {
                if !self.collecting {
                    return Some(Err(CodecError::DecodingFailed("end without start".into())));
                }
                self.buffer.extend_from_slice(packet.text());
                self.collecting = false;
                Some(Ok(std::mem::take(&mut self.buffer)))
            }
        }
    }

    /// Feed a whole batch, collecting every completed run in order.
    pub fn push_batch(&mut self, batch: &[Ump128]) -> Vec<Result<Vec<u8>, CodecError>> {
        batch.iter().filter_map(|ump| self.push(ump)).collect()
    }

    /// True when no partial run is buffered.
    pub fn is_idle(&self) -> bool {
        !self.collecting
    }

    /// Partial runs discarded because a new run began before their `End`.
    pub fn interrupted_runs(&self) -> u64 {
        self.interrupted
    }

    fn reset(&mut self) {
        if self.collecting {
            self.interrupted += 1;
        }
        self.collecting = false;
        self.buffer.clear();
    }
}
