//! Control-frame codec: the 8-byte prefix every control frame carries, plus
//! the per-data-frame descriptors a `0x01..0x0F` Send-Data frame bundles.

use crate::binary::{read_i32_be, read_u16_be, write_i32_be, write_u16_be};
use crate::error::Error;

pub const OPCODE_CAPABILITIES: u8 = 0x00;
pub const OPCODE_PING: u8 = 0x10;
pub const OPCODE_PONG: u8 = 0x11;
pub const OPCODE_CANCEL_MESSAGES: u8 = 0x12;

/// Maximum simultaneous data frames a single Send-Data control frame can announce.
pub const MAX_DESCRIPTORS_PER_FRAME: usize = 15;
pub const MAX_HEADER_LEN: usize = 64;
/// 26-bit field: offsets and total lengths are `0..2^26 - 1`.
pub const MAX_OFFSET_OR_LENGTH: u32 = (1 << 26) - 1;
pub const MAX_MESSAGE_NUMBER: u8 = 15;

/// `8 (prefix) + 15 * (8 + 64)` — the largest a control frame can ever be.
pub const MAX_CONTROL_FRAME_SIZE: usize = 8 + MAX_DESCRIPTORS_PER_FRAME * (8 + MAX_HEADER_LEN);

const PREFIX_LEN: usize = 8;
const DESCRIPTOR_FIXED_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRecord {
    pub major_version: u16,
    pub minor_version: u16,
    pub capability_bits: u32,
}

/// One data-frame announcement within a Send-Data control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrameDescriptor {
    pub message_number: u8,
    pub offset: u32,
    pub total_message_length: u32,
    pub is_first: bool,
    pub is_last: bool,
    pub header: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFramePayload {
    Capabilities(CapabilityRecord),
    SendData(Vec<DataFrameDescriptor>),
    Ping,
    Pong,
    CancelMessages(u16),
    /// Unrecognized opcode: carried through so callers can choose to ignore it.
    Reserved(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub rtt_ms: u16,
    pub throughput_bps: i32,
    pub payload: ControlFramePayload,
}

impl ControlFrame {
    pub fn opcode(&self) -> u8 {
        match &self.payload {
            ControlFramePayload::Capabilities(_) => OPCODE_CAPABILITIES,
            ControlFramePayload::SendData(descriptors) => descriptors.len() as u8,
            ControlFramePayload::Ping => OPCODE_PING,
            ControlFramePayload::Pong => OPCODE_PONG,
            ControlFramePayload::CancelMessages(_) => OPCODE_CANCEL_MESSAGES,
            ControlFramePayload::Reserved(opcode) => *opcode,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PREFIX_LEN];
        buf[0] = self.opcode();
        // buf[1] reserved, left at 0.
        write_u16_be(&mut buf, 2, self.rtt_ms);
        write_i32_be(&mut buf, 4, self.throughput_bps);

        match &self.payload {
            ControlFramePayload::Capabilities(record) => {
                let mut payload = [0u8; 8];
                write_u16_be(&mut payload, 0, record.major_version);
                write_u16_be(&mut payload, 2, record.minor_version);
                write_i32_be(&mut payload, 4, record.capability_bits as i32);
                buf.extend_from_slice(&payload);
            }
            ControlFramePayload::SendData(descriptors) => {
                for descriptor in descriptors {
                    encode_descriptor(&mut buf, descriptor);
                }
            }
            ControlFramePayload::Ping | ControlFramePayload::Pong => {}
            ControlFramePayload::CancelMessages(bitmask) => {
                let mut payload = [0u8; 2];
                write_u16_be(&mut payload, 0, *bitmask);
                buf.extend_from_slice(&payload);
            }
            ControlFramePayload::Reserved(_) => {}
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<ControlFrame, Error> {
        if buf.len() < PREFIX_LEN {
            return Err(Error::ProtocolViolation(
                "control frame shorter than the 8-byte prefix".into(),
            ));
        }
        let opcode = buf[0];
        let rtt_ms = read_u16_be(buf, 2);
        let throughput_bps = read_i32_be(buf, 4);

        let payload = match opcode {
            OPCODE_CAPABILITIES => {
                if buf.len() < PREFIX_LEN + 8 {
                    return Err(Error::ProtocolViolation(
                        "capabilities frame missing its 8-byte record".into(),
                    ));
                }
                let record_buf = &buf[PREFIX_LEN..];
                ControlFramePayload::Capabilities(CapabilityRecord {
                    major_version: read_u16_be(record_buf, 0),
                    minor_version: read_u16_be(record_buf, 2),
                    capability_bits: read_i32_be(record_buf, 4) as u32,
                })
            }
            0x01..=0x0F => {
                let count = opcode as usize;
                let mut descriptors = Vec::with_capacity(count);
                let mut offset = PREFIX_LEN;
                for _ in 0..count {
                    let (descriptor, consumed) = decode_descriptor(buf, offset)?;
                    descriptors.push(descriptor);
                    offset += consumed;
                }
                ControlFramePayload::SendData(descriptors)
            }
            OPCODE_PING => ControlFramePayload::Ping,
            OPCODE_PONG => ControlFramePayload::Pong,
            OPCODE_CANCEL_MESSAGES => {
                if buf.len() < PREFIX_LEN + 2 {
                    return Err(Error::ProtocolViolation(
                        "cancel-messages frame missing its bitmask".into(),
                    ));
                }
                ControlFramePayload::CancelMessages(read_u16_be(&buf[PREFIX_LEN..], 0))
            }
            other => ControlFramePayload::Reserved(other),
        };

        Ok(ControlFrame {
            rtt_ms,
            throughput_bps,
            payload,
        })
    }
}

fn encode_descriptor(buf: &mut Vec<u8>, descriptor: &DataFrameDescriptor) {
    let header_len = descriptor.header.as_ref().map_or(0, Vec::len) as u32;

    let mut word0: i32 = ((descriptor.message_number as i32) & 0xF) << 28;
    if descriptor.is_first {
        word0 |= 1 << 27;
    }
    if descriptor.is_last {
        word0 |= 1 << 26;
    }
    word0 |= (descriptor.offset & MAX_OFFSET_OR_LENGTH) as i32;

    let mut word1: i32 = ((header_len & 0x3F) as i32) << 26;
    word1 |= (descriptor.total_message_length & MAX_OFFSET_OR_LENGTH) as i32;

    let start = buf.len();
    buf.resize(start + DESCRIPTOR_FIXED_LEN, 0);
    write_i32_be(buf, start, word0);
    write_i32_be(buf, start + 4, word1);

    if let Some(header) = &descriptor.header {
        buf.extend_from_slice(header);
    }
}

fn decode_descriptor(buf: &[u8], offset: usize) -> Result<(DataFrameDescriptor, usize), Error> {
    if buf.len() < offset + DESCRIPTOR_FIXED_LEN {
        return Err(Error::ProtocolViolation(
            "truncated data-frame descriptor".into(),
        ));
    }
    let word0 = read_i32_be(buf, offset);
    let word1 = read_i32_be(buf, offset + 4);

    let message_number = ((word0 >> 28) & 0xF) as u8;
    let is_first = (word0 & (1 << 27)) != 0;
    let is_last = (word0 & (1 << 26)) != 0;
    let descriptor_offset = (word0 as u32) & MAX_OFFSET_OR_LENGTH;

    let header_len = (((word1 >> 26) as u32) & 0x3F) as usize;
    let total_message_length = (word1 as u32) & MAX_OFFSET_OR_LENGTH;

    if header_len > MAX_HEADER_LEN {
        return Err(Error::ProtocolViolation(format!(
            "descriptor header length {header_len} exceeds {MAX_HEADER_LEN}"
        )));
    }
    let header_start = offset + DESCRIPTOR_FIXED_LEN;
    if buf.len() < header_start + header_len {
        return Err(Error::ProtocolViolation(
            "truncated data-frame descriptor header".into(),
        ));
    }
    let header = if header_len > 0 {
        Some(buf[header_start..header_start + header_len].to_vec())
    } else {
        None
    };

    let descriptor = DataFrameDescriptor {
        message_number,
        offset: descriptor_offset,
        total_message_length,
        is_first,
        is_last,
        header,
    };
    Ok((descriptor, DESCRIPTOR_FIXED_LEN + header_len))
}
