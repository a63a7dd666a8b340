//! Minimal MAVLink framing for the messages the coprocessor exchanges with
//! the ground station.
//!
//! Outbound frames use v1 framing (`0xFE`). Inbound datagrams may carry v1
//! or v2 (`0xFD`) frames; v2 payloads truncated of trailing zeros are
//! zero-extended before decoding and signatures are skipped without being
//! verified.

use thiserror::Error;

pub(crate) const STX_V1: u8 = 0xFE;
pub(crate) const STX_V2: u8 = 0xFD;

pub(crate) const MSG_NAMED_VALUE_FLOAT: u32 = 251;
pub(crate) const MSG_NAMED_VALUE_INT: u32 = 252;
pub(crate) const MSG_STATUSTEXT: u32 = 253;

const NAME_LEN: usize = 10;
const STATUSTEXT_LEN: usize = 50;
const V1_HEADER_LEN: usize = 6;
const V2_HEADER_LEN: usize = 10;
const CRC_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_SIGNED: u8 = 0x01;

/// Seed mixed into the checksum of each message type.
fn crc_extra(msg_id: u32) -> Option<u8> {
    match msg_id {
        MSG_NAMED_VALUE_FLOAT => Some(170),
        MSG_NAMED_VALUE_INT => Some(44),
        MSG_STATUSTEXT => Some(83),
        _ => None,
    }
}

/// CRC-16/MCRF4XX as used by MAVLink.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Crc(u16);

impl Crc {
    pub(crate) fn new() -> Self {
        Self(0xFFFF)
    }

    pub(crate) fn accumulate(&mut self, byte: u8) {
        let mut tmp = byte ^ (self.0 as u8);
        tmp ^= tmp << 4;
        let tmp = u16::from(tmp);
        self.0 = (self.0 >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4);
    }

    pub(crate) fn accumulate_all(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.accumulate(byte);
        }
    }

    pub(crate) fn value(self) -> u16 {
        self.0
    }
}

/// ASCII name truncated to ten bytes and padded with NULs.
pub(crate) fn name_bytes(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    for (slot, byte) in out.iter_mut().zip(name.bytes().filter(u8::is_ascii)) {
        *slot = byte;
    }
    out
}

/// Builds outbound v1 frames and tracks the per-link sequence number.
#[derive(Debug)]
pub(crate) struct MavlinkEncoder {
    system_id: u8,
    component_id: u8,
    sequence: u8,
}

impl MavlinkEncoder {
    pub(crate) fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            system_id,
            component_id,
            sequence: 0,
        }
    }

    pub(crate) fn named_value_float(&mut self, time_boot_ms: u32, name: &str, value: f32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(18);
        payload.extend_from_slice(&time_boot_ms.to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        payload.extend_from_slice(&name_bytes(name));
        self.frame(MSG_NAMED_VALUE_FLOAT as u8, &payload)
    }

    pub(crate) fn named_value_int(&mut self, time_boot_ms: u32, name: &str, value: i32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(18);
        payload.extend_from_slice(&time_boot_ms.to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        payload.extend_from_slice(&name_bytes(name));
        self.frame(MSG_NAMED_VALUE_INT as u8, &payload)
    }

    /// Status text, truncated to the 50 byte field.
    pub(crate) fn statustext(&mut self, severity: u8, text: &str) -> Vec<u8> {
        let mut payload = vec![0u8; 1 + STATUSTEXT_LEN];
        payload[0] = severity;
        for (slot, byte) in payload[1..].iter_mut().zip(text.bytes()) {
            *slot = byte;
        }
        self.frame(MSG_STATUSTEXT as u8, &payload)
    }

    fn frame(&mut self, msg_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(V1_HEADER_LEN + payload.len() + CRC_LEN);
        out.push(STX_V1);
        out.push(payload.len() as u8);
        out.push(self.sequence);
        out.push(self.system_id);
        out.push(self.component_id);
        out.push(msg_id);
        out.extend_from_slice(payload);

        let mut crc = Crc::new();
        crc.accumulate_all(&out[1..]);
        if let Some(extra) = crc_extra(u32::from(msg_id)) {
            crc.accumulate(extra);
        }
        out.extend_from_slice(&crc.value().to_le_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        out
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum FrameError {
    #[error("not a MAVLink start byte: {0:#04x}")]
    BadMagic(u8),
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown message id {0}")]
    UnknownMessage(u32),
    #[error("checksum mismatch for message {msg_id}: got {got:#06x}, expected {expected:#06x}")]
    Checksum { msg_id: u32, got: u16, expected: u16 },
}

/// Decoded inbound message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum InboundMessage {
    StatusText { severity: u8, text: String },
    NamedValueFloat { name: String, value: f32 },
    NamedValueInt { name: String, value: i32 },
}

/// Parse the frame at the start of `buf`, returning it with its encoded length.
pub(crate) fn parse_frame(buf: &[u8]) -> Result<(InboundMessage, usize), FrameError> {
    let Some(&magic) = buf.first() else {
        return Err(FrameError::Truncated {
            needed: 1,
            available: 0,
        });
    };
    let (header_len, payload_len, msg_id, signed) = match magic {
        STX_V1 => {
            require(buf, V1_HEADER_LEN)?;
            (V1_HEADER_LEN, usize::from(buf[1]), u32::from(buf[5]), false)
        }
        STX_V2 => {
            require(buf, V2_HEADER_LEN)?;
            let msg_id = u32::from_le_bytes([buf[7], buf[8], buf[9], 0]);
            (
                V2_HEADER_LEN,
                usize::from(buf[1]),
                msg_id,
                buf[2] & INCOMPAT_SIGNED != 0,
            )
        }
        other => return Err(FrameError::BadMagic(other)),
    };

    let body_end = header_len + payload_len;
    let total = body_end + CRC_LEN + if signed { SIGNATURE_LEN } else { 0 };
    require(buf, total)?;

    let extra = crc_extra(msg_id).ok_or(FrameError::UnknownMessage(msg_id))?;
    let mut crc = Crc::new();
    crc.accumulate_all(&buf[1..body_end]);
    crc.accumulate(extra);
    let got = u16::from_le_bytes([buf[body_end], buf[body_end + 1]]);
    if got != crc.value() {
        return Err(FrameError::Checksum {
            msg_id,
            got,
            expected: crc.value(),
        });
    }

    let payload = &buf[header_len..body_end];
    Ok((decode_payload(msg_id, payload), total))
}

/// Every well-formed frame in a datagram. Unparseable bytes are skipped.
pub(crate) fn parse_datagram(mut buf: &[u8]) -> Vec<InboundMessage> {
    let mut messages = Vec::new();
    while !buf.is_empty() {
        let Some(start) = buf.iter().position(|&b| b == STX_V1 || b == STX_V2) else {
            break;
        };
        buf = &buf[start..];
        match parse_frame(buf) {
            Ok((message, consumed)) => {
                messages.push(message);
                buf = &buf[consumed..];
            }
            Err(_) => buf = &buf[1..],
        }
    }
    messages
}

fn require(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        Err(FrameError::Truncated {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn decode_payload(msg_id: u32, payload: &[u8]) -> InboundMessage {
    match msg_id {
        MSG_STATUSTEXT => {
            let body = zero_extended::<{ 1 + STATUSTEXT_LEN }>(payload);
            InboundMessage::StatusText {
                severity: body[0],
                text: c_string(&body[1..]),
            }
        }
        MSG_NAMED_VALUE_FLOAT => {
            let body = zero_extended::<18>(payload);
            InboundMessage::NamedValueFloat {
                value: f32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                name: c_string(&body[8..]),
            }
        }
        _ => {
            let body = zero_extended::<18>(payload);
            InboundMessage::NamedValueInt {
                value: i32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                name: c_string(&body[8..]),
            }
        }
    }
}

fn zero_extended<const N: usize>(payload: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = payload.len().min(N);
    out[..len].copy_from_slice(&payload[..len]);
    out
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
