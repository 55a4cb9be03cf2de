// SPDX-License-Identifier: BSD-3-Clause

//! Frame codec (§4.1, §6.1): length-prefixed messages with an XDR-encoded header.

use crate::error::{Error, Result};
use crate::xdr;

/// Size in bytes of the encoded [`FrameHeader`] (6 x u32/i32 fields), not including the
/// 4-byte length prefix.
pub const HEADER_SIZE: usize = 24;

/// Compile-time bound on a message body, matching the source's `VIR_NET_MESSAGE_MAX`
/// (on the order of hundreds of kilobytes, §4.1).
pub const MAX_BODY: usize = 256 * 1024;

/// Largest a full frame (length word + header + body) may ever be.
pub const MAX_FRAME: usize = 4 + MAX_BODY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 0,
    Reply = 1,
    Message = 2,
    Stream = 3,
}

impl MessageType {
    fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Reply),
            2 => Ok(MessageType::Message),
            3 => Ok(MessageType::Stream),
            other => Err(Error::protocol(format!("unknown message type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Continue = 2,
}

impl Status {
    fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Continue),
            other => Err(Error::protocol(format!("unknown status {other}"))),
        }
    }
}

/// The fixed frame header (§3, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub program: u32,
    pub version: u32,
    pub procedure: i32,
    pub message_type: MessageType,
    pub serial: u32,
    pub status: Status,
}

impl FrameHeader {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        xdr::write_u32(out, self.program)?;
        xdr::write_u32(out, self.version)?;
        xdr::write_i32(out, self.procedure)?;
        xdr::write_i32(out, self.message_type as i32)?;
        xdr::write_u32(out, self.serial)?;
        xdr::write_i32(out, self.status as i32)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::protocol("frame shorter than header size"));
        }
        let mut r = buf;
        let program = xdr::read_u32(&mut r)?;
        let version = xdr::read_u32(&mut r)?;
        let procedure = xdr::read_i32(&mut r)?;
        let message_type = MessageType::from_i32(xdr::read_i32(&mut r)?)?;
        let serial = xdr::read_u32(&mut r)?;
        let status = Status::from_i32(xdr::read_i32(&mut r)?)?;
        Ok(FrameHeader {
            program,
            version,
            procedure,
            message_type,
            serial,
            status,
        })
    }
}

/// Encodes a full frame: 4-byte big-endian total length (inclusive of itself), the
/// header, then `body`.
pub fn encode_frame(header: &FrameHeader, body: &[u8]) -> Result<Vec<u8>> {
    let total_len = 4 + HEADER_SIZE + body.len();
    if total_len > MAX_FRAME {
        return Err(Error::protocol(format!(
            "encoded frame of {total_len} bytes exceeds MAX_FRAME {MAX_FRAME}"
        )));
    }
    let mut out = Vec::with_capacity(total_len);
    xdr::write_u32(&mut out, total_len as u32)?;
    header.encode(&mut out)?;
    out.extend_from_slice(body);
    Ok(out)
}

/// Decodes the length prefix only, returning the total frame length it declares.
/// Bounds-checks against [`MAX_FRAME`] and the minimum possible frame (length word +
/// header).
pub fn decode_length_prefix(buf: &[u8; 4]) -> Result<u32> {
    let len = u32::from_be_bytes(*buf);
    let min = (4 + HEADER_SIZE) as u32;
    if len < min {
        return Err(Error::protocol(format!(
            "frame length {len} shorter than minimum {min}"
        )));
    }
    if len as usize > MAX_FRAME {
        return Err(Error::protocol(format!(
            "frame length {len} exceeds MAX_FRAME {MAX_FRAME}"
        )));
    }
    Ok(len)
}

/// Decodes a complete frame (length prefix already stripped by the caller): splits the
/// header from the trailing body.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8])> {
    let header = FrameHeader::decode(buf)?;
    Ok((header, &buf[HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = FrameHeader {
            program: 0x2000_0000,
            version: 1,
            procedure: 42,
            message_type: MessageType::Call,
            serial: 7,
            status: Status::Ok,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn frame_length_within_bounds() {
        let header = FrameHeader {
            program: 1,
            version: 1,
            procedure: 1,
            message_type: MessageType::Reply,
            serial: 1,
            status: Status::Ok,
        };
        let frame = encode_frame(&header, b"hello").unwrap();
        assert!(frame.len() >= HEADER_SIZE);
        assert!(frame.len() <= MAX_FRAME);
        let declared = decode_length_prefix(&frame[..4].try_into().unwrap()).unwrap();
        assert_eq!(declared as usize, frame.len());
    }

    #[test]
    fn rejects_oversized_body() {
        let header = FrameHeader {
            program: 1,
            version: 1,
            procedure: 1,
            message_type: MessageType::Call,
            serial: 1,
            status: Status::Ok,
        };
        let huge = vec![0u8; MAX_BODY + 1];
        assert!(encode_frame(&header, &huge).is_err());
    }
}
