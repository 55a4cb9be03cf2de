// SPDX-License-Identifier: BSD-3-Clause

//! Minimal External Data Representation (XDR, RFC 4506) primitives.
//!
//! The RPC procedure catalog itself (argument/result record shapes) is an external,
//! code-generated concern (§1 non-goals); this module only encodes the fixed pieces the
//! core touches directly: the frame header and the error record (§6.1).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Error, ErrorRecord, Result};

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_u32::<BigEndian>(v).map_err(Error::from)
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_i32::<BigEndian>(v).map_err(Error::from)
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    r.read_u32::<BigEndian>().map_err(Error::from)
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    r.read_i32::<BigEndian>().map_err(Error::from)
}

/// Writes an opaque string: a 4-byte length followed by the bytes, padded with zeroes to
/// a multiple of 4.
pub fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes).map_err(Error::from)?;
    write_padding(w, bytes.len())
}

pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(Error::from)?;
    read_padding(r, len)?;
    String::from_utf8(buf).map_err(|e| Error::protocol(format!("invalid utf8 string: {e}")))
}

/// Writes an opaque byte array: a 4-byte length followed by the raw bytes, padded to a
/// multiple of 4. Used for payloads that aren't necessarily valid UTF-8, such as SASL
/// challenge/response data (§4.4).
pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes).map_err(Error::from)?;
    write_padding(w, bytes.len())
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(Error::from)?;
    read_padding(r, len)?;
    Ok(buf)
}

/// Writes an XDR `optional<string>`: a boolean presence flag followed by the string if
/// present (used for the error record's `str1`/`str2`/`str3`/`message`, §6.1).
pub fn write_optional_string<W: Write>(w: &mut W, s: &Option<String>) -> Result<()> {
    match s {
        Some(v) => {
            write_u32(w, 1)?;
            write_string(w, v)
        }
        None => write_u32(w, 0),
    }
}

pub fn read_optional_string<R: Read>(r: &mut R) -> Result<Option<String>> {
    if read_u32(r)? != 0 {
        Ok(Some(read_string(r)?))
    } else {
        Ok(None)
    }
}

fn write_padding<W: Write>(w: &mut W, len: usize) -> Result<()> {
    let pad = (4 - (len % 4)) % 4;
    if pad > 0 {
        w.write_all(&[0u8; 4][..pad]).map_err(Error::from)?;
    }
    Ok(())
}

fn read_padding<R: Read>(r: &mut R, len: usize) -> Result<()> {
    let pad = (4 - (len % 4)) % 4;
    if pad > 0 {
        let mut scratch = [0u8; 4];
        r.read_exact(&mut scratch[..pad]).map_err(Error::from)?;
    }
    Ok(())
}

/// Encodes an [`ErrorRecord`] (§6.1) into `w`.
pub fn write_error_record<W: Write>(w: &mut W, e: &ErrorRecord) -> Result<()> {
    write_i32(w, e.domain)?;
    write_i32(w, e.code)?;
    write_i32(w, e.level)?;
    write_optional_string(w, &e.str1)?;
    write_optional_string(w, &e.str2)?;
    write_optional_string(w, &e.str3)?;
    write_i32(w, e.int1)?;
    write_i32(w, e.int2)?;
    write_optional_string(w, &e.message)
}

/// Decodes an [`ErrorRecord`] (§6.1) from `r`.
pub fn read_error_record<R: Read>(r: &mut R) -> Result<ErrorRecord> {
    Ok(ErrorRecord {
        domain: read_i32(r)?,
        code: read_i32(r)?,
        level: read_i32(r)?,
        str1: read_optional_string(r)?,
        str2: read_optional_string(r)?,
        str3: read_optional_string(r)?,
        int1: read_i32(r)?,
        int2: read_i32(r)?,
        message: read_optional_string(r)?,
    })
}

/// Maps an end-of-file hit while reading a partial frame to an I/O error distinct from a
/// genuine decode error, so the read sub-machine (§4.5) can tell "peer closed cleanly"
/// from "peer sent garbage".
pub fn is_eof(e: &Error) -> bool {
    matches!(e, Error::Transport(io) if io.kind() == io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips_with_padding() {
        let mut buf = Vec::new();
        write_string(&mut buf, "abc").unwrap();
        // 4 (length) + 3 (bytes) + 1 (pad) = 8
        assert_eq!(buf.len(), 8);
        let mut cursor = buf.as_slice();
        assert_eq!(read_string(&mut cursor).unwrap(), "abc");
        assert!(cursor.is_empty());
    }

    #[test]
    fn error_record_round_trips() {
        let rec = ErrorRecord {
            domain: 1,
            code: 42,
            level: 2,
            str1: Some("s1".into()),
            str2: None,
            str3: Some("s3".into()),
            int1: 7,
            int2: -1,
            message: Some("boom".into()),
        };
        let mut buf = Vec::new();
        write_error_record(&mut buf, &rec).unwrap();
        let mut cursor = buf.as_slice();
        let after = read_error_record(&mut cursor).unwrap();
        assert_eq!(rec, after);
    }
}
