//! MRT record stream reader (RFC 6396).
//!
//! Records are length-delimited: a 12-byte common header followed by the
//! body. Extended-timestamp types carry an extra microseconds field at
//! the start of the body.

pub mod bgp4mp;
pub mod table_dump;

use bytes::Bytes;
use std::io::Read;

use crate::error::MrtError;

pub const MRT_TABLE_DUMP_V2: u16 = 13;
pub const MRT_BGP4MP: u16 = 16;
pub const MRT_BGP4MP_ET: u16 = 17;

/// Common MRT header.
#[derive(Debug, Clone, Copy)]
pub struct MrtHeader {
    pub timestamp: u32,
    pub mrt_type: u16,
    pub subtype: u16,
    pub length: u32,
}

/// One record: header plus body bytes (microseconds already split off
/// for extended-timestamp types).
#[derive(Debug, Clone)]
pub struct MrtRecord {
    pub header: MrtHeader,
    pub microsecs: Option<u32>,
    pub body: Bytes,
}

/// Pulls MRT records off any byte stream.
pub struct MrtReader<R> {
    reader: R,
    offset: u64,
}

impl<R: Read> MrtReader<R> {
    pub fn new(reader: R) -> Self {
        MrtReader { reader, offset: 0 }
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn fill(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<bool, MrtError> {
        let mut got = 0usize;
        while got < buf.len() {
            match self.reader.read(&mut buf[got..]) {
                Ok(0) => {
                    if got == 0 && at_boundary {
                        return Ok(false); // clean EOF
                    }
                    return Err(MrtError::Truncated {
                        offset: self.offset + got as u64,
                    });
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MrtError::Io(e)),
            }
        }
        self.offset += buf.len() as u64;
        Ok(true)
    }

    /// Read the next record; `Ok(None)` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<MrtRecord>, MrtError> {
        let mut hdr = [0u8; 12];
        if !self.fill(&mut hdr, true)? {
            return Ok(None);
        }
        let header = MrtHeader {
            timestamp: u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]),
            mrt_type: u16::from_be_bytes([hdr[4], hdr[5]]),
            subtype: u16::from_be_bytes([hdr[6], hdr[7]]),
            length: u32::from_be_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]),
        };
        let mut body = vec![0u8; header.length as usize];
        self.fill(&mut body, false)?;
        let mut body = Bytes::from(body);

        let microsecs = if header.mrt_type == MRT_BGP4MP_ET {
            if body.len() < 4 {
                return Err(MrtError::Truncated {
                    offset: self.offset,
                });
            }
            let us = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            body = body.slice(4..);
            Some(us)
        } else {
            None
        };

        Ok(Some(MrtRecord {
            header,
            microsecs,
            body,
        }))
    }
}

#[cfg(test)]
pub(crate) fn make_record(
    timestamp: u32,
    mrt_type: u16,
    subtype: u16,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + body.len());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&mrt_type.to_be_bytes());
    out.extend_from_slice(&subtype.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}
