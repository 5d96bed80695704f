//! BGP message view.
//!
//! [`BgpMessage`] wraps raw wire bytes and hands out lazy iterators over
//! the pieces the filter engine consumes: announced and withdrawn
//! prefixes, AS-path entries, communities, and the attribute list.
//! Malformed data surfaces as a [`BgpError`] *during iteration*, so a
//! damaged record only fails when something actually reads the damaged
//! field.

pub mod iter;

use bytes::Bytes;
use std::ops::Range;

use crate::error::BgpError;
use crate::netaddr::{Afi, NetAddr};

pub use iter::{AsPathIter, Attr, AttrIter, CommunityIter, PrefixIter};

/// BGP message header length: 16-byte marker, length, type.
pub const BGP_HDR_LEN: usize = 19;

pub const MSG_OPEN: u8 = 1;
pub const MSG_UPDATE: u8 = 2;
pub const MSG_NOTIFICATION: u8 = 3;
pub const MSG_KEEPALIVE: u8 = 4;

pub const ATTR_ORIGIN: u8 = 1;
pub const ATTR_AS_PATH: u8 = 2;
pub const ATTR_NEXT_HOP: u8 = 3;
pub const ATTR_MULTI_EXIT_DISC: u8 = 4;
pub const ATTR_LOCAL_PREF: u8 = 5;
pub const ATTR_ATOMIC_AGGREGATE: u8 = 6;
pub const ATTR_AGGREGATOR: u8 = 7;
pub const ATTR_COMMUNITY: u8 = 8;
pub const ATTR_ORIGINATOR_ID: u8 = 9;
pub const ATTR_CLUSTER_LIST: u8 = 10;
pub const ATTR_MP_REACH_NLRI: u8 = 14;
pub const ATTR_MP_UNREACH_NLRI: u8 = 15;
pub const ATTR_EXTENDED_COMMUNITIES: u8 = 16;
pub const ATTR_AS4_PATH: u8 = 17;
pub const ATTR_AS4_AGGREGATOR: u8 = 18;
pub const ATTR_LARGE_COMMUNITY: u8 = 32;

/// Which AS-path attribute an [`AsPathIter`] walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    /// AS_PATH (attribute 2) as carried on the wire.
    AsPath,
    /// AS4_PATH (attribute 17).
    As4Path,
    /// The path after AS4 reconstruction (RFC 6793).
    Real,
}

/// A decoded BGP message. Only UPDATEs expose field ranges; other kinds
/// are representable so the VM can refuse them explicitly.
pub struct BgpMessage {
    data: Bytes,
    kind: u8,
    asn32: bool,
    withdrawn: Range<usize>,
    attrs: Range<usize>,
    nlri: Range<usize>,
}

fn read_u16(data: &[u8], off: usize) -> Result<u16, BgpError> {
    let b = data.get(off..off + 2).ok_or(BgpError::Truncated)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

impl BgpMessage {
    /// Parse the message framing. `asn32` records whether the speaker was
    /// 4-octet-AS capable, which decides the width of AS_PATH entries.
    pub fn from_wire(data: Bytes, asn32: bool) -> Result<Self, BgpError> {
        if data.len() < BGP_HDR_LEN {
            return Err(BgpError::Truncated);
        }
        let msg_len = usize::from(read_u16(&data, 16)?);
        if msg_len < BGP_HDR_LEN || msg_len > data.len() {
            return Err(BgpError::Truncated);
        }
        let kind = data[18];

        let mut msg = BgpMessage {
            data,
            kind,
            asn32,
            withdrawn: 0..0,
            attrs: 0..0,
            nlri: 0..0,
        };
        if kind == MSG_UPDATE {
            let wlen = usize::from(read_u16(&msg.data, BGP_HDR_LEN)?);
            let wstart = BGP_HDR_LEN + 2;
            let wend = wstart + wlen;
            if wend + 2 > msg_len {
                return Err(BgpError::Truncated);
            }
            let alen = usize::from(read_u16(&msg.data, wend)?);
            let astart = wend + 2;
            let aend = astart + alen;
            if aend > msg_len {
                return Err(BgpError::Truncated);
            }
            msg.withdrawn = wstart..wend;
            msg.attrs = astart..aend;
            msg.nlri = aend..msg_len;
        }
        Ok(msg)
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn is_update(&self) -> bool {
        self.kind == MSG_UPDATE
    }

    pub fn asn32(&self) -> bool {
        self.asn32
    }

    /// The raw message bytes, header included.
    pub fn wire(&self) -> &[u8] {
        &self.data
    }

    fn attr_bytes(&self) -> &[u8] {
        &self.data[self.attrs.clone()]
    }

    /// Walk the path attributes of this UPDATE.
    pub fn attributes(&self) -> AttrIter<'_> {
        AttrIter::new(self.attr_bytes())
    }

    /// First attribute with the given code, if any.
    pub fn find_attr(&self, code: u8) -> Result<Option<Attr<'_>>, BgpError> {
        for attr in self.attributes() {
            let attr = attr?;
            if attr.code == code {
                return Ok(Some(attr));
            }
        }
        Ok(None)
    }

    pub fn has_attr(&self, code: u8) -> Result<bool, BgpError> {
        Ok(self.find_attr(code)?.is_some())
    }

    /// Announced prefixes. With `all`, MP_REACH_NLRI prefixes follow the
    /// plain IPv4 NLRI field.
    pub fn nlri(&self, all: bool) -> PrefixIter<'_> {
        PrefixIter::new(self, &self.data[self.nlri.clone()], ATTR_MP_REACH_NLRI, all)
    }

    /// Withdrawn prefixes. With `all`, MP_UNREACH_NLRI prefixes follow
    /// the plain withdrawn-routes field.
    pub fn withdrawn(&self, all: bool) -> PrefixIter<'_> {
        PrefixIter::new(
            self,
            &self.data[self.withdrawn.clone()],
            ATTR_MP_UNREACH_NLRI,
            all,
        )
    }

    /// AS-path entries in left-to-right order.
    pub fn as_path(&self, mode: PathMode) -> Result<AsPathIter<'_>, BgpError> {
        AsPathIter::open(self, mode)
    }

    /// Community values from the COMMUNITY attribute.
    pub fn communities(&self) -> Result<CommunityIter<'_>, BgpError> {
        let attr = self.find_attr(ATTR_COMMUNITY)?;
        Ok(CommunityIter::new(attr.map(|a| a.data).unwrap_or(&[])))
    }
}

/// Assembles a BGP UPDATE from parts.
///
/// This backs the TABLE_DUMP_V2 synthesis path (a RIB entry is presented
/// to the filter as the UPDATE that would have announced it) and keeps
/// tests honest by exercising the same decoder as real traffic.
pub struct UpdateBuilder {
    asn32: bool,
    withdrawn: Vec<NetAddr>,
    mp_unreach: Vec<NetAddr>,
    attrs: Vec<u8>,
    nlri: Vec<NetAddr>,
    mp_reach: Vec<NetAddr>,
}

impl UpdateBuilder {
    pub fn new() -> Self {
        UpdateBuilder {
            asn32: true,
            withdrawn: Vec::new(),
            mp_unreach: Vec::new(),
            attrs: Vec::new(),
            nlri: Vec::new(),
            mp_reach: Vec::new(),
        }
    }

    /// Encode AS_PATH with 2-byte entries, as a pre-RFC 6793 speaker
    /// would.
    pub fn asn16(mut self) -> Self {
        self.asn32 = false;
        self
    }

    pub fn withdraw(mut self, addr: NetAddr) -> Self {
        match addr.afi() {
            Afi::Ipv4 => self.withdrawn.push(addr),
            Afi::Ipv6 => self.mp_unreach.push(addr),
        }
        self
    }

    pub fn announce(mut self, addr: NetAddr) -> Self {
        match addr.afi() {
            Afi::Ipv4 => self.nlri.push(addr),
            Afi::Ipv6 => self.mp_reach.push(addr),
        }
        self
    }

    /// Append an attribute verbatim; extended length is chosen as needed.
    pub fn raw_attr(mut self, flags: u8, code: u8, payload: &[u8]) -> Self {
        push_attr(&mut self.attrs, flags, code, payload);
        self
    }

    pub fn origin(self, origin: u8) -> Self {
        self.raw_attr(0x40, ATTR_ORIGIN, &[origin])
    }

    /// AS_PATH as a single AS_SEQUENCE segment.
    pub fn as_path(self, path: &[u32]) -> Self {
        let payload = encode_segment(path, self.asn32);
        self.raw_attr(0x40, ATTR_AS_PATH, &payload)
    }

    /// AS4_PATH as a single AS_SEQUENCE segment (always 4-byte entries).
    pub fn as4_path(self, path: &[u32]) -> Self {
        let payload = encode_segment(path, true);
        self.raw_attr(0xc0, ATTR_AS4_PATH, &payload)
    }

    pub fn communities(self, comms: &[u32]) -> Self {
        let mut payload = Vec::with_capacity(comms.len() * 4);
        for c in comms {
            payload.extend_from_slice(&c.to_be_bytes());
        }
        self.raw_attr(0xc0, ATTR_COMMUNITY, &payload)
    }

    pub fn build(self) -> Result<BgpMessage, BgpError> {
        let mut attrs = self.attrs;
        if !self.mp_reach.is_empty() {
            let mut payload = vec![0, 2, 1, 0, 0]; // AFI v6, SAFI unicast, no nexthop
            for p in &self.mp_reach {
                payload.extend_from_slice(&p.to_wire());
            }
            push_attr(&mut attrs, 0x80, ATTR_MP_REACH_NLRI, &payload);
        }
        if !self.mp_unreach.is_empty() {
            let mut payload = vec![0, 2, 1]; // AFI v6, SAFI unicast
            for p in &self.mp_unreach {
                payload.extend_from_slice(&p.to_wire());
            }
            push_attr(&mut attrs, 0x80, ATTR_MP_UNREACH_NLRI, &payload);
        }

        let mut withdrawn = Vec::new();
        for p in &self.withdrawn {
            withdrawn.extend_from_slice(&p.to_wire());
        }
        let mut nlri = Vec::new();
        for p in &self.nlri {
            nlri.extend_from_slice(&p.to_wire());
        }

        let total = BGP_HDR_LEN + 2 + withdrawn.len() + 2 + attrs.len() + nlri.len();
        let msg_len = u16::try_from(total).map_err(|_| BgpError::Truncated)?;

        let mut wire = Vec::with_capacity(total);
        wire.extend_from_slice(&[0xff; 16]);
        wire.extend_from_slice(&msg_len.to_be_bytes());
        wire.push(MSG_UPDATE);
        wire.extend_from_slice(&(withdrawn.len() as u16).to_be_bytes());
        wire.extend_from_slice(&withdrawn);
        wire.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        wire.extend_from_slice(&attrs);
        wire.extend_from_slice(&nlri);

        BgpMessage::from_wire(Bytes::from(wire), self.asn32)
    }
}

impl Default for UpdateBuilder {
    fn default() -> Self {
        UpdateBuilder::new()
    }
}

fn push_attr(out: &mut Vec<u8>, flags: u8, code: u8, payload: &[u8]) {
    if payload.len() > 0xff {
        out.push(flags | 0x10);
        out.push(code);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(flags);
        out.push(code);
        out.push(payload.len() as u8);
    }
    out.extend_from_slice(payload);
}

fn encode_segment(path: &[u32], asn4: bool) -> Vec<u8> {
    let width = if asn4 { 4 } else { 2 };
    let mut out = Vec::with_capacity(2 + path.len() * width);
    out.push(2); // AS_SEQUENCE
    out.push(path.len() as u8);
    for &asn in path {
        if asn4 {
            out.extend_from_slice(&asn.to_be_bytes());
        } else {
            out.extend_from_slice(&(asn as u16).to_be_bytes());
        }
    }
    out
}
