//! Lazy iterators over the fields of a BGP UPDATE.
//!
//! All iterators are fused on error: after yielding an `Err` they return
//! `None` forever. The filter interpreter maps these errors onto its own
//! packet-corruption code.

use crate::error::BgpError;
use crate::netaddr::{Afi, NetAddr};

use super::{BgpMessage, ATTR_AS4_PATH, ATTR_AS_PATH, PathMode};

const AFI_IPV4: u16 = 1;
const AFI_IPV6: u16 = 2;
const SAFI_UNICAST: u8 = 1;
const SAFI_MULTICAST: u8 = 2;

/// One path attribute: flags, type code, payload.
#[derive(Debug, Clone, Copy)]
pub struct Attr<'a> {
    pub flags: u8,
    pub code: u8,
    pub data: &'a [u8],
}

/// Walks a raw attribute block.
pub struct AttrIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AttrIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        AttrIter { data, pos: 0 }
    }

    fn fail(&mut self) -> Option<Result<Attr<'a>, BgpError>> {
        self.pos = self.data.len();
        Some(Err(BgpError::BadAttribute))
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<Attr<'a>, BgpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let Some(&[flags, code]) = self.data.get(self.pos..self.pos + 2) else {
            return self.fail();
        };
        self.pos += 2;
        let extended = flags & 0x10 != 0;
        let len = if extended {
            let Some(b) = self.data.get(self.pos..self.pos + 2) else {
                return self.fail();
            };
            self.pos += 2;
            usize::from(u16::from_be_bytes([b[0], b[1]]))
        } else {
            let Some(&b) = self.data.get(self.pos) else {
                return self.fail();
            };
            self.pos += 1;
            usize::from(b)
        };
        let Some(payload) = self.data.get(self.pos..self.pos + len) else {
            return self.fail();
        };
        self.pos += len;
        Some(Ok(Attr {
            flags,
            code,
            data: payload,
        }))
    }
}

fn decode_prefix(afi: Afi, data: &[u8], pos: &mut usize) -> Result<NetAddr, BgpError> {
    let len = *data.get(*pos).ok_or(BgpError::Truncated)?;
    *pos += 1;
    if len > afi.max_bitlen() {
        return Err(BgpError::BadPrefixLen(len));
    }
    let nbytes = usize::from(len).div_ceil(8);
    let packed = data.get(*pos..*pos + nbytes).ok_or(BgpError::Truncated)?;
    *pos += nbytes;
    NetAddr::from_packed(afi, len, packed).map_err(|_| BgpError::BadPrefixLen(len))
}

enum PrefixState<'a> {
    Main { data: &'a [u8], pos: usize },
    Mp { afi: Afi, data: &'a [u8], pos: usize },
    Done,
}

/// Iterates announced or withdrawn prefixes, optionally continuing into
/// the matching multiprotocol attribute.
pub struct PrefixIter<'a> {
    msg: &'a BgpMessage,
    mp_code: u8,
    all: bool,
    state: PrefixState<'a>,
}

impl<'a> PrefixIter<'a> {
    pub(super) fn new(msg: &'a BgpMessage, main: &'a [u8], mp_code: u8, all: bool) -> Self {
        PrefixIter {
            msg,
            mp_code,
            all,
            state: PrefixState::Main { data: main, pos: 0 },
        }
    }

    /// Locate and open the MP attribute, or finish.
    fn enter_mp(&mut self) -> Option<Result<(), BgpError>> {
        let attr = match self.msg.find_attr(self.mp_code) {
            Ok(Some(attr)) => attr,
            Ok(None) => {
                self.state = PrefixState::Done;
                return None;
            }
            Err(e) => {
                self.state = PrefixState::Done;
                return Some(Err(e));
            }
        };
        let payload = attr.data;
        let header_len = if self.mp_code == super::ATTR_MP_REACH_NLRI {
            // afi, safi, nexthop length, nexthop, reserved
            let Some(&nhlen) = payload.get(3) else {
                self.state = PrefixState::Done;
                return Some(Err(BgpError::Truncated));
            };
            5 + usize::from(nhlen)
        } else {
            3
        };
        if payload.len() < header_len {
            self.state = PrefixState::Done;
            return Some(Err(BgpError::Truncated));
        }
        let afi_raw = u16::from_be_bytes([payload[0], payload[1]]);
        let afi = match afi_raw {
            AFI_IPV4 => Afi::Ipv4,
            AFI_IPV6 => Afi::Ipv6,
            other => {
                self.state = PrefixState::Done;
                return Some(Err(BgpError::UnknownFamily(other)));
            }
        };
        let safi = payload[2];
        if safi != SAFI_UNICAST && safi != SAFI_MULTICAST {
            tracing::debug!(safi, "ignoring multiprotocol attribute with unsupported SAFI");
            self.state = PrefixState::Done;
            return None;
        }
        self.state = PrefixState::Mp {
            afi,
            data: payload,
            pos: header_len,
        };
        None
    }
}

impl Iterator for PrefixIter<'_> {
    type Item = Result<NetAddr, BgpError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                PrefixState::Main { data, pos } => {
                    if *pos < data.len() {
                        return match decode_prefix(Afi::Ipv4, data, pos) {
                            Ok(addr) => Some(Ok(addr)),
                            Err(e) => {
                                self.state = PrefixState::Done;
                                Some(Err(e))
                            }
                        };
                    }
                    if !self.all {
                        self.state = PrefixState::Done;
                        return None;
                    }
                    if let Some(Err(e)) = self.enter_mp() {
                        return Some(Err(e));
                    }
                    if matches!(self.state, PrefixState::Done) {
                        return None;
                    }
                }
                PrefixState::Mp { afi, data, pos } => {
                    if *pos >= data.len() {
                        self.state = PrefixState::Done;
                        return None;
                    }
                    let afi = *afi;
                    return match decode_prefix(afi, data, pos) {
                        Ok(addr) => Some(Ok(addr)),
                        Err(e) => {
                            self.state = PrefixState::Done;
                            Some(Err(e))
                        }
                    };
                }
                PrefixState::Done => return None,
            }
        }
    }
}

/// Streams the AS numbers of one path attribute, flattening segments.
pub(super) struct SegWalk<'a> {
    data: &'a [u8],
    pos: usize,
    asn4: bool,
    seg_left: u8,
    failed: bool,
}

impl<'a> SegWalk<'a> {
    fn new(data: &'a [u8], asn4: bool) -> Self {
        SegWalk {
            data,
            pos: 0,
            asn4,
            seg_left: 0,
            failed: false,
        }
    }

    fn empty() -> Self {
        SegWalk::new(&[], true)
    }

    fn next_as(&mut self) -> Option<Result<u32, BgpError>> {
        if self.failed {
            return None;
        }
        while self.seg_left == 0 {
            if self.pos >= self.data.len() {
                return None;
            }
            let Some(&[seg_type, count]) = self.data.get(self.pos..self.pos + 2) else {
                self.failed = true;
                return Some(Err(BgpError::BadSegment));
            };
            if seg_type != 1 && seg_type != 2 {
                self.failed = true;
                return Some(Err(BgpError::BadSegment));
            }
            self.pos += 2;
            self.seg_left = count;
        }
        let width = if self.asn4 { 4 } else { 2 };
        let Some(b) = self.data.get(self.pos..self.pos + width) else {
            self.failed = true;
            return Some(Err(BgpError::BadSegment));
        };
        self.pos += width;
        self.seg_left -= 1;
        let asn = if self.asn4 {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from(u16::from_be_bytes([b[0], b[1]]))
        };
        Some(Ok(asn))
    }

    /// Count entries without decoding them; validates segment framing.
    fn count_entries(data: &[u8], asn4: bool) -> Result<usize, BgpError> {
        let width = if asn4 { 4 } else { 2 };
        let mut pos = 0;
        let mut total = 0usize;
        while pos < data.len() {
            let Some(&[seg_type, count]) = data.get(pos..pos + 2) else {
                return Err(BgpError::BadSegment);
            };
            if seg_type != 1 && seg_type != 2 {
                return Err(BgpError::BadSegment);
            }
            pos += 2 + usize::from(count) * width;
            if pos > data.len() {
                return Err(BgpError::BadSegment);
            }
            total += usize::from(count);
        }
        Ok(total)
    }
}

/// AS-path entries in left-to-right order, across one or two attributes
/// depending on [`PathMode`].
pub struct AsPathIter<'a> {
    first: SegWalk<'a>,
    take_first: usize,
    second: Option<SegWalk<'a>>,
}

impl<'a> AsPathIter<'a> {
    pub(super) fn open(msg: &'a BgpMessage, mode: PathMode) -> Result<Self, BgpError> {
        let plain = |attr: Option<Attr<'a>>, asn4: bool| AsPathIter {
            first: attr
                .map(|a| SegWalk::new(a.data, asn4))
                .unwrap_or_else(SegWalk::empty),
            take_first: usize::MAX,
            second: None,
        };

        match mode {
            PathMode::AsPath => Ok(plain(msg.find_attr(ATTR_AS_PATH)?, msg.asn32())),
            PathMode::As4Path => Ok(plain(msg.find_attr(ATTR_AS4_PATH)?, true)),
            PathMode::Real => {
                if msg.asn32() {
                    return Ok(plain(msg.find_attr(ATTR_AS_PATH)?, true));
                }
                let ap = msg.find_attr(ATTR_AS_PATH)?;
                let Some(a4) = msg.find_attr(ATTR_AS4_PATH)? else {
                    return Ok(plain(ap, false));
                };
                let n = match &ap {
                    Some(a) => SegWalk::count_entries(a.data, false)?,
                    None => 0,
                };
                let n4 = SegWalk::count_entries(a4.data, true)?;
                if n4 > n {
                    // AS4_PATH longer than AS_PATH: ignore it (RFC 6793)
                    return Ok(plain(ap, false));
                }
                Ok(AsPathIter {
                    first: ap
                        .map(|a| SegWalk::new(a.data, false))
                        .unwrap_or_else(SegWalk::empty),
                    take_first: n - n4,
                    second: Some(SegWalk::new(a4.data, true)),
                })
            }
        }
    }
}

impl Iterator for AsPathIter<'_> {
    type Item = Result<u32, BgpError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.take_first > 0 {
            match self.first.next_as() {
                Some(item) => {
                    self.take_first = self.take_first.saturating_sub(1);
                    return Some(item);
                }
                None => {
                    self.take_first = 0;
                }
            }
        }
        match &mut self.second {
            Some(walk) => walk.next_as(),
            None => None,
        }
    }
}

/// Community values from the COMMUNITY attribute payload.
pub struct CommunityIter<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> CommunityIter<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        CommunityIter {
            data,
            pos: 0,
            failed: false,
        }
    }
}

impl Iterator for CommunityIter<'_> {
    type Item = Result<u32, BgpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let Some(b) = self.data.get(self.pos..self.pos + 4) else {
            self.failed = true;
            return Some(Err(BgpError::BadAttribute));
        };
        self.pos += 4;
        Some(Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
    }
}
