//! TABLE_DUMP_V2 record bodies: the peer index table and RIB snapshots.
//!
//! A RIB entry is presented to the filter as the UPDATE that would have
//! announced it: the entry's attributes are copied over (minus any
//! next-hop-only MP_REACH_NLRI) and the record prefix is announced
//! through the regular NLRI machinery.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::bgp::{AttrIter, BgpMessage, UpdateBuilder, ATTR_MP_REACH_NLRI};
use crate::error::{BgpError, MrtError};
use crate::netaddr::{Afi, NetAddr};

pub const TD2_PEER_INDEX_TABLE: u16 = 1;
pub const TD2_RIB_IPV4_UNICAST: u16 = 2;
pub const TD2_RIB_IPV4_MULTICAST: u16 = 3;
pub const TD2_RIB_IPV6_UNICAST: u16 = 4;
pub const TD2_RIB_IPV6_MULTICAST: u16 = 5;
pub const TD2_RIB_GENERIC: u16 = 6;

/// One peer from the index table.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub bgp_id: u32,
    pub addr: IpAddr,
    pub asn: u32,
}

/// The PEER_INDEX_TABLE record: maps RIB peer indices to peers.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    pub collector_id: u32,
    pub view_name: String,
    pub peers: Vec<PeerEntry>,
}

impl PeerTable {
    pub fn get(&self, index: u16) -> Option<&PeerEntry> {
        self.peers.get(usize::from(index))
    }
}

/// One entry of a RIB record.
#[derive(Debug, Clone)]
pub struct RibEntry {
    pub peer_index: u16,
    pub originated: u32,
    pub attrs: Bytes,
}

/// A RIB_IPV4_UNICAST / RIB_IPV6_UNICAST record.
#[derive(Debug, Clone)]
pub struct RibRecord {
    pub sequence: u32,
    pub prefix: NetAddr,
    pub entries: Vec<RibEntry>,
}

struct Reader {
    body: Bytes,
    pos: usize,
    what: &'static str,
}

impl Reader {
    fn take(&mut self, n: usize) -> Result<&[u8], MrtError> {
        let end = self.pos + n;
        if end > self.body.len() {
            return Err(MrtError::Malformed(self.what));
        }
        let out = &self.body[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MrtError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MrtError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MrtError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

pub fn parse_peer_index(body: Bytes) -> Result<PeerTable, MrtError> {
    let mut r = Reader {
        body,
        pos: 0,
        what: "PEER_INDEX_TABLE",
    };
    let collector_id = r.u32()?;
    let name_len = usize::from(r.u16()?);
    let view_name = String::from_utf8_lossy(r.take(name_len)?).into_owned();
    let peer_count = usize::from(r.u16()?);

    let mut peers = Vec::with_capacity(peer_count);
    for _ in 0..peer_count {
        let peer_type = r.u8()?;
        let bgp_id = r.u32()?;
        let addr = if peer_type & 0x01 != 0 {
            let b = r.take(16)?;
            let mut o = [0u8; 16];
            o.copy_from_slice(b);
            IpAddr::V6(Ipv6Addr::from(o))
        } else {
            let b = r.take(4)?;
            let mut o = [0u8; 4];
            o.copy_from_slice(b);
            IpAddr::V4(Ipv4Addr::from(o))
        };
        let asn = if peer_type & 0x02 != 0 {
            r.u32()?
        } else {
            u32::from(r.u16()?)
        };
        peers.push(PeerEntry { bgp_id, addr, asn });
    }

    Ok(PeerTable {
        collector_id,
        view_name,
        peers,
    })
}

/// Parse a unicast RIB record. The address family comes from the
/// subtype.
pub fn parse_rib(subtype: u16, body: Bytes) -> Result<RibRecord, MrtError> {
    let afi = match subtype {
        TD2_RIB_IPV4_UNICAST => Afi::Ipv4,
        TD2_RIB_IPV6_UNICAST => Afi::Ipv6,
        other => {
            return Err(MrtError::UnsupportedSubtype {
                mrt_type: super::MRT_TABLE_DUMP_V2,
                subtype: other,
            })
        }
    };
    let mut r = Reader {
        body,
        pos: 0,
        what: "RIB",
    };
    let sequence = r.u32()?;
    let bitlen = r.u8()?;
    let nbytes = usize::from(bitlen).div_ceil(8);
    let prefix = {
        let packed = r.take(nbytes)?;
        NetAddr::from_packed(afi, bitlen, packed).map_err(|_| MrtError::Malformed("RIB prefix"))?
    };
    let entry_count = usize::from(r.u16()?);

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let peer_index = r.u16()?;
        let originated = r.u32()?;
        let attr_len = usize::from(r.u16()?);
        let start = r.pos;
        r.take(attr_len)?;
        entries.push(RibEntry {
            peer_index,
            originated,
            attrs: r.body.slice(start..start + attr_len),
        });
    }

    Ok(RibRecord {
        sequence,
        prefix,
        entries,
    })
}

/// Rebuild the UPDATE a RIB entry stands for: its attributes plus the
/// record prefix as NLRI. RIB entries always encode 4-byte AS_PATH
/// entries (RFC 6396), and their MP_REACH_NLRI carries only a next hop,
/// so it is dropped in favour of one that announces the prefix.
pub fn synthesize_update(prefix: &NetAddr, attrs: &[u8]) -> Result<BgpMessage, BgpError> {
    let mut builder = UpdateBuilder::new();
    for attr in AttrIter::new(attrs) {
        let attr = attr?;
        if attr.code != ATTR_MP_REACH_NLRI {
            builder = builder.raw_attr(attr.flags, attr.code, attr.data);
        }
    }
    builder.announce(*prefix).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::{PathMode, ATTR_ORIGIN};

    fn pfx(s: &str) -> NetAddr {
        s.parse().unwrap()
    }

    fn make_peer_index_body() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x0a0b0c0du32.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(b"view");
        out.extend_from_slice(&2u16.to_be_bytes());
        // peer 0: v4 address, 2-byte AS
        out.push(0x00);
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&Ipv4Addr::new(192, 0, 2, 1).octets());
        out.extend_from_slice(&65000u16.to_be_bytes());
        // peer 1: v6 address, 4-byte AS
        out.push(0x03);
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        out.extend_from_slice(&196608u32.to_be_bytes());
        out
    }

    #[test]
    fn test_parse_peer_index() {
        let table = parse_peer_index(Bytes::from(make_peer_index_body())).unwrap();
        assert_eq!(table.collector_id, 0x0a0b0c0d);
        assert_eq!(table.view_name, "view");
        assert_eq!(table.peers.len(), 2);
        assert_eq!(table.get(0).unwrap().asn, 65000);
        assert_eq!(table.get(1).unwrap().asn, 196608);
        assert!(matches!(table.get(1).unwrap().addr, IpAddr::V6(_)));
        assert!(table.get(2).is_none());
    }

    #[test]
    fn test_parse_rib_v4() {
        let update = UpdateBuilder::new()
            .origin(0)
            .as_path(&[64512, 64513])
            .build()
            .unwrap();
        // extract the raw attribute block from the built update
        let attrs: Vec<u8> = {
            let mut out = Vec::new();
            for attr in update.attributes() {
                let attr = attr.unwrap();
                out.push(attr.flags);
                out.push(attr.code);
                out.push(attr.data.len() as u8);
                out.extend_from_slice(attr.data);
            }
            out
        };

        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_be_bytes());
        body.push(16);
        body.extend_from_slice(&[10, 1]);
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // peer index
        body.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        body.extend_from_slice(&attrs);

        let rib = parse_rib(TD2_RIB_IPV4_UNICAST, Bytes::from(body)).unwrap();
        assert_eq!(rib.sequence, 7);
        assert!(rib.prefix.naddr_eq(&pfx("10.1.0.0/16")));
        assert_eq!(rib.entries.len(), 1);

        let synth = synthesize_update(&rib.prefix, &rib.entries[0].attrs).unwrap();
        let nlri: Vec<NetAddr> = synth.nlri(true).map(|r| r.unwrap()).collect();
        assert_eq!(nlri, vec![pfx("10.1.0.0/16")]);
        let path: Vec<u32> = synth
            .as_path(PathMode::Real)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(path, vec![64512, 64513]);
        assert!(synth.has_attr(ATTR_ORIGIN).unwrap());
    }

    #[test]
    fn test_synthesized_v6_announces_via_mp() {
        let prefix = pfx("2001:db8::/32");
        let synth = synthesize_update(&prefix, &[]).unwrap();
        assert_eq!(synth.nlri(false).count(), 0);
        let nlri: Vec<NetAddr> = synth.nlri(true).map(|r| r.unwrap()).collect();
        assert_eq!(nlri, vec![prefix]);
    }

    #[test]
    fn test_multicast_subtype_unsupported() {
        assert!(matches!(
            parse_rib(TD2_RIB_IPV4_MULTICAST, Bytes::new()),
            Err(MrtError::UnsupportedSubtype { subtype: 3, .. })
        ));
    }

    #[test]
    fn test_truncated_peer_table() {
        let mut body = make_peer_index_body();
        body.truncate(body.len() - 3);
        assert!(matches!(
            parse_peer_index(Bytes::from(body)),
            Err(MrtError::Malformed(_))
        ));
    }
}
