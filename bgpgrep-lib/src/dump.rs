//! Output formatters: the pipe-separated text dump, the C-array hex
//! dump, and the peer-index listing.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};

use crate::bgp::{BgpMessage, PathMode, ATTR_ORIGIN};
use crate::error::Result;
use crate::mrt::table_dump::PeerTable;

/// Per-record context threaded into the text dump.
pub struct DumpCtx {
    /// First output column: `BGP4MP` or `TABLE_DUMP2`.
    pub tag: &'static str,
    pub timestamp: u32,
    pub peer_addr: IpAddr,
    pub peer_as: u32,
}

fn origin_str(msg: &BgpMessage) -> Result<&'static str> {
    let Some(attr) = msg.find_attr(ATTR_ORIGIN)? else {
        return Ok("");
    };
    Ok(match attr.data.first() {
        Some(0) => "IGP",
        Some(1) => "EGP",
        _ => "INCOMPLETE",
    })
}

/// One line per prefix, bgpdump-flavoured:
/// `TAG|ts|A|peer|peer-as|prefix|as-path|origin` for announcements,
/// `TAG|ts|W|peer|peer-as|prefix` for withdrawals.
pub fn dump_text<W: Write + ?Sized>(out: &mut W, ctx: &DumpCtx, msg: &BgpMessage) -> Result<()> {
    let head = format!(
        "{}|{}|{}|{}",
        ctx.tag, ctx.timestamp, ctx.peer_addr, ctx.peer_as
    );

    for prefix in msg.withdrawn(true) {
        let prefix = prefix?;
        writeln!(out, "{}|W|{}", head, prefix)?;
    }

    let mut path = String::new();
    for asn in msg.as_path(PathMode::Real)? {
        let asn = asn?;
        if !path.is_empty() {
            path.push(' ');
        }
        path.push_str(&asn.to_string());
    }
    let origin = origin_str(msg)?;

    for prefix in msg.nlri(true) {
        let prefix = prefix?;
        writeln!(out, "{}|A|{}|{}|{}", head, prefix, path, origin)?;
    }
    Ok(())
}

/// Dump one message as a C unsigned-char array, 16 bytes per row.
pub fn dump_hex<W: Write + ?Sized>(out: &mut W, index: usize, data: &[u8]) -> std::io::Result<()> {
    writeln!(out, "static const unsigned char packet_{index}[{}] = {{", data.len())?;
    for row in data.chunks(16) {
        let mut line = String::with_capacity(4 + row.len() * 6);
        line.push_str("    ");
        for byte in row {
            line.push_str(&format!("0x{byte:02x}, "));
        }
        writeln!(out, "{}", line.trim_end())?;
    }
    writeln!(out, "}};")?;
    Ok(())
}

/// `-f`: list the decoded peer index table.
pub fn dump_peer_table<W: Write + ?Sized>(out: &mut W, table: &PeerTable) -> std::io::Result<()> {
    let collector = Ipv4Addr::from(table.collector_id);
    for (index, peer) in table.peers.iter().enumerate() {
        writeln!(
            out,
            "PEER_INDEX_TABLE|{}|{}|{}|{}|{}",
            collector, table.view_name, index, peer.addr, peer.asn
        )?;
    }
    Ok(())
}
