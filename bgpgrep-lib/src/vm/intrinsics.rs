//! Default native functions installed in every VM.
//!
//! The two accumulators push the host-side peer filter sets onto the
//! stack on demand, keeping those lists out of bytecode. Loop detection
//! materializes the reconstructed AS path into the transient heap zone
//! and scans it for a non-prepending repeat.

use crate::bgp::PathMode;
use crate::error::{BgpError, VmError};
use crate::netaddr::AS_TRANS;

use super::exec::Exec;
use super::Cell;

fn map_bgp(e: BgpError) -> VmError {
    match e {
        BgpError::UnknownFamily(_) => VmError::SurprisingBytes,
        _ => VmError::BadPacket,
    }
}

/// Push every configured peer AS onto the stack.
pub fn peer_as_list(ex: &mut Exec<'_, '_>) -> Result<(), VmError> {
    for i in 0..ex.vm.peer_as_list.len() {
        let asn = ex.vm.peer_as_list[i];
        ex.vm.push(Cell::As(asn))?;
    }
    Ok(())
}

/// Push every configured peer address onto the stack.
pub fn peer_addr_list(ex: &mut Exec<'_, '_>) -> Result<(), VmError> {
    for i in 0..ex.vm.peer_addr_list.len() {
        let addr = ex.vm.peer_addr_list[i];
        ex.vm.push(Cell::Addr(addr))?;
    }
    Ok(())
}

/// Push true iff the real AS path contains a loop: some AS appears at two
/// non-adjacent positions. Consecutive repeats are prepending, not loops,
/// and `AS_TRANS` placeholders are ignored on both sides of the
/// comparison.
pub fn find_loops(ex: &mut Exec<'_, '_>) -> Result<(), VmError> {
    ex.require_update()?;
    ex.settle();

    let base = ex.vm.heap.alloc_temp(0)?;
    let mut n: u32 = 0;
    let msg = ex.msg;
    for item in msg.as_path(PathMode::Real).map_err(map_bgp)? {
        let asn = item.map_err(map_bgp)?;
        ex.vm.heap.grow_temp(base, n as usize + 1)?;
        ex.vm.heap.set(base + n, Cell::As(i64::from(asn)))?;
        n += 1;
    }

    let trans = i64::from(AS_TRANS);
    let mut found = false;
    'outer: for i in 2..n {
        let here = ex.vm.heap.get(base + i)?.as_wide_as()?;
        if here == trans {
            continue;
        }
        let prev = ex.vm.heap.get(base + i - 1)?.as_wide_as()?;
        if here == prev {
            continue; // prepending
        }
        for j in 0..i - 1 {
            let earlier = ex.vm.heap.get(base + j)?.as_wide_as()?;
            if earlier == trans {
                continue;
            }
            if earlier == here {
                found = true;
                break 'outer;
            }
        }
    }

    ex.vm.heap.return_temp(n as usize)?;
    ex.vm.push(Cell::Val(i64::from(found)))?;
    Ok(())
}
