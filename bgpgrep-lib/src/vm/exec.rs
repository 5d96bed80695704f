//! The interpreter: a fetch/decode/dispatch loop over 16-bit words.
//!
//! Errors are plain `Result` values threaded through the loop; every exit
//! path, normal or erroneous, settles the pending message iterator before
//! returning. `EXARG` prefixes are folded away in the fetch step, so the
//! dispatch match only ever sees an opcode and its effective argument.

use std::collections::VecDeque;

use crate::bgp::{AsPathIter, BgpMessage, PathMode, PrefixIter};
use crate::error::{BgpError, VmError};
use crate::netaddr::{Afi, WideAs, AS_ANY};

use super::op::{self, access, op as opc};
use super::{Cell, Vm, VM_TMPTRIE, VM_TMPTRIE6};

/// A registered native function, invoked by `CALL`.
pub type Intrinsic = fn(&mut Exec<'_, '_>) -> Result<(), VmError>;

/// The tracked message iterator: opened lazily by the first opcode that
/// needs it, continued by opcodes declaring the same access mask, and
/// closed by `settle`.
enum Accessor<'m> {
    Prefixes { mask: u8, iter: PrefixIter<'m> },
    Path { mask: u8, iter: AsPathIter<'m> },
}

enum Flow {
    Continue,
    Halt(bool),
}

#[derive(Clone, Copy)]
enum Rel {
    Exact,
    Subnet,
    Supernet,
    Related,
}

/// Per-execution interpreter state. Intrinsics receive this.
pub struct Exec<'v, 'm> {
    pub(crate) vm: &'v mut Vm,
    pub(crate) msg: &'m BgpMessage,
    pc: usize,
    curblk: u32,
    accessor: Option<Accessor<'m>>,
}

fn map_bgp(e: BgpError) -> VmError {
    match e {
        BgpError::UnknownFamily(_) => VmError::SurprisingBytes,
        _ => VmError::BadPacket,
    }
}

pub(crate) fn run(vm: &mut Vm, msg: &BgpMessage) -> Result<bool, VmError> {
    vm.stack.clear();
    vm.heap.reset_temp();
    vm.curtrie = VM_TMPTRIE;
    vm.curtrie6 = VM_TMPTRIE6;
    vm.tries[VM_TMPTRIE].clear();
    vm.tries[VM_TMPTRIE6].clear();

    let mut ex = Exec {
        vm,
        msg,
        pc: 0,
        curblk: 0,
        accessor: None,
    };
    let outcome = ex.dispatch();
    ex.settle();
    let curblk = ex.curblk;
    let Exec { vm, .. } = ex;

    if let Some(verdict) = outcome? {
        return Ok(verdict);
    }
    if curblk > 0 {
        return Err(VmError::DanglingBlk);
    }
    Ok(vm.pop()?.as_value()? != 0)
}

impl<'v, 'm> Exec<'v, 'm> {
    /// The VM this execution runs on.
    pub fn vm(&mut self) -> &mut Vm {
        self.vm
    }

    /// The message installed as the current packet.
    pub fn message(&self) -> &'m BgpMessage {
        self.msg
    }

    pub fn require_update(&self) -> Result<(), VmError> {
        if !self.msg.is_update() {
            return Err(VmError::PacketMismatch);
        }
        Ok(())
    }

    /// Close the pending message iterator.
    pub fn settle(&mut self) {
        self.accessor = None;
    }

    fn dispatch(&mut self) -> Result<Option<bool>, VmError> {
        let mut exarg: u32 = 0;
        loop {
            let Some(&word) = self.vm.code.get(self.pc) else {
                return Ok(None);
            };
            self.pc += 1;
            let opcode = op::opcode(word);
            let arg8 = op::arg(word);
            if opcode == opc::EXARG {
                exarg = (exarg << 8) | u32::from(arg8);
                continue;
            }
            let arg = ((exarg << 8) | u32::from(arg8)) & op::ARG_MASK;
            exarg = 0;
            tracing::trace!(pc = self.pc - 1, opcode, arg, "dispatch");
            match self.execute(opcode, arg)? {
                Flow::Continue => {}
                Flow::Halt(verdict) => return Ok(Some(verdict)),
            }
        }
    }

    fn execute(&mut self, opcode: u8, arg: u32) -> Result<Flow, VmError> {
        match opcode {
            opc::NOP => {}

            opc::BLK => self.curblk += 1,

            opc::ENDBLK => {
                if self.curblk == 0 {
                    return Err(VmError::SpuriousEndblk);
                }
                self.curblk -= 1;
            }

            opc::LOAD => self.vm.push(Cell::Val(i64::from(arg)))?,

            opc::LOADK => {
                let cell = self.vm.constant(arg)?;
                self.vm.push(cell)?;
            }

            opc::UNPACK => {
                let Cell::Arr { base, nels } = self.vm.pop()? else {
                    return Err(VmError::CellMismatch);
                };
                self.vm.heap.check_array(base, nels)?;
                for i in 0..nels {
                    let el = self.vm.heap.get(base + i)?;
                    self.vm.push(el)?;
                }
            }

            opc::STORE => {
                let addr = self.vm.pop()?.as_addr()?;
                let slot = self.cur_trie_slot(addr.afi());
                self.vm.tries[slot]
                    .insert(&addr)
                    .map_err(|_| VmError::TrieMismatch)?;
            }

            opc::DISCARD => {
                let addr = self.vm.pop()?.as_addr()?;
                let slot = self.cur_trie_slot(addr.afi());
                self.vm.tries[slot].remove(&addr);
            }

            opc::NOT => {
                let top = self.vm.peek_mut()?;
                let v = top.as_value()?;
                *top = Cell::Val(i64::from(v == 0));
            }

            opc::CPASS => {
                let v = self.vm.peek()?.as_value()?;
                if v != 0 {
                    if self.curblk == 0 {
                        return Ok(Flow::Halt(true));
                    }
                    self.skip_to_endblk()?;
                } else {
                    self.vm.pop()?;
                }
            }

            opc::CFAIL => {
                let v = self.vm.peek()?.as_value()?;
                if v != 0 {
                    if self.curblk == 0 {
                        return Ok(Flow::Halt(false));
                    }
                    *self.vm.peek_mut()? = Cell::Val(0);
                    self.skip_to_endblk()?;
                } else {
                    self.vm.pop()?;
                }
            }

            opc::SETTLE => self.settle(),

            opc::HASATTR => {
                self.require_update()?;
                let code = (arg & 0xff) as u8;
                let has = self.msg.has_attr(code).map_err(map_bgp)?;
                self.vm.push(Cell::Val(i64::from(has)))?;
            }

            opc::EXACT => self.prefix_match(arg as u8, Rel::Exact)?,
            opc::SUBNET => self.prefix_match(arg as u8, Rel::Subnet)?,
            opc::SUPERNET => self.prefix_match(arg as u8, Rel::Supernet)?,
            opc::RELATED => self.prefix_match(arg as u8, Rel::Related)?,

            opc::PFXCONTAINS | opc::ADDRCONTAINS | opc::ASCONTAINS => {
                let k = self.vm.constant(arg)?;
                let mut found = false;
                while let Some(cell) = self.vm.stack.pop() {
                    let eq = match opcode {
                        opc::PFXCONTAINS => cell.as_addr()?.prefix_eq(&k.as_addr()?),
                        opc::ADDRCONTAINS => cell.as_addr()?.naddr_eq(&k.as_addr()?),
                        _ => cell.as_wide_as()? == k.as_wide_as()?,
                    };
                    found |= eq;
                }
                self.vm.push(Cell::Val(i64::from(found)))?;
            }

            opc::ASPMATCH | opc::ASPSTARTS | opc::ASPENDS | opc::ASPEXACT => {
                self.require_update()?;
                let pattern = self.pop_as_pattern()?;
                self.ensure_path_accessor(arg as u8)?;
                let mut acc = self.accessor.take();
                let matched = {
                    let Some(Accessor::Path { iter, .. }) = acc.as_mut() else {
                        return Err(VmError::BadAccessor);
                    };
                    match opcode {
                        opc::ASPSTARTS => match_starts(iter, &pattern)?,
                        opc::ASPENDS => match_ends(iter, &pattern)?,
                        opc::ASPEXACT => match_exact(iter, &pattern)?,
                        _ => match_substring(iter, &pattern)?,
                    }
                };
                self.accessor = acc;
                self.vm.push(Cell::Val(i64::from(matched)))?;
            }

            opc::COMMEXACT => {
                self.require_update()?;
                self.settle();
                let mut pattern = Vec::with_capacity(self.vm.stack.len());
                for cell in self.vm.stack.drain(..) {
                    pattern.push(cell.as_comm()?);
                }
                let mut seen = vec![false; pattern.len()];
                let mut seen_count = 0usize;
                for item in self.msg.communities().map_err(map_bgp)? {
                    let comm = item.map_err(map_bgp)?;
                    let slot = pattern
                        .iter()
                        .zip(seen.iter())
                        .position(|(&p, &s)| !s && p == comm);
                    if let Some(i) = slot {
                        seen[i] = true;
                        seen_count += 1;
                        if seen_count == pattern.len() {
                            break;
                        }
                    }
                }
                self.vm
                    .push(Cell::Val(i64::from(seen_count == pattern.len())))?;
            }

            opc::CALL => {
                let func = self
                    .vm
                    .funcs
                    .get(arg as usize)
                    .copied()
                    .flatten()
                    .ok_or(VmError::FuncUndefined)?;
                func(self)?;
            }

            opc::SETTRIE => {
                let idx = arg as usize;
                let trie = self.vm.tries.get(idx).ok_or(VmError::TrieUndefined)?;
                if trie.max_bitlen() != 32 {
                    return Err(VmError::TrieMismatch);
                }
                self.vm.curtrie = idx;
            }

            opc::SETTRIE6 => {
                let idx = arg as usize;
                let trie = self.vm.tries.get(idx).ok_or(VmError::TrieUndefined)?;
                if trie.max_bitlen() != 128 {
                    return Err(VmError::TrieMismatch);
                }
                self.vm.curtrie6 = idx;
            }

            opc::CLRTRIE => {
                let slot = self.vm.curtrie;
                self.vm.tries[slot].clear();
            }

            opc::CLRTRIE6 => {
                let slot = self.vm.curtrie6;
                self.vm.tries[slot].clear();
            }

            opc::ADDRCMP | opc::PFXCMP | opc::ASCMP => {
                let k = self.vm.constant(arg)?;
                let top = self.vm.pop()?;
                let eq = match opcode {
                    opc::ADDRCMP => top.as_addr()?.naddr_eq(&k.as_addr()?),
                    opc::PFXCMP => top.as_addr()?.prefix_eq(&k.as_addr()?),
                    _ => top.as_wide_as()? == k.as_wide_as()?,
                };
                self.vm.push(Cell::Val(i64::from(eq)))?;
            }

            other => return Err(VmError::IllegalOpcode(other)),
        }
        Ok(Flow::Continue)
    }

    fn cur_trie_slot(&self, afi: Afi) -> usize {
        match afi {
            Afi::Ipv4 => self.vm.curtrie,
            Afi::Ipv6 => self.vm.curtrie6,
        }
    }

    /// Scan forward to the `ENDBLK` closing the current block, consuming
    /// it (nesting-aware).
    fn skip_to_endblk(&mut self) -> Result<(), VmError> {
        let mut depth = 1u32;
        while let Some(&word) = self.vm.code.get(self.pc) {
            self.pc += 1;
            match op::opcode(word) {
                opc::BLK => depth += 1,
                opc::ENDBLK => {
                    depth -= 1;
                    if depth == 0 {
                        self.curblk -= 1;
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(VmError::DanglingBlk)
    }

    /// Pop the entire stack as a wide-AS pattern, in push order.
    fn pop_as_pattern(&mut self) -> Result<Vec<WideAs>, VmError> {
        let mut pattern = Vec::with_capacity(self.vm.stack.len());
        for cell in self.vm.stack.drain(..) {
            pattern.push(cell.as_wide_as()?);
        }
        Ok(pattern)
    }

    fn ensure_prefix_accessor(&mut self, requested: u8) -> Result<(), VmError> {
        let want = requested & !access::SETTLE;
        let rewind = requested & access::SETTLE != 0;
        let sel = want & (access::NLRI | access::WITHDRAWN);
        if sel != access::NLRI && sel != access::WITHDRAWN {
            return Err(VmError::BadAccessor);
        }
        if want & !(access::NLRI | access::WITHDRAWN | access::ALL) != 0 {
            return Err(VmError::BadAccessor);
        }
        if !rewind {
            if let Some(Accessor::Prefixes { mask, .. }) = &self.accessor {
                if *mask == want {
                    return Ok(());
                }
            }
        }
        self.settle();
        let all = want & access::ALL != 0;
        let iter = if sel == access::NLRI {
            self.msg.nlri(all)
        } else {
            self.msg.withdrawn(all)
        };
        self.accessor = Some(Accessor::Prefixes { mask: want, iter });
        Ok(())
    }

    fn ensure_path_accessor(&mut self, requested: u8) -> Result<(), VmError> {
        let want = requested & !access::SETTLE;
        let rewind = requested & access::SETTLE != 0;
        let mode = match want {
            x if x == access::AS_PATH => PathMode::AsPath,
            x if x == access::AS4_PATH => PathMode::As4Path,
            x if x == access::REAL_AS_PATH => PathMode::Real,
            _ => return Err(VmError::BadAccessor),
        };
        if !rewind {
            if let Some(Accessor::Path { mask, .. }) = &self.accessor {
                if *mask == want {
                    return Ok(());
                }
            }
        }
        self.settle();
        let iter = self.msg.as_path(mode).map_err(map_bgp)?;
        self.accessor = Some(Accessor::Path { mask: want, iter });
        Ok(())
    }

    fn prefix_match(&mut self, requested: u8, rel: Rel) -> Result<(), VmError> {
        self.require_update()?;
        self.ensure_prefix_accessor(requested)?;
        let mut acc = self.accessor.take();
        let (found, exhausted) = {
            let Some(Accessor::Prefixes { iter, .. }) = acc.as_mut() else {
                return Err(VmError::BadAccessor);
            };
            let mut found = false;
            let mut exhausted = false;
            loop {
                match iter.next() {
                    Some(Ok(addr)) => {
                        let slot = match addr.afi() {
                            Afi::Ipv4 => self.vm.curtrie,
                            Afi::Ipv6 => self.vm.curtrie6,
                        };
                        let trie = &self.vm.tries[slot];
                        let hit = match rel {
                            Rel::Exact => trie.search_exact(&addr).is_some(),
                            Rel::Subnet => trie.is_subnet_of_any(&addr),
                            Rel::Supernet => trie.is_supernet_of_any(&addr),
                            Rel::Related => trie.is_related_of_any(&addr),
                        };
                        if hit {
                            found = true;
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(map_bgp(e)),
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
            (found, exhausted)
        };
        if !exhausted {
            self.accessor = acc;
        }
        self.vm.push(Cell::Val(i64::from(found)))?;
        Ok(())
    }
}

fn atom_matches(atom: WideAs, asn: u32) -> bool {
    atom == AS_ANY || atom == i64::from(asn)
}

fn match_starts(iter: &mut AsPathIter<'_>, pattern: &[WideAs]) -> Result<bool, VmError> {
    for &atom in pattern {
        match iter.next() {
            Some(Ok(asn)) if atom_matches(atom, asn) => {}
            Some(Ok(_)) => return Ok(false),
            Some(Err(e)) => return Err(map_bgp(e)),
            None => return Ok(false),
        }
    }
    Ok(true)
}

fn match_ends(iter: &mut AsPathIter<'_>, pattern: &[WideAs]) -> Result<bool, VmError> {
    let n = pattern.len();
    let mut window: VecDeque<u32> = VecDeque::with_capacity(n + 1);
    for item in iter.by_ref() {
        let asn = item.map_err(map_bgp)?;
        window.push_back(asn);
        if window.len() > n {
            window.pop_front();
        }
    }
    if window.len() < n {
        return Ok(false);
    }
    Ok(window
        .iter()
        .zip(pattern)
        .all(|(&asn, &atom)| atom_matches(atom, asn)))
}

fn match_exact(iter: &mut AsPathIter<'_>, pattern: &[WideAs]) -> Result<bool, VmError> {
    let n = pattern.len();
    let mut matched = 0usize;
    for item in iter.by_ref() {
        let asn = item.map_err(map_bgp)?;
        if matched >= n || !atom_matches(pattern[matched], asn) {
            return Ok(false);
        }
        matched += 1;
    }
    Ok(matched == n)
}

fn match_substring(iter: &mut AsPathIter<'_>, pattern: &[WideAs]) -> Result<bool, VmError> {
    let n = pattern.len();
    if n == 0 {
        return Ok(true);
    }
    let mut window: VecDeque<u32> = VecDeque::with_capacity(n + 1);
    for item in iter.by_ref() {
        let asn = item.map_err(map_bgp)?;
        window.push_back(asn);
        if window.len() > n {
            window.pop_front();
        }
        if window.len() == n
            && window
                .iter()
                .zip(pattern)
                .all(|(&a, &atom)| atom_matches(atom, a))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::UpdateBuilder;
    use crate::netaddr::NetAddr;
    use crate::vm::{K_PEER_AS, KBASESIZ};
    use bytes::Bytes;

    fn pfx(s: &str) -> NetAddr {
        s.parse().unwrap()
    }

    fn update() -> BgpMessage {
        UpdateBuilder::new()
            .origin(0)
            .as_path(&[1, 2, 3, 2, 4])
            .announce(pfx("10.1.0.0/16"))
            .announce(pfx("2001:db8::/32"))
            .build()
            .unwrap()
    }

    fn keepalive() -> BgpMessage {
        let mut wire = vec![0xffu8; 16];
        wire.extend_from_slice(&19u16.to_be_bytes());
        wire.push(crate::bgp::MSG_KEEPALIVE);
        BgpMessage::from_wire(Bytes::from(wire), true).unwrap()
    }

    fn run_program(build: impl FnOnce(&mut Vm), msg: &BgpMessage) -> Result<bool, VmError> {
        let mut vm = Vm::new();
        build(&mut vm);
        vm.execute(msg)
    }

    #[test]
    fn test_terminal_load_is_verdict() {
        assert_eq!(run_program(|vm| vm.emit_arg(opc::LOAD, 1), &update()), Ok(true));
        assert_eq!(run_program(|vm| vm.emit_arg(opc::LOAD, 0), &update()), Ok(false));
    }

    #[test]
    fn test_not_flips_top() {
        let verdict = run_program(
            |vm| {
                vm.emit_arg(opc::LOAD, 1);
                vm.emit(opc::NOT);
            },
            &update(),
        );
        assert_eq!(verdict, Ok(false));
    }

    #[test]
    fn test_cpass_halts_outside_blocks() {
        let verdict = run_program(
            |vm| {
                vm.emit_arg(opc::LOAD, 1);
                vm.emit(opc::CPASS);
                vm.emit_arg(opc::LOAD, 0); // never reached
            },
            &update(),
        );
        assert_eq!(verdict, Ok(true));
    }

    #[test]
    fn test_cfail_halts_outside_blocks() {
        let verdict = run_program(
            |vm| {
                vm.emit_arg(opc::LOAD, 1);
                vm.emit(opc::CFAIL);
                vm.emit_arg(opc::LOAD, 1);
            },
            &update(),
        );
        assert_eq!(verdict, Ok(false));
    }

    #[test]
    fn test_cpass_falsy_pops_and_continues() {
        let verdict = run_program(
            |vm| {
                vm.emit_arg(opc::LOAD, 0);
                vm.emit(opc::CPASS);
                vm.emit_arg(opc::LOAD, 1);
            },
            &update(),
        );
        assert_eq!(verdict, Ok(true));
    }

    #[test]
    fn test_or_block_short_circuit() {
        // BLK; t1; CPASS; t2; ENDBLK; NOT; CFAIL; LOAD 1
        let or_chain = |t1: u32, t2: u32| {
            move |vm: &mut Vm| {
                vm.emit(opc::BLK);
                vm.emit_arg(opc::LOAD, t1);
                vm.emit(opc::CPASS);
                vm.emit_arg(opc::LOAD, t2);
                vm.emit(opc::ENDBLK);
                vm.emit(opc::NOT);
                vm.emit(opc::CFAIL);
                vm.emit_arg(opc::LOAD, 1);
            }
        };
        assert_eq!(run_program(or_chain(1, 0), &update()), Ok(true));
        assert_eq!(run_program(or_chain(0, 1), &update()), Ok(true));
        assert_eq!(run_program(or_chain(0, 0), &update()), Ok(false));
    }

    #[test]
    fn test_cfail_in_block_exits_chain_with_false() {
        // BLK; LOAD 1; CFAIL; LOAD 9; ENDBLK -> the chain yields false
        let verdict = run_program(
            |vm| {
                vm.emit(opc::BLK);
                vm.emit_arg(opc::LOAD, 1);
                vm.emit(opc::CFAIL);
                vm.emit_arg(opc::LOAD, 9);
                vm.emit(opc::ENDBLK);
            },
            &update(),
        );
        assert_eq!(verdict, Ok(false));
    }

    #[test]
    fn test_unbalanced_blocks() {
        assert_eq!(
            run_program(
                |vm| {
                    vm.emit(opc::BLK);
                    vm.emit_arg(opc::LOAD, 1);
                },
                &update()
            ),
            Err(VmError::DanglingBlk)
        );
        assert_eq!(
            run_program(|vm| vm.emit(opc::ENDBLK), &update()),
            Err(VmError::SpuriousEndblk)
        );
    }

    #[test]
    fn test_empty_program_underflows() {
        assert_eq!(run_program(|_| {}, &update()), Err(VmError::StackUnderflow));
    }

    #[test]
    fn test_illegal_opcode() {
        assert_eq!(
            run_program(|vm| vm.emit(0xee), &update()),
            Err(VmError::IllegalOpcode(0xee))
        );
    }

    #[test]
    fn test_undefined_constant_function_trie() {
        assert_eq!(
            run_program(|vm| vm.emit_arg(opc::LOADK, 99), &update()),
            Err(VmError::KUndefined)
        );
        assert_eq!(
            run_program(|vm| vm.emit_arg(opc::CALL, 99), &update()),
            Err(VmError::FuncUndefined)
        );
        assert_eq!(
            run_program(|vm| vm.emit_arg(opc::SETTRIE, 99), &update()),
            Err(VmError::TrieUndefined)
        );
    }

    #[test]
    fn test_settrie_family_check() {
        // slot 1 is the v6 scratch trie
        assert_eq!(
            run_program(|vm| vm.emit_arg(opc::SETTRIE, 1), &update()),
            Err(VmError::TrieMismatch)
        );
        assert_eq!(
            run_program(|vm| vm.emit_arg(opc::SETTRIE6, 0), &update()),
            Err(VmError::TrieMismatch)
        );
    }

    #[test]
    fn test_packet_mismatch_on_non_update() {
        let verdict = run_program(
            |vm| vm.emit_arg(opc::HASATTR, u32::from(crate::bgp::ATTR_ORIGIN)),
            &keepalive(),
        );
        assert_eq!(verdict, Err(VmError::PacketMismatch));
    }

    #[test]
    fn test_unpack_and_bad_array() {
        let verdict = run_program(
            |vm| {
                let arr = vm.alloc_array(&[Cell::Val(0), Cell::Val(1)]).unwrap();
                let k = vm.add_const(arr).unwrap();
                vm.emit_arg(opc::LOADK, k);
                vm.emit(opc::UNPACK);
                // stack now holds [0, 1]; verdict is the top
            },
            &update(),
        );
        assert_eq!(verdict, Ok(true));

        let verdict = run_program(
            |vm| {
                let k = vm.add_const(Cell::Arr { base: 40, nels: 2 }).unwrap();
                vm.emit_arg(opc::LOADK, k);
                vm.emit(opc::UNPACK);
            },
            &update(),
        );
        assert_eq!(verdict, Err(VmError::BadArray));
    }

    #[test]
    fn test_unpack_requires_array_cell() {
        let verdict = run_program(
            |vm| {
                vm.emit_arg(opc::LOAD, 7);
                vm.emit(opc::UNPACK);
            },
            &update(),
        );
        assert_eq!(verdict, Err(VmError::CellMismatch));
    }

    #[test]
    fn test_store_and_prefix_query_on_scratch_trie() {
        // STORE 10.0.0.0/8 into the scratch trie, then SUBNET over NLRI
        let verdict = run_program(
            |vm| {
                let k = vm.add_const(Cell::Addr(pfx("10.0.0.0/8"))).unwrap();
                vm.emit_arg(opc::LOADK, k);
                vm.emit(opc::STORE);
                vm.emit_arg(
                    opc::SUBNET,
                    u32::from(access::SETTLE | access::NLRI),
                );
            },
            &update(),
        );
        assert_eq!(verdict, Ok(true));
    }

    #[test]
    fn test_scratch_tries_cleared_between_runs() {
        let mut vm = Vm::new();
        let k = vm.add_const(Cell::Addr(pfx("10.0.0.0/8"))).unwrap();
        vm.emit_arg(opc::SUBNET, u32::from(access::SETTLE | access::NLRI));
        vm.emit(opc::CPASS);
        // populate the scratch trie *after* the query, so a second run
        // only matches if state leaked
        vm.emit_arg(opc::LOADK, k);
        vm.emit(opc::STORE);
        vm.emit_arg(opc::LOAD, 0);
        let msg = update();
        assert_eq!(vm.execute(&msg), Ok(false));
        assert_eq!(vm.execute(&msg), Ok(false));
    }

    #[test]
    fn test_bad_accessor_combinations() {
        let verdict = run_program(
            |vm| {
                vm.emit_arg(
                    opc::EXACT,
                    u32::from(access::NLRI | access::WITHDRAWN),
                );
            },
            &update(),
        );
        assert_eq!(verdict, Err(VmError::BadAccessor));

        let verdict = run_program(
            |vm| {
                vm.emit_arg(
                    opc::ASPMATCH,
                    u32::from(access::AS_PATH | access::AS4_PATH),
                );
            },
            &update(),
        );
        assert_eq!(verdict, Err(VmError::BadAccessor));
    }

    #[test]
    fn test_aspmatch_continuation_slides_forward() {
        // path is [1, 2, 3, 2, 4]; two chained searches for "2" succeed,
        // a third finds nothing further to the right
        let chain = |searches: u32| {
            move |vm: &mut Vm| {
                for i in 0..searches {
                    vm.emit_arg(opc::LOAD, 2);
                    let acc = if i == 0 {
                        access::REAL_AS_PATH | access::SETTLE
                    } else {
                        access::REAL_AS_PATH
                    };
                    vm.emit_arg(opc::ASPMATCH, u32::from(acc));
                    if i + 1 < searches {
                        vm.emit(opc::NOT);
                        vm.emit(opc::CFAIL);
                    }
                }
            }
        };
        assert_eq!(run_program(chain(1), &update()), Ok(true));
        assert_eq!(run_program(chain(2), &update()), Ok(true));
        assert_eq!(run_program(chain(3), &update()), Ok(false));
    }

    #[test]
    fn test_settle_flag_rewinds_the_scan() {
        let verdict = run_program(
            |vm| {
                for _ in 0..3 {
                    vm.emit_arg(opc::LOAD, 2);
                    vm.emit_arg(
                        opc::ASPMATCH,
                        u32::from(access::REAL_AS_PATH | access::SETTLE),
                    );
                    vm.emit(opc::NOT);
                    vm.emit(opc::CFAIL);
                }
                vm.emit_arg(opc::LOAD, 1);
            },
            &update(),
        );
        assert_eq!(verdict, Ok(true));
    }

    #[test]
    fn test_ascontains_against_peer_constant() {
        let mut vm = Vm::new();
        vm.set_peer_as_filter(vec![65000, 65010]);
        vm.emit_arg(opc::CALL, crate::vm::FN_PEER_AS_LIST);
        vm.emit_arg(opc::ASCONTAINS, K_PEER_AS);
        let msg = update();

        vm.set_peer(65010, NetAddr::host("192.0.2.1".parse().unwrap()));
        assert_eq!(vm.execute(&msg), Ok(true));
        vm.set_peer(64999, NetAddr::host("192.0.2.1".parse().unwrap()));
        assert_eq!(vm.execute(&msg), Ok(false));
    }

    #[test]
    fn test_cmp_ops_replace_top() {
        let mut vm = Vm::new();
        let k = vm.add_const(Cell::As(65000)).unwrap();
        assert_eq!(k as usize, KBASESIZ);
        vm.emit_arg(opc::LOAD, 65000);
        vm.emit_arg(opc::ASCMP, k);
        assert_eq!(vm.execute(&update()), Ok(true));

        let mut vm = Vm::new();
        let a = vm.add_const(Cell::Addr(pfx("10.0.0.0/8"))).unwrap();
        let b = vm.add_const(Cell::Addr(pfx("10.0.0.0/8"))).unwrap();
        vm.emit_arg(opc::LOADK, a);
        vm.emit_arg(opc::PFXCMP, b);
        assert_eq!(vm.execute(&update()), Ok(true));
    }

    #[test]
    fn test_commexact_empty_pattern_is_true() {
        let verdict = run_program(|vm| vm.emit(opc::COMMEXACT), &update());
        assert_eq!(verdict, Ok(true));
    }

    #[test]
    fn test_exarg_extends_argument() {
        // LOADK with an index that needs an EXARG prefix
        let mut vm = Vm::new();
        let mut k = 0;
        for i in 0..400 {
            k = vm.add_const(Cell::Val(i)).unwrap();
        }
        vm.emit_arg(opc::LOADK, k);
        assert!(vm.code().len() > 1); // EXARG emitted
        assert_eq!(vm.execute(&update()), Ok(true));
    }
}
