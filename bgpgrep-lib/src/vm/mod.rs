//! The packet-filter virtual machine.
//!
//! A [`Vm`] holds one compiled filter program plus everything it needs at
//! run time: the cell stack, the constant pool, the two-zone heap, the
//! trie array, and the intrinsic table. It is built once per invocation
//! and executed once per decoded BGP UPDATE; execution resets the stack,
//! scratch tries, and transient heap but preserves code, constants, the
//! permanent heap, and user-populated tries.

pub mod exec;
pub mod heap;
pub mod intrinsics;
pub mod op;

use crate::bgp::BgpMessage;
use crate::error::VmError;
use crate::netaddr::{Afi, Community, NetAddr, WideAs};
use crate::trie::PrefixTrie;

use heap::Heap;

pub use exec::{Exec, Intrinsic};

/// Reserved constant-pool slot: peer AS of the current record.
pub const K_PEER_AS: u32 = 0;
/// Reserved constant-pool slot: peer address of the current record.
pub const K_PEER_ADDR: u32 = 1;
/// Number of reserved constant-pool slots.
pub const KBASESIZ: usize = 2;

/// Scratch trie slots, cleared at the start of every execution.
pub const VM_TMPTRIE: usize = 0;
pub const VM_TMPTRIE6: usize = 1;

/// Default intrinsic slots.
pub const FN_PEER_AS_LIST: u32 = 0;
pub const FN_PEER_ADDR_LIST: u32 = 1;
pub const FN_FIND_LOOPS: u32 = 2;

const STACK_CEILING: usize = 4096;
const K_CEILING: usize = 1 << 16;

/// One stack slot: an address, a wide AS number, a community, a plain
/// value, or a descriptor of a cell array on the VM heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Val(i64),
    As(WideAs),
    Addr(NetAddr),
    Comm(Community),
    Arr { base: u32, nels: u32 },
}

impl Cell {
    /// The cell as a plain value, for truth tests.
    pub fn as_value(&self) -> Result<i64, VmError> {
        match self {
            Cell::Val(v) | Cell::As(v) => Ok(*v),
            Cell::Comm(c) => Ok(i64::from(*c)),
            _ => Err(VmError::CellMismatch),
        }
    }

    pub fn as_wide_as(&self) -> Result<WideAs, VmError> {
        match self {
            Cell::As(v) | Cell::Val(v) => Ok(*v),
            _ => Err(VmError::CellMismatch),
        }
    }

    pub fn as_addr(&self) -> Result<NetAddr, VmError> {
        match self {
            Cell::Addr(a) => Ok(*a),
            _ => Err(VmError::CellMismatch),
        }
    }

    pub fn as_comm(&self) -> Result<Community, VmError> {
        match self {
            Cell::Comm(c) => Ok(*c),
            Cell::Val(v) => u32::try_from(*v).map_err(|_| VmError::CellMismatch),
            _ => Err(VmError::CellMismatch),
        }
    }
}

/// The filter VM.
pub struct Vm {
    pub(crate) code: Vec<u16>,
    pub(crate) consts: Vec<Cell>,
    pub(crate) stack: Vec<Cell>,
    pub(crate) heap: Heap,
    pub(crate) tries: Vec<PrefixTrie>,
    pub(crate) funcs: Vec<Option<Intrinsic>>,
    pub(crate) curtrie: usize,
    pub(crate) curtrie6: usize,
    /// Peer-AS filter set, pushed by the `FN_PEER_AS_LIST` intrinsic.
    pub(crate) peer_as_list: Vec<WideAs>,
    /// Peer-address filter set, pushed by the `FN_PEER_ADDR_LIST` intrinsic.
    pub(crate) peer_addr_list: Vec<NetAddr>,
}

impl Vm {
    /// A fresh VM: scratch tries in slots 0 and 1, reserved constants,
    /// default intrinsics installed, empty program.
    pub fn new() -> Self {
        Vm {
            code: Vec::new(),
            consts: vec![Cell::Val(0); KBASESIZ],
            stack: Vec::new(),
            heap: Heap::new(),
            tries: vec![PrefixTrie::new(Afi::Ipv4), PrefixTrie::new(Afi::Ipv6)],
            funcs: vec![
                Some(intrinsics::peer_as_list as Intrinsic),
                Some(intrinsics::peer_addr_list as Intrinsic),
                Some(intrinsics::find_loops as Intrinsic),
            ],
            curtrie: VM_TMPTRIE,
            curtrie6: VM_TMPTRIE6,
            peer_as_list: Vec::new(),
            peer_addr_list: Vec::new(),
        }
    }

    /// Install the per-record peer constants before execution.
    pub fn set_peer(&mut self, peer_as: u32, peer_addr: NetAddr) {
        self.consts[K_PEER_AS as usize] = Cell::As(i64::from(peer_as));
        self.consts[K_PEER_ADDR as usize] = Cell::Addr(peer_addr);
    }

    /// Append a constant; `None` when the pool is exhausted.
    pub fn add_const(&mut self, cell: Cell) -> Option<u32> {
        if self.consts.len() >= K_CEILING {
            return None;
        }
        self.consts.push(cell);
        Some((self.consts.len() - 1) as u32)
    }

    pub(crate) fn constant(&self, idx: u32) -> Result<Cell, VmError> {
        self.consts
            .get(idx as usize)
            .copied()
            .ok_or(VmError::KUndefined)
    }

    /// Add a trie for the given family; returns its slot index.
    pub fn add_trie(&mut self, afi: Afi) -> u32 {
        self.tries.push(PrefixTrie::new(afi));
        (self.tries.len() - 1) as u32
    }

    /// Install a pre-populated trie; returns its slot index.
    pub fn install_trie(&mut self, trie: PrefixTrie) -> u32 {
        self.tries.push(trie);
        (self.tries.len() - 1) as u32
    }

    /// Set the peer-AS list served by the `FN_PEER_AS_LIST` intrinsic.
    pub fn set_peer_as_filter(&mut self, list: Vec<WideAs>) {
        self.peer_as_list = list;
    }

    /// Set the peer-address list served by the `FN_PEER_ADDR_LIST`
    /// intrinsic.
    pub fn set_peer_addr_filter(&mut self, list: Vec<NetAddr>) {
        self.peer_addr_list = list;
    }

    pub fn trie_mut(&mut self, idx: u32) -> Option<&mut PrefixTrie> {
        self.tries.get_mut(idx as usize)
    }

    /// Copy `cells` into the permanent heap and return the array
    /// descriptor cell for them.
    pub fn alloc_array(&mut self, cells: &[Cell]) -> Result<Cell, VmError> {
        let base = self.heap.alloc_perm(cells)?;
        Ok(Cell::Arr {
            base,
            nels: cells.len() as u32,
        })
    }

    /// Append an argumentless opcode.
    pub fn emit(&mut self, opcode: u8) {
        self.code.push(op::encode(opcode, 0));
    }

    /// Append an opcode with an up-to-31-bit argument.
    pub fn emit_arg(&mut self, opcode: u8, arg: u32) {
        op::emit(&mut self.code, opcode, arg);
    }

    pub fn code(&self) -> &[u16] {
        &self.code
    }

    pub fn disassemble(&self) -> String {
        op::disassemble(&self.code)
    }

    /// Run the filter over one decoded message.
    pub fn execute(&mut self, msg: &BgpMessage) -> Result<bool, VmError> {
        exec::run(self, msg)
    }

    pub(crate) fn push(&mut self, cell: Cell) -> Result<(), VmError> {
        if self.stack.len() >= STACK_CEILING {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(cell);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Cell, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    pub(crate) fn peek(&self) -> Result<&Cell, VmError> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    pub(crate) fn peek_mut(&mut self) -> Result<&mut Cell, VmError> {
        self.stack.last_mut().ok_or(VmError::StackUnderflow)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vm_shape() {
        let vm = Vm::new();
        assert_eq!(vm.tries.len(), 2);
        assert_eq!(vm.tries[VM_TMPTRIE].max_bitlen(), 32);
        assert_eq!(vm.tries[VM_TMPTRIE6].max_bitlen(), 128);
        assert_eq!(vm.consts.len(), KBASESIZ);
        assert_eq!(vm.funcs.len(), 3);
    }

    #[test]
    fn test_add_const_and_lookup() {
        let mut vm = Vm::new();
        let k = vm.add_const(Cell::Val(42)).unwrap();
        assert_eq!(k, KBASESIZ as u32);
        assert_eq!(vm.constant(k).unwrap(), Cell::Val(42));
        assert_eq!(vm.constant(999), Err(VmError::KUndefined));
    }

    #[test]
    fn test_cell_kind_accessors() {
        assert_eq!(Cell::Val(1).as_value().unwrap(), 1);
        assert_eq!(Cell::As(-1).as_wide_as().unwrap(), -1);
        assert_eq!(Cell::Comm(7).as_value().unwrap(), 7);
        assert_eq!(Cell::Val(7).as_comm().unwrap(), 7);
        assert!(Cell::Val(-1).as_comm().is_err());
        assert!(Cell::Val(0).as_addr().is_err());
        let a: NetAddr = "10.0.0.0/8".parse().unwrap();
        assert!(Cell::Addr(a).as_addr().is_ok());
        assert!(Cell::Addr(a).as_value().is_err());
    }

    #[test]
    fn test_stack_ceiling() {
        let mut vm = Vm::new();
        for _ in 0..STACK_CEILING {
            vm.push(Cell::Val(0)).unwrap();
        }
        assert_eq!(vm.push(Cell::Val(0)), Err(VmError::StackOverflow));
    }
}
