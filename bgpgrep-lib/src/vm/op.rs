//! Bytecode format of the filter VM.
//!
//! Instructions are fixed 16-bit words: low 8 bits opcode, high 8 bits
//! argument. Arguments wider than 8 bits are carried by one or more
//! `EXARG` prefix instructions, each holding the next-most-significant
//! byte; the effective argument is the concatenation, masked to 31 bits,
//! consumed by the next non-`EXARG` opcode.

/// Opcodes (8 bits).
pub mod op {
    pub const NOP: u8 = 0;
    pub const BLK: u8 = 1;
    pub const ENDBLK: u8 = 2;
    /// Push an integer value (extended argument).
    pub const LOAD: u8 = 3;
    /// Push a constant-pool entry (extended argument).
    pub const LOADK: u8 = 4;
    /// Pop an array descriptor; push its elements in order.
    pub const UNPACK: u8 = 5;
    /// Extended-argument prefix.
    pub const EXARG: u8 = 6;
    /// Pop an address; insert it into the current trie of its family.
    pub const STORE: u8 = 7;
    /// Pop an address; remove it from the current trie of its family.
    pub const DISCARD: u8 = 8;
    pub const NOT: u8 = 9;
    pub const CPASS: u8 = 10;
    pub const CFAIL: u8 = 11;
    /// Close the pending message iterator, if any.
    pub const SETTLE: u8 = 12;
    /// Push true iff the UPDATE carries the attribute in the argument.
    pub const HASATTR: u8 = 13;
    pub const EXACT: u8 = 14;
    pub const SUBNET: u8 = 15;
    pub const SUPERNET: u8 = 16;
    pub const RELATED: u8 = 17;
    pub const PFXCONTAINS: u8 = 18;
    pub const ADDRCONTAINS: u8 = 19;
    pub const ASCONTAINS: u8 = 20;
    pub const ASPMATCH: u8 = 21;
    pub const ASPSTARTS: u8 = 22;
    pub const ASPENDS: u8 = 23;
    pub const ASPEXACT: u8 = 24;
    pub const COMMEXACT: u8 = 25;
    pub const CALL: u8 = 26;
    pub const SETTRIE: u8 = 27;
    pub const SETTRIE6: u8 = 28;
    pub const CLRTRIE: u8 = 29;
    pub const CLRTRIE6: u8 = 30;
    pub const ADDRCMP: u8 = 31;
    pub const PFXCMP: u8 = 32;
    pub const ASCMP: u8 = 33;
}

/// Access-mask bits carried in the argument of packet-iterating opcodes.
/// Values are per opcode family: the prefix constants apply to
/// `EXACT`..`RELATED`, the path constants to the `ASP*` matchers.
pub mod access {
    pub const NLRI: u8 = 0x01;
    pub const WITHDRAWN: u8 = 0x02;
    /// Widen to the all-address-families variant (MP attributes).
    pub const ALL: u8 = 0x04;

    pub const AS_PATH: u8 = 0x01;
    pub const AS4_PATH: u8 = 0x02;
    pub const REAL_AS_PATH: u8 = 0x04;

    pub const COMM: u8 = 0x01;

    /// Rewind flag: close the pending iterator before opening this one.
    pub const SETTLE: u8 = 0x80;
}

/// Effective arguments are masked to 31 bits.
pub const ARG_MASK: u32 = 0x7fff_ffff;

#[inline]
#[must_use]
pub const fn encode(opcode: u8, arg: u8) -> u16 {
    ((arg as u16) << 8) | opcode as u16
}

#[inline]
#[must_use]
pub const fn opcode(word: u16) -> u8 {
    (word & 0xff) as u8
}

#[inline]
#[must_use]
pub const fn arg(word: u16) -> u8 {
    (word >> 8) as u8
}

/// Append `opcode` with an up-to-31-bit argument, emitting `EXARG`
/// prefixes for the high bytes as needed.
pub fn emit(code: &mut Vec<u16>, opcode: u8, argval: u32) {
    let argval = argval & ARG_MASK;
    for shift in [24u32, 16, 8] {
        if argval >> shift != 0 {
            emit_exarg_tail(code, argval, shift);
            break;
        }
    }
    code.push(encode(opcode, (argval & 0xff) as u8));
}

fn emit_exarg_tail(code: &mut Vec<u16>, argval: u32, top_shift: u32) {
    let mut shift = top_shift;
    loop {
        code.push(encode(op::EXARG, ((argval >> shift) & 0xff) as u8));
        if shift == 8 {
            break;
        }
        shift -= 8;
    }
}

fn name(opcode: u8) -> &'static str {
    match opcode {
        op::NOP => "NOP",
        op::BLK => "BLK",
        op::ENDBLK => "ENDBLK",
        op::LOAD => "LOAD",
        op::LOADK => "LOADK",
        op::UNPACK => "UNPACK",
        op::EXARG => "EXARG",
        op::STORE => "STORE",
        op::DISCARD => "DISCARD",
        op::NOT => "NOT",
        op::CPASS => "CPASS",
        op::CFAIL => "CFAIL",
        op::SETTLE => "SETTLE",
        op::HASATTR => "HASATTR",
        op::EXACT => "EXACT",
        op::SUBNET => "SUBNET",
        op::SUPERNET => "SUPERNET",
        op::RELATED => "RELATED",
        op::PFXCONTAINS => "PFXCONTAINS",
        op::ADDRCONTAINS => "ADDRCONTAINS",
        op::ASCONTAINS => "ASCONTAINS",
        op::ASPMATCH => "ASPMATCH",
        op::ASPSTARTS => "ASPSTARTS",
        op::ASPENDS => "ASPENDS",
        op::ASPEXACT => "ASPEXACT",
        op::COMMEXACT => "COMMEXACT",
        op::CALL => "CALL",
        op::SETTRIE => "SETTRIE",
        op::SETTRIE6 => "SETTRIE6",
        op::CLRTRIE => "CLRTRIE",
        op::CLRTRIE6 => "CLRTRIE6",
        op::ADDRCMP => "ADDRCMP",
        op::PFXCMP => "PFXCMP",
        op::ASCMP => "ASCMP",
        _ => "???",
    }
}

/// Render a program for `-d`: one instruction per line, `EXARG` chains
/// resolved into the effective argument of the consuming opcode.
pub fn disassemble(code: &[u16]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let mut exarg = 0u32;
    for (pc, &word) in code.iter().enumerate() {
        let opc = opcode(word);
        let a = arg(word);
        if opc == op::EXARG {
            exarg = (exarg << 8) | u32::from(a);
            let _ = writeln!(out, "{pc:04}: EXARG 0x{a:02x}");
            continue;
        }
        let eff = ((exarg << 8) | u32::from(a)) & ARG_MASK;
        exarg = 0;
        let _ = writeln!(out, "{pc:04}: {} {eff}", name(opc));
    }
    out
}
