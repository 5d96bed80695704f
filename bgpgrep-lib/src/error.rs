use thiserror::Error;

/// Errors raised by the filter virtual machine.
///
/// Every variant maps to a stable negative code (see [`VmError::code`]) so
/// callers that aggregate per-record failures can log something greppable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("call to undefined function")]
    FuncUndefined,

    #[error("reference to undefined constant")]
    KUndefined,

    #[error("unsupported accessor combination")]
    BadAccessor,

    #[error("address family does not match current trie")]
    TrieMismatch,

    #[error("trie index out of range")]
    TrieUndefined,

    #[error("packet-touching opcode on a non-UPDATE message")]
    PacketMismatch,

    #[error("decoder reported a corrupted packet")]
    BadPacket,

    #[error("illegal opcode 0x{0:02x}")]
    IllegalOpcode(u8),

    #[error("unterminated block at end of program")]
    DanglingBlk,

    #[error("ENDBLK outside any block")]
    SpuriousEndblk,

    #[error("address with unknown family")]
    SurprisingBytes,

    #[error("array descriptor out of bounds")]
    BadArray,

    #[error("bad heap request")]
    BadHeapPtr,

    #[error("stack cell has unexpected kind")]
    CellMismatch,
}

impl VmError {
    /// Stable negative error code for diagnostics.
    pub fn code(self) -> i32 {
        match self {
            VmError::OutOfMemory => -1,
            VmError::StackOverflow => -2,
            VmError::StackUnderflow => -3,
            VmError::FuncUndefined => -4,
            VmError::KUndefined => -5,
            VmError::BadAccessor => -6,
            VmError::TrieMismatch => -7,
            VmError::TrieUndefined => -8,
            VmError::PacketMismatch => -9,
            VmError::BadPacket => -10,
            VmError::IllegalOpcode(_) => -11,
            VmError::DanglingBlk => -12,
            VmError::SpuriousEndblk => -13,
            VmError::SurprisingBytes => -14,
            VmError::BadArray => -15,
            VmError::BadHeapPtr => -16,
            VmError::CellMismatch => -17,
        }
    }
}

/// Errors from parsing a network address or prefix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid prefix length {bitlen} for {what}")]
    InvalidBitlen { bitlen: u8, what: &'static str },

    #[error("cannot parse '{0}' as an address or prefix")]
    Parse(String),
}

/// Errors from the MRT record layer.
#[derive(Error, Debug)]
pub enum MrtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated MRT record at byte offset {offset}")]
    Truncated { offset: u64 },

    #[error("unsupported MRT subtype {subtype} for type {mrt_type}")]
    UnsupportedSubtype { mrt_type: u16, subtype: u16 },

    #[error("malformed {0} record body")]
    Malformed(&'static str),
}

/// Errors from decoding a BGP message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BgpError {
    #[error("truncated BGP message")]
    Truncated,

    #[error("malformed path attribute")]
    BadAttribute,

    #[error("unknown address family {0}")]
    UnknownFamily(u16),

    #[error("invalid prefix length {0}")]
    BadPrefixLen(u8),

    #[error("malformed AS path segment")]
    BadSegment,
}

/// Errors from the token scanner used for list files.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("{name}:{line}: I/O error: {source}")]
    Io {
        name: String,
        line: u32,
        source: std::io::Error,
    },

    #[error("{name}:{line}: token exceeds {max} bytes")]
    TokenTooLong { name: String, line: u32, max: usize },

    #[error("{name}:{line}: invalid escape '\\{escape}'")]
    BadEscape { name: String, line: u32, escape: char },
}

/// Errors from translating CLI expressions into a filter program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("empty AS-path expression")]
    EmptyExpr,

    #[error("'{0}' is not an AS number, '?', or '*'")]
    BadAtom(String),

    #[error("'{0}' is not a community")]
    BadCommunity(String),

    #[error("'{0}' is not an attribute name or code")]
    BadAttribute(String),

    #[error("constant pool exhausted")]
    ConstExhausted,

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("vm error while building: {0}")]
    Vm(#[from] VmError),
}

/// Top-level error for the host: anything that can fail while processing
/// one input file.
#[derive(Error, Debug)]
pub enum GrepError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mrt(#[from] MrtError),

    #[error(transparent)]
    Bgp(#[from] BgpError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("filter error: {0}")]
    Vm(#[from] VmError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("{0}")]
    Unsupported(String),
}

pub type Result<T, E = GrepError> = std::result::Result<T, E>;
