//! Tokens and geometry shared between the interpreter-facing callbacks and
//! the metric reductions.
//!
//! The interpreter owns the IR. Everything it hands us — opcodes, basic
//! blocks, instruction handles, address spaces — is treated as an opaque
//! token with equality; the only lookup we ever ask for is opcode → short
//! printable name, via [`OpcodeNames`].

use std::fmt;

/// Three-dimensional launch geometry (work-group counts or local sizes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total element count, widened so large launches cannot overflow.
    pub fn volume(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize
    }

    /// Linearise a local id within a group of this size:
    /// `x·(y_dim·z_dim) + y·z_dim + z`.
    pub fn linear_index(&self, local: Dim3) -> usize {
        local.x as usize * (self.y as usize * self.z as usize)
            + local.y as usize * self.z as usize
            + local.z as usize
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.x, self.y, self.z)
    }
}

/// Opaque instruction-kind token supplied by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u32);

/// Opaque basic-block identity. Equality is the only defined operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u64);

/// Identity of one interpreter worker thread. Worker state is keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

/// A conditional-branch site: the instruction handle plus the source line
/// the interpreter recovered from debug info, if any.
///
/// The line projection is applied only at report time ([`Self::report_id`]);
/// accumulation keys on the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchSite {
    pub handle: u64,
    pub line: Option<u32>,
}

impl BranchSite {
    /// Report-facing id: the source line when debug info is present,
    /// otherwise the raw handle reinterpreted as an integer.
    pub fn report_id(&self) -> u64 {
        match self.line {
            Some(line) => u64::from(line),
            None => self.handle,
        }
    }
}

/// Logical memory partition of an access. Private accesses carry no
/// address-level metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Private = 0,
    Global = 1,
    Constant = 2,
    Local = 3,
}

impl AddressSpace {
    /// Raw interpreter tag for this space.
    #[inline(always)]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decode a raw interpreter tag.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(AddressSpace::Private),
            1 => Some(AddressSpace::Global),
            2 => Some(AddressSpace::Constant),
            3 => Some(AddressSpace::Local),
            _ => None,
        }
    }
}

/// Direction of a memory instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Load,
    Store,
}

/// Memory-instruction facet of an [`InstructionDesc`].
#[derive(Debug, Clone)]
pub struct MemoryAccess {
    pub op: MemOp,
    pub space: AddressSpace,
    /// Name of the pointer operand, as the interpreter prints it.
    pub pointer: String,
}

/// Successor pair of a conditional branch. `taken` is the first successor;
/// observing it records `true` at the branch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTargets {
    pub taken: BlockId,
    pub not_taken: BlockId,
}

/// Static description of one instruction, built once by the interpreter and
/// passed by reference on every execution of that instruction.
#[derive(Debug, Clone)]
pub struct InstructionDesc {
    /// Opaque per-static-instruction handle. Doubles as the branch-site
    /// identity and the debug-info fallback id.
    pub handle: u64,
    pub opcode: Opcode,
    /// Parent basic block, used to resolve the previous conditional branch.
    pub block: BlockId,
    /// Present iff the instruction is a load or a store.
    pub memory: Option<MemoryAccess>,
    /// Present iff the instruction is a conditional branch with two
    /// label-typed successors.
    pub cond_targets: Option<BranchTargets>,
    pub debug_line: Option<u32>,
}

impl InstructionDesc {
    /// The branch-site identity of this instruction.
    pub fn branch_site(&self) -> BranchSite {
        BranchSite {
            handle: self.handle,
            line: self.debug_line,
        }
    }
}

/// One kernel launch as announced by the interpreter at `kernel_begin`.
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    pub kernel_name: String,
    /// Whether the work-group size was user-specified at enqueue.
    pub work_group_size_specified: bool,
    /// Work-group count in each dimension.
    pub num_groups: Dim3,
    /// Work-items per group in each dimension.
    pub local_size: Dim3,
}

/// The single lookup required of the interpreter: opcode token to a short
/// printable name for the `opcode_counts` report row.
pub trait OpcodeNames {
    fn opcode_name(&self, opcode: Opcode) -> &str;
}
