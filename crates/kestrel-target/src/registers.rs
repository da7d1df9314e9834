/// CPU architecture of a debugged process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    /// x86-64.
    X64,

    /// AArch64.
    Arm64,
}

impl Arch {
    /// Returns the architecture this crate was compiled for.
    pub const fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::Arm64
        } else {
            Self::X64
        }
    }
}

/// Category of a register block.
///
/// Each category is read and written as a single atomic block against the
/// underlying thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateKind {
    /// Integer registers, instruction and stack pointers, flags.
    General,

    /// Legacy floating-point state (x87 on x86-64).
    FloatingPoint,

    /// SIMD state.
    Vector,

    /// Hardware breakpoint/watchpoint state.
    Debug,
}

impl StateKind {
    /// Every category, in a stable order.
    pub const ALL: [Self; 4] = [
        Self::General,
        Self::FloatingPoint,
        Self::Vector,
        Self::Debug,
    ];
}

/// Register of the x86-64 architecture.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum X64Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,

    Fcw,
    Fsw,
    Ftw,
    Fop,
    Fip,
    Fdp,
    St(u8),

    Mxcsr,
    Ymm(u8),

    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
    Dr7,
}

impl X64Register {
    /// General registers, in block order.
    pub const GENERAL: [Self; 18] = [
        Self::Rax,
        Self::Rbx,
        Self::Rcx,
        Self::Rdx,
        Self::Rsi,
        Self::Rdi,
        Self::Rbp,
        Self::Rsp,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
        Self::Rip,
        Self::Rflags,
    ];

    /// Debug registers, in block order.
    pub const DEBUG: [Self; 6] = [
        Self::Dr0,
        Self::Dr1,
        Self::Dr2,
        Self::Dr3,
        Self::Dr6,
        Self::Dr7,
    ];

    /// Returns the category this register belongs to.
    pub fn category(self) -> StateKind {
        match self {
            Self::Fcw | Self::Fsw | Self::Ftw | Self::Fop | Self::Fip | Self::Fdp | Self::St(_) => {
                StateKind::FloatingPoint
            }
            Self::Mxcsr | Self::Ymm(_) => StateKind::Vector,
            Self::Dr0 | Self::Dr1 | Self::Dr2 | Self::Dr3 | Self::Dr6 | Self::Dr7 => {
                StateKind::Debug
            }
            _ => StateKind::General,
        }
    }
}

/// Register of the AArch64 architecture.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arm64Register {
    /// `x0` to `x29`.
    X(u8),
    Lr,
    Sp,
    Pc,
    Cpsr,

    Fpcr,
    Fpsr,
    /// `v0` to `v31`.
    V(u8),

    /// Breakpoint control register of a slot.
    Dbgbcr(u8),
    /// Breakpoint value register of a slot.
    Dbgbvr(u8),
    /// Watchpoint control register of a slot.
    Dbgwcr(u8),
    /// Watchpoint value register of a slot.
    Dbgwvr(u8),
    Far,
    Esr,
}

impl Arm64Register {
    /// Returns the category this register belongs to.
    pub fn category(self) -> StateKind {
        match self {
            Self::X(_) | Self::Lr | Self::Sp | Self::Pc | Self::Cpsr => StateKind::General,
            Self::Fpcr | Self::Fpsr | Self::V(_) => StateKind::Vector,
            _ => StateKind::Debug,
        }
    }
}

/// Architecture-qualified register identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterId {
    /// x86-64 register.
    X64(X64Register),

    /// AArch64 register.
    Arm64(Arm64Register),
}

impl RegisterId {
    /// Returns the category this register belongs to.
    pub fn category(self) -> StateKind {
        match self {
            Self::X64(reg) => reg.category(),
            Self::Arm64(reg) => reg.category(),
        }
    }
}

/// Register value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Register {
    /// Register identifier.
    pub id: RegisterId,

    /// Little-endian contents.
    pub data: Vec<u8>,
}

impl Register {
    /// Creates a register holding a 64-bit value.
    pub fn from_u64(id: RegisterId, value: u64) -> Self {
        Self {
            id,
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// Returns the value of the register if it is at most 64 bits wide.
    pub fn as_u64(&self) -> Option<u64> {
        if self.data.len() > 8 {
            return None;
        }

        let mut bytes = [0u8; 8];
        bytes[..self.data.len()].copy_from_slice(&self.data);
        Some(u64::from_le_bytes(bytes))
    }
}

/// Registers of a single category.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterCategory {
    /// Category of all the registers.
    pub kind: StateKind,

    /// Decoded registers.
    pub registers: Vec<Register>,
}
