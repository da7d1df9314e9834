use crate::process::MemoryAccess;
use crate::registers::Arch;

/// Registers needed to start a stack unwind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindRegs {
    /// Architecture of the registers.
    pub arch: Arch,

    /// Instruction pointer.
    pub ip: u64,

    /// Stack pointer.
    pub sp: u64,

    /// Frame pointer.
    pub fp: u64,

    /// Link register (AArch64 only).
    pub lr: Option<u64>,
}

/// Physical stack frame, as produced by an unwinder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawFrame {
    /// Code address of the frame.
    pub address: u64,

    /// Frame base (stack pointer at this frame), `0` if unknown.
    pub sp: u64,

    /// Frame base of the caller, `0` if unknown.
    pub cfa: u64,
}

/// Platform unwinder collaborator.
pub trait Unwinder {
    /// Unwinds at most `max_depth` frames, most recent first.
    fn unwind(
        &mut self,
        regs: &UnwindRegs,
        memory: &dyn MemoryAccess,
        max_depth: usize,
    ) -> crate::Result<Vec<RawFrame>>;
}
