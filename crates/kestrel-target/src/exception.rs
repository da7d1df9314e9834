/// Exception as reported by the target operating system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawException {
    /// A software breakpoint instruction was executed.
    SoftwareBreakpoint,

    /// A debug trap was raised (hardware breakpoint, watchpoint or single
    /// step). The architecture layer decodes which one.
    HardwareBreakpoint,

    /// Invalid memory access.
    PageFault,

    /// Invalid instruction.
    UndefinedInstruction,

    /// Misaligned memory access.
    UnalignedAccess,

    /// Any other fault.
    General,
}

/// Exception classification produced by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionType {
    /// Fault unrelated to controlled execution.
    General,

    /// Hardware single step.
    SingleStep,

    /// Software breakpoint.
    Software,

    /// Hardware execute breakpoint.
    Hardware,

    /// Hardware watchpoint.
    Watchpoint,
}

impl std::fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::General => "general",
            Self::SingleStep => "single step",
            Self::Software => "software breakpoint",
            Self::Hardware => "hardware breakpoint",
            Self::Watchpoint => "watchpoint",
        };

        f.write_str(s)
    }
}

/// How a breakpoint is installed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Trap instruction written to memory.
    #[default]
    Software,

    /// Hardware execute slot.
    Hardware,
}

impl BreakpointKind {
    /// Returns the exception type a hit of this breakpoint kind produces.
    pub const fn exception_type(self) -> ExceptionType {
        match self {
            Self::Software => ExceptionType::Software,
            Self::Hardware => ExceptionType::Hardware,
        }
    }
}

/// Per-breakpoint statistics reported with a hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakpointStats {
    /// Identifier of the logical breakpoint (or watchpoint).
    pub id: u32,

    /// Number of hits so far, this one included.
    pub hit_count: u32,

    /// Whether the breakpoint was deleted because of this hit.
    pub should_delete: bool,
}
