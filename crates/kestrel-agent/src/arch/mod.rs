//! Architecture strategies.
//!
//! An [ArchProvider] encodes and decodes the canonical register blocks of a
//! thread and manages its hardware breakpoint/watchpoint slots. One provider
//! is selected per process at attach time and injected wherever register or
//! slot operations are needed.

pub mod arm64;
pub mod x64;

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use kestrel_target::{
    AddressRange, Arch, Error, MemoryAccess, Register, RegisterId, RegisterState, Result,
    StateKind, UnwindRegs,
};

/// Outcome of decoding a debug trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwareTrap {
    /// The thread executed a single instruction.
    SingleStep,

    /// A hardware execute slot fired at the given address.
    Breakpoint(u64),

    /// A hardware watch slot fired for the given (aligned) address.
    Watchpoint(u64),

    /// Nothing in the debug state explains the trap.
    Unknown,
}

/// Architecture strategy.
pub trait ArchProvider: Send + Sync {
    /// Returns the architecture handled by this provider.
    fn arch(&self) -> Arch;

    /// Returns the software breakpoint instruction.
    fn break_instruction(&self) -> &'static [u8];

    /// Returns the address of the breakpoint instruction, given the address
    /// reported by a software breakpoint exception.
    fn breakpoint_address_for_software_exception(&self, exception_addr: u64) -> u64;

    /// Returns the address of the instruction to execute after a software
    /// breakpoint exception which does not belong to the debugger.
    fn next_instruction_for_software_exception(&self, exception_addr: u64) -> u64;

    /// Returns the address of the instruction to execute after a watchpoint
    /// hit.
    fn next_instruction_for_watchpoint_hit(&self, exception_addr: u64) -> u64;

    /// Returns the alignment of watched ranges.
    fn watchpoint_granule(&self) -> u64 {
        8
    }

    /// Returns the number of hardware execute slots of a thread.
    fn hw_breakpoint_count(&self) -> usize;

    /// Returns the number of hardware watch slots of a thread.
    fn watchpoint_count(&self) -> usize;

    /// Returns the identifier of the instruction pointer.
    fn ip_register(&self) -> RegisterId;

    /// Reads the instruction pointer of a stopped thread.
    fn read_ip(&self, thread: &dyn RegisterState) -> Result<u64>;

    /// Modifies the instruction pointer of a stopped thread.
    fn write_ip(&self, thread: &mut dyn RegisterState, ip: u64) -> Result<()>;

    /// Returns the registers needed to unwind the stack of a stopped thread.
    fn unwind_regs(&self, thread: &dyn RegisterState) -> Result<UnwindRegs>;

    /// Reads the registers of one category.
    fn read_registers(&self, kind: StateKind, thread: &dyn RegisterState)
    -> Result<Vec<Register>>;

    /// Writes some registers of one category, leaving the other registers of
    /// the category untouched.
    fn write_registers(
        &self,
        kind: StateKind,
        registers: &[Register],
        thread: &mut dyn RegisterState,
    ) -> Result<()>;

    /// Installs a hardware execute breakpoint on a stopped thread.
    fn install_hw_breakpoint(&self, thread: &mut dyn RegisterState, address: u64) -> Result<()>;

    /// Uninstalls a hardware execute breakpoint from a stopped thread.
    fn uninstall_hw_breakpoint(&self, thread: &mut dyn RegisterState, address: u64)
    -> Result<()>;

    /// Installs a hardware watchpoint on a stopped thread.
    fn install_watchpoint(&self, thread: &mut dyn RegisterState, range: AddressRange)
    -> Result<()>;

    /// Uninstalls a hardware watchpoint from a stopped thread.
    fn uninstall_watchpoint(
        &self,
        thread: &mut dyn RegisterState,
        range: AddressRange,
    ) -> Result<()>;

    /// Decodes which debug event stopped the thread.
    fn decode_hardware_exception(&self, thread: &dyn RegisterState) -> HardwareTrap;

    /// Clears the sticky status of the last debug event.
    fn clear_hardware_exception(&self, thread: &mut dyn RegisterState) -> Result<()>;

    /// Returns whether the memory at `address` holds the breakpoint
    /// instruction.
    fn is_breakpoint_instruction(&self, memory: &dyn MemoryAccess, address: u64) -> bool {
        let expected = self.break_instruction();
        let mut buf = vec![0u8; expected.len()];

        match memory.read_memory(address, &mut buf) {
            Ok(len) => len == buf.len() && buf == expected,
            Err(e) => {
                tracing::debug!(error = %e, addr = format_args!("{address:#x}"), "read instruction");
                false
            }
        }
    }
}

/// Returns the strategy of the given architecture.
pub fn provider_for(arch: Arch) -> Arc<dyn ArchProvider> {
    match arch {
        Arch::X64 => Arc::new(x64::X64),
        Arch::Arm64 => Arc::new(arm64::Arm64),
    }
}

/// Location of a register within a canonical block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Field {
    pub id: RegisterId,
    pub offset: usize,
    pub size: usize,
}

impl Field {
    pub const fn new(id: RegisterId, offset: usize, size: usize) -> Self {
        Self { id, offset, size }
    }
}

/// Decodes every field of a canonical block.
pub(crate) fn decode_block(fields: &[Field], block: &[u8]) -> Result<Vec<Register>> {
    fields
        .iter()
        .map(|field| {
            block
                .get(field.offset..field.offset + field.size)
                .map(|data| Register {
                    id: field.id,
                    data: data.to_vec(),
                })
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "register block of {} bytes too short for {:?}",
                        block.len(),
                        field.id
                    ))
                })
        })
        .collect()
}

/// Overwrites the given registers within a canonical block.
///
/// Fails with [Error::InvalidArgs] if a register is not part of the block or
/// has the wrong size, in which case the block may be partially modified.
pub(crate) fn patch_block(fields: &[Field], block: &mut [u8], registers: &[Register]) -> Result<()> {
    for reg in registers {
        let field = fields
            .iter()
            .find(|field| field.id == reg.id)
            .ok_or(Error::InvalidArgs)?;

        if reg.data.len() != field.size {
            return Err(Error::InvalidArgs);
        }

        block
            .get_mut(field.offset..field.offset + field.size)
            .ok_or(Error::InvalidArgs)?
            .copy_from_slice(&reg.data);
    }

    Ok(())
}

/// Reads a 64-bit value at the given offset of a block.
pub(crate) fn read_u64_at(block: &[u8], offset: usize) -> Result<u64> {
    block
        .get(offset..offset + 8)
        .map(LittleEndian::read_u64)
        .ok_or_else(|| Error::Internal(format!("register block too short ({} bytes)", block.len())))
}

/// Writes a 64-bit value at the given offset of a block.
pub(crate) fn write_u64_at(block: &mut [u8], offset: usize, value: u64) -> Result<()> {
    let len = block.len();
    let slot = block
        .get_mut(offset..offset + 8)
        .ok_or_else(|| Error::Internal(format!("register block too short ({len} bytes)")))?;

    LittleEndian::write_u64(slot, value);
    Ok(())
}
