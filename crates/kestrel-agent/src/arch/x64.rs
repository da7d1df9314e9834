//! x86-64 strategy.
//!
//! The four debug address registers DR0-DR3 are shared between execute
//! breakpoints and watchpoints, the mode of each slot being encoded in DR7.

use byteorder::{ByteOrder, LittleEndian};

use kestrel_target::{
    AddressRange, Arch, Error, Register, RegisterId, RegisterState, Result, StateKind,
    UnwindRegs, X64Register,
};

use super::{ArchProvider, Field, HardwareTrap, decode_block, patch_block, read_u64_at};

/// Software breakpoint instruction (`int3`).
pub const BREAK_INSTRUCTION: [u8; 1] = [0xcc];

/// Number of hardware debug slots.
pub const SLOT_COUNT: usize = 4;

const GENERAL_SIZE: usize = X64Register::GENERAL.len() * 8;
const RIP_OFFSET: usize = 16 * 8;
const RSP_OFFSET: usize = 7 * 8;
const RBP_OFFSET: usize = 6 * 8;

const FP_SIZE: usize = 24 + 8 * 16;
const VECTOR_SIZE: usize = 8 + 16 * 32;
const DEBUG_SIZE: usize = X64Register::DEBUG.len() * 8;

/// DR6 single-step status bit (BS).
const DR6_BS: u64 = 1 << 14;

/// x86-64 architecture strategy.
#[derive(Clone, Copy, Debug, Default)]
pub struct X64;

impl ArchProvider for X64 {
    fn arch(&self) -> Arch {
        Arch::X64
    }

    fn break_instruction(&self) -> &'static [u8] {
        &BREAK_INSTRUCTION
    }

    fn breakpoint_address_for_software_exception(&self, exception_addr: u64) -> u64 {
        // `int3` reports the address right after itself
        exception_addr.wrapping_sub(BREAK_INSTRUCTION.len() as u64)
    }

    fn next_instruction_for_software_exception(&self, exception_addr: u64) -> u64 {
        exception_addr
    }

    fn next_instruction_for_watchpoint_hit(&self, exception_addr: u64) -> u64 {
        // watchpoints trap after the faulting instruction completed
        exception_addr
    }

    fn hw_breakpoint_count(&self) -> usize {
        SLOT_COUNT
    }

    fn watchpoint_count(&self) -> usize {
        SLOT_COUNT
    }

    fn ip_register(&self) -> RegisterId {
        RegisterId::X64(X64Register::Rip)
    }

    fn read_ip(&self, thread: &dyn RegisterState) -> Result<u64> {
        let block = thread.read_state(StateKind::General)?;
        read_u64_at(&block, RIP_OFFSET)
    }

    fn write_ip(&self, thread: &mut dyn RegisterState, ip: u64) -> Result<()> {
        let mut block = thread.read_state(StateKind::General)?;
        super::write_u64_at(&mut block, RIP_OFFSET, ip)?;
        thread.write_state(StateKind::General, &block)
    }

    fn unwind_regs(&self, thread: &dyn RegisterState) -> Result<UnwindRegs> {
        let block = thread.read_state(StateKind::General)?;

        Ok(UnwindRegs {
            arch: Arch::X64,
            ip: read_u64_at(&block, RIP_OFFSET)?,
            sp: read_u64_at(&block, RSP_OFFSET)?,
            fp: read_u64_at(&block, RBP_OFFSET)?,
            lr: None,
        })
    }

    fn read_registers(&self, kind: StateKind, thread: &dyn RegisterState) -> Result<Vec<Register>> {
        let block = thread.read_state(kind)?;
        decode_block(&layout(kind), &block)
    }

    fn write_registers(
        &self,
        kind: StateKind,
        registers: &[Register],
        thread: &mut dyn RegisterState,
    ) -> Result<()> {
        match kind {
            StateKind::General | StateKind::Debug => (),
            StateKind::FloatingPoint | StateKind::Vector => return Err(Error::NotSupported),
        }

        let mut block = thread.read_state(kind)?;
        patch_block(&layout(kind), &mut block, registers)?;
        thread.write_state(kind, &block)
    }

    fn install_hw_breakpoint(&self, thread: &mut dyn RegisterState, address: u64) -> Result<()> {
        update_debug_regs(thread, |regs| regs.setup_hw_breakpoint(address))
    }

    fn uninstall_hw_breakpoint(
        &self,
        thread: &mut dyn RegisterState,
        address: u64,
    ) -> Result<()> {
        update_debug_regs(thread, |regs| regs.remove_hw_breakpoint(address))
    }

    fn install_watchpoint(
        &self,
        thread: &mut dyn RegisterState,
        range: AddressRange,
    ) -> Result<()> {
        update_debug_regs(thread, |regs| regs.setup_watchpoint(range.begin))
    }

    fn uninstall_watchpoint(
        &self,
        thread: &mut dyn RegisterState,
        range: AddressRange,
    ) -> Result<()> {
        update_debug_regs(thread, |regs| regs.remove_watchpoint(range.begin))
    }

    fn decode_hardware_exception(&self, thread: &dyn RegisterState) -> HardwareTrap {
        let regs = match thread
            .read_state(StateKind::Debug)
            .and_then(|block| DebugRegs::from_block(&block))
        {
            Ok(regs) => regs,
            Err(e) => {
                // without DR6 the only debug event we can assume is a step
                tracing::warn!(error = %e, "could not read debug registers");
                return HardwareTrap::SingleStep;
            }
        };

        regs.decode()
    }

    fn clear_hardware_exception(&self, thread: &mut dyn RegisterState) -> Result<()> {
        update_debug_regs(thread, |regs| {
            regs.dr6 &= !(0b1111 | DR6_BS);
            Ok(())
        })
    }
}

fn update_debug_regs(
    thread: &mut dyn RegisterState,
    f: impl FnOnce(&mut DebugRegs) -> Result<()>,
) -> Result<()> {
    let mut regs = DebugRegs::from_block(&thread.read_state(StateKind::Debug)?)?;
    f(&mut regs)?;
    thread.write_state(StateKind::Debug, &regs.to_block())
}

fn layout(kind: StateKind) -> Vec<Field> {
    let reg = RegisterId::X64;

    match kind {
        StateKind::General => X64Register::GENERAL
            .iter()
            .enumerate()
            .map(|(i, id)| Field::new(reg(*id), i * 8, 8))
            .collect(),
        StateKind::FloatingPoint => {
            let mut fields = vec![
                Field::new(reg(X64Register::Fcw), 0, 2),
                Field::new(reg(X64Register::Fsw), 2, 2),
                Field::new(reg(X64Register::Ftw), 4, 2),
                Field::new(reg(X64Register::Fop), 6, 2),
                Field::new(reg(X64Register::Fip), 8, 8),
                Field::new(reg(X64Register::Fdp), 16, 8),
            ];
            fields.extend(
                (0..8u8).map(|i| Field::new(reg(X64Register::St(i)), 24 + 16 * usize::from(i), 16)),
            );
            fields
        }
        StateKind::Vector => {
            let mut fields = vec![Field::new(reg(X64Register::Mxcsr), 0, 4)];
            fields.extend(
                (0..16u8).map(|i| Field::new(reg(X64Register::Ymm(i)), 8 + 32 * usize::from(i), 32)),
            );
            fields
        }
        StateKind::Debug => X64Register::DEBUG
            .iter()
            .enumerate()
            .map(|(i, id)| Field::new(reg(*id), i * 8, 8))
            .collect(),
    }
}

/// Returns the size of the canonical block of a category.
pub const fn block_size(kind: StateKind) -> usize {
    match kind {
        StateKind::General => GENERAL_SIZE,
        StateKind::FloatingPoint => FP_SIZE,
        StateKind::Vector => VECTOR_SIZE,
        StateKind::Debug => DEBUG_SIZE,
    }
}

/// Decoded debug registers of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugRegs {
    /// Address registers DR0-DR3.
    pub dr: [u64; SLOT_COUNT],

    /// Status register.
    pub dr6: u64,

    /// Control register.
    pub dr7: u64,
}

impl DebugRegs {
    /// Decodes the canonical debug block.
    pub fn from_block(block: &[u8]) -> Result<Self> {
        if block.len() < DEBUG_SIZE {
            return Err(Error::Internal(format!(
                "debug register block of {} bytes",
                block.len()
            )));
        }

        let word = |i: usize| LittleEndian::read_u64(&block[i * 8..i * 8 + 8]);

        Ok(Self {
            dr: [word(0), word(1), word(2), word(3)],
            dr6: word(4),
            dr7: word(5),
        })
    }

    /// Encodes the canonical debug block.
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; DEBUG_SIZE];

        for (i, value) in self.dr.iter().chain([&self.dr6, &self.dr7]).enumerate() {
            LittleEndian::write_u64(&mut block[i * 8..i * 8 + 8], *value);
        }

        block
    }

    /// Claims the lowest free slot for an execute breakpoint.
    pub fn setup_hw_breakpoint(&mut self, address: u64) -> Result<()> {
        self.setup(address, hw_breakpoint_dr7_mask)
    }

    /// Releases the execute slot holding `address`.
    pub fn remove_hw_breakpoint(&mut self, address: u64) -> Result<()> {
        self.remove(address, SlotMode::Execute)
    }

    /// Claims the lowest free slot for an 8-byte write watchpoint.
    ///
    /// The address is aligned down to 8 bytes.
    pub fn setup_watchpoint(&mut self, address: u64) -> Result<()> {
        self.setup(align(address), watchpoint_dr7_mask)
    }

    /// Releases the watch slot holding the aligned `address`.
    pub fn remove_watchpoint(&mut self, address: u64) -> Result<()> {
        self.remove(align(address), SlotMode::Watch)
    }

    /// Returns which debug event is recorded in DR6.
    ///
    /// A fired slot takes precedence over the single-step flag.
    pub fn decode(&self) -> HardwareTrap {
        if let Some(slot) = (0..SLOT_COUNT).find(|&i| self.dr6 & (1 << i) != 0) {
            let address = self.dr[slot];

            return match self.slot_mode(slot) {
                SlotMode::Execute => HardwareTrap::Breakpoint(address),
                SlotMode::Watch => HardwareTrap::Watchpoint(address),
            };
        }

        if self.dr6 & DR6_BS != 0 {
            HardwareTrap::SingleStep
        } else {
            HardwareTrap::Unknown
        }
    }

    fn setup(&mut self, address: u64, mask: fn(usize) -> u64) -> Result<()> {
        if (0..SLOT_COUNT).any(|i| self.slot_enabled(i) && self.dr[i] == address) {
            return Err(Error::AlreadyBound);
        }

        let slot = (0..SLOT_COUNT)
            .find(|i| !self.slot_enabled(*i))
            .ok_or(Error::NoResources)?;

        self.dr[slot] = address;
        self.dr7 |= mask(slot);

        Ok(())
    }

    fn remove(&mut self, address: u64, mode: SlotMode) -> Result<()> {
        let slot = (0..SLOT_COUNT)
            .find(|&i| self.slot_enabled(i) && self.dr[i] == address && self.slot_mode(i) == mode)
            .ok_or(Error::OutOfRange)?;

        self.dr[slot] = 0;
        self.dr7 &= !slot_dr7_bits(slot);

        Ok(())
    }

    fn slot_enabled(&self, slot: usize) -> bool {
        self.dr7 & (1 << (2 * slot)) != 0
    }

    fn slot_mode(&self, slot: usize) -> SlotMode {
        if (self.dr7 >> (16 + 4 * slot)) & 0b11 == 0 {
            SlotMode::Execute
        } else {
            SlotMode::Watch
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotMode {
    Execute,
    Watch,
}

const fn align(address: u64) -> u64 {
    address & !0b111
}

/// DR7 bits of an execute slot: L=1, RW=00, LEN=00.
const fn hw_breakpoint_dr7_mask(slot: usize) -> u64 {
    1 << (2 * slot)
}

/// DR7 bits of a watch slot: L=1, RW=01 (writes), LEN=10 (8 bytes).
const fn watchpoint_dr7_mask(slot: usize) -> u64 {
    1 << (2 * slot) | 0b01 << (16 + 4 * slot) | 0b10 << (18 + 4 * slot)
}

/// Every DR7 bit owned by a slot (local/global enable, RW and LEN).
const fn slot_dr7_bits(slot: usize) -> u64 {
    0b11 << (2 * slot) | 0b1111 << (16 + 4 * slot)
}
