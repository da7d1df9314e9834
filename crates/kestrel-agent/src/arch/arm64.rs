//! AArch64 strategy.
//!
//! Unlike x86-64, execute breakpoints and watchpoints have their own slot
//! tables, each slot being a control register and a value register.

use byteorder::{ByteOrder, LittleEndian};

use kestrel_target::{
    AddressRange, Arch, Arm64Register, Error, Register, RegisterId, RegisterState, Result,
    StateKind, UnwindRegs,
};

use super::{ArchProvider, Field, HardwareTrap, decode_block, patch_block, read_u64_at};

/// Software breakpoint instruction (`brk #0`).
pub const BREAK_INSTRUCTION: [u8; 4] = [0x00, 0x00, 0x20, 0xd4];

/// Number of hardware breakpoint slots.
pub const BREAKPOINT_SLOT_COUNT: usize = 4;

/// Number of hardware watchpoint slots.
pub const WATCHPOINT_SLOT_COUNT: usize = 4;

const GENERAL_SIZE: usize = 34 * 8;
const FP_OFFSET: usize = 29 * 8;
const LR_OFFSET: usize = 30 * 8;
const SP_OFFSET: usize = 31 * 8;
const PC_OFFSET: usize = 32 * 8;

const VECTOR_SIZE: usize = 8 + 32 * 16;

const WATCHPOINT_TABLE_OFFSET: usize = BREAKPOINT_SLOT_COUNT * 16;
const FAR_OFFSET: usize = WATCHPOINT_TABLE_OFFSET + WATCHPOINT_SLOT_COUNT * 16;
const ESR_OFFSET: usize = FAR_OFFSET + 8;
const DEBUG_SIZE: usize = ESR_OFFSET + 8;

/// Enable bit of a control register.
const CTRL_E: u32 = 1;

/// DBGBCR value: E, PMC=0b10 (EL0), BAS=0xf (whole A64 instruction).
const DBGBCR_EXECUTE: u32 = CTRL_E | 0b10 << 1 | 0xf << 5;

/// DBGWCR value: E, PAC=0b10 (EL0), LSC=0b11 (loads and stores),
/// BAS=0xff (8 bytes).
const DBGWCR_WATCH: u32 = CTRL_E | 0b10 << 1 | 0b11 << 3 | 0xff << 5;

/// Exception classes found in ESR.EC.
const EC_BREAKPOINT_LOWER_EL: u32 = 0x30;
const EC_BREAKPOINT_SAME_EL: u32 = 0x31;
const EC_STEP_LOWER_EL: u32 = 0x32;
const EC_STEP_SAME_EL: u32 = 0x33;
const EC_WATCHPOINT_LOWER_EL: u32 = 0x34;
const EC_WATCHPOINT_SAME_EL: u32 = 0x35;

/// AArch64 architecture strategy.
#[derive(Clone, Copy, Debug, Default)]
pub struct Arm64;

impl ArchProvider for Arm64 {
    fn arch(&self) -> Arch {
        Arch::Arm64
    }

    fn break_instruction(&self) -> &'static [u8] {
        &BREAK_INSTRUCTION
    }

    fn breakpoint_address_for_software_exception(&self, exception_addr: u64) -> u64 {
        // `brk` reports its own address
        exception_addr
    }

    fn next_instruction_for_software_exception(&self, exception_addr: u64) -> u64 {
        exception_addr + BREAK_INSTRUCTION.len() as u64
    }

    fn next_instruction_for_watchpoint_hit(&self, exception_addr: u64) -> u64 {
        // watchpoints trap before the faulting instruction completes
        exception_addr + 4
    }

    fn hw_breakpoint_count(&self) -> usize {
        BREAKPOINT_SLOT_COUNT
    }

    fn watchpoint_count(&self) -> usize {
        WATCHPOINT_SLOT_COUNT
    }

    fn ip_register(&self) -> RegisterId {
        RegisterId::Arm64(Arm64Register::Pc)
    }

    fn read_ip(&self, thread: &dyn RegisterState) -> Result<u64> {
        let block = thread.read_state(StateKind::General)?;
        read_u64_at(&block, PC_OFFSET)
    }

    fn write_ip(&self, thread: &mut dyn RegisterState, ip: u64) -> Result<()> {
        let mut block = thread.read_state(StateKind::General)?;
        super::write_u64_at(&mut block, PC_OFFSET, ip)?;
        thread.write_state(StateKind::General, &block)
    }

    fn unwind_regs(&self, thread: &dyn RegisterState) -> Result<UnwindRegs> {
        let block = thread.read_state(StateKind::General)?;

        Ok(UnwindRegs {
            arch: Arch::Arm64,
            ip: read_u64_at(&block, PC_OFFSET)?,
            sp: read_u64_at(&block, SP_OFFSET)?,
            fp: read_u64_at(&block, FP_OFFSET)?,
            lr: Some(read_u64_at(&block, LR_OFFSET)?),
        })
    }

    fn read_registers(&self, kind: StateKind, thread: &dyn RegisterState) -> Result<Vec<Register>> {
        if kind == StateKind::FloatingPoint {
            // all FP state lives in the vector registers
            return Ok(Vec::new());
        }

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
                tracing::warn!(error = %e, "could not read debug registers");
                return HardwareTrap::SingleStep;
            }
        };

        match regs.exception_class() {
            EC_BREAKPOINT_LOWER_EL | EC_BREAKPOINT_SAME_EL => match self.read_ip(thread) {
                Ok(pc) => HardwareTrap::Breakpoint(pc),
                Err(e) => {
                    tracing::warn!(error = %e, "could not read pc");
                    HardwareTrap::Unknown
                }
            },
            EC_STEP_LOWER_EL | EC_STEP_SAME_EL => HardwareTrap::SingleStep,
            EC_WATCHPOINT_LOWER_EL | EC_WATCHPOINT_SAME_EL => {
                HardwareTrap::Watchpoint(align(regs.far))
            }
            _ => HardwareTrap::Unknown,
        }
    }

    fn clear_hardware_exception(&self, _thread: &mut dyn RegisterState) -> Result<()> {
        // ESR/FAR are reported per exception, nothing is sticky
        Ok(())
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
    let reg = RegisterId::Arm64;

    match kind {
        StateKind::General => {
            let mut fields: Vec<_> = (0..30u8)
                .map(|i| Field::new(reg(Arm64Register::X(i)), 8 * usize::from(i), 8))
                .collect();
            fields.extend([
                Field::new(reg(Arm64Register::Lr), LR_OFFSET, 8),
                Field::new(reg(Arm64Register::Sp), SP_OFFSET, 8),
                Field::new(reg(Arm64Register::Pc), PC_OFFSET, 8),
                Field::new(reg(Arm64Register::Cpsr), PC_OFFSET + 8, 8),
            ]);
            fields
        }
        StateKind::FloatingPoint => Vec::new(),
        StateKind::Vector => {
            let mut fields = vec![
                Field::new(reg(Arm64Register::Fpcr), 0, 4),
                Field::new(reg(Arm64Register::Fpsr), 4, 4),
            ];
            fields.extend(
                (0..32u8).map(|i| Field::new(reg(Arm64Register::V(i)), 8 + 16 * usize::from(i), 16)),
            );
            fields
        }
        StateKind::Debug => {
            let mut fields = Vec::new();
            for i in 0..BREAKPOINT_SLOT_COUNT as u8 {
                let offset = 16 * usize::from(i);
                fields.push(Field::new(reg(Arm64Register::Dbgbcr(i)), offset, 4));
                fields.push(Field::new(reg(Arm64Register::Dbgbvr(i)), offset + 8, 8));
            }
            for i in 0..WATCHPOINT_SLOT_COUNT as u8 {
                let offset = WATCHPOINT_TABLE_OFFSET + 16 * usize::from(i);
                fields.push(Field::new(reg(Arm64Register::Dbgwcr(i)), offset, 4));
                fields.push(Field::new(reg(Arm64Register::Dbgwvr(i)), offset + 8, 8));
            }
            fields.push(Field::new(reg(Arm64Register::Far), FAR_OFFSET, 8));
            fields.push(Field::new(reg(Arm64Register::Esr), ESR_OFFSET, 4));
            fields
        }
    }
}

/// Returns the size of the canonical block of a category.
pub const fn block_size(kind: StateKind) -> usize {
    match kind {
        StateKind::General => GENERAL_SIZE,
        StateKind::FloatingPoint => 0,
        StateKind::Vector => VECTOR_SIZE,
        StateKind::Debug => DEBUG_SIZE,
    }
}

/// Control/value register pair of a debug slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugSlot {
    /// Control register (DBGBCR or DBGWCR).
    pub ctrl: u32,

    /// Value register (DBGBVR or DBGWVR).
    pub value: u64,
}

impl DebugSlot {
    fn enabled(&self) -> bool {
        self.ctrl & CTRL_E != 0
    }
}

/// Decoded debug registers of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugRegs {
    /// Breakpoint slots.
    pub breakpoints: [DebugSlot; BREAKPOINT_SLOT_COUNT],

    /// Watchpoint slots.
    pub watchpoints: [DebugSlot; WATCHPOINT_SLOT_COUNT],

    /// Faulting address of the last watchpoint hit.
    pub far: u64,

    /// Syndrome of the last debug exception.
    pub esr: u32,
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

        let slot = |offset: usize| DebugSlot {
            ctrl: LittleEndian::read_u32(&block[offset..offset + 4]),
            value: LittleEndian::read_u64(&block[offset + 8..offset + 16]),
        };

        let mut regs = Self {
            far: LittleEndian::read_u64(&block[FAR_OFFSET..FAR_OFFSET + 8]),
            esr: LittleEndian::read_u32(&block[ESR_OFFSET..ESR_OFFSET + 4]),
            ..Default::default()
        };

        for (i, bp) in regs.breakpoints.iter_mut().enumerate() {
            *bp = slot(16 * i);
        }
        for (i, wp) in regs.watchpoints.iter_mut().enumerate() {
            *wp = slot(WATCHPOINT_TABLE_OFFSET + 16 * i);
        }

        Ok(regs)
    }

    /// Encodes the canonical debug block.
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; DEBUG_SIZE];

        let offsets = (0..BREAKPOINT_SLOT_COUNT)
            .map(|i| 16 * i)
            .chain((0..WATCHPOINT_SLOT_COUNT).map(|i| WATCHPOINT_TABLE_OFFSET + 16 * i));

        for (offset, slot) in offsets.zip(self.breakpoints.iter().chain(&self.watchpoints)) {
            LittleEndian::write_u32(&mut block[offset..offset + 4], slot.ctrl);
            LittleEndian::write_u64(&mut block[offset + 8..offset + 16], slot.value);
        }

        LittleEndian::write_u64(&mut block[FAR_OFFSET..FAR_OFFSET + 8], self.far);
        LittleEndian::write_u32(&mut block[ESR_OFFSET..ESR_OFFSET + 4], self.esr);

        block
    }

    /// Claims the lowest free breakpoint slot.
    pub fn setup_hw_breakpoint(&mut self, address: u64) -> Result<()> {
        setup_slot(&mut self.breakpoints, address, DBGBCR_EXECUTE)
    }

    /// Releases the breakpoint slot holding `address`.
    pub fn remove_hw_breakpoint(&mut self, address: u64) -> Result<()> {
        remove_slot(&mut self.breakpoints, address)
    }

    /// Claims the lowest free watchpoint slot for the aligned `address`.
    pub fn setup_watchpoint(&mut self, address: u64) -> Result<()> {
        setup_slot(&mut self.watchpoints, align(address), DBGWCR_WATCH)
    }

    /// Releases the watchpoint slot holding the aligned `address`.
    pub fn remove_watchpoint(&mut self, address: u64) -> Result<()> {
        remove_slot(&mut self.watchpoints, align(address))
    }

    fn exception_class(&self) -> u32 {
        (self.esr >> 26) & 0x3f
    }
}

fn setup_slot(slots: &mut [DebugSlot], address: u64, ctrl: u32) -> Result<()> {
    if slots.iter().any(|slot| slot.enabled() && slot.value == address) {
        return Err(Error::AlreadyBound);
    }

    let slot = slots
        .iter_mut()
        .find(|slot| !slot.enabled())
        .ok_or(Error::NoResources)?;

    *slot = DebugSlot {
        ctrl,
        value: address,
    };

    Ok(())
}

fn remove_slot(slots: &mut [DebugSlot], address: u64) -> Result<()> {
    let slot = slots
        .iter_mut()
        .find(|slot| slot.enabled() && slot.value == address)
        .ok_or(Error::OutOfRange)?;

    *slot = DebugSlot::default();

    Ok(())
}

const fn align(address: u64) -> u64 {
    address & !0b111
}

#[cfg(test)]
mod tests {
    use kestrel_target::{AddressRange, Error, StateKind};

    use super::{
        Arm64, BREAKPOINT_SLOT_COUNT, DBGBCR_EXECUTE, DBGWCR_WATCH, DebugRegs, DebugSlot,
        EC_STEP_LOWER_EL, EC_WATCHPOINT_LOWER_EL, block_size,
    };
    use crate::arch::{ArchProvider, HardwareTrap};
    use crate::testing::MockRegisters;

    #[test]
    fn breakpoint_slots() {
        let mut regs = DebugRegs::default();

        for i in 0..BREAKPOINT_SLOT_COUNT as u64 {
            regs.setup_hw_breakpoint(0x1000 + 4 * i).expect("install");
        }

        assert!(matches!(
            regs.setup_hw_breakpoint(0x1000),
            Err(Error::AlreadyBound)
        ));
        assert!(matches!(
            regs.setup_hw_breakpoint(0x2000),
            Err(Error::NoResources)
        ));
        assert_eq!(
            regs.breakpoints[2],
            DebugSlot {
                ctrl: DBGBCR_EXECUTE,
                value: 0x1008
            }
        );

        // watchpoint slots are independent
        regs.setup_watchpoint(0x2004).expect("install");
        assert_eq!(
            regs.watchpoints[0],
            DebugSlot {
                ctrl: DBGWCR_WATCH,
                value: 0x2000
            }
        );

        regs.remove_hw_breakpoint(0x1004).expect("remove");
        assert_eq!(regs.breakpoints[1], DebugSlot::default());
        assert!(matches!(
            regs.remove_hw_breakpoint(0x1004),
            Err(Error::OutOfRange)
        ));
        assert!(matches!(
            regs.remove_watchpoint(0x1000),
            Err(Error::OutOfRange)
        ));

        regs.setup_hw_breakpoint(0x3000).expect("install");
        assert_eq!(regs.breakpoints[1].value, 0x3000);
    }

    #[test]
    fn block_encoding_keeps_slots() {
        let mut regs = DebugRegs::default();
        regs.setup_hw_breakpoint(0x4000).expect("install");
        regs.setup_watchpoint(0xdeadbeef).expect("install");
        regs.far = 0x1234;
        regs.esr = 0xabcd;

        assert_eq!(DebugRegs::from_block(&regs.to_block()).expect("decode"), regs);
    }

    #[test]
    fn decode_exception_class() {
        let mut thread = MockRegisters::new(block_size);

        Arm64
            .install_watchpoint(&mut thread, AddressRange::new(0xdeadbeef, 0xdeadbef0))
            .expect("install");

        let mut regs = DebugRegs::from_block(&thread.block(StateKind::Debug)).expect("decode");
        regs.esr = EC_WATCHPOINT_LOWER_EL << 26;
        regs.far = 0xdeadbeef;
        thread.set_block(StateKind::Debug, regs.to_block());

        assert_eq!(
            Arm64.decode_hardware_exception(&thread),
            HardwareTrap::Watchpoint(0xdeadbee8)
        );

        regs.esr = EC_STEP_LOWER_EL << 26;
        thread.set_block(StateKind::Debug, regs.to_block());
        assert_eq!(
            Arm64.decode_hardware_exception(&thread),
            HardwareTrap::SingleStep
        );

        regs.esr = 0x3c << 26;
        thread.set_block(StateKind::Debug, regs.to_block());
        assert_eq!(
            Arm64.decode_hardware_exception(&thread),
            HardwareTrap::Unknown
        );
    }

    #[test]
    fn floating_point_category_is_empty() {
        let thread = MockRegisters::new(block_size);

        assert!(
            Arm64
                .read_registers(StateKind::FloatingPoint, &thread)
                .expect("read")
                .is_empty()
        );
        assert_eq!(
            Arm64
                .read_registers(StateKind::Vector, &thread)
                .expect("read")
                .len(),
            34
        );
    }
}
