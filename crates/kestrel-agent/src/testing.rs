//! In-crate doubles of the target seams.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Mutex;
use std::time::Duration;

use kestrel_target::{
    AddressRange, Arch, Error, ExceptionToken, MemoryAccess, Module, ProcessHandle, Register,
    RegisterId, RegisterState, Result, StateKind, ThreadHandle, ThreadRunState, UnwindRegs,
};

use crate::arch::{ArchProvider, HardwareTrap, x64::X64};

/// Address of the fake memory region.
pub const MEMORY_ADDRESS: u64 = 0x1_2345_6780;

/// Initial content of the fake memory region.
pub const ORIGINAL_DATA: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

/// Zero-initialized register blocks.
pub struct MockRegisters {
    blocks: HashMap<StateKind, Vec<u8>>,
}

impl MockRegisters {
    pub fn new(block_size: fn(StateKind) -> usize) -> Self {
        let blocks = StateKind::ALL
            .into_iter()
            .map(|kind| (kind, vec![0u8; block_size(kind)]))
            .collect();

        Self { blocks }
    }

    pub fn block(&self, kind: StateKind) -> Vec<u8> {
        self.blocks.get(&kind).cloned().unwrap_or_default()
    }

    pub fn set_block(&mut self, kind: StateKind, block: Vec<u8>) {
        self.blocks.insert(kind, block);
    }
}

impl RegisterState for MockRegisters {
    fn read_state(&self, kind: StateKind) -> Result<Vec<u8>> {
        self.blocks.get(&kind).cloned().ok_or(Error::NotSupported)
    }

    fn write_state(&mut self, kind: StateKind, data: &[u8]) -> Result<()> {
        let block = self.blocks.get_mut(&kind).ok_or(Error::NotSupported)?;

        if block.len() != data.len() {
            return Err(Error::InvalidArgs);
        }

        block.copy_from_slice(data);
        Ok(())
    }
}

/// Memory mapped at a single address, everything else unmapped.
pub struct FakeMemory {
    address: u64,
    data: Vec<u8>,
}

impl FakeMemory {
    pub fn new(address: u64, data: &[u8]) -> Self {
        Self {
            address,
            data: data.to_vec(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn starts_with_break(&self) -> bool {
        self.data.starts_with(X64.break_instruction())
    }

    pub fn is_original(&self) -> bool {
        self.data == ORIGINAL_DATA
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let end = self.address + self.data.len() as u64;

        if addr < self.address || addr + len as u64 > end {
            return Err(Error::Io(std::io::Error::from_raw_os_error(14)));
        }

        let start = (addr - self.address) as usize;
        Ok(start..start + len)
    }
}

impl MemoryAccess for FakeMemory {
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(buf.len())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        let range = self.range(addr, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(data.len())
    }
}

/// Observable state of a mock thread.
pub struct MockThreadState {
    pub registers: MockRegisters,
    pub suspend_count: usize,
    pub in_exception: bool,
    pub handled_exceptions: usize,
    pub unhandled_exceptions: usize,
    pub single_step: bool,
    pub single_step_writes: usize,
}

/// Thread whose tokens update a shared state on release.
#[derive(Clone)]
pub struct MockThread {
    koid: u64,
    state: Rc<RefCell<MockThreadState>>,
}

impl MockThread {
    pub fn new(koid: u64) -> Self {
        let state = MockThreadState {
            registers: MockRegisters::new(crate::arch::x64::block_size),
            suspend_count: 0,
            in_exception: false,
            handled_exceptions: 0,
            unhandled_exceptions: 0,
            single_step: false,
            single_step_writes: 0,
        };

        Self {
            koid,
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn state(&self) -> std::cell::Ref<'_, MockThreadState> {
        self.state.borrow()
    }

    /// Blocks the thread in an exception.
    pub fn raise_exception(&self) -> MockException {
        self.state.borrow_mut().in_exception = true;

        MockException {
            state: self.state.clone(),
            handled: false,
        }
    }

    /// Sets the instruction pointer.
    pub fn set_ip(&self, ip: u64) {
        let mut state = self.state.borrow_mut();
        X64.write_ip(&mut state.registers, ip).expect("write ip");
    }

    pub fn ip(&self) -> u64 {
        X64.read_ip(&self.state.borrow().registers).expect("read ip")
    }

    /// Sets the debug status register (DR6).
    pub fn set_debug_status(&self, dr6: u64) {
        let mut state = self.state.borrow_mut();
        let mut block = state.registers.block(StateKind::Debug);
        block[32..40].copy_from_slice(&dr6.to_le_bytes());
        state.registers.set_block(StateKind::Debug, block);
    }

    /// Returns the debug control register (DR7).
    pub fn debug_control(&self) -> u64 {
        let block = self.state.borrow().registers.block(StateKind::Debug);
        u64::from_le_bytes(block[40..48].try_into().expect("dr7"))
    }

    /// Replaces a whole register block, whatever its size.
    pub fn set_block(&self, kind: StateKind, block: Vec<u8>) {
        self.state.borrow_mut().registers.set_block(kind, block);
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.borrow();
        state.suspend_count == 0 && !state.in_exception
    }

    pub fn is_suspended(&self) -> bool {
        self.state.borrow().suspend_count > 0
    }

    pub fn in_exception(&self) -> bool {
        self.state.borrow().in_exception
    }
}

impl RegisterState for MockThread {
    fn read_state(&self, kind: StateKind) -> Result<Vec<u8>> {
        self.state.borrow().registers.read_state(kind)
    }

    fn write_state(&mut self, kind: StateKind, data: &[u8]) -> Result<()> {
        self.state.borrow_mut().registers.write_state(kind, data)
    }
}

impl ThreadHandle for MockThread {
    type SuspendToken = MockSuspendToken;
    type ExceptionToken = MockException;

    fn koid(&self) -> u64 {
        self.koid
    }

    fn name(&self) -> String {
        format!("thread-{}", self.koid)
    }

    fn run_state(&self) -> Result<ThreadRunState> {
        let state = self.state.borrow();

        Ok(if state.in_exception {
            ThreadRunState::BlockedException
        } else if state.suspend_count > 0 {
            ThreadRunState::Suspended
        } else {
            ThreadRunState::Running
        })
    }

    fn suspend(&mut self) -> Result<MockSuspendToken> {
        self.state.borrow_mut().suspend_count += 1;

        Ok(MockSuspendToken {
            state: self.state.clone(),
        })
    }

    async fn wait_suspended(&mut self, timeout: Duration) -> Result<bool> {
        let stopped = {
            let state = self.state.borrow();
            state.suspend_count > 0 || state.in_exception
        };

        if !stopped {
            tokio::time::sleep(timeout).await;
        }

        Ok(stopped)
    }

    fn set_single_step(&mut self, enable: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.single_step = enable;
        state.single_step_writes += 1;
        Ok(())
    }
}

pub struct MockSuspendToken {
    state: Rc<RefCell<MockThreadState>>,
}

impl Drop for MockSuspendToken {
    fn drop(&mut self) {
        self.state.borrow_mut().suspend_count -= 1;
    }
}

pub struct MockException {
    state: Rc<RefCell<MockThreadState>>,
    handled: bool,
}

impl ExceptionToken for MockException {
    fn set_handled(&mut self) -> Result<()> {
        self.handled = true;
        Ok(())
    }
}

impl Drop for MockException {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.in_exception = false;

        if self.handled {
            state.handled_exceptions += 1;
        } else {
            state.unhandled_exceptions += 1;
        }
    }
}

/// Process over a [FakeMemory], sharing its state between clones.
#[derive(Clone)]
pub struct MockProcess {
    koid: u64,
    name: String,
    memory: Rc<RefCell<FakeMemory>>,
    threads: Rc<RefCell<Vec<MockThread>>>,
    watching: Rc<RefCell<bool>>,
    killed: Rc<RefCell<bool>>,
}

impl MockProcess {
    pub fn new(koid: u64) -> Self {
        Self::with_name(koid, "mock")
    }

    pub fn with_name(koid: u64, name: &str) -> Self {
        Self {
            koid,
            name: name.to_owned(),
            memory: Rc::new(RefCell::new(FakeMemory::new(MEMORY_ADDRESS, &ORIGINAL_DATA))),
            threads: Rc::default(),
            watching: Rc::default(),
            killed: Rc::default(),
        }
    }

    pub fn add_thread(&self, koid: u64) -> MockThread {
        let thread = MockThread::new(koid);
        self.threads.borrow_mut().push(thread.clone());
        thread
    }

    /// Writes the fake memory behind the debugger's back.
    pub fn poke(&self, addr: u64, data: &[u8]) {
        self.memory
            .borrow_mut()
            .write_memory(addr, data)
            .expect("poke");
    }

    pub fn memory(&self) -> std::cell::Ref<'_, FakeMemory> {
        self.memory.borrow()
    }

    pub fn is_watching(&self) -> bool {
        *self.watching.borrow()
    }

    pub fn is_killed(&self) -> bool {
        *self.killed.borrow()
    }
}

impl MemoryAccess for MockProcess {
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.memory.borrow().read_memory(addr, buf)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        self.memory.borrow_mut().write_memory(addr, data)
    }
}

pub struct MockWatch {
    watching: Rc<RefCell<bool>>,
}

impl Drop for MockWatch {
    fn drop(&mut self) {
        *self.watching.borrow_mut() = false;
    }
}

impl ProcessHandle for MockProcess {
    type Thread = MockThread;
    type Watch = MockWatch;

    fn koid(&self) -> u64 {
        self.koid
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn arch(&self) -> Arch {
        Arch::X64
    }

    fn threads(&mut self) -> Result<Vec<MockThread>> {
        Ok(self.threads.borrow().clone())
    }

    async fn modules(&self) -> Result<Vec<Module>> {
        Ok(vec![Module {
            name: "mock".to_owned(),
            path: "/bin/mock".into(),
            base: 0x1_0000_0000,
            end: 0x1_3000_0000,
        }])
    }

    fn watch_exceptions(&mut self) -> Result<MockWatch> {
        *self.watching.borrow_mut() = true;

        Ok(MockWatch {
            watching: self.watching.clone(),
        })
    }

    fn kill(&mut self) -> Result<()> {
        *self.killed.borrow_mut() = true;
        Ok(())
    }
}

/// x64 strategy counting the hardware slot operations instead of touching
/// the thread.
#[derive(Default)]
pub struct MockArch {
    bp_installs: Mutex<HashMap<u64, usize>>,
    bp_uninstalls: Mutex<HashMap<u64, usize>>,
    wp_installs: Mutex<HashMap<u64, usize>>,
    wp_uninstalls: Mutex<HashMap<u64, usize>>,
}

impl MockArch {
    pub fn breakpoint_install_count(&self, address: u64) -> usize {
        count(&self.bp_installs, Some(address))
    }

    pub fn breakpoint_uninstall_count(&self, address: u64) -> usize {
        count(&self.bp_uninstalls, Some(address))
    }

    pub fn total_breakpoint_install_calls(&self) -> usize {
        count(&self.bp_installs, None)
    }

    pub fn total_breakpoint_uninstall_calls(&self) -> usize {
        count(&self.bp_uninstalls, None)
    }

    pub fn watchpoint_install_count(&self, address: u64) -> usize {
        count(&self.wp_installs, Some(address))
    }

    pub fn watchpoint_uninstall_count(&self, address: u64) -> usize {
        count(&self.wp_uninstalls, Some(address))
    }
}

fn count(calls: &Mutex<HashMap<u64, usize>>, address: Option<u64>) -> usize {
    let calls = calls.lock().expect("lock");

    match address {
        Some(address) => calls.get(&address).copied().unwrap_or(0),
        None => calls.values().sum(),
    }
}

fn record(calls: &Mutex<HashMap<u64, usize>>, address: u64) {
    *calls.lock().expect("lock").entry(address).or_default() += 1;
}

impl ArchProvider for MockArch {
    fn arch(&self) -> Arch {
        Arch::X64
    }

    fn break_instruction(&self) -> &'static [u8] {
        X64.break_instruction()
    }

    fn breakpoint_address_for_software_exception(&self, exception_addr: u64) -> u64 {
        X64.breakpoint_address_for_software_exception(exception_addr)
    }

    fn next_instruction_for_software_exception(&self, exception_addr: u64) -> u64 {
        X64.next_instruction_for_software_exception(exception_addr)
    }

    fn next_instruction_for_watchpoint_hit(&self, exception_addr: u64) -> u64 {
        X64.next_instruction_for_watchpoint_hit(exception_addr)
    }

    fn hw_breakpoint_count(&self) -> usize {
        X64.hw_breakpoint_count()
    }

    fn watchpoint_count(&self) -> usize {
        X64.watchpoint_count()
    }

    fn ip_register(&self) -> RegisterId {
        X64.ip_register()
    }

    fn read_ip(&self, thread: &dyn RegisterState) -> Result<u64> {
        X64.read_ip(thread)
    }

    fn write_ip(&self, thread: &mut dyn RegisterState, ip: u64) -> Result<()> {
        X64.write_ip(thread, ip)
    }

    fn unwind_regs(&self, thread: &dyn RegisterState) -> Result<UnwindRegs> {
        X64.unwind_regs(thread)
    }

    fn read_registers(&self, kind: StateKind, thread: &dyn RegisterState) -> Result<Vec<Register>> {
        X64.read_registers(kind, thread)
    }

    fn write_registers(
        &self,
        kind: StateKind,
        registers: &[Register],
        thread: &mut dyn RegisterState,
    ) -> Result<()> {
        X64.write_registers(kind, registers, thread)
    }

    fn install_hw_breakpoint(&self, _thread: &mut dyn RegisterState, address: u64) -> Result<()> {
        record(&self.bp_installs, address);
        Ok(())
    }

    fn uninstall_hw_breakpoint(
        &self,
        _thread: &mut dyn RegisterState,
        address: u64,
    ) -> Result<()> {
        record(&self.bp_uninstalls, address);
        Ok(())
    }

    fn install_watchpoint(
        &self,
        _thread: &mut dyn RegisterState,
        range: AddressRange,
    ) -> Result<()> {
        record(&self.wp_installs, range.begin);
        Ok(())
    }

    fn uninstall_watchpoint(
        &self,
        _thread: &mut dyn RegisterState,
        range: AddressRange,
    ) -> Result<()> {
        record(&self.wp_uninstalls, range.begin);
        Ok(())
    }

    fn decode_hardware_exception(&self, thread: &dyn RegisterState) -> HardwareTrap {
        X64.decode_hardware_exception(thread)
    }

    fn clear_hardware_exception(&self, thread: &mut dyn RegisterState) -> Result<()> {
        X64.clear_hardware_exception(thread)
    }
}
