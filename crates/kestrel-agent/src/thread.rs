use std::sync::Arc;

use kestrel_target::{
    ClientState, ExceptionToken, MemoryAccess, RawFrame, Register, RegisterCategory, RunMode,
    StackAmount, StateKind, ThreadCreation, ThreadHandle, ThreadRecord, ThreadRunState, Unwinder,
};
use tokio::time::Instant;

use crate::arch::ArchProvider;
use crate::config::AgentConfig;

/// Thread of a debugged process.
///
/// The thread is stopped whenever the debugger holds its suspend token or
/// its exception token (or both, since a suspension requested while the
/// thread is blocked in an exception only applies once the exception is
/// released).
pub struct DebuggedThread<T: ThreadHandle> {
    handle: T,
    koid: u64,
    process_koid: u64,
    arch: Arc<dyn ArchProvider>,
    config: Arc<AgentConfig>,

    suspend_token: Option<T::SuspendToken>,
    exception_token: Option<T::ExceptionToken>,

    client_state: ClientState,
    run_mode: RunMode,

    /// Last value given to the hardware single-step bit.
    single_step: bool,

    /// Address of the breakpoint the thread is stopped at or stepping over.
    current_breakpoint: Option<u64>,
}

impl<T: ThreadHandle> DebuggedThread<T> {
    /// Creates a thread, possibly blocked in its start exception.
    pub fn new(
        handle: T,
        process_koid: u64,
        arch: Arc<dyn ArchProvider>,
        config: Arc<AgentConfig>,
        creation: ThreadCreation,
        exception: Option<T::ExceptionToken>,
    ) -> Self {
        let mut thread = Self {
            koid: handle.koid(),
            handle,
            process_koid,
            arch,
            config,
            suspend_token: None,
            exception_token: exception,
            client_state: ClientState::Running,
            run_mode: RunMode::Continue,
            single_step: false,
            current_breakpoint: None,
        };

        if creation == ThreadCreation::SuspendedShouldRun {
            thread.resume_exception();
        }

        thread
    }

    /// Returns the kernel identity of the thread.
    pub fn koid(&self) -> u64 {
        self.koid
    }

    /// Returns the underlying thread handle.
    pub fn handle(&self) -> &T {
        &self.handle
    }

    pub(crate) fn handle_mut(&mut self) -> &mut T {
        &mut self.handle
    }

    /// Returns the client-visible state of the thread.
    pub fn client_state(&self) -> ClientState {
        self.client_state
    }

    pub(crate) fn set_client_state(&mut self, state: ClientState) {
        self.client_state = state;
    }

    /// Returns how the thread runs once resumed.
    pub fn run_mode(&self) -> &RunMode {
        &self.run_mode
    }

    pub(crate) fn set_run_mode(&mut self, run_mode: RunMode) {
        self.run_mode = run_mode;
    }

    /// Returns the address of the breakpoint this thread is stopped at or
    /// stepping over.
    pub fn current_breakpoint(&self) -> Option<u64> {
        self.current_breakpoint
    }

    pub(crate) fn set_current_breakpoint(&mut self, address: Option<u64>) {
        self.current_breakpoint = address;
    }

    /// Returns whether the debugger holds the thread in an exception.
    pub fn in_exception(&self) -> bool {
        self.exception_token.is_some()
    }

    /// Returns whether the debugger holds a suspension of the thread.
    pub fn is_suspended(&self) -> bool {
        self.suspend_token.is_some()
    }

    /// Returns whether the thread is stopped by the debugger.
    pub fn is_stopped(&self) -> bool {
        self.in_exception() || self.is_suspended()
    }

    pub(crate) fn set_exception(&mut self, token: T::ExceptionToken) {
        if self.exception_token.replace(token).is_some() {
            tracing::warn!(thread = self.koid, "exception delivered twice");
        }
    }

    /// Suspends the thread.
    ///
    /// Returns `false` if the thread was already stopped by the debugger,
    /// in which case nothing is done. If `synchronous`, waits for the
    /// suspension to be effective.
    pub async fn suspend(&mut self, synchronous: bool) -> kestrel_target::Result<bool> {
        if self.is_stopped() {
            return Ok(false);
        }

        self.suspend_token = Some(self.handle.suspend()?);

        if synchronous {
            let deadline = Instant::now() + self.config.suspend_deadline;
            self.wait_for_suspension(deadline).await;
        }

        Ok(true)
    }

    /// Takes a suspension even if the thread is blocked in an exception, so
    /// that releasing the exception leaves it stopped.
    ///
    /// Returns `false` if the debugger already held a suspension.
    pub(crate) fn hold_suspension(&mut self) -> kestrel_target::Result<bool> {
        if self.is_suspended() {
            return Ok(false);
        }

        self.suspend_token = Some(self.handle.suspend()?);
        Ok(true)
    }

    /// Waits for a requested suspension to be effective.
    ///
    /// A thread may hit an exception before the suspension applies, which is
    /// fine as well. Returns `false` if the deadline elapsed first.
    pub async fn wait_for_suspension(&mut self, deadline: Instant) -> bool {
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(thread = self.koid, "suspension timed out");
                return false;
            }

            let timeout = self.config.suspend_poll_interval.min(deadline - now);

            match self.handle.wait_suspended(timeout).await {
                Ok(true) => return true,
                Ok(false) => (),
                Err(e) => {
                    tracing::warn!(thread = self.koid, error = %e, "wait for suspension");
                    return false;
                }
            }
        }
    }

    /// Releases the exception the thread is blocked in, marking it as
    /// handled by the debugger.
    pub fn resume_exception(&mut self) {
        if let Some(mut token) = self.exception_token.take() {
            if let Err(e) = token.set_handled() {
                tracing::warn!(thread = self.koid, error = %e, "mark exception handled");
            }
        }
    }

    /// Releases the suspension held by the debugger.
    pub fn resume_suspension(&mut self) {
        self.suspend_token = None;
    }

    /// Enables or disables hardware single-stepping.
    pub fn set_single_step(&mut self, enable: bool) {
        if self.single_step == enable {
            return;
        }

        // the thread may be dying
        match self.handle.set_single_step(enable) {
            Ok(()) => self.single_step = enable,
            Err(e) => tracing::debug!(thread = self.koid, error = %e, "set single step"),
        }
    }

    /// Resumes the thread according to its run mode, unless the client
    /// paused it.
    ///
    /// Stepping over a breakpoint is not handled here, see
    /// [DebuggedProcess::resume_for_run_mode](crate::DebuggedProcess).
    pub(crate) fn resume_normally(&mut self) {
        if self.client_state == ClientState::Paused {
            return;
        }

        self.set_single_step(self.run_mode != RunMode::Continue);
        self.resume_exception();
        self.resume_suspension();
    }

    /// Reads the registers of the requested categories.
    ///
    /// Categories that cannot be read are left out.
    pub fn read_registers(&self, kinds: &[StateKind]) -> Vec<RegisterCategory> {
        kinds
            .iter()
            .filter_map(|&kind| match self.arch.read_registers(kind, &self.handle) {
                Ok(registers) => Some(RegisterCategory { kind, registers }),
                Err(e) => {
                    tracing::warn!(thread = self.koid, ?kind, error = %e, "read registers");
                    None
                }
            })
            .collect()
    }

    /// Writes registers, category by category.
    ///
    /// Every category is attempted, the first error is returned.
    pub fn write_registers(&mut self, registers: &[Register]) -> kestrel_target::Result<()> {
        let mut result = Ok(());

        for kind in StateKind::ALL {
            let batch: Vec<_> = registers
                .iter()
                .filter(|reg| reg.id.category() == kind)
                .cloned()
                .collect();

            if batch.is_empty() {
                continue;
            }

            if let Err(e) = self.arch.write_registers(kind, &batch, &mut self.handle) {
                tracing::warn!(thread = self.koid, ?kind, error = %e, "write registers");

                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let ip = self.arch.ip_register();
        if registers.iter().any(|reg| reg.id == ip) {
            // moved away from the breakpoint
            self.current_breakpoint = None;
        }

        result
    }

    pub(crate) fn read_ip(&self) -> kestrel_target::Result<u64> {
        self.arch.read_ip(&self.handle)
    }

    pub(crate) fn write_ip(&mut self, ip: u64) -> kestrel_target::Result<()> {
        self.arch.write_ip(&mut self.handle, ip)
    }

    /// Snapshots the thread.
    ///
    /// A stack is only gathered when the thread is stopped by the debugger.
    pub fn fill_thread_record(
        &self,
        stack_amount: StackAmount,
        memory: &dyn MemoryAccess,
        unwinder: &mut dyn Unwinder,
    ) -> ThreadRecord {
        let state = self.handle.run_state().unwrap_or_else(|e| {
            tracing::debug!(thread = self.koid, error = %e, "thread state");
            ThreadRunState::Dead
        });

        let depth = match stack_amount {
            StackAmount::None => 0,
            StackAmount::Minimal => self.config.minimal_stack_frames,
            StackAmount::Full => self.config.full_stack_frames,
        };

        let (stack_amount, frames) = if depth > 0 && self.is_stopped() {
            (stack_amount, self.unwind(memory, unwinder, depth))
        } else {
            (StackAmount::None, Vec::new())
        };

        ThreadRecord {
            process_koid: self.process_koid,
            thread_koid: self.koid,
            name: self.handle.name(),
            state,
            stack_amount,
            frames,
        }
    }

    /// Unwinds at most `depth` physical frames.
    ///
    /// When the unwinder fails, the stack is reduced to the current frame.
    pub fn unwind(
        &self,
        memory: &dyn MemoryAccess,
        unwinder: &mut dyn Unwinder,
        depth: usize,
    ) -> Vec<RawFrame> {
        let regs = match self.arch.unwind_regs(&self.handle) {
            Ok(regs) => regs,
            Err(e) => {
                tracing::warn!(thread = self.koid, error = %e, "read unwind registers");
                return Vec::new();
            }
        };

        match unwinder.unwind(&regs, memory, depth) {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => vec![top_frame(regs.ip, regs.sp)],
            Err(e) => {
                tracing::debug!(thread = self.koid, error = %e, "unwind");
                vec![top_frame(regs.ip, regs.sp)]
            }
        }
    }

    /// Must be called before the breakpoint at `address` is destroyed.
    pub fn will_delete_process_breakpoint(&mut self, address: u64) {
        if self.current_breakpoint == Some(address) {
            self.current_breakpoint = None;
        }
    }
}

fn top_frame(address: u64, sp: u64) -> RawFrame {
    RawFrame {
        address,
        sp,
        cfa: 0,
    }
}
