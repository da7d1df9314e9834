use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use kestrel_target::{
    AddressRange, BreakpointKind, ClientState, Error, ExceptionType, MemoryAccess, MemoryBlock,
    Notification, ProcessHandle, RawException, ResumeRequest, RunMode, StackAmount,
    ThreadCreation, ThreadHandle, ThreadRecord, ThreadRunState, Unwinder,
};
use tokio::time::Instant;

use crate::arch::{ArchProvider, HardwareTrap};
use crate::config::AgentConfig;
use crate::process_breakpoint::{BreakpointRef, ProcessBreakpoint};
use crate::thread::DebuggedThread;
use crate::watchpoint::{ProcessWatchpoint, WatchpointRef};

type ExceptionTokenOf<P> = <<P as ProcessHandle>::Thread as ThreadHandle>::ExceptionToken;

const PAGE_SIZE: u64 = 4096;

/// Thread stop to be reported to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Stop {
    pub thread_koid: u64,
    pub exception_type: ExceptionType,

    /// Identifiers of the logical breakpoints hit, or of the logical
    /// watchpoints for a watchpoint stop.
    pub hits: Vec<u32>,
}

/// Debugged process.
///
/// Owns the threads of the process as well as the breakpoint and watchpoint
/// installations.
pub struct DebuggedProcess<P: ProcessHandle> {
    handle: P,
    koid: u64,
    name: String,
    arch: Arc<dyn ArchProvider>,
    config: Arc<AgentConfig>,

    threads: IndexMap<u64, DebuggedThread<P::Thread>>,
    breakpoints: BTreeMap<u64, ProcessBreakpoint>,
    watchpoints: BTreeMap<u64, ProcessWatchpoint>,

    watch: Option<P::Watch>,
}

impl<P: ProcessHandle> DebuggedProcess<P> {
    /// Starts debugging a process.
    ///
    /// The threads which already exist are left running.
    pub fn new(
        mut handle: P,
        arch: Arc<dyn ArchProvider>,
        config: Arc<AgentConfig>,
    ) -> kestrel_target::Result<Self> {
        let koid = handle.koid();
        let watch = handle.watch_exceptions()?;

        let threads = handle
            .threads()?
            .into_iter()
            .map(|thread| {
                let thread = DebuggedThread::new(
                    thread,
                    koid,
                    arch.clone(),
                    config.clone(),
                    ThreadCreation::RunningKeepRunning,
                    None,
                );
                (thread.koid(), thread)
            })
            .collect();

        Ok(Self {
            koid,
            name: handle.name(),
            handle,
            arch,
            config,
            threads,
            breakpoints: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
            watch: Some(watch),
        })
    }

    /// Returns the kernel identity of the process.
    pub fn koid(&self) -> u64 {
        self.koid
    }

    /// Returns the name of the process.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the underlying process handle.
    pub fn handle(&self) -> &P {
        &self.handle
    }

    /// Returns the architecture strategy of the process.
    pub fn arch(&self) -> &Arc<dyn ArchProvider> {
        &self.arch
    }

    /// Returns a thread of the process.
    pub fn thread(&self, koid: u64) -> Option<&DebuggedThread<P::Thread>> {
        self.threads.get(&koid)
    }

    /// Returns a thread of the process.
    pub fn thread_mut(&mut self, koid: u64) -> Option<&mut DebuggedThread<P::Thread>> {
        self.threads.get_mut(&koid)
    }

    /// Iterates over the threads, in order of discovery.
    pub fn threads(&self) -> impl Iterator<Item = &DebuggedThread<P::Thread>> {
        self.threads.values()
    }

    /// Returns the breakpoint installed at an address.
    pub fn find_process_breakpoint(&self, address: u64) -> Option<&ProcessBreakpoint> {
        self.breakpoints.get(&address)
    }

    /// Iterates over the installed breakpoints, by address.
    pub fn breakpoints(&self) -> impl Iterator<Item = &ProcessBreakpoint> {
        self.breakpoints.values()
    }

    /// Returns the watchpoint whose range starts at an address.
    pub fn find_watchpoint(&self, address: u64) -> Option<&ProcessWatchpoint> {
        self.watchpoints.get(&address)
    }

    /// Returns whether exceptions of this process are still delivered.
    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Registers a logical breakpoint at an address, creating the process
    /// breakpoint if it is the first one there.
    pub fn register_breakpoint(
        &mut self,
        r: BreakpointRef,
        address: u64,
    ) -> kestrel_target::Result<()> {
        let Self {
            handle,
            threads,
            breakpoints,
            arch,
            ..
        } = self;

        let bp = breakpoints
            .entry(address)
            .or_insert_with(|| ProcessBreakpoint::new(address));

        let result = bp.register(r, threads, handle, arch.as_ref());

        if bp.refs().is_empty() {
            breakpoints.remove(&address);
        }

        result
    }

    /// Unregisters a logical breakpoint from an address, destroying the
    /// process breakpoint if nothing references it anymore.
    pub async fn unregister_breakpoint(&mut self, r: &BreakpointRef, address: u64) {
        let Self {
            handle,
            threads,
            breakpoints,
            arch,
            ..
        } = self;

        let Some(bp) = breakpoints.get_mut(&address) else {
            tracing::debug!(addr = format_args!("{address:#x}"), "no breakpoint to unregister");
            return;
        };

        if bp.unregister(r, threads, handle, arch.as_ref()) {
            return;
        }

        for thread in threads.values_mut() {
            thread.will_delete_process_breakpoint(address);
        }

        if let Some(mut bp) = breakpoints.remove(&address) {
            for koid in bp.take_suspended() {
                self.resume_for_run_mode(koid).await;
            }
        }
    }

    /// Registers a logical watchpoint over a range.
    pub fn register_watchpoint(
        &mut self,
        r: WatchpointRef,
        range: AddressRange,
    ) -> kestrel_target::Result<()> {
        let Self {
            threads,
            watchpoints,
            arch,
            ..
        } = self;

        let granule = arch.watchpoint_granule();
        let wp = watchpoints
            .entry(range.begin & !(granule - 1))
            .or_insert_with(|| ProcessWatchpoint::new(range, granule));

        let key = wp.range().begin;
        let result = wp.register(r, threads, arch.as_ref());

        if wp.refs().is_empty() {
            watchpoints.remove(&key);
        }

        result
    }

    /// Unregisters a logical watchpoint from a range.
    pub fn unregister_watchpoint(&mut self, r: &WatchpointRef, range: AddressRange) {
        let key = range.begin & !(self.arch.watchpoint_granule() - 1);

        let Some(wp) = self.watchpoints.get_mut(&key) else {
            return;
        };

        if !wp.unregister(r, &mut self.threads, self.arch.as_ref()) {
            self.watchpoints.remove(&key);
        }
    }

    /// Reads memory, with breakpoint instructions replaced by the original
    /// ones.
    ///
    /// Unreadable pages are reported as invalid blocks.
    pub fn read_memory(&self, address: u64, size: u32) -> Vec<MemoryBlock> {
        let mut blocks = read_memory_blocks(&self.handle, address, size);

        for block in &mut blocks {
            for bp in self.breakpoints.values() {
                bp.fixup_memory_block(block);
            }
        }

        blocks
    }

    /// Writes memory.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> kestrel_target::Result<()> {
        let written = self.handle.write_memory(address, data)?;

        if written != data.len() {
            return Err(Error::PartialTransfer {
                actual: written,
                expected: data.len(),
            });
        }

        Ok(())
    }

    /// Builds the module list notification.
    pub async fn modules_notification(&self, stopped_thread_koids: Vec<u64>) -> Notification {
        let modules = self.handle.modules().await.unwrap_or_else(|e| {
            tracing::warn!(process = self.koid, error = %e, "enumerate modules");
            Vec::new()
        });

        Notification::Modules {
            process_koid: self.koid,
            modules,
            stopped_thread_koids,
        }
    }

    /// Snapshots a thread.
    pub fn thread_record(
        &self,
        thread_koid: u64,
        stack_amount: StackAmount,
        unwinder: &mut dyn Unwinder,
    ) -> Option<ThreadRecord> {
        let thread = self.threads.get(&thread_koid)?;
        Some(thread.fill_thread_record(stack_amount, &self.handle, unwinder))
    }

    /// Adds a thread which just started.
    ///
    /// Hardware breakpoints and watchpoints in scope are installed on it
    /// before it runs.
    pub fn on_thread_starting(
        &mut self,
        thread: P::Thread,
        exception: Option<ExceptionTokenOf<P>>,
        creation: ThreadCreation,
        unwinder: &mut dyn Unwinder,
    ) -> ThreadRecord {
        let koid = thread.koid();

        let thread = DebuggedThread::new(
            thread,
            self.koid,
            self.arch.clone(),
            self.config.clone(),
            ThreadCreation::SuspendedKeepSuspended,
            exception,
        );

        if self.threads.insert(koid, thread).is_some() {
            tracing::warn!(thread = koid, "thread started twice");
        }

        let Self {
            handle,
            threads,
            breakpoints,
            watchpoints,
            arch,
            ..
        } = self;

        for bp in breakpoints.values_mut() {
            if let Err(e) = bp.update(threads, handle, arch.as_ref()) {
                tracing::warn!(thread = koid, error = %e, "install breakpoints on new thread");
            }
        }

        for wp in watchpoints.values_mut() {
            if let Err(e) = wp.update(threads, arch.as_ref()) {
                tracing::warn!(thread = koid, error = %e, "install watchpoints on new thread");
            }
        }

        let mut record = ThreadRecord {
            process_koid: self.koid,
            thread_koid: koid,
            name: String::new(),
            state: ThreadRunState::Dead,
            stack_amount: StackAmount::None,
            frames: Vec::new(),
        };

        if let Some(thread) = self.threads.get_mut(&koid) {
            record = thread.fill_thread_record(StackAmount::None, &self.handle, unwinder);

            if creation == ThreadCreation::SuspendedShouldRun {
                thread.resume_exception();
            }
        }

        record
    }

    /// Removes a thread which exited.
    ///
    /// Returns `None` if the thread is unknown.
    pub async fn on_thread_exiting(&mut self, thread_koid: u64) -> Option<ThreadRecord> {
        let thread = self.threads.shift_remove(&thread_koid)?;
        let name = thread.handle().name();
        drop(thread);

        let Self {
            handle,
            threads,
            breakpoints,
            watchpoints,
            arch,
            ..
        } = self;

        let mut to_resume = Vec::new();

        for bp in breakpoints.values_mut() {
            if bp.is_stepping_over(thread_koid) {
                to_resume.extend(bp.end_step_over(thread_koid, threads, handle, arch.as_ref()));
            }
            bp.forget_thread(thread_koid);
        }

        for wp in watchpoints.values_mut() {
            wp.forget_thread(thread_koid);
        }

        for koid in to_resume {
            self.resume_for_run_mode(koid).await;
        }

        Some(ThreadRecord {
            process_koid: self.koid,
            thread_koid,
            name,
            state: ThreadRunState::Dead,
            stack_amount: StackAmount::None,
            frames: Vec::new(),
        })
    }

    /// Pauses one thread, or every thread.
    ///
    /// Returns the threads which are now paused.
    pub async fn pause(&mut self, thread_koid: Option<u64>) -> Vec<u64> {
        let koids: Vec<_> = match thread_koid {
            Some(koid) if self.threads.contains_key(&koid) => vec![koid],
            Some(_) => return Vec::new(),
            None => self.threads.keys().copied().collect(),
        };

        for koid in &koids {
            if let Some(thread) = self.threads.get_mut(koid) {
                if let Err(e) = thread.suspend(false).await {
                    tracing::warn!(thread = koid, error = %e, "suspend");
                }
            }
        }

        let deadline = Instant::now() + self.config.suspend_deadline;
        let mut paused = Vec::new();

        for koid in koids {
            let Some(thread) = self.threads.get_mut(&koid) else {
                continue;
            };

            if thread.is_suspended() && !thread.in_exception() {
                thread.wait_for_suspension(deadline).await;
            }

            if thread.is_stopped() {
                thread.set_client_state(ClientState::Paused);
                paused.push(koid);
            }
        }

        paused
    }

    /// Resumes the requested threads, or every thread.
    pub async fn resume(&mut self, request: &ResumeRequest) {
        let koids: Vec<_> = if request.thread_koids.is_empty() {
            self.threads.keys().copied().collect()
        } else {
            request.thread_koids.clone()
        };

        for koid in koids {
            let Some(thread) = self.threads.get_mut(&koid) else {
                tracing::debug!(thread = koid, "cannot resume unknown thread");
                continue;
            };

            thread.set_client_state(ClientState::Running);
            thread.set_run_mode(request.run_mode.clone());

            self.resume_for_run_mode(koid).await;
        }
    }

    /// Resumes a thread according to its run mode.
    ///
    /// A thread stopped at one of our breakpoints first steps over it.
    pub(crate) async fn resume_for_run_mode(&mut self, thread_koid: u64) {
        let Self {
            handle,
            threads,
            breakpoints,
            arch,
            config,
            ..
        } = self;

        let Some(thread) = threads.get_mut(&thread_koid) else {
            return;
        };

        if thread.in_exception() {
            if let Some(address) = thread.current_breakpoint() {
                if let Some(bp) = breakpoints.get_mut(&address) {
                    tracing::debug!(
                        thread = thread_koid,
                        addr = format_args!("{address:#x}"),
                        "stepping over breakpoint"
                    );

                    thread.set_single_step(true);
                    bp.begin_step_over(
                        thread_koid,
                        threads,
                        handle,
                        arch.as_ref(),
                        config.suspend_deadline,
                    )
                    .await;
                    return;
                }

                thread.set_current_breakpoint(None);
            }
        }

        thread.resume_normally();
    }

    /// Handles an exception a thread is blocked in.
    ///
    /// Returns the stop to report, if any. A known thread whose exception
    /// cannot be handled is reported as a general stop. Fails with
    /// [Error::NotFound] if the thread is unknown, in which case the
    /// exception is released without being handled.
    #[tracing::instrument(skip_all, fields(process = self.koid, thread = thread_koid))]
    pub(crate) async fn on_exception(
        &mut self,
        thread_koid: u64,
        exception: ExceptionTokenOf<P>,
        kind: RawException,
    ) -> kestrel_target::Result<Option<Stop>> {
        let thread = self
            .threads
            .get_mut(&thread_koid)
            .ok_or(Error::NotFound)?;

        thread.set_exception(exception);

        match self.dispatch_exception(thread_koid, kind).await {
            Ok(stop) => Ok(stop),
            Err(e) => {
                tracing::error!(?kind, error = %e, "handle exception");
                Ok(Some(stop(thread_koid, ExceptionType::General)))
            }
        }
    }

    async fn dispatch_exception(
        &mut self,
        thread_koid: u64,
        kind: RawException,
    ) -> kestrel_target::Result<Option<Stop>> {
        let thread = self
            .threads
            .get_mut(&thread_koid)
            .ok_or(Error::NotFound)?;

        let stop = match kind {
            RawException::SoftwareBreakpoint => self.on_software_breakpoint(thread_koid).await?,
            RawException::HardwareBreakpoint => {
                let trap = self.arch.decode_hardware_exception(thread.handle());

                if let Err(e) = self.arch.clear_hardware_exception(thread.handle_mut()) {
                    tracing::warn!(error = %e, "clear debug status");
                }

                match trap {
                    HardwareTrap::SingleStep => self.on_single_step(thread_koid).await?,
                    HardwareTrap::Breakpoint(address) => {
                        self.on_hardware_breakpoint(thread_koid, address)?
                    }
                    HardwareTrap::Watchpoint(address) => {
                        self.on_watchpoint(thread_koid, address)?
                    }
                    HardwareTrap::Unknown => {
                        tracing::warn!("unexplained debug trap");
                        Some(stop(thread_koid, ExceptionType::General))
                    }
                }
            }
            RawException::PageFault
            | RawException::UndefinedInstruction
            | RawException::UnalignedAccess
            | RawException::General => Some(stop(thread_koid, ExceptionType::General)),
        };

        Ok(stop)
    }

    async fn on_single_step(&mut self, thread_koid: u64) -> kestrel_target::Result<Option<Stop>> {
        let thread = self
            .threads
            .get_mut(&thread_koid)
            .ok_or(Error::NotFound)?;

        if let Some(address) = thread.current_breakpoint() {
            // done stepping over the breakpoint
            thread.set_current_breakpoint(None);
            let paused = thread.client_state() == ClientState::Paused;

            let Self {
                handle,
                threads,
                breakpoints,
                arch,
                ..
            } = self;

            let to_resume = match breakpoints.get_mut(&address) {
                Some(bp) => bp.end_step_over(thread_koid, threads, handle, arch.as_ref()),
                None => vec![thread_koid],
            };

            // the suspension keeps a paused thread stopped
            if paused && to_resume.contains(&thread_koid) {
                if let Some(thread) = self.threads.get_mut(&thread_koid) {
                    if let Err(e) = thread.hold_suspension() {
                        tracing::warn!(error = %e, "suspend");
                    }
                    thread.resume_exception();
                }
            }

            for koid in to_resume {
                self.resume_for_run_mode(koid).await;
            }

            return Ok(None);
        }

        let ip = thread.read_ip()?;

        let auto_resume = match thread.run_mode() {
            RunMode::Continue => true,
            RunMode::StepInRange(range) => range.contains(ip),
            RunMode::StepInstruction => false,
        };

        if auto_resume {
            self.resume_for_run_mode(thread_koid).await;
            return Ok(None);
        }

        Ok(Some(stop(thread_koid, ExceptionType::SingleStep)))
    }

    async fn on_software_breakpoint(
        &mut self,
        thread_koid: u64,
    ) -> kestrel_target::Result<Option<Stop>> {
        let thread = self
            .threads
            .get_mut(&thread_koid)
            .ok_or(Error::NotFound)?;

        let ip = thread.read_ip()?;
        let address = self.arch.breakpoint_address_for_software_exception(ip);

        if let Some(bp) = self.breakpoints.get(&address) {
            thread.write_ip(address)?;
            thread.set_current_breakpoint(Some(address));

            if !bp.should_hit_thread(thread_koid) {
                tracing::debug!(addr = format_args!("{address:#x}"), "breakpoint not for this thread");
                self.resume_for_run_mode(thread_koid).await;
                return Ok(None);
            }

            let hits = bp.on_hit(BreakpointKind::Software, thread_koid);

            return Ok(Some(Stop {
                thread_koid,
                exception_type: ExceptionType::Software,
                hits,
            }));
        }

        if self.arch.is_breakpoint_instruction(&self.handle, address) {
            // not ours, and it stays there
            tracing::debug!(addr = format_args!("{address:#x}"), "foreign breakpoint instruction");
            thread.write_ip(self.arch.next_instruction_for_software_exception(ip))?;
            self.resume_for_run_mode(thread_koid).await;
            return Ok(None);
        }

        // most likely a breakpoint removed while the exception was in flight
        tracing::debug!(addr = format_args!("{address:#x}"), "breakpoint instruction is gone");
        thread.write_ip(address)?;

        Ok(Some(stop(thread_koid, ExceptionType::Software)))
    }

    fn on_hardware_breakpoint(
        &mut self,
        thread_koid: u64,
        address: u64,
    ) -> kestrel_target::Result<Option<Stop>> {
        let thread = self
            .threads
            .get_mut(&thread_koid)
            .ok_or(Error::NotFound)?;

        thread.write_ip(address)?;

        let hits = match self.breakpoints.get(&address) {
            Some(bp) => {
                thread.set_current_breakpoint(Some(address));
                bp.on_hit(BreakpointKind::Hardware, thread_koid)
            }
            None => Vec::new(),
        };

        Ok(Some(Stop {
            thread_koid,
            exception_type: ExceptionType::Hardware,
            hits,
        }))
    }

    fn on_watchpoint(
        &mut self,
        thread_koid: u64,
        address: u64,
    ) -> kestrel_target::Result<Option<Stop>> {
        let thread = self
            .threads
            .get_mut(&thread_koid)
            .ok_or(Error::NotFound)?;

        let hits = match self.watchpoints.get(&address) {
            Some(wp) => {
                let ip = thread.read_ip()?;
                thread.write_ip(self.arch.next_instruction_for_watchpoint_hit(ip))?;
                wp.on_hit(thread_koid)
            }
            None => Vec::new(),
        };

        Ok(Some(Stop {
            thread_koid,
            exception_type: ExceptionType::Watchpoint,
            hits,
        }))
    }

    /// Stops debugging the process, leaving it running.
    pub async fn detach(&mut self) {
        for &address in self.breakpoints.keys() {
            for thread in self.threads.values_mut() {
                thread.will_delete_process_breakpoint(address);
            }
        }

        let Self {
            handle,
            threads,
            breakpoints,
            watchpoints,
            arch,
            ..
        } = self;

        for bp in breakpoints.values_mut() {
            bp.clear(threads, handle, arch.as_ref());
        }
        breakpoints.clear();

        for wp in watchpoints.values_mut() {
            wp.clear(threads, arch.as_ref());
        }
        watchpoints.clear();

        self.resume(&ResumeRequest::default()).await;

        self.watch = None;
    }

    /// Kills the process.
    pub fn kill(&mut self) -> kestrel_target::Result<()> {
        // no exception may be delivered for a dead process
        self.watch = None;
        self.threads.clear();

        self.handle.kill()
    }
}

fn stop(thread_koid: u64, exception_type: ExceptionType) -> Stop {
    Stop {
        thread_koid,
        exception_type,
        hits: Vec::new(),
    }
}

/// Reads a memory range in one go, or page by page if that fails.
fn read_memory_blocks(memory: &dyn MemoryAccess, address: u64, size: u32) -> Vec<MemoryBlock> {
    let mut data = vec![0u8; size as usize];

    if let Ok(read) = memory.read_memory(address, &mut data) {
        if read == data.len() {
            return vec![MemoryBlock {
                address,
                size,
                valid: true,
                data,
            }];
        }
    }

    let end = address.saturating_add(u64::from(size));
    let mut blocks: Vec<MemoryBlock> = Vec::new();
    let mut cur = address;

    while cur < end {
        let page_end = ((cur / PAGE_SIZE) + 1)
            .saturating_mul(PAGE_SIZE)
            .min(end);
        let len = (page_end - cur) as usize;

        let mut page = vec![0u8; len];
        let valid = matches!(memory.read_memory(cur, &mut page), Ok(read) if read == len);

        match blocks.last_mut() {
            Some(last) if last.valid == valid => {
                last.size += len as u32;
                if valid {
                    last.data.extend_from_slice(&page);
                }
            }
            _ => blocks.push(MemoryBlock {
                address: cur,
                size: len as u32,
                valid,
                data: if valid { page } else { Vec::new() },
            }),
        }

        cur = page_end;
    }

    blocks
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kestrel_target::{
        AddressRange, BreakpointKind, Error, ExceptionType, MemoryAccess, MemoryBlock,
        RawException, ResumeRequest, RunMode, ThreadHandle,
    };
    use test_log::test;

    use super::{DebuggedProcess, read_memory_blocks};
    use crate::arch::ArchProvider;
    use crate::arch::x64::X64;
    use crate::config::AgentConfig;
    use crate::process_breakpoint::BreakpointRef;
    use crate::testing::{MEMORY_ADDRESS, MockProcess, MockThread, ORIGINAL_DATA};

    const SOFTWARE: BreakpointRef = BreakpointRef {
        id: 1,
        thread: None,
        kind: BreakpointKind::Software,
    };

    const DR6_BS: u64 = 1 << 14;

    fn debugged(process: &MockProcess) -> DebuggedProcess<MockProcess> {
        DebuggedProcess::new(
            process.clone(),
            Arc::new(X64),
            Arc::new(AgentConfig::default()),
        )
        .expect("debug process")
    }

    /// Stops the thread at the breakpoint, then has the client resume it.
    async fn hit_and_resume(process: &mut DebuggedProcess<MockProcess>, thread: &MockThread) {
        thread.set_ip(MEMORY_ADDRESS + 1);

        let stop = process
            .on_exception(
                thread.koid(),
                thread.raise_exception(),
                RawException::SoftwareBreakpoint,
            )
            .await
            .expect("exception")
            .expect("stop");

        assert_eq!(stop.exception_type, ExceptionType::Software);
        assert_eq!(stop.hits, vec![1]);

        process
            .resume(&ResumeRequest {
                thread_koids: vec![thread.koid()],
                ..Default::default()
            })
            .await;
    }

    async fn single_step(process: &mut DebuggedProcess<MockProcess>, thread: &MockThread) {
        thread.set_debug_status(DR6_BS);

        let stop = process
            .on_exception(
                thread.koid(),
                thread.raise_exception(),
                RawException::HardwareBreakpoint,
            )
            .await
            .expect("exception");

        assert_eq!(stop, None);
    }

    fn stepping_over(process: &DebuggedProcess<MockProcess>) -> Vec<u64> {
        let bp = process
            .find_process_breakpoint(MEMORY_ADDRESS)
            .expect("breakpoint");

        (1..=5).filter(|koid| bp.is_stepping_over(*koid)).collect()
    }

    #[test]
    fn install_and_fixup() {
        let mock = MockProcess::new(1);
        let mut process = debugged(&mock);

        process
            .register_breakpoint(SOFTWARE, MEMORY_ADDRESS)
            .expect("register");
        assert!(mock.memory().starts_with_break());

        let mut block = MemoryBlock {
            address: MEMORY_ADDRESS - 4,
            size: 16,
            valid: true,
            data: vec![0; 16],
        };
        block.data[4..8].copy_from_slice(mock.memory().data());

        process
            .find_process_breakpoint(MEMORY_ADDRESS)
            .expect("breakpoint")
            .fixup_memory_block(&mut block);
        assert_eq!(block.data[4..8], ORIGINAL_DATA);

        // same through the process
        let blocks = process.read_memory(MEMORY_ADDRESS, 4);
        assert_eq!(blocks[0].data, ORIGINAL_DATA);

        assert!(matches!(
            process.register_breakpoint(SOFTWARE, MEMORY_ADDRESS),
            Err(Error::AlreadyBound)
        ));
    }

    #[test(tokio::test)]
    async fn step_multiple() {
        let mock = MockProcess::new(1);
        let threads: Vec<_> = (1..=5).map(|koid| mock.add_thread(koid)).collect();
        let [t1, t2, t3, t4, t5] = &threads[..] else {
            unreachable!()
        };

        let mut process = debugged(&mock);

        // paused by the client, so never resumed by a step over
        assert_eq!(process.pause(Some(5)).await, vec![5]);
        assert!(t5.is_suspended());

        process
            .register_breakpoint(SOFTWARE, MEMORY_ADDRESS)
            .expect("register");
        assert!(mock.memory().starts_with_break());

        hit_and_resume(&mut process, t1).await;
        assert!(mock.memory().is_original());
        assert!(t1.is_running());
        assert!(t1.state().single_step);
        assert!(t2.is_suspended() && t3.is_suspended() && t4.is_suspended());
        assert!(t5.is_suspended());
        assert_eq!(stepping_over(&process), vec![1]);

        // raced the suspension
        hit_and_resume(&mut process, t2).await;
        assert!(mock.memory().is_original());
        assert!(t1.is_running() && t2.is_running());
        assert!(t3.is_suspended() && t4.is_suspended() && t5.is_suspended());
        assert_eq!(stepping_over(&process), vec![1, 2]);

        // done first, waits for the others
        single_step(&mut process, t1).await;
        assert!(mock.memory().is_original());
        assert!(t1.is_suspended() && !t1.in_exception());
        assert!(t2.is_running());
        assert_eq!(stepping_over(&process), vec![2]);

        hit_and_resume(&mut process, t3).await;
        assert!(t2.is_running() && t3.is_running());
        assert_eq!(stepping_over(&process), vec![2, 3]);

        single_step(&mut process, t3).await;
        assert!(mock.memory().is_original());
        assert!(t1.is_suspended() && t3.is_suspended() && t4.is_suspended());
        assert!(t2.is_running());
        assert_eq!(stepping_over(&process), vec![2]);

        single_step(&mut process, t2).await;
        assert!(mock.memory().starts_with_break());
        assert_eq!(stepping_over(&process), Vec::<u64>::new());

        for thread in [t1, t2, t3, t4] {
            assert!(thread.is_running(), "thread {} is stopped", thread.koid());
            assert!(!thread.state().single_step);
        }
        assert!(t5.is_suspended());

        assert_eq!(t1.state().handled_exceptions, 2);
        assert_eq!(t1.state().unhandled_exceptions, 0);
    }

    #[test(tokio::test)]
    async fn unknown_thread_exception_is_released() {
        let mock = MockProcess::new(1);
        let mut process = debugged(&mock);

        let stranger = MockThread::new(42);
        let result = process
            .on_exception(42, stranger.raise_exception(), RawException::General)
            .await;

        assert!(matches!(result, Err(Error::NotFound)));
        assert!(!stranger.in_exception());
        assert_eq!(stranger.state().unhandled_exceptions, 1);
    }

    #[test(tokio::test)]
    async fn removing_breakpoint_mid_step_releases_threads() {
        let mock = MockProcess::new(1);
        let t1 = mock.add_thread(1);
        let t2 = mock.add_thread(2);

        let mut process = debugged(&mock);
        process
            .register_breakpoint(SOFTWARE, MEMORY_ADDRESS)
            .expect("register");

        hit_and_resume(&mut process, &t1).await;
        assert!(t2.is_suspended());

        process.unregister_breakpoint(&SOFTWARE, MEMORY_ADDRESS).await;
        assert!(process.find_process_breakpoint(MEMORY_ADDRESS).is_none());
        assert!(mock.memory().is_original());
        assert!(t2.is_running());

        // the pending single step is a plain one now
        single_step(&mut process, &t1).await;
        assert!(t1.is_running());
    }

    #[test]
    fn failed_install_is_rolled_back() {
        let mock = MockProcess::new(1);
        mock.add_thread(1);
        let mut process = debugged(&mock);

        // outside of the mapped memory
        let address = MEMORY_ADDRESS + 0x100;

        assert!(matches!(
            process.register_breakpoint(SOFTWARE, address),
            Err(Error::Io(_))
        ));
        assert!(process.find_process_breakpoint(address).is_none());
        assert!(mock.memory().is_original());

        // nothing left behind, so the same reference installs fine elsewhere
        process
            .register_breakpoint(SOFTWARE, MEMORY_ADDRESS)
            .expect("register");
        assert!(mock.memory().starts_with_break());
    }

    #[test(tokio::test)]
    async fn foreign_trap_is_stepped_past() {
        let mock = MockProcess::new(1);
        let thread = mock.add_thread(1);
        let mut process = debugged(&mock);

        // a trap nobody registered
        mock.poke(MEMORY_ADDRESS, X64.break_instruction());
        thread.set_ip(MEMORY_ADDRESS + 1);

        let stop = process
            .on_exception(1, thread.raise_exception(), RawException::SoftwareBreakpoint)
            .await
            .expect("exception");

        assert_eq!(stop, None);
        assert_eq!(thread.ip(), MEMORY_ADDRESS + 1);
        assert!(thread.is_running());
        assert_eq!(thread.state().handled_exceptions, 1);
    }

    #[test(tokio::test)]
    async fn restored_trap_stops_at_its_address() {
        let mock = MockProcess::new(1);
        let thread = mock.add_thread(1);
        let mut process = debugged(&mock);

        thread.set_ip(MEMORY_ADDRESS + 1);

        let stop = process
            .on_exception(1, thread.raise_exception(), RawException::SoftwareBreakpoint)
            .await
            .expect("exception")
            .expect("stop");

        assert_eq!(stop.exception_type, ExceptionType::Software);
        assert!(stop.hits.is_empty());
        assert_eq!(thread.ip(), MEMORY_ADDRESS);
        assert!(thread.in_exception());
    }

    #[test(tokio::test)]
    async fn step_in_range_stops_once_out() {
        let mock = MockProcess::new(1);
        let thread = mock.add_thread(1);
        let mut process = debugged(&mock);

        process
            .resume(&ResumeRequest {
                thread_koids: vec![1],
                run_mode: RunMode::StepInRange(AddressRange::new(0x1000, 0x1010)),
            })
            .await;
        assert!(thread.state().single_step);

        thread.set_ip(0x1008);
        single_step(&mut process, &thread).await;
        assert!(thread.is_running());
        assert!(thread.state().single_step);

        thread.set_ip(0x1010);
        thread.set_debug_status(DR6_BS);

        let stop = process
            .on_exception(1, thread.raise_exception(), RawException::HardwareBreakpoint)
            .await
            .expect("exception")
            .expect("stop");

        assert_eq!(stop.exception_type, ExceptionType::SingleStep);
        assert!(thread.in_exception());
    }

    #[test(tokio::test)]
    async fn faults_are_general_stops() {
        let mock = MockProcess::new(1);
        let t1 = mock.add_thread(1);
        let t2 = mock.add_thread(2);
        let mut process = debugged(&mock);

        for (thread, kind) in [(&t1, RawException::PageFault), (&t2, RawException::General)] {
            let stop = process
                .on_exception(thread.koid(), thread.raise_exception(), kind)
                .await
                .expect("exception")
                .expect("stop");

            assert_eq!(stop.exception_type, ExceptionType::General);
            assert!(stop.hits.is_empty());
            assert!(thread.in_exception());
        }
    }

    #[test(tokio::test)]
    async fn paused_stepper_stays_suspended() {
        let mock = MockProcess::new(1);
        let thread = mock.add_thread(1);
        let mut process = debugged(&mock);

        process
            .register_breakpoint(SOFTWARE, MEMORY_ADDRESS)
            .expect("register");

        hit_and_resume(&mut process, &thread).await;
        assert!(thread.is_running());

        assert_eq!(process.pause(Some(1)).await, vec![1]);

        single_step(&mut process, &thread).await;
        assert!(mock.memory().starts_with_break());
        assert!(!thread.in_exception());
        assert!(thread.is_suspended());
        assert_eq!(thread.state().handled_exceptions, 2);

        process.resume(&ResumeRequest::default()).await;
        assert!(thread.is_running());
    }

    struct EvenPages;

    impl MemoryAccess for EvenPages {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> kestrel_target::Result<usize> {
            let first = addr / 0x1000;
            let last = (addr + buf.len() as u64 - 1) / 0x1000;

            if (first..=last).any(|page| page % 2 == 1) {
                return Err(Error::Io(std::io::Error::from_raw_os_error(14)));
            }

            buf.fill(0xaa);
            Ok(buf.len())
        }

        fn write_memory(&mut self, _addr: u64, _data: &[u8]) -> kestrel_target::Result<usize> {
            Err(Error::NotSupported)
        }
    }

    #[test]
    fn unreadable_pages_are_split() {
        let blocks = read_memory_blocks(&EvenPages, 0x1800, 0x2000);

        let layout: Vec<_> = blocks
            .iter()
            .map(|b| (b.address, b.size, b.valid, b.data.len()))
            .collect();

        assert_eq!(
            layout,
            vec![
                (0x1800, 0x800, false, 0),
                (0x2000, 0x1000, true, 0x1000),
                (0x3000, 0x800, false, 0),
            ]
        );

        let blocks = read_memory_blocks(&EvenPages, 0x2000, 0x100);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].valid);
    }
}
