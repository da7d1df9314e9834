use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_target::{
    Error, ExceptionType, MemoryBlock, Notification, NotificationSink, ProcessHandle, Register,
    RegisterCategory, ResumeRequest, StackAmount, StateKind, SymbolResolver, TargetEvent,
    ThreadCreation, ThreadRecord, Unwinder,
};

use crate::arch::{self, ArchProvider};
use crate::breakpoint::{Breakpoint, BreakpointSettings, Watchpoint, WatchpointSettings};
use crate::config::AgentConfig;
use crate::job::DebuggedJob;
use crate::process::{DebuggedProcess, Stop};
use crate::process_breakpoint::BreakpointRef;
use crate::stack::Stack;
use crate::unwind::FramePointerUnwinder;
use crate::watchpoint::WatchpointRef;

/// Debug engine.
///
/// This is the single dispatch context of the engine: every target event
/// and every client request goes through `&mut self`, so none of the state
/// below needs locking.
pub struct DebugAgent<P: ProcessHandle, N: NotificationSink> {
    config: Arc<AgentConfig>,
    sink: N,

    /// Unwinder of the stacks attached to notifications.
    unwinder: Box<dyn Unwinder>,

    processes: BTreeMap<u64, DebuggedProcess<P>>,
    jobs: BTreeMap<u64, DebuggedJob>,
    breakpoints: BTreeMap<u32, Breakpoint>,
    watchpoints: BTreeMap<u32, Watchpoint>,
}

impl<P: ProcessHandle, N: NotificationSink> DebugAgent<P, N> {
    /// Creates an engine with the default configuration.
    pub fn new(sink: N) -> Self {
        Self::with_config(AgentConfig::default(), sink)
    }

    /// Creates an engine.
    pub fn with_config(config: AgentConfig, sink: N) -> Self {
        Self {
            config: Arc::new(config),
            sink,
            unwinder: Box::new(FramePointerUnwinder),
            processes: BTreeMap::new(),
            jobs: BTreeMap::new(),
            breakpoints: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
        }
    }

    /// Replaces the unwinder used for the stacks of notifications.
    pub fn set_unwinder(&mut self, unwinder: Box<dyn Unwinder>) {
        self.unwinder = unwinder;
    }

    /// Returns the notification sink.
    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// Returns the notification sink.
    pub fn sink_mut(&mut self) -> &mut N {
        &mut self.sink
    }

    /// Returns a debugged process.
    pub fn process(&self, koid: u64) -> Option<&DebuggedProcess<P>> {
        self.processes.get(&koid)
    }

    /// Returns a logical breakpoint.
    pub fn breakpoint(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// Returns a logical watchpoint.
    pub fn watchpoint(&self, id: u32) -> Option<&Watchpoint> {
        self.watchpoints.get(&id)
    }

    /// Attaches to a process, with the strategy of its architecture.
    pub async fn attach_process(&mut self, handle: P) -> kestrel_target::Result<u64> {
        let arch = arch::provider_for(handle.arch());
        self.attach_process_with_arch(handle, arch).await
    }

    /// Attaches to a process.
    ///
    /// Its threads are left running. Logical breakpoints and watchpoints
    /// with locations in the process get installed.
    pub async fn attach_process_with_arch(
        &mut self,
        handle: P,
        arch: Arc<dyn ArchProvider>,
    ) -> kestrel_target::Result<u64> {
        let koid = handle.koid();

        if self.processes.contains_key(&koid) {
            return Err(Error::AlreadyBound);
        }

        let process = DebuggedProcess::new(handle, arch, self.config.clone())?;
        tracing::info!(process = koid, name = process.name(), "attached");

        self.processes.insert(koid, process);

        let ids: Vec<_> = self.breakpoints.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.apply_breakpoint(id).await {
                tracing::warn!(id, error = %e, "install breakpoint in new process");
            }
        }

        let ids: Vec<_> = self.watchpoints.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.apply_watchpoint(id).await {
                tracing::warn!(id, error = %e, "install watchpoint in new process");
            }
        }

        Ok(koid)
    }

    /// Detaches from a process, leaving it running.
    pub async fn detach_process(&mut self, koid: u64) -> kestrel_target::Result<()> {
        let mut process = self.processes.remove(&koid).ok_or(Error::NotFound)?;
        process.detach().await;
        self.forget_process(koid);

        tracing::info!(process = koid, "detached");
        Ok(())
    }

    /// Kills a process.
    pub fn kill_process(&mut self, koid: u64) -> kestrel_target::Result<()> {
        let mut process = self.processes.remove(&koid).ok_or(Error::NotFound)?;
        self.forget_process(koid);

        process.kill()
    }

    fn forget_process(&mut self, koid: u64) {
        for bp in self.breakpoints.values_mut() {
            bp.registered.retain(|(loc, _)| loc.process_koid != koid);
        }

        for wp in self.watchpoints.values_mut() {
            wp.registered.retain(|loc| loc.process_koid != koid);
        }
    }

    /// Starts watching process creations within a job.
    pub fn attach_job(&mut self, koid: u64) -> kestrel_target::Result<()> {
        if self.jobs.contains_key(&koid) {
            return Err(Error::AlreadyBound);
        }

        self.jobs.insert(koid, DebuggedJob::new(koid));
        Ok(())
    }

    /// Stops watching process creations within a job.
    pub fn detach_job(&mut self, koid: u64) -> kestrel_target::Result<()> {
        self.jobs.remove(&koid).map(drop).ok_or(Error::NotFound)
    }

    /// Replaces the process name filters of a job.
    pub fn set_job_filters(&mut self, koid: u64, filters: Vec<String>) -> kestrel_target::Result<()> {
        let job = self.jobs.get_mut(&koid).ok_or(Error::NotFound)?;
        job.set_filters(filters);
        Ok(())
    }

    /// Sends the module list of a process.
    pub async fn send_modules(
        &mut self,
        process_koid: u64,
        stopped_thread_koids: Vec<u64>,
    ) -> kestrel_target::Result<()> {
        let process = self.processes.get(&process_koid).ok_or(Error::NotFound)?;
        let notification = process.modules_notification(stopped_thread_koids).await;

        self.sink.notify(notification);
        Ok(())
    }

    /// Pauses a thread, every thread of a process, or every thread of every
    /// process.
    ///
    /// Returns the records of the paused threads.
    pub async fn pause(
        &mut self,
        process_koid: Option<u64>,
        thread_koid: Option<u64>,
    ) -> Vec<ThreadRecord> {
        let mut records = Vec::new();

        for (koid, process) in self.processes.iter_mut() {
            if process_koid.is_some_and(|wanted| wanted != *koid) {
                continue;
            }

            let thread_koid = process_koid.and(thread_koid);

            for paused in process.pause(thread_koid).await {
                records.extend(process.thread_record(
                    paused,
                    StackAmount::Minimal,
                    self.unwinder.as_mut(),
                ));
            }
        }

        records
    }

    /// Resumes threads of a process, or of every process.
    pub async fn resume(&mut self, process_koid: Option<u64>, request: &ResumeRequest) {
        for (koid, process) in self.processes.iter_mut() {
            if process_koid.is_none_or(|wanted| wanted == *koid) {
                process.resume(request).await;
            }
        }
    }

    /// Returns the record of a thread, with its full stack if stopped.
    pub fn thread_status(
        &mut self,
        process_koid: u64,
        thread_koid: u64,
    ) -> kestrel_target::Result<ThreadRecord> {
        let process = self.processes.get(&process_koid).ok_or(Error::NotFound)?;

        process
            .thread_record(thread_koid, StackAmount::Full, self.unwinder.as_mut())
            .ok_or(Error::NotFound)
    }

    /// Reads registers of a stopped thread.
    pub fn read_registers(
        &self,
        process_koid: u64,
        thread_koid: u64,
        kinds: &[StateKind],
    ) -> kestrel_target::Result<Vec<RegisterCategory>> {
        let thread = self
            .processes
            .get(&process_koid)
            .and_then(|p| p.thread(thread_koid))
            .ok_or(Error::NotFound)?;

        if !thread.is_stopped() {
            return Err(Error::BadState);
        }

        Ok(thread.read_registers(kinds))
    }

    /// Writes registers of a stopped thread.
    pub fn write_registers(
        &mut self,
        process_koid: u64,
        thread_koid: u64,
        registers: &[Register],
    ) -> kestrel_target::Result<()> {
        let thread = self
            .processes
            .get_mut(&process_koid)
            .and_then(|p| p.thread_mut(thread_koid))
            .ok_or(Error::NotFound)?;

        if !thread.is_stopped() {
            return Err(Error::BadState);
        }

        thread.write_registers(registers)
    }

    /// Reads memory of a process.
    pub fn read_memory(
        &self,
        process_koid: u64,
        address: u64,
        size: u32,
    ) -> kestrel_target::Result<Vec<MemoryBlock>> {
        let process = self.processes.get(&process_koid).ok_or(Error::NotFound)?;
        Ok(process.read_memory(address, size))
    }

    /// Writes memory of a process.
    pub fn write_memory(
        &mut self,
        process_koid: u64,
        address: u64,
        data: &[u8],
    ) -> kestrel_target::Result<()> {
        let process = self
            .processes
            .get_mut(&process_koid)
            .ok_or(Error::NotFound)?;

        process.write_memory(address, data)
    }

    /// Materializes the logical stack of a stopped thread.
    pub async fn stack(
        &self,
        process_koid: u64,
        thread_koid: u64,
        resolver: &impl SymbolResolver,
        unwinder: &mut dyn Unwinder,
        max_depth: usize,
    ) -> kestrel_target::Result<Stack> {
        let process = self.processes.get(&process_koid).ok_or(Error::NotFound)?;
        let thread = process.thread(thread_koid).ok_or(Error::NotFound)?;

        if !thread.is_stopped() {
            return Err(Error::BadState);
        }

        let raw = thread.unwind(process.handle(), unwinder, max_depth);
        Ok(Stack::from_raw_frames(raw, resolver).await)
    }

    /// Creates or updates a logical breakpoint.
    ///
    /// Locations failing to install are reported through the returned
    /// error, the other locations stay installed.
    pub async fn add_or_change_breakpoint(
        &mut self,
        settings: BreakpointSettings,
    ) -> kestrel_target::Result<()> {
        let id = settings.id;

        match self.breakpoints.get_mut(&id) {
            Some(bp) => bp.set_settings(settings),
            None => {
                self.breakpoints.insert(id, Breakpoint::new(settings));
            }
        }

        self.apply_breakpoint(id).await
    }

    /// Deletes a logical breakpoint.
    pub async fn remove_breakpoint(&mut self, id: u32) -> kestrel_target::Result<()> {
        let bp = self.breakpoints.remove(&id).ok_or(Error::NotFound)?;

        for (loc, kind) in bp.registered {
            if let Some(process) = self.processes.get_mut(&loc.process_koid) {
                let r = BreakpointRef {
                    id,
                    thread: loc.thread_koid,
                    kind,
                };
                process.unregister_breakpoint(&r, loc.address).await;
            }
        }

        Ok(())
    }

    /// Registers the wanted locations of a logical breakpoint which are not
    /// registered yet, and unregisters the others.
    async fn apply_breakpoint(&mut self, id: u32) -> kestrel_target::Result<()> {
        let bp = self.breakpoints.get_mut(&id).ok_or(Error::NotFound)?;

        let kind = bp.settings().kind;
        let wanted = bp.wanted_locations().to_vec();
        let previous = std::mem::take(&mut bp.registered);

        let mut registered = Vec::new();
        let mut result = Ok(());

        for (loc, old_kind) in previous {
            if old_kind == kind && wanted.contains(&loc) {
                registered.push((loc, kind));
                continue;
            }

            if let Some(process) = self.processes.get_mut(&loc.process_koid) {
                let r = BreakpointRef {
                    id,
                    thread: loc.thread_koid,
                    kind: old_kind,
                };
                process.unregister_breakpoint(&r, loc.address).await;
            }
        }

        for loc in wanted {
            if registered.contains(&(loc, kind)) {
                continue;
            }

            // installed once attached
            let Some(process) = self.processes.get_mut(&loc.process_koid) else {
                continue;
            };

            let r = BreakpointRef {
                id,
                thread: loc.thread_koid,
                kind,
            };

            match process.register_breakpoint(r, loc.address) {
                Ok(()) => registered.push((loc, kind)),
                Err(e) => {
                    tracing::warn!(
                        id,
                        addr = format_args!("{:#x}", loc.address),
                        error = %e,
                        "register breakpoint"
                    );

                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.registered = registered;
        }

        result
    }

    /// Creates or updates a logical watchpoint.
    pub async fn add_or_change_watchpoint(
        &mut self,
        settings: WatchpointSettings,
    ) -> kestrel_target::Result<()> {
        let id = settings.id;

        match self.watchpoints.get_mut(&id) {
            Some(wp) => wp.set_settings(settings),
            None => {
                self.watchpoints.insert(id, Watchpoint::new(settings));
            }
        }

        self.apply_watchpoint(id).await
    }

    /// Deletes a logical watchpoint.
    pub async fn remove_watchpoint(&mut self, id: u32) -> kestrel_target::Result<()> {
        let wp = self.watchpoints.remove(&id).ok_or(Error::NotFound)?;

        for loc in wp.registered {
            if let Some(process) = self.processes.get_mut(&loc.process_koid) {
                let r = WatchpointRef {
                    id,
                    thread: loc.thread_koid,
                };
                process.unregister_watchpoint(&r, loc.range);
            }
        }

        Ok(())
    }

    async fn apply_watchpoint(&mut self, id: u32) -> kestrel_target::Result<()> {
        let wp = self.watchpoints.get_mut(&id).ok_or(Error::NotFound)?;

        let wanted = wp.settings().locations.clone();
        let previous = std::mem::take(&mut wp.registered);

        let mut registered = Vec::new();
        let mut result = Ok(());

        for loc in previous {
            if wanted.contains(&loc) {
                registered.push(loc);
            } else if let Some(process) = self.processes.get_mut(&loc.process_koid) {
                let r = WatchpointRef {
                    id,
                    thread: loc.thread_koid,
                };
                process.unregister_watchpoint(&r, loc.range);
            }
        }

        for loc in wanted {
            if registered.contains(&loc) {
                continue;
            }

            let Some(process) = self.processes.get_mut(&loc.process_koid) else {
                continue;
            };

            let r = WatchpointRef {
                id,
                thread: loc.thread_koid,
            };

            match process.register_watchpoint(r, loc.range) {
                Ok(()) => registered.push(loc),
                Err(e) => {
                    tracing::warn!(id, error = %e, "register watchpoint");

                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        if let Some(wp) = self.watchpoints.get_mut(&id) {
            wp.registered = registered;
        }

        result
    }

    /// Handles an event of a target.
    pub async fn on_event(&mut self, event: TargetEvent<P>) {
        match event {
            TargetEvent::ProcessStarting { job_koid, process } => {
                self.on_process_starting(job_koid, process).await;
            }

            TargetEvent::ThreadStarting {
                process_koid,
                thread,
                exception,
            } => {
                let Some(process) = self.processes.get_mut(&process_koid) else {
                    tracing::warn!(process = process_koid, "thread of unknown process");
                    return;
                };

                let creation = match exception {
                    Some(_) => ThreadCreation::SuspendedShouldRun,
                    None => ThreadCreation::RunningKeepRunning,
                };

                let record = process.on_thread_starting(
                    thread,
                    exception,
                    creation,
                    self.unwinder.as_mut(),
                );

                self.sink.notify(Notification::ThreadStarting(record));
            }

            TargetEvent::ThreadExiting {
                process_koid,
                thread_koid,
            } => {
                let Some(process) = self.processes.get_mut(&process_koid) else {
                    return;
                };

                if let Some(record) = process.on_thread_exiting(thread_koid).await {
                    self.sink.notify(Notification::ThreadExiting(record));
                }
            }

            TargetEvent::Exception {
                process_koid,
                thread_koid,
                exception,
                kind,
            } => {
                let Some(process) = self.processes.get_mut(&process_koid) else {
                    tracing::error!(process = process_koid, "exception of unknown process");
                    return;
                };

                match process.on_exception(thread_koid, exception, kind).await {
                    Ok(Some(stop)) => self.on_stop(process_koid, stop).await,
                    Ok(None) => (),
                    Err(e) => {
                        tracing::error!(
                            process = process_koid,
                            thread = thread_koid,
                            error = %e,
                            "handle exception"
                        );
                    }
                }
            }

            TargetEvent::ProcessTerminated {
                process_koid,
                return_code,
            } => {
                if self.processes.remove(&process_koid).is_none() {
                    return;
                }
                self.forget_process(process_koid);

                tracing::info!(process = process_koid, return_code, "process exited");

                self.sink.notify(Notification::ProcessExiting {
                    process_koid,
                    return_code,
                });
            }
        }
    }

    async fn on_process_starting(&mut self, job_koid: u64, process: P) {
        let Some(job) = self.jobs.get(&job_koid) else {
            tracing::debug!(job = job_koid, "process of unknown job");
            return;
        };

        let name = process.name();

        let Some(filter) = job.match_process(&name).map(str::to_owned) else {
            tracing::debug!(%name, "no filter matched");
            return;
        };

        let koid = match self.attach_process(process).await {
            Ok(koid) => koid,
            Err(e) => {
                tracing::warn!(%name, error = %e, "attach to new process");
                return;
            }
        };

        self.sink.notify(Notification::ProcessStarting {
            process_koid: koid,
            name,
            filter,
        });

        if let Err(e) = self.send_modules(koid, Vec::new()).await {
            tracing::warn!(process = koid, error = %e, "send modules");
        }
    }

    /// Reports a stop.
    ///
    /// Hit counts are updated first, then one-shot breakpoints are deleted,
    /// now that no registry is being walked anymore.
    async fn on_stop(&mut self, process_koid: u64, stop: Stop) {
        let watchpoint = stop.exception_type == ExceptionType::Watchpoint;

        let stats: Vec<_> = stop
            .hits
            .iter()
            .filter_map(|id| {
                if watchpoint {
                    self.watchpoints.get_mut(id).map(Watchpoint::on_hit)
                } else {
                    self.breakpoints.get_mut(id).map(Breakpoint::on_hit)
                }
            })
            .collect();

        for stat in stats.iter().filter(|s| s.should_delete) {
            let result = if watchpoint {
                self.remove_watchpoint(stat.id).await
            } else {
                self.remove_breakpoint(stat.id).await
            };

            if let Err(e) = result {
                tracing::warn!(id = stat.id, error = %e, "delete one-shot breakpoint");
            }
        }

        let Some(record) = self.processes.get(&process_koid).and_then(|process| {
            process.thread_record(stop.thread_koid, StackAmount::Minimal, self.unwinder.as_mut())
        }) else {
            return;
        };

        tracing::debug!(
            thread = stop.thread_koid,
            exception = %stop.exception_type,
            "thread stopped"
        );

        self.sink.notify(Notification::Exception {
            thread: record,
            exception_type: stop.exception_type,
            hit_breakpoints: stats,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kestrel_target::{
        AddressRange, BreakpointKind, BreakpointStats, ExceptionType, Notification, RawException,
        StateKind, TargetEvent, ThreadHandle,
    };
    use test_log::test;

    use super::DebugAgent;
    use crate::arch::ArchProvider;
    use crate::breakpoint::{
        BreakpointLocation, BreakpointSettings, WatchpointLocation, WatchpointSettings,
    };
    use crate::testing::{MEMORY_ADDRESS, MockArch, MockProcess, MockThread, ORIGINAL_DATA};

    const PROCESS_KOID: u64 = 1;

    type Agent = DebugAgent<MockProcess, Vec<Notification>>;

    fn settings(id: u32, thread_koid: Option<u64>) -> BreakpointSettings {
        BreakpointSettings {
            id,
            enabled: true,
            one_shot: false,
            kind: BreakpointKind::Software,
            locations: vec![BreakpointLocation {
                process_koid: PROCESS_KOID,
                thread_koid,
                address: MEMORY_ADDRESS,
            }],
        }
    }

    async fn raise(agent: &mut Agent, thread: &MockThread, kind: RawException) {
        agent
            .on_event(TargetEvent::Exception {
                process_koid: PROCESS_KOID,
                thread_koid: thread.koid(),
                exception: thread.raise_exception(),
                kind,
            })
            .await;
    }

    async fn hit_software_breakpoint(agent: &mut Agent, thread: &MockThread) {
        thread.set_ip(MEMORY_ADDRESS + 1);
        raise(agent, thread, RawException::SoftwareBreakpoint).await;
    }

    fn last_exception(agent: &Agent) -> (ExceptionType, Vec<BreakpointStats>) {
        match agent.sink().last() {
            Some(Notification::Exception {
                exception_type,
                hit_breakpoints,
                ..
            }) => (*exception_type, hit_breakpoints.clone()),
            other => panic!("expected an exception notification, got {other:?}"),
        }
    }

    #[test(tokio::test)]
    async fn breakpoints_sharing_an_address() {
        let process = MockProcess::new(PROCESS_KOID);
        let thread = process.add_thread(10);

        let mut agent = Agent::new(Vec::new());
        agent.attach_process(process.clone()).await.expect("attach");

        agent.add_or_change_breakpoint(settings(1, None)).await.expect("add");
        agent.add_or_change_breakpoint(settings(2, None)).await.expect("add");
        assert!(process.memory().starts_with_break());

        hit_software_breakpoint(&mut agent, &thread).await;

        let (exception_type, stats) = last_exception(&agent);
        assert_eq!(exception_type, ExceptionType::Software);
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.hit_count == 1 && !s.should_delete));
        assert_eq!(thread.ip(), MEMORY_ADDRESS);
        assert!(thread.in_exception());

        agent.remove_breakpoint(1).await.expect("remove");
        assert!(process.memory().starts_with_break());

        agent.remove_breakpoint(2).await.expect("remove");
        assert!(process.memory().is_original());
        assert!(agent.remove_breakpoint(2).await.is_err());
    }

    #[test(tokio::test)]
    async fn one_shot_breakpoint_is_deleted_on_hit() {
        let process = MockProcess::new(PROCESS_KOID);
        let thread = process.add_thread(10);

        let mut agent = Agent::new(Vec::new());
        agent.attach_process(process.clone()).await.expect("attach");

        let mut one_shot = settings(1, None);
        one_shot.one_shot = true;
        agent.add_or_change_breakpoint(one_shot).await.expect("add");

        hit_software_breakpoint(&mut agent, &thread).await;

        let (_, stats) = last_exception(&agent);
        assert_eq!(
            stats,
            vec![BreakpointStats {
                id: 1,
                hit_count: 1,
                should_delete: true,
            }]
        );

        assert!(agent.breakpoint(1).is_none());
        assert!(process.memory().is_original());

        let debugged = agent.process(PROCESS_KOID).expect("process");
        assert!(debugged.find_process_breakpoint(MEMORY_ADDRESS).is_none());
        assert_eq!(debugged.thread(10).and_then(|t| t.current_breakpoint()), None);

        // nothing to step over anymore
        agent.resume(None, &Default::default()).await;
        assert!(thread.is_running());
        assert!(!thread.state().single_step);
    }

    #[test(tokio::test)]
    async fn foreign_thread_steps_over_silently() {
        let process = MockProcess::new(PROCESS_KOID);
        let stepper = process.add_thread(10);
        let other = process.add_thread(11);

        let mut agent = Agent::new(Vec::new());
        agent.attach_process(process.clone()).await.expect("attach");
        agent
            .add_or_change_breakpoint(settings(1, Some(11)))
            .await
            .expect("add");

        hit_software_breakpoint(&mut agent, &stepper).await;

        // the stepper runs over the original instruction, alone
        assert!(agent.sink().is_empty());
        assert!(process.memory().is_original());
        assert!(!stepper.in_exception());
        assert!(stepper.state().single_step);
        assert!(other.is_suspended());
        assert_eq!(agent.breakpoint(1).map(|bp| bp.hit_count()), Some(0));

        stepper.set_debug_status(1 << 14);
        agent
            .on_event(TargetEvent::Exception {
                process_koid: PROCESS_KOID,
                thread_koid: 10,
                exception: stepper.raise_exception(),
                kind: RawException::HardwareBreakpoint,
            })
            .await;

        assert!(agent.sink().is_empty());
        assert!(process.memory().starts_with_break());
        assert!(stepper.is_running());
        assert!(!stepper.state().single_step);
        assert_eq!(stepper.state().handled_exceptions, 2);
        assert!(other.is_running());
    }

    #[test(tokio::test)]
    async fn unreadable_registers_stop_the_thread() {
        let process = MockProcess::new(PROCESS_KOID);
        let thread = process.add_thread(10);

        let mut agent = Agent::new(Vec::new());
        agent.attach_process(process.clone()).await.expect("attach");
        agent.add_or_change_breakpoint(settings(1, None)).await.expect("add");

        thread.set_block(StateKind::General, Vec::new());
        raise(&mut agent, &thread, RawException::SoftwareBreakpoint).await;

        let (exception_type, stats) = last_exception(&agent);
        assert_eq!(exception_type, ExceptionType::General);
        assert!(stats.is_empty());
        assert!(thread.in_exception());
        assert_eq!(agent.breakpoint(1).map(|bp| bp.hit_count()), Some(0));
    }

    #[test(tokio::test)]
    async fn hardware_breakpoint_hit_and_step_over() {
        let process = MockProcess::new(PROCESS_KOID);
        let thread = process.add_thread(10);

        let mut agent = Agent::new(Vec::new());
        agent.attach_process(process.clone()).await.expect("attach");

        let mut hardware = settings(1, None);
        hardware.kind = BreakpointKind::Hardware;
        agent.add_or_change_breakpoint(hardware).await.expect("add");
        assert_eq!(thread.debug_control() & 1, 1);
        assert!(process.memory().is_original());

        // DR6.B0
        thread.set_debug_status(1);
        raise(&mut agent, &thread, RawException::HardwareBreakpoint).await;

        let (exception_type, stats) = last_exception(&agent);
        assert_eq!(exception_type, ExceptionType::Hardware);
        assert_eq!(
            stats,
            vec![BreakpointStats {
                id: 1,
                hit_count: 1,
                should_delete: false,
            }]
        );
        assert_eq!(thread.ip(), MEMORY_ADDRESS);
        assert!(thread.in_exception());

        // the slot is lifted for the step
        agent.resume(None, &Default::default()).await;
        assert_eq!(thread.debug_control() & 1, 0);
        assert!(thread.state().single_step);
        assert!(thread.is_running());

        let notifications = agent.sink().len();
        thread.set_debug_status(1 << 14);
        raise(&mut agent, &thread, RawException::HardwareBreakpoint).await;

        assert_eq!(agent.sink().len(), notifications);
        assert_eq!(thread.debug_control() & 1, 1);
        assert!(!thread.state().single_step);
        assert!(thread.is_running());
    }

    #[test(tokio::test)]
    async fn one_shot_watchpoint_is_deleted_on_hit() {
        let process = MockProcess::new(PROCESS_KOID);
        let thread = process.add_thread(10);

        let mut agent = Agent::new(Vec::new());
        agent.attach_process(process.clone()).await.expect("attach");

        agent
            .add_or_change_watchpoint(WatchpointSettings {
                id: 7,
                one_shot: true,
                locations: vec![WatchpointLocation {
                    process_koid: PROCESS_KOID,
                    thread_koid: None,
                    range: AddressRange::new(MEMORY_ADDRESS + 0x44, MEMORY_ADDRESS + 0x48),
                }],
            })
            .await
            .expect("add");

        assert_ne!(thread.debug_control(), 0);
        assert!(
            agent
                .process(PROCESS_KOID)
                .and_then(|p| p.find_watchpoint(MEMORY_ADDRESS + 0x40))
                .is_some()
        );

        thread.set_ip(0x1000);
        thread.set_debug_status(1);
        raise(&mut agent, &thread, RawException::HardwareBreakpoint).await;

        let (exception_type, stats) = last_exception(&agent);
        assert_eq!(exception_type, ExceptionType::Watchpoint);
        assert_eq!(
            stats,
            vec![BreakpointStats {
                id: 7,
                hit_count: 1,
                should_delete: true,
            }]
        );
        assert_eq!(thread.ip(), 0x1000);
        assert!(thread.in_exception());

        assert!(agent.watchpoint(7).is_none());
        assert_eq!(thread.debug_control(), 0);
        assert!(
            agent
                .process(PROCESS_KOID)
                .and_then(|p| p.find_watchpoint(MEMORY_ADDRESS + 0x40))
                .is_none()
        );
    }

    #[test(tokio::test)]
    async fn hardware_breakpoint_scope() {
        let process = MockProcess::new(PROCESS_KOID);
        process.add_thread(10);
        process.add_thread(11);

        let arch = Arc::new(MockArch::default());

        let mut agent = Agent::new(Vec::new());
        agent
            .attach_process_with_arch(process.clone(), arch.clone() as Arc<dyn ArchProvider>)
            .await
            .expect("attach");

        let mut hardware = settings(1, None);
        hardware.kind = BreakpointKind::Hardware;
        agent
            .add_or_change_breakpoint(hardware.clone())
            .await
            .expect("add");

        assert_eq!(arch.breakpoint_install_count(MEMORY_ADDRESS), 2);
        assert!(process.memory().is_original());

        hardware.locations[0].thread_koid = Some(11);
        agent.add_or_change_breakpoint(hardware).await.expect("change");

        assert_eq!(arch.breakpoint_uninstall_count(MEMORY_ADDRESS), 2);
        assert_eq!(arch.breakpoint_install_count(MEMORY_ADDRESS), 3);

        // a new thread is out of scope
        let thread = process.add_thread(12);
        agent
            .on_event(TargetEvent::ThreadStarting {
                process_koid: PROCESS_KOID,
                thread,
                exception: None,
            })
            .await;

        assert_eq!(arch.total_breakpoint_install_calls(), 3);
        assert!(matches!(
            agent.sink().last(),
            Some(Notification::ThreadStarting(record)) if record.thread_koid == 12
        ));

        agent.remove_breakpoint(1).await.expect("remove");
        assert_eq!(arch.total_breakpoint_uninstall_calls(), 3);
    }

    #[test(tokio::test)]
    async fn breakpoints_apply_to_attached_processes() {
        let process = MockProcess::new(PROCESS_KOID);
        process.add_thread(10);

        let mut agent = Agent::new(Vec::new());
        agent.add_or_change_breakpoint(settings(1, None)).await.expect("add");
        assert!(process.memory().is_original());

        agent.attach_process(process.clone()).await.expect("attach");
        assert!(process.is_watching());
        assert!(process.memory().starts_with_break());

        // reading memory hides the trap
        let blocks = agent
            .read_memory(PROCESS_KOID, MEMORY_ADDRESS, 4)
            .expect("read");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, ORIGINAL_DATA);

        agent.detach_process(PROCESS_KOID).await.expect("detach");
        assert!(!process.is_watching());
        assert!(process.memory().is_original());
        assert!(agent.process(PROCESS_KOID).is_none());

        agent.attach_process(process.clone()).await.expect("attach again");
        assert!(process.memory().starts_with_break());

        agent.kill_process(PROCESS_KOID).expect("kill");
        assert!(process.is_killed());
        assert!(agent.kill_process(PROCESS_KOID).is_err());
    }

    #[test(tokio::test)]
    async fn job_filter_attaches_new_processes() {
        let mut agent = Agent::new(Vec::new());
        agent.attach_job(5).expect("attach job");
        agent
            .set_job_filters(5, vec!["^server$".to_owned(), "client".to_owned()])
            .expect("filters");

        agent
            .on_event(TargetEvent::ProcessStarting {
                job_koid: 5,
                process: MockProcess::with_name(2, "unrelated"),
            })
            .await;
        assert!(agent.sink().is_empty());

        let process = MockProcess::with_name(3, "test-client");
        agent
            .on_event(TargetEvent::ProcessStarting {
                job_koid: 5,
                process: process.clone(),
            })
            .await;

        assert!(process.is_watching());
        assert_eq!(agent.sink().len(), 2);
        assert_eq!(
            agent.sink()[0],
            Notification::ProcessStarting {
                process_koid: 3,
                name: "test-client".to_owned(),
                filter: "client".to_owned(),
            }
        );
        assert!(matches!(
            &agent.sink()[1],
            Notification::Modules { process_koid: 3, modules, .. } if modules.len() == 1
        ));

        agent
            .on_event(TargetEvent::ProcessTerminated {
                process_koid: 3,
                return_code: 0,
            })
            .await;
        assert!(agent.process(3).is_none());
        assert_eq!(
            agent.sink().last(),
            Some(&Notification::ProcessExiting {
                process_koid: 3,
                return_code: 0,
            })
        );

        agent.detach_job(5).expect("detach job");
        assert!(agent.detach_job(5).is_err());
    }
}
