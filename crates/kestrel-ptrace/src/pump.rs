use std::time::Duration;

use kestrel_target::{RawException, StateKind, TargetEvent};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::process::PtraceProcess;
use crate::thread::{PtraceExceptionToken, PtraceThread};
use crate::tracee::{SharedTracees, Stop, Tracees, lock};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

// `si_code` values of SIGTRAP
const SI_KERNEL: i32 = 0x80;
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;
const TRAP_HWBKPT: i32 = 4;

/// Source of the [TargetEvent]s of a [PtraceProcess].
pub struct EventPump {
    tracees: SharedTracees,
}

impl EventPump {
    pub(crate) fn new(tracees: SharedTracees) -> Self {
        Self { tracees }
    }

    /// Waits for the next event of the process.
    ///
    /// Returns `None` once the process has terminated.
    pub async fn next_event(&mut self) -> Option<TargetEvent<PtraceProcess>> {
        loop {
            match self.poll_status() {
                Ok(Some(status)) => {
                    if let Some(event) = self.handle_status(status) {
                        return Some(event);
                    }
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(()) => return None,
            }
        }
    }

    fn poll_status(&mut self) -> Result<Option<WaitStatus>, ()> {
        let mut tracees = lock(&self.tracees);

        if let Some(status) = tracees.backlog.pop_front() {
            return Ok(Some(status));
        }

        if tracees.terminated {
            return Err(());
        }

        // only tracees of this thread, see the crate docs
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;

        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(status)),
            Err(Errno::ECHILD) => {
                tracing::warn!(pid = tracees.leader.as_raw(), "no task left to wait for");
                tracees.terminated = true;
                Err(())
            }
            Err(Errno::EINTR) => Ok(None),
            Err(e) => {
                tracing::error!(error = %e, "waitpid");
                Ok(None)
            }
        }
    }

    fn handle_status(&mut self, status: WaitStatus) -> Option<TargetEvent<PtraceProcess>> {
        let mut tracees = lock(&self.tracees);
        let process_koid = tracees.leader.as_raw() as u64;

        tracing::trace!(?status, "wait status");

        match status {
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_STOP)
                if !tracees.tasks.contains_key(&tid) =>
            {
                tracees.insert_started(tid);
                tracing::debug!(tid = tid.as_raw(), "new thread");

                Some(TargetEvent::ThreadStarting {
                    process_koid,
                    thread: PtraceThread::new(tid, self.tracees.clone()),
                    exception: Some(PtraceExceptionToken::new(tid, None, self.tracees.clone())),
                })
            }
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_EXIT) => {
                let task = tracees.tasks.get_mut(&tid)?;
                task.exiting = true;
                task.stop = Some(Stop::Interrupt);
                task.holds = 0;
                task.single_step = false;
                task.pending_signal = None;

                tracees.restart(tid);

                Some(TargetEvent::ThreadExiting {
                    process_koid,
                    thread_koid: tid.as_raw() as u64,
                })
            }
            WaitStatus::PtraceEvent(tid, _, _) => {
                // interrupt, clone or group stop
                let task = tracees.tasks.get_mut(&tid)?;
                task.stop = Some(Stop::Interrupt);
                task.interrupting = false;

                tracees.restart(tid);
                None
            }
            WaitStatus::Stopped(tid, signal) => on_signal(&mut tracees, &self.tracees, tid, signal),
            WaitStatus::Exited(tid, code) => on_exit(&mut tracees, tid, i64::from(code)),
            WaitStatus::Signaled(tid, signal, _) => {
                on_exit(&mut tracees, tid, -i64::from(signal as i32))
            }
            _ => None,
        }
    }
}

fn on_signal(
    tracees: &mut Tracees,
    shared: &SharedTracees,
    tid: Pid,
    signal: Signal,
) -> Option<TargetEvent<PtraceProcess>> {
    let process_koid = tracees.leader.as_raw() as u64;
    let watched = tracees.watched;

    tracees.insert_running(tid);
    let task = tracees.tasks.get_mut(&tid)?;

    match classify_signal(tid, signal) {
        Some(kind) if watched => {
            task.stop = Some(Stop::Exception);
            task.holds += 1;

            if tracing::enabled!(tracing::Level::DEBUG) {
                let ip = crate::regs::read_block(tid, StateKind::General)
                    .ok()
                    .and_then(|block| crate::regs::instruction_pointer(&block))
                    .unwrap_or_default();

                tracing::debug!(tid = tid.as_raw(), ?kind, ?signal, ip = format_args!("{ip:#x}"), "exception");
            }

            Some(TargetEvent::Exception {
                process_koid,
                thread_koid: tid.as_raw() as u64,
                exception: PtraceExceptionToken::new(tid, Some(signal), shared.clone()),
                kind,
            })
        }
        _ => {
            tracing::debug!(tid = tid.as_raw(), ?signal, "forwarding signal");

            task.stop = Some(Stop::Signal);
            task.pending_signal = Some(signal);

            tracees.restart(tid);
            None
        }
    }
}

fn on_exit(tracees: &mut Tracees, tid: Pid, return_code: i64) -> Option<TargetEvent<PtraceProcess>> {
    let process_koid = tracees.leader.as_raw() as u64;
    let task = tracees.tasks.remove(&tid);

    if tid == tracees.leader {
        tracing::debug!(pid = tid.as_raw(), return_code, "process terminated");
        tracees.terminated = true;

        return Some(TargetEvent::ProcessTerminated {
            process_koid,
            return_code,
        });
    }

    // already reported by its exit stop
    match task {
        Some(task) if !task.exiting => Some(TargetEvent::ThreadExiting {
            process_koid,
            thread_koid: tid.as_raw() as u64,
        }),
        _ => None,
    }
}

/// Classifies a signal-delivery-stop, `None` for signals that are not faults.
fn classify_signal(tid: Pid, signal: Signal) -> Option<RawException> {
    let kind = match signal {
        Signal::SIGTRAP => match ptrace::getsiginfo(tid).map(|info| info.si_code) {
            Ok(SI_KERNEL | TRAP_BRKPT) => RawException::SoftwareBreakpoint,
            Ok(TRAP_TRACE | TRAP_HWBKPT) => RawException::HardwareBreakpoint,
            Ok(_) => RawException::General,
            Err(e) => {
                tracing::warn!(error = %e, tid = tid.as_raw(), "ptrace(PTRACE_GETSIGINFO)");
                RawException::General
            }
        },
        Signal::SIGSEGV => RawException::PageFault,
        Signal::SIGILL => RawException::UndefinedInstruction,
        Signal::SIGBUS => RawException::UnalignedAccess,
        Signal::SIGFPE => RawException::General,
        _ => return None,
    };

    Some(kind)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use kestrel_target::TargetEvent;
    use nix::unistd::Pid;

    use super::on_exit;
    use crate::tracee::Tracees;

    #[test]
    fn leader_exit_terminates_process() {
        let leader = Pid::from_raw(i32::MAX - 1);
        let other = Pid::from_raw(i32::MAX);

        let shared = Arc::new(Mutex::new(Tracees::new(leader)));
        let mut tracees = crate::tracee::lock(&shared);
        tracees.insert_running(leader);
        tracees.insert_running(other);

        let event = on_exit(&mut tracees, other, 0);
        assert!(matches!(
            event,
            Some(TargetEvent::ThreadExiting { thread_koid, .. }) if thread_koid == other.as_raw() as u64
        ));
        assert!(!tracees.terminated);

        let event = on_exit(&mut tracees, leader, -9);
        assert!(matches!(
            event,
            Some(TargetEvent::ProcessTerminated { return_code: -9, .. })
        ));
        assert!(tracees.terminated);
        assert!(tracees.tasks.is_empty());
    }

    #[test]
    fn exit_after_exit_stop_is_not_reported_twice() {
        let leader = Pid::from_raw(i32::MAX - 1);
        let other = Pid::from_raw(i32::MAX);

        let mut tracees = Tracees::new(leader);
        tracees.insert_running(other);

        if let Some(task) = tracees.tasks.get_mut(&other) {
            task.exiting = true;
        }

        assert!(on_exit(&mut tracees, other, 0).is_none());
    }
}
