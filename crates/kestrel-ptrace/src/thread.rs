use std::time::{Duration, Instant};

use kestrel_target::{RegisterState, StateKind, ThreadHandle, ThreadRunState};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::tracee::{SharedTracees, Stop, lock};

const SUSPEND_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Traced task of a [PtraceProcess](crate::PtraceProcess).
pub struct PtraceThread {
    tid: Pid,
    tracees: SharedTracees,
}

impl PtraceThread {
    pub(crate) fn new(tid: Pid, tracees: SharedTracees) -> Self {
        Self { tid, tracees }
    }

    fn ensure_stopped(&self) -> crate::Result<()> {
        let tracees = lock(&self.tracees);

        match tracees.tasks.get(&self.tid).and_then(|task| task.stop) {
            Some(_) => Ok(()),
            None => Err(crate::Error::NotStopped(self.koid())),
        }
    }

    /// Polls the wait status of this task only.
    ///
    /// Interrupt stops are consumed here. Any other status is queued for the
    /// event pump.
    fn poll_stop(&self) -> crate::Result<bool> {
        let mut tracees = lock(&self.tracees);

        let Some(task) = tracees.tasks.get(&self.tid) else {
            return Ok(true);
        };

        if task.stop.is_some() {
            return Ok(true);
        }

        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;

        let status = match waitpid(self.tid, Some(flags)) {
            Ok(WaitStatus::StillAlive) => return Ok(false),
            Ok(status) => status,
            Err(Errno::ECHILD) => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        let stop = match status {
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => Stop::Interrupt,
            status => {
                tracees.backlog.push_back(status);
                Stop::Pending
            }
        };

        if let Some(task) = tracees.tasks.get_mut(&self.tid) {
            if stop == Stop::Interrupt {
                task.interrupting = false;
            }
            task.stop = Some(stop);
        }

        Ok(true)
    }
}

impl RegisterState for PtraceThread {
    fn read_state(&self, kind: StateKind) -> kestrel_target::Result<Vec<u8>> {
        self.ensure_stopped()?;
        crate::regs::read_block(self.tid, kind).map_err(Into::into)
    }

    fn write_state(&mut self, kind: StateKind, data: &[u8]) -> kestrel_target::Result<()> {
        self.ensure_stopped()?;
        crate::regs::write_block(self.tid, kind, data).map_err(Into::into)
    }
}

impl ThreadHandle for PtraceThread {
    type SuspendToken = PtraceSuspendToken;
    type ExceptionToken = PtraceExceptionToken;

    fn koid(&self) -> u64 {
        self.tid.as_raw() as u64
    }

    fn name(&self) -> String {
        let tracees = lock(&self.tracees);
        let path = format!("/proc/{}/task/{}/comm", tracees.leader, self.tid);

        std::fs::read_to_string(path)
            .map(|comm| comm.trim_end().to_owned())
            .unwrap_or_default()
    }

    fn run_state(&self) -> kestrel_target::Result<ThreadRunState> {
        let tracees = lock(&self.tracees);

        let Some(task) = tracees.tasks.get(&self.tid) else {
            return Ok(ThreadRunState::Dead);
        };

        let state = match task.stop {
            _ if task.exiting => ThreadRunState::Dying,
            None => ThreadRunState::Running,
            Some(Stop::Exception) => ThreadRunState::BlockedException,
            Some(_) => ThreadRunState::Suspended,
        };

        Ok(state)
    }

    fn suspend(&mut self) -> kestrel_target::Result<PtraceSuspendToken> {
        lock(&self.tracees).hold(self.tid)?;

        Ok(PtraceSuspendToken {
            tid: self.tid,
            tracees: self.tracees.clone(),
        })
    }

    async fn wait_suspended(&mut self, timeout: Duration) -> kestrel_target::Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.poll_stop()? {
                return Ok(true);
            }

            if Instant::now() >= deadline {
                return Ok(false);
            }

            tokio::time::sleep(SUSPEND_POLL_INTERVAL).await;
        }
    }

    fn set_single_step(&mut self, enable: bool) -> kestrel_target::Result<()> {
        let mut tracees = lock(&self.tracees);

        let task = tracees
            .tasks
            .get_mut(&self.tid)
            .ok_or(kestrel_target::Error::BadState)?;

        task.single_step = enable;
        Ok(())
    }
}

/// Keeps a task stopped until dropped.
pub struct PtraceSuspendToken {
    tid: Pid,
    tracees: SharedTracees,
}

impl Drop for PtraceSuspendToken {
    fn drop(&mut self) {
        lock(&self.tracees).release(self.tid);
    }
}

/// Keeps a task stopped in its signal-delivery-stop until dropped.
///
/// Unless [handled](kestrel_target::ExceptionToken::set_handled), the
/// signal is delivered to the task when it restarts.
pub struct PtraceExceptionToken {
    tid: Pid,
    signal: Option<Signal>,
    handled: bool,
    tracees: SharedTracees,
}

impl PtraceExceptionToken {
    /// Creates a token over a task the table already holds once.
    pub(crate) fn new(tid: Pid, signal: Option<Signal>, tracees: SharedTracees) -> Self {
        Self {
            tid,
            signal,
            handled: false,
            tracees,
        }
    }
}

impl kestrel_target::ExceptionToken for PtraceExceptionToken {
    fn set_handled(&mut self) -> kestrel_target::Result<()> {
        self.handled = true;
        Ok(())
    }
}

impl Drop for PtraceExceptionToken {
    fn drop(&mut self) {
        let mut tracees = lock(&self.tracees);

        if !self.handled {
            if let Some(task) = tracees.tasks.get_mut(&self.tid) {
                task.pending_signal = self.signal;
            }
        }

        tracees.release(self.tid);
    }
}
