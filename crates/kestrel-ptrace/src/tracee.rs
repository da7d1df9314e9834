use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Why a task is in a ptrace-stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stop {
    /// `PTRACE_INTERRUPT` (or any other event stop).
    Interrupt,

    /// First stop of a new task.
    Start,

    /// Signal-delivery-stop reported as an exception.
    Exception,

    /// Signal-delivery-stop of a signal forwarded to the task.
    Signal,

    /// Stop observed but not yet reported by the event pump.
    Pending,
}

/// Tracking state of a single traced task.
#[derive(Debug)]
pub struct Task {
    /// Current ptrace-stop, `None` while running.
    pub stop: Option<Stop>,

    /// Number of tokens keeping the task stopped.
    pub holds: u32,

    /// Whether the task restarts with `PTRACE_SINGLESTEP`.
    pub single_step: bool,

    /// Signal delivered on the next restart.
    pub pending_signal: Option<Signal>,

    /// Whether a `PTRACE_INTERRUPT` is in flight.
    pub interrupting: bool,

    /// Whether the task reached its exit stop.
    pub exiting: bool,
}

impl Task {
    fn new(stop: Option<Stop>) -> Self {
        Self {
            stop,
            holds: 0,
            single_step: false,
            pending_signal: None,
            interrupting: false,
            exiting: false,
        }
    }
}

/// Tracee table of a process, shared by all of its handles.
#[derive(Debug)]
pub struct Tracees {
    /// Thread group leader.
    pub leader: Pid,

    /// Attached tasks.
    pub tasks: HashMap<Pid, Task>,

    /// Wait statuses collected outside the event pump.
    pub backlog: VecDeque<WaitStatus>,

    /// Whether exceptions are reported rather than forwarded to the tasks.
    pub watched: bool,

    /// Whether the thread group leader has exited.
    pub terminated: bool,
}

/// Shared handle over a [Tracees] table.
pub type SharedTracees = Arc<Mutex<Tracees>>;

/// Locks the tracee table, ignoring poisoning.
pub fn lock(tracees: &SharedTracees) -> MutexGuard<'_, Tracees> {
    tracees.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Tracees {
    pub fn new(leader: Pid) -> Self {
        Self {
            leader,
            tasks: HashMap::new(),
            backlog: VecDeque::new(),
            watched: false,
            terminated: false,
        }
    }

    /// Registers a running task.
    pub fn insert_running(&mut self, tid: Pid) {
        self.tasks.entry(tid).or_insert_with(|| Task::new(None));
    }

    /// Registers a task in its first stop, held by one token.
    pub fn insert_started(&mut self, tid: Pid) {
        let mut task = Task::new(Some(Stop::Start));
        task.holds = 1;
        self.tasks.insert(tid, task);
    }

    /// Returns any task that is currently ptrace-stopped.
    pub fn stopped_task(&self) -> Option<Pid> {
        self.tasks
            .iter()
            .find(|(_, task)| task.stop.is_some_and(|stop| stop != Stop::Pending) && !task.exiting)
            .map(|(tid, _)| *tid)
    }

    /// Takes a hold on a task, interrupting it if it is running.
    pub fn hold(&mut self, tid: Pid) -> crate::Result<()> {
        let task = self
            .tasks
            .get_mut(&tid)
            .ok_or(crate::Error::Os(Errno::ESRCH))?;

        if task.stop.is_none() && !task.interrupting {
            ptrace::interrupt(tid)
                .inspect_err(|e| tracing::error!(error = %e, tid = tid.as_raw(), "ptrace(PTRACE_INTERRUPT)"))?;
            task.interrupting = true;
        }

        task.holds += 1;
        Ok(())
    }

    /// Releases a hold on a task, restarting it when none is left.
    pub fn release(&mut self, tid: Pid) {
        let Some(task) = self.tasks.get_mut(&tid) else {
            return;
        };

        task.holds = task.holds.saturating_sub(1);

        if task.holds == 0 {
            self.restart(tid);
        }
    }

    /// Restarts a stopped task that nobody holds.
    pub fn restart(&mut self, tid: Pid) {
        let Some(task) = self.tasks.get_mut(&tid) else {
            return;
        };

        if task.holds > 0 || matches!(task.stop, None | Some(Stop::Pending)) {
            return;
        }

        let signal = task.pending_signal.take();

        let res = if task.single_step {
            ptrace::step(tid, signal)
        } else {
            ptrace::cont(tid, signal)
        };

        match res {
            Ok(()) => task.stop = None,
            // killed meanwhile, its exit status is still to be reaped
            Err(Errno::ESRCH) => task.stop = None,
            Err(e) => tracing::error!(error = %e, tid = tid.as_raw(), "restart task"),
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;

    use super::{Stop, Tracees};

    #[test]
    fn pending_stops_are_not_restarted() {
        let tid = Pid::from_raw(i32::MAX);
        let mut tracees = Tracees::new(tid);

        tracees.insert_running(tid);
        assert_eq!(tracees.stopped_task(), None);

        if let Some(task) = tracees.tasks.get_mut(&tid) {
            task.stop = Some(Stop::Pending);
            task.holds = 1;
        }

        // no ptrace request is issued for a pending stop
        tracees.release(tid);

        let task = tracees.tasks.get(&tid).expect("task");
        assert_eq!(task.holds, 0);
        assert_eq!(task.stop, Some(Stop::Pending));
        assert_eq!(tracees.stopped_task(), None);
    }

    #[test]
    fn started_task_is_held() {
        let tid = Pid::from_raw(i32::MAX);
        let mut tracees = Tracees::new(tid);

        tracees.insert_started(tid);
        assert_eq!(tracees.stopped_task(), Some(tid));
        assert_eq!(tracees.tasks.get(&tid).map(|task| task.holds), Some(1));
    }
}
