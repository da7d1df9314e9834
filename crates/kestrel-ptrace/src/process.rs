use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::TryStreamExt;
use kestrel_target::{Arch, MemoryAccess, Module, ProcessHandle};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio_stream::wrappers::ReadDirStream;

use crate::pump::EventPump;
use crate::thread::PtraceThread;
use crate::tracee::{SharedTracees, Stop, Tracees, lock};

/// Process attached with `PTRACE_SEIZE`.
///
/// Dropping it detaches every task that is still alive.
pub struct PtraceProcess {
    pid: Pid,
    tracees: SharedTracees,
}

impl PtraceProcess {
    /// Attaches to every task of the process with the given ID.
    ///
    /// Tasks are left running.
    #[tracing::instrument(name = "PtraceAttach", skip_all, fields(pid = pid))]
    pub async fn attach(pid: u64) -> crate::Result<Self> {
        let pid = i32::try_from(pid)
            .ok()
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw)
            .ok_or(crate::Error::Os(Errno::EINVAL))?;
        let mut tracees = Tracees::new(pid);

        // threads may be spawned while attaching, rescan until stable
        loop {
            let tids = list_tasks(pid).await?;
            let mut new_task = false;

            for tid in tids {
                if tracees.tasks.contains_key(&tid) {
                    continue;
                }

                match ptrace::seize(tid, ptrace_options()) {
                    Ok(()) => {
                        tracing::debug!(tid = tid.as_raw(), "seized");
                        tracees.insert_running(tid);
                        new_task = true;
                    }
                    // exited meanwhile
                    Err(Errno::ESRCH) => (),
                    Err(e) => {
                        tracing::error!(error = %e, tid = tid.as_raw(), "ptrace(PTRACE_SEIZE)");

                        if tracees.tasks.is_empty() {
                            return Err(e.into());
                        }
                    }
                }
            }

            if !new_task {
                break;
            }
        }

        if tracees.tasks.is_empty() {
            return Err(crate::Error::NoThread(pid.as_raw() as u64));
        }

        Ok(Self {
            pid,
            tracees: Arc::new(Mutex::new(tracees)),
        })
    }

    /// Returns the process ID.
    pub fn pid(&self) -> u64 {
        self.pid.as_raw() as u64
    }

    /// Creates the pump turning the wait statuses of this process into
    /// events.
    pub fn event_pump(&self) -> EventPump {
        EventPump::new(self.tracees.clone())
    }

    fn detach_all(&mut self) {
        let mut tracees = lock(&self.tracees);
        let tids: Vec<_> = tracees.tasks.keys().copied().collect();

        for tid in tids {
            let Some(task) = tracees.tasks.remove(&tid) else {
                continue;
            };

            let mut signal = task.pending_signal;

            match task.stop {
                Some(Stop::Pending) => {
                    if let Some(sig) = tracees.backlog.iter().find_map(|status| match status {
                        WaitStatus::Stopped(pid, sig) if *pid == tid && *sig != Signal::SIGTRAP => {
                            Some(*sig)
                        }
                        _ => None,
                    }) {
                        signal = Some(sig);
                    }
                }
                Some(_) => (),
                None => {
                    if !task.interrupting {
                        if let Err(e) = ptrace::interrupt(tid) {
                            tracing::debug!(error = %e, tid = tid.as_raw(), "interrupt before detach");
                            continue;
                        }
                    }

                    // FIXME: this call blocks the async runtime
                    match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                        Ok(WaitStatus::Stopped(_, sig)) if sig != Signal::SIGTRAP => {
                            signal = Some(sig);
                        }
                        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => continue,
                        Ok(_) => (),
                        Err(e) => {
                            tracing::debug!(error = %e, tid = tid.as_raw(), "wait before detach");
                            continue;
                        }
                    }
                }
            }

            match ptrace::detach(tid, signal) {
                Ok(()) => tracing::debug!(tid = tid.as_raw(), "detached"),
                Err(Errno::ESRCH) => (),
                Err(e) => tracing::error!(error = %e, tid = tid.as_raw(), "ptrace(PTRACE_DETACH)"),
            }
        }
    }
}

impl Drop for PtraceProcess {
    fn drop(&mut self) {
        self.detach_all();
    }
}

fn ptrace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_TRACEEXIT
}

async fn list_tasks(pid: Pid) -> crate::Result<HashSet<Pid>> {
    let path: PathBuf = format!("/proc/{pid}/task").into();

    let entries = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| crate::Error::File(path, e))?;

    let tids: HashSet<Pid> = ReadDirStream::new(entries)
        .try_filter_map(|entry| async move {
            Ok(entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse().ok())
                .map(Pid::from_raw))
        })
        .try_collect()
        .await?;

    Ok(tids)
}

impl MemoryAccess for PtraceProcess {
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> kestrel_target::Result<usize> {
        crate::mem::read_process_memory(self.pid, addr, buf).map_err(Into::into)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> kestrel_target::Result<usize> {
        let stopped = lock(&self.tracees).stopped_task();

        match stopped {
            Some(tid) => crate::mem::poke_process_memory(tid, addr, data)?,
            None => crate::mem::write_proc_mem(self.pid, addr, data)?,
        }

        Ok(data.len())
    }
}

impl ProcessHandle for PtraceProcess {
    type Thread = PtraceThread;
    type Watch = ExceptionWatch;

    fn koid(&self) -> u64 {
        self.pid()
    }

    fn name(&self) -> String {
        std::fs::read_to_string(format!("/proc/{}/comm", self.pid))
            .map(|comm| comm.trim_end().to_owned())
            .unwrap_or_default()
    }

    fn arch(&self) -> Arch {
        Arch::host()
    }

    fn threads(&mut self) -> kestrel_target::Result<Vec<PtraceThread>> {
        let tracees = lock(&self.tracees);

        let mut tids: Vec<_> = tracees
            .tasks
            .iter()
            .filter(|(_, task)| !task.exiting)
            .map(|(tid, _)| *tid)
            .collect();
        tids.sort();

        Ok(tids
            .into_iter()
            .map(|tid| PtraceThread::new(tid, self.tracees.clone()))
            .collect())
    }

    async fn modules(&self) -> kestrel_target::Result<Vec<Module>> {
        crate::maps::process_modules(self.pid)
            .await
            .map_err(Into::into)
    }

    fn watch_exceptions(&mut self) -> kestrel_target::Result<ExceptionWatch> {
        let mut tracees = lock(&self.tracees);

        if tracees.watched {
            return Err(kestrel_target::Error::AlreadyBound);
        }

        tracees.watched = true;

        Ok(ExceptionWatch {
            tracees: self.tracees.clone(),
        })
    }

    fn kill(&mut self) -> kestrel_target::Result<()> {
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(crate::Error::from)
            .map_err(Into::into)
    }
}

/// Registration of the exception reporting of a [PtraceProcess].
///
/// While it is alive, faults of the tasks are reported as exceptions.
/// Otherwise they are delivered to the tasks.
pub struct ExceptionWatch {
    tracees: SharedTracees,
}

impl Drop for ExceptionWatch {
    fn drop(&mut self) {
        lock(&self.tracees).watched = false;
    }
}
