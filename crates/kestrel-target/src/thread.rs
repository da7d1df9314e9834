use std::future::Future;
use std::time::Duration;

use crate::process::AddressRange;
use crate::registers::StateKind;

/// Block-level access to the register state of a stopped thread.
///
/// This trait is object-safe so that architecture strategies can operate on
/// any thread implementation.
pub trait RegisterState {
    /// Reads the canonical register block of the given category.
    fn read_state(&self, kind: StateKind) -> crate::Result<Vec<u8>>;

    /// Writes the canonical register block of the given category.
    fn write_state(&mut self, kind: StateKind, data: &[u8]) -> crate::Result<()>;
}

/// Control primitives of a single thread of a debugged process.
pub trait ThreadHandle: RegisterState {
    /// Token keeping the thread suspended.
    ///
    /// Dropping the token releases this suspension.
    type SuspendToken;

    /// Token keeping the thread blocked in an exception.
    ///
    /// Dropping the token releases the exception.
    type ExceptionToken: ExceptionToken;

    /// Returns the kernel identity of the thread.
    fn koid(&self) -> u64;

    /// Returns the name of the thread.
    fn name(&self) -> String;

    /// Returns the kernel-visible state of the thread.
    fn run_state(&self) -> crate::Result<ThreadRunState>;

    /// Requests the thread to be suspended.
    ///
    /// The suspension is asynchronous: the thread may still be running when
    /// this returns. See [wait_suspended](Self::wait_suspended).
    fn suspend(&mut self) -> crate::Result<Self::SuspendToken>;

    /// Waits at most `timeout` for the thread to reach a stopped state
    /// (either suspended or blocked in an exception).
    ///
    /// Returns `false` if the timeout elapsed first.
    fn wait_suspended(&mut self, timeout: Duration) -> impl Future<Output = crate::Result<bool>>;

    /// Enables or disables hardware single-stepping on the next resume.
    fn set_single_step(&mut self, enable: bool) -> crate::Result<()>;
}

/// Handle over an exception a thread is blocked in.
pub trait ExceptionToken {
    /// Marks the exception as resolved by the debugger, so that releasing the
    /// token resumes the thread instead of forwarding the exception.
    fn set_handled(&mut self) -> crate::Result<()>;
}

/// Kernel-visible state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadRunState {
    /// The thread is executing.
    Running,

    /// The thread is suspended.
    Suspended,

    /// The thread is blocked in an exception.
    BlockedException,

    /// The thread is exiting.
    Dying,

    /// The thread has exited.
    Dead,
}

/// Client-visible state of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientState {
    /// The client considers the thread running.
    #[default]
    Running,

    /// The client paused the thread. No automatic resumption may happen.
    Paused,
}

/// How a thread should execute once resumed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Run freely.
    #[default]
    Continue,

    /// Execute a single instruction, then stop.
    StepInstruction,

    /// Single-step silently while the instruction pointer stays within the
    /// range, then stop.
    StepInRange(AddressRange),
}

/// Client request to resume threads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResumeRequest {
    /// Threads to resume. Empty means every thread.
    pub thread_koids: Vec<u64>,

    /// How the threads should execute.
    pub run_mode: RunMode,
}

/// How a newly observed thread should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCreation {
    /// The thread already runs and is left running.
    RunningKeepRunning,

    /// The thread is stopped at its start and stays stopped.
    SuspendedKeepSuspended,

    /// The thread is stopped at its start and is resumed right away.
    SuspendedShouldRun,
}
