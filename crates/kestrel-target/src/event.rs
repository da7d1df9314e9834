use crate::exception::RawException;
use crate::process::ProcessHandle;
use crate::thread::ThreadHandle;

type ThreadOf<P> = <P as ProcessHandle>::Thread;
type ExceptionTokenOf<P> = <ThreadOf<P> as ThreadHandle>::ExceptionToken;

/// Event delivered by an exception channel into the engine.
pub enum TargetEvent<P: ProcessHandle> {
    /// A process was started within a watched job.
    ProcessStarting {
        /// Job in which the process was started.
        job_koid: u64,

        /// The new process.
        process: P,
    },

    /// A thread was started.
    ThreadStarting {
        /// Process the thread belongs to.
        process_koid: u64,

        /// The new thread.
        thread: ThreadOf<P>,

        /// Start exception the thread is blocked in, if any.
        exception: Option<ExceptionTokenOf<P>>,
    },

    /// A thread is exiting.
    ThreadExiting {
        /// Process the thread belongs to.
        process_koid: u64,

        /// Identity of the thread.
        thread_koid: u64,
    },

    /// A thread is blocked in an exception.
    Exception {
        /// Process the thread belongs to.
        process_koid: u64,

        /// Identity of the thread.
        thread_koid: u64,

        /// Token over the exception.
        exception: ExceptionTokenOf<P>,

        /// Exception reported by the OS.
        kind: RawException,
    },

    /// A process has terminated.
    ProcessTerminated {
        /// Identity of the process.
        process_koid: u64,

        /// Exit code of the process.
        return_code: i64,
    },
}
