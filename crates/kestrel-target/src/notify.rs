use crate::exception::{BreakpointStats, ExceptionType};
use crate::process::Module;
use crate::thread::ThreadRunState;
use crate::unwind::RawFrame;

/// How much of the stack a thread record carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StackAmount {
    /// No stack.
    #[default]
    None,

    /// A couple of frames, enough to tell where the thread stopped.
    Minimal,

    /// The whole stack.
    Full,
}

/// Snapshot of a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Process the thread belongs to.
    pub process_koid: u64,

    /// Identity of the thread.
    pub thread_koid: u64,

    /// Name of the thread.
    pub name: String,

    /// Kernel-visible state of the thread.
    pub state: ThreadRunState,

    /// Amount of stack gathered into `frames`.
    pub stack_amount: StackAmount,

    /// Physical frames, most recent first.
    pub frames: Vec<RawFrame>,
}

/// Event reported by the engine to its client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// A process was attached because of a job filter.
    ProcessStarting {
        /// Identity of the process.
        process_koid: u64,

        /// Name of the process.
        name: String,

        /// Filter which matched the process name.
        filter: String,
    },

    /// A process has exited.
    ProcessExiting {
        /// Identity of the process.
        process_koid: u64,

        /// Exit code of the process.
        return_code: i64,
    },

    /// A thread was created.
    ThreadStarting(ThreadRecord),

    /// A thread has exited.
    ThreadExiting(ThreadRecord),

    /// The module list of a process.
    Modules {
        /// Identity of the process.
        process_koid: u64,

        /// Mapped modules.
        modules: Vec<Module>,

        /// Threads that are stopped and wait for the client.
        stopped_thread_koids: Vec<u64>,
    },

    /// A thread stopped because of an exception.
    Exception {
        /// Snapshot of the stopped thread.
        thread: ThreadRecord,

        /// Classification of the exception.
        exception_type: ExceptionType,

        /// Breakpoints (or watchpoints) hit, if any.
        hit_breakpoints: Vec<BreakpointStats>,
    },
}

/// Notification sink collaborator.
pub trait NotificationSink {
    /// Delivers a notification to the client.
    fn notify(&mut self, notification: Notification);
}

impl NotificationSink for Vec<Notification> {
    fn notify(&mut self, notification: Notification) {
        self.push(notification);
    }
}

impl NotificationSink for tokio::sync::mpsc::UnboundedSender<Notification> {
    fn notify(&mut self, notification: Notification) {
        // a closed receiver means nobody listens anymore
        let _ = self.send(notification);
    }
}
