//! Linux backend of the kestrel debug engine, on top of `ptrace(2)`.
//!
//! [PtraceProcess] implements [kestrel_target::ProcessHandle] for a process
//! attached with `PTRACE_SEIZE`, and [EventPump] turns the `waitpid(2)`
//! statuses of its tasks into [kestrel_target::TargetEvent]s.
//!
//! <div class="warning">
//!
//! The kernel only accepts ptrace requests from the thread that attached to
//! the tracee. Every handle of this crate must be used from that thread
//! (e.g., within a single-threaded `tokio` runtime).
//!
//! </div>

#[cfg(target_os = "linux")]
mod error;
#[cfg(target_os = "linux")]
mod maps;
#[cfg(target_os = "linux")]
mod mem;
#[cfg(target_os = "linux")]
mod process;
#[cfg(target_os = "linux")]
mod pump;
#[cfg(target_os = "linux")]
mod regs;
#[cfg(target_os = "linux")]
mod thread;
#[cfg(target_os = "linux")]
mod tracee;

#[cfg(target_os = "linux")]
pub use self::error::{Error, Result};
#[cfg(target_os = "linux")]
pub use self::process::{ExceptionWatch, PtraceProcess};
#[cfg(target_os = "linux")]
pub use self::pump::EventPump;
#[cfg(target_os = "linux")]
pub use self::thread::{PtraceExceptionToken, PtraceSuspendToken, PtraceThread};
