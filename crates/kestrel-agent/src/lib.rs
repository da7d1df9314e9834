//! This crate provides the debug engine of kestrel.
//!
//! The engine keeps track of the debugged processes and their threads, and
//! implements everything needed for controlled execution on top of them:
//!
//! * software and hardware breakpoints, shared between logical breakpoints
//!   and stepped over transparently,
//! * hardware watchpoints,
//! * pause, resume and single-stepping of threads,
//! * register and memory access, with breakpoint instructions hidden,
//! * stack snapshots, expanded into inline frames.
//!
//! <div class="warning">
//!
//! *This crate never talks to an operating system directly! It drives the
//! collaborators defined in `kestrel-target`, see `kestrel-ptrace` for the
//! Linux implementation.*
//!
//! </div>
//!
//! # Supported Architectures
//!
//! <table>
//!     <thead>
//!         <tr>
//!             <th>Architecture</th>
//!             <th>Hardware Breakpoints</th>
//!             <th>Watchpoints</th>
//!         </tr>
//!     </thead>
//!     <tbody>
//!         <tr>
//!             <td><code>x86_64</code></td>
//!             <td>4</td>
//!             <td>4</td>
//!         </tr>
//!         <tr>
//!             <td><code>aarch64</code></td>
//!             <td>4</td>
//!             <td>4</td>
//!         </tr>
//!     </tbody>
//! </table>

mod agent;
pub mod arch;
mod breakpoint;
mod config;
mod job;
mod process;
mod process_breakpoint;
mod stack;
mod thread;
mod unwind;
mod watchpoint;

#[cfg(test)]
mod testing;

pub use self::agent::DebugAgent;
pub use self::breakpoint::{
    Breakpoint, BreakpointLocation, BreakpointSettings, Watchpoint, WatchpointLocation,
    WatchpointSettings,
};
pub use self::config::AgentConfig;
pub use self::job::DebuggedJob;
pub use self::process::DebuggedProcess;
pub use self::process_breakpoint::{BreakpointRef, ProcessBreakpoint};
pub use self::stack::{Frame, Stack};
pub use self::thread::DebuggedThread;
pub use self::unwind::FramePointerUnwinder;
pub use self::watchpoint::{ProcessWatchpoint, WatchpointRef};
