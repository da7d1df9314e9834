//! Vocabulary shared by the kestrel debug engine and the collaborators it
//! drives.
//!
//! The engine itself (`kestrel-agent`) never talks to an operating system,
//! a symbol file or a client directly. Instead it consumes the traits defined
//! here:
//!
//! * [ProcessHandle], [ThreadHandle] and [ExceptionToken] for process and
//!   thread control, together with the [TargetEvent] stream an exception
//!   channel delivers.
//! * [SymbolResolver] for address to symbol/line resolution.
//! * [Unwinder] for raw physical stack frames.
//! * [NotificationSink] for everything the engine reports to its client.

mod error;
mod event;
mod exception;
mod notify;
mod process;
mod registers;
mod symbol;
mod thread;
mod unwind;

pub use self::error::{Error, Result};
pub use self::event::TargetEvent;
pub use self::exception::{BreakpointKind, BreakpointStats, ExceptionType, RawException};
pub use self::notify::{Notification, NotificationSink, StackAmount, ThreadRecord};
pub use self::process::{AddressRange, MemoryAccess, MemoryBlock, Module, ProcessHandle};
pub use self::registers::{
    Arch, Arm64Register, Register, RegisterCategory, RegisterId, StateKind, X64Register,
};
pub use self::symbol::{FileLine, Location, Symbol, SymbolKind, SymbolResolver};
pub use self::thread::{
    ClientState, ExceptionToken, RegisterState, ResumeRequest, RunMode, ThreadCreation,
    ThreadHandle, ThreadRunState,
};
pub use self::unwind::{RawFrame, UnwindRegs, Unwinder};
