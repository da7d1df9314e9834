//! Symbolization and unwinding of the ELF binaries mapped into a debugged
//! process.
//!
//! [ModuleResolver] implements [kestrel_target::SymbolResolver] on top of
//! [wholesym], inline frames included, and [FramehopUnwinder] implements
//! [kestrel_target::Unwinder] with the CFI of the mapped binaries.

pub mod elf;
mod error;
mod inline;
mod resolver;
mod unwind;

pub use self::error::{Error, Result};
pub use self::resolver::ModuleResolver;
pub use self::unwind::FramehopUnwinder;
