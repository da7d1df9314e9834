use std::future::Future;
use std::path::PathBuf;

use crate::registers::Arch;
use crate::thread::ThreadHandle;

/// Access to the address space of a debugged process.
pub trait MemoryAccess {
    /// Reads memory into `buf`, returning the number of bytes read.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> crate::Result<usize>;

    /// Writes `data` to memory, returning the number of bytes written.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> crate::Result<usize>;
}

/// Control primitives of a debugged process.
pub trait ProcessHandle: MemoryAccess {
    /// Type of the threads of this process.
    type Thread: ThreadHandle;

    /// Registration of an exception watch.
    ///
    /// Dropping it stops exception delivery for this process.
    type Watch;

    /// Returns the kernel identity of the process.
    fn koid(&self) -> u64;

    /// Returns the name of the process.
    fn name(&self) -> String;

    /// Returns the CPU architecture of the process.
    fn arch(&self) -> Arch;

    /// Enumerates the current threads of the process.
    fn threads(&mut self) -> crate::Result<Vec<Self::Thread>>;

    /// Enumerates the modules mapped into the process.
    fn modules(&self) -> impl Future<Output = crate::Result<Vec<Module>>>;

    /// Starts delivering exceptions of this process.
    fn watch_exceptions(&mut self) -> crate::Result<Self::Watch>;

    /// Kills the process.
    fn kill(&mut self) -> crate::Result<()>;
}

/// Half-open address range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressRange {
    /// First address of the range.
    pub begin: u64,

    /// Address right after the last one of the range.
    pub end: u64,
}

impl AddressRange {
    /// Creates a new address range.
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Returns whether the address falls within the range.
    pub const fn contains(&self, addr: u64) -> bool {
        self.begin <= addr && addr < self.end
    }

    /// Returns the size of the range in bytes.
    pub const fn size(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }
}

/// Chunk of memory read from a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Address of the first byte.
    pub address: u64,

    /// Size of the block.
    pub size: u32,

    /// Whether the memory could be read. If not, `data` is empty.
    pub valid: bool,

    /// Contents of the block.
    pub data: Vec<u8>,
}

/// Binary mapped into a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// File name of the binary.
    pub name: String,

    /// Path of the mapped file.
    pub path: PathBuf,

    /// Load address.
    pub base: u64,

    /// End of the highest mapping of the binary.
    pub end: u64,
}
