use std::io::IoSliceMut;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use nix::sys::ptrace;
use nix::sys::uio::{RemoteIoVec, process_vm_readv};
use nix::unistd::Pid;

const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Reads memory from the process with the given ID.
///
/// Returns the number of bytes read, which is less than the buffer size if
/// the range crosses into unmapped memory.
pub fn read_process_memory(pid: Pid, addr: u64, buf: &mut [u8]) -> crate::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }

    let remote_iov = RemoteIoVec {
        base: addr as usize,
        len: buf.len(),
    };

    let len = buf.len();
    let mut local_iov = [IoSliceMut::new(buf)];

    process_vm_readv(pid, &mut local_iov, &[remote_iov])
        .inspect_err(|e| {
            tracing::debug!(error = %e, addr = format_args!("{addr:#x}"), len, "process_vm_readv")
        })
        .map_err(Into::into)
}

/// Writes memory through the ptrace-stopped task `tid`, a word at a time.
pub fn poke_process_memory(tid: Pid, addr: u64, buf: &[u8]) -> crate::Result<()> {
    let mut chunks = buf.chunks_exact(WORD_SIZE);
    let mut write_addr = addr;

    for chunk in &mut chunks {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(chunk);

        ptrace::write(tid, write_addr as ptrace::AddressType, i64::from_le_bytes(word))
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_POKEDATA)"))?;

        write_addr += WORD_SIZE as u64;
    }

    let remainder = chunks.remainder();

    if !remainder.is_empty() {
        let mut word = ptrace::read(tid, write_addr as ptrace::AddressType)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_PEEKDATA)"))?
            .to_le_bytes();

        word[..remainder.len()].copy_from_slice(remainder);

        ptrace::write(tid, write_addr as ptrace::AddressType, i64::from_le_bytes(word))
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_POKEDATA)"))?;
    }

    Ok(())
}

/// Writes memory through `/proc/<pid>/mem`, for processes without any
/// stopped task.
pub fn write_proc_mem(pid: Pid, addr: u64, buf: &[u8]) -> crate::Result<()> {
    let path: PathBuf = format!("/proc/{pid}/mem").into();

    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| crate::Error::File(path.clone(), e))?;

    let len = file
        .write_at(buf, addr)
        .map_err(|e| crate::Error::File(path, e))?;

    if len != buf.len() {
        Err(crate::Error::PartialMemOp(len, buf.len()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;

    use super::read_process_memory;

    #[test]
    fn read_own_memory() {
        let data = *b"kestrel!";
        let mut buf = [0u8; 8];

        let len = read_process_memory(Pid::this(), data.as_ptr() as u64, &mut buf)
            .expect("read memory");

        assert_eq!(len, 8);
        assert_eq!(buf, data);
    }

    #[test]
    fn read_unmapped_memory() {
        let mut buf = [0u8; 8];
        assert!(read_process_memory(Pid::this(), 0x8, &mut buf).is_err());
    }
}
