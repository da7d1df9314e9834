use framehop::{FrameAddress, MayAllocateDuringUnwind, Unwinder as _};
use kestrel_target::{Arch, MemoryAccess, RawFrame, UnwindRegs, Unwinder};

use crate::elf::MappedElf;

#[cfg(target_arch = "x86_64")]
type StackUnwinder = framehop::x86_64::UnwinderX86_64<Vec<u8>, MayAllocateDuringUnwind>;
#[cfg(target_arch = "aarch64")]
type StackUnwinder = framehop::aarch64::UnwinderAarch64<Vec<u8>, MayAllocateDuringUnwind>;

#[cfg(target_arch = "x86_64")]
type StackUnwinderCache = framehop::x86_64::CacheX86_64<MayAllocateDuringUnwind>;
#[cfg(target_arch = "aarch64")]
type StackUnwinderCache = framehop::aarch64::CacheAarch64<MayAllocateDuringUnwind>;

#[cfg(target_arch = "x86_64")]
const HOST_ARCH: Arch = Arch::X64;
#[cfg(target_arch = "aarch64")]
const HOST_ARCH: Arch = Arch::Arm64;

/// Unwinder using the CFI of the binaries mapped into the process, falling
/// back to frame pointers where none is found.
pub struct FramehopUnwinder {
    unwinder: StackUnwinder,
    cache: StackUnwinderCache,
}

impl FramehopUnwinder {
    /// Creates an unwinder without any module.
    pub fn new() -> Self {
        Self {
            unwinder: StackUnwinder::new(),
            cache: StackUnwinderCache::new(),
        }
    }

    /// Creates an unwinder knowing the given binaries.
    ///
    /// Binaries whose unwind information cannot be parsed are skipped.
    pub async fn from_binaries(binaries: &[MappedElf]) -> Self {
        let mut this = Self::new();

        for binary in binaries {
            this.add_binary(binary).await;
        }

        this
    }

    /// Adds the unwind information of a binary.
    pub async fn add_binary(&mut self, binary: &MappedElf) {
        match binary.to_unwind_module().await {
            Ok(module) => self.unwinder.add_module(module),
            Err(e) => tracing::warn!(error = %e, binary = binary.file_name(), "no unwind info"),
        }
    }

    /// Forgets the binary loaded at the given address.
    pub fn remove_binary(&mut self, base: u64) {
        self.unwinder.remove_module(base);
    }
}

impl Default for FramehopUnwinder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
fn to_unwind_regs(regs: &UnwindRegs) -> framehop::x86_64::UnwindRegsX86_64 {
    framehop::x86_64::UnwindRegsX86_64::new(regs.ip, regs.sp, regs.fp)
}

#[cfg(target_arch = "aarch64")]
fn to_unwind_regs(regs: &UnwindRegs) -> framehop::aarch64::UnwindRegsAarch64 {
    framehop::aarch64::UnwindRegsAarch64::new(regs.lr.unwrap_or_default(), regs.sp, regs.fp)
}

impl Unwinder for FramehopUnwinder {
    fn unwind(
        &mut self,
        regs: &UnwindRegs,
        memory: &dyn MemoryAccess,
        max_depth: usize,
    ) -> kestrel_target::Result<Vec<RawFrame>> {
        if regs.arch != HOST_ARCH {
            return Err(kestrel_target::Error::NotSupported);
        }

        let mut read_stack = |stack_addr: u64| {
            let mut buf = [0u8; 8];

            match memory.read_memory(stack_addr, &mut buf) {
                Ok(8) => Ok(u64::from_le_bytes(buf)),
                _ => {
                    tracing::debug!(addr = format_args!("{stack_addr:#x}"), "read memory during unwind");
                    Err(())
                }
            }
        };

        let mut frames = self
            .unwinder
            .iter_frames(regs.ip, to_unwind_regs(regs), &mut self.cache, &mut read_stack);

        let mut raw_frames = Vec::with_capacity(max_depth.min(64));

        while raw_frames.len() < max_depth {
            let address = match frames.next() {
                Ok(Some(FrameAddress::InstructionPointer(addr))) => addr,
                Ok(Some(FrameAddress::ReturnAddress(addr))) => addr.get(),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "unwind stopped");
                    break;
                }
            };

            let sp = if raw_frames.is_empty() { regs.sp } else { 0 };

            raw_frames.push(RawFrame {
                address,
                sp,
                cfa: 0,
            });
        }

        Ok(raw_frames)
    }
}

#[cfg(test)]
mod tests {
    use kestrel_target::{Arch, MemoryAccess, UnwindRegs, Unwinder};

    use super::{FramehopUnwinder, HOST_ARCH};

    /// Stack of frame pointer records: [fp, return address] pairs.
    struct Stack {
        base: u64,
        words: Vec<u64>,
    }

    impl MemoryAccess for Stack {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> kestrel_target::Result<usize> {
            let Some(word) = addr
                .checked_sub(self.base)
                .map(|offset| offset / 8)
                .and_then(|idx| self.words.get(idx as usize))
            else {
                return Err(kestrel_target::Error::BadState);
            };

            let bytes = word.to_le_bytes();
            let n = buf.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        }

        fn write_memory(&mut self, _addr: u64, _data: &[u8]) -> kestrel_target::Result<usize> {
            Err(kestrel_target::Error::NotSupported)
        }
    }

    #[test]
    fn first_frame_is_the_instruction_pointer() {
        let stack = Stack {
            base: 0x7000,
            words: vec![0; 4],
        };

        let regs = UnwindRegs {
            arch: HOST_ARCH,
            ip: 0x40_1000,
            sp: 0x7000,
            fp: 0,
            lr: None,
        };

        let frames = FramehopUnwinder::new()
            .unwind(&regs, &stack, 8)
            .expect("unwind");

        assert_eq!(frames.first().map(|f| (f.address, f.sp)), Some((0x40_1000, 0x7000)));
    }

    #[test]
    fn foreign_arch_is_not_supported() {
        let foreign = if HOST_ARCH == Arch::X64 {
            Arch::Arm64
        } else {
            Arch::X64
        };

        let regs = UnwindRegs {
            arch: foreign,
            ip: 0x1000,
            sp: 0x2000,
            fp: 0,
            lr: None,
        };

        let stack = Stack {
            base: 0,
            words: Vec::new(),
        };

        let res = FramehopUnwinder::new().unwind(&regs, &stack, 8);
        assert!(matches!(res, Err(kestrel_target::Error::NotSupported)));
    }
}
