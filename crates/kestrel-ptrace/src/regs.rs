use byteorder::{ByteOrder, LittleEndian};
use kestrel_target::StateKind;
use nix::sys::ptrace;
use nix::sys::ptrace::regset::NT_PRSTATUS;
use nix::unistd::Pid;

/// Reads the canonical register block of a ptrace-stopped task.
pub fn read_block(tid: Pid, kind: StateKind) -> crate::Result<Vec<u8>> {
    match kind {
        StateKind::General => {
            let regs = ptrace::getregset::<NT_PRSTATUS>(tid)?;
            Ok(general_to_block(&regs))
        }
        StateKind::FloatingPoint => read_fp_block(tid),
        StateKind::Debug => read_debug_block(tid),
        StateKind::Vector => Err(crate::Error::Unsupported(kind)),
    }
}

/// Writes the canonical register block of a ptrace-stopped task.
pub fn write_block(tid: Pid, kind: StateKind, block: &[u8]) -> crate::Result<()> {
    match kind {
        StateKind::General => {
            let mut regs = ptrace::getregset::<NT_PRSTATUS>(tid)?;
            general_from_block(&mut regs, block)?;
            ptrace::setregset::<NT_PRSTATUS>(tid, regs)?;
            Ok(())
        }
        StateKind::FloatingPoint => write_fp_block(tid, block),
        StateKind::Debug => write_debug_block(tid, block),
        StateKind::Vector => Err(crate::Error::Unsupported(kind)),
    }
}

fn check_len(kind: StateKind, block: &[u8], expected: usize) -> crate::Result<()> {
    if block.len() < expected {
        tracing::error!(?kind, len = block.len(), expected, "short register block");
        return Err(crate::Error::PartialMemOp(block.len(), expected));
    }

    Ok(())
}

#[cfg(target_arch = "x86_64")]
mod x64 {
    use byteorder::{ByteOrder, LittleEndian};
    use kestrel_target::StateKind;
    use nix::libc;
    use nix::sys::ptrace;
    use nix::sys::ptrace::regset::NT_PRFPREG;
    use nix::unistd::Pid;

    const GENERAL_SIZE: usize = 18 * 8;
    const FP_SIZE: usize = 24 + 8 * 16;
    const DEBUG_SIZE: usize = 6 * 8;

    const DR0_OFFSET: usize = std::mem::offset_of!(libc::user, u_debugreg);

    /// Indexes of the debug registers within `u_debugreg`, in block order.
    const DEBUG_REGS: [usize; 6] = [0, 1, 2, 3, 6, 7];

    fn general_fields(regs: &mut libc::user_regs_struct) -> [&mut u64; 18] {
        [
            &mut regs.rax,
            &mut regs.rbx,
            &mut regs.rcx,
            &mut regs.rdx,
            &mut regs.rsi,
            &mut regs.rdi,
            &mut regs.rbp,
            &mut regs.rsp,
            &mut regs.r8,
            &mut regs.r9,
            &mut regs.r10,
            &mut regs.r11,
            &mut regs.r12,
            &mut regs.r13,
            &mut regs.r14,
            &mut regs.r15,
            &mut regs.rip,
            &mut regs.eflags,
        ]
    }

    pub fn general_to_block(regs: &libc::user_regs_struct) -> Vec<u8> {
        let mut regs = *regs;
        let mut block = vec![0u8; GENERAL_SIZE];

        for (i, value) in general_fields(&mut regs).into_iter().enumerate() {
            LittleEndian::write_u64(&mut block[i * 8..i * 8 + 8], *value);
        }

        block
    }

    pub fn general_from_block(regs: &mut libc::user_regs_struct, block: &[u8]) -> crate::Result<()> {
        super::check_len(StateKind::General, block, GENERAL_SIZE)?;

        for (i, value) in general_fields(regs).into_iter().enumerate() {
            *value = LittleEndian::read_u64(&block[i * 8..i * 8 + 8]);
        }

        Ok(())
    }

    pub fn read_fp_block(tid: Pid) -> crate::Result<Vec<u8>> {
        let fp = ptrace::getregset::<NT_PRFPREG>(tid)?;
        let mut block = vec![0u8; FP_SIZE];

        LittleEndian::write_u16(&mut block[0..2], fp.cwd);
        LittleEndian::write_u16(&mut block[2..4], fp.swd);
        LittleEndian::write_u16(&mut block[4..6], fp.ftw);
        LittleEndian::write_u16(&mut block[6..8], fp.fop);
        LittleEndian::write_u64(&mut block[8..16], fp.rip);
        LittleEndian::write_u64(&mut block[16..24], fp.rdp);
        LittleEndian::write_u32_into(&fp.st_space, &mut block[24..FP_SIZE]);

        Ok(block)
    }

    pub fn write_fp_block(tid: Pid, block: &[u8]) -> crate::Result<()> {
        super::check_len(StateKind::FloatingPoint, block, FP_SIZE)?;

        let mut fp = ptrace::getregset::<NT_PRFPREG>(tid)?;

        fp.cwd = LittleEndian::read_u16(&block[0..2]);
        fp.swd = LittleEndian::read_u16(&block[2..4]);
        fp.ftw = LittleEndian::read_u16(&block[4..6]);
        fp.fop = LittleEndian::read_u16(&block[6..8]);
        fp.rip = LittleEndian::read_u64(&block[8..16]);
        fp.rdp = LittleEndian::read_u64(&block[16..24]);
        LittleEndian::read_u32_into(&block[24..FP_SIZE], &mut fp.st_space);

        ptrace::setregset::<NT_PRFPREG>(tid, fp)?;
        Ok(())
    }

    fn debugreg_offset(idx: usize) -> ptrace::AddressType {
        (DR0_OFFSET + idx * 8) as ptrace::AddressType
    }

    pub fn read_debug_block(tid: Pid) -> crate::Result<Vec<u8>> {
        let mut block = vec![0u8; DEBUG_SIZE];

        for (i, idx) in DEBUG_REGS.into_iter().enumerate() {
            let value = ptrace::read_user(tid, debugreg_offset(idx))?;
            LittleEndian::write_u64(&mut block[i * 8..i * 8 + 8], value as u64);
        }

        Ok(block)
    }

    pub fn write_debug_block(tid: Pid, block: &[u8]) -> crate::Result<()> {
        super::check_len(StateKind::Debug, block, DEBUG_SIZE)?;

        let current = read_debug_block(tid)?;

        // DR7 comes last, so that the kernel validates the enabled slots
        // against their new addresses.
        for (i, idx) in DEBUG_REGS.into_iter().enumerate() {
            let word = &block[i * 8..i * 8 + 8];

            if word == &current[i * 8..i * 8 + 8] {
                continue;
            }

            let value = LittleEndian::read_u64(word);

            ptrace::write_user(tid, debugreg_offset(idx), value as libc::c_long)
                .inspect_err(|e| tracing::error!(error = %e, dr = idx, value = format_args!("{value:#x}"), "ptrace(PTRACE_POKEUSER)"))?;
        }

        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
mod arm64 {
    use byteorder::{ByteOrder, LittleEndian};
    use kestrel_target::StateKind;
    use nix::libc;
    use nix::unistd::Pid;

    const GENERAL_SIZE: usize = 34 * 8;

    pub fn general_to_block(regs: &libc::user_regs_struct) -> Vec<u8> {
        let mut block = vec![0u8; GENERAL_SIZE];

        LittleEndian::write_u64_into(&regs.regs, &mut block[..31 * 8]);
        LittleEndian::write_u64(&mut block[31 * 8..32 * 8], regs.sp);
        LittleEndian::write_u64(&mut block[32 * 8..33 * 8], regs.pc);
        LittleEndian::write_u64(&mut block[33 * 8..34 * 8], regs.pstate);

        block
    }

    pub fn general_from_block(regs: &mut libc::user_regs_struct, block: &[u8]) -> crate::Result<()> {
        super::check_len(StateKind::General, block, GENERAL_SIZE)?;

        LittleEndian::read_u64_into(&block[..31 * 8], &mut regs.regs);
        regs.sp = LittleEndian::read_u64(&block[31 * 8..32 * 8]);
        regs.pc = LittleEndian::read_u64(&block[32 * 8..33 * 8]);
        regs.pstate = LittleEndian::read_u64(&block[33 * 8..34 * 8]);

        Ok(())
    }

    /// There is no legacy floating-point state on AArch64.
    pub fn read_fp_block(_tid: Pid) -> crate::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    pub fn write_fp_block(_tid: Pid, _block: &[u8]) -> crate::Result<()> {
        Ok(())
    }

    pub fn read_debug_block(_tid: Pid) -> crate::Result<Vec<u8>> {
        Err(crate::Error::Unsupported(StateKind::Debug))
    }

    pub fn write_debug_block(_tid: Pid, _block: &[u8]) -> crate::Result<()> {
        Err(crate::Error::Unsupported(StateKind::Debug))
    }
}

#[cfg(target_arch = "aarch64")]
use self::arm64::*;
#[cfg(target_arch = "x86_64")]
use self::x64::*;

/// Reads the instruction pointer out of a canonical general block.
pub fn instruction_pointer(block: &[u8]) -> Option<u64> {
    let offset = if cfg!(target_arch = "aarch64") {
        32 * 8
    } else {
        16 * 8
    };

    block
        .get(offset..offset + 8)
        .map(LittleEndian::read_u64)
}
