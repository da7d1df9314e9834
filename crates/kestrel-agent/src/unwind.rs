use byteorder::{ByteOrder, LittleEndian};
use kestrel_target::{MemoryAccess, RawFrame, UnwindRegs, Unwinder};

/// Unwinder following the frame pointer chain.
///
/// Every frame is expected to start with the saved frame pointer of its
/// caller, followed by the return address. Used when no unwind information
/// is available.
#[derive(Clone, Copy, Debug, Default)]
pub struct FramePointerUnwinder;

impl Unwinder for FramePointerUnwinder {
    fn unwind(
        &mut self,
        regs: &UnwindRegs,
        memory: &dyn MemoryAccess,
        max_depth: usize,
    ) -> kestrel_target::Result<Vec<RawFrame>> {
        let mut frames = Vec::new();
        if max_depth == 0 {
            return Ok(frames);
        }

        let mut fp = regs.fp;
        frames.push(RawFrame {
            address: regs.ip,
            sp: regs.sp,
            cfa: cfa_of(fp),
        });

        while frames.len() < max_depth && fp != 0 {
            let mut record = [0u8; 16];
            match memory.read_memory(fp, &mut record) {
                Ok(16) => (),
                _ => break,
            }

            let caller_fp = LittleEndian::read_u64(&record[..8]);
            let return_addr = LittleEndian::read_u64(&record[8..]);

            if return_addr == 0 {
                break;
            }

            frames.push(RawFrame {
                address: return_addr,
                sp: fp + 16,
                cfa: cfa_of(caller_fp),
            });

            // the stack grows down, callers are at higher addresses
            if caller_fp <= fp {
                break;
            }
            fp = caller_fp;
        }

        Ok(frames)
    }
}

fn cfa_of(fp: u64) -> u64 {
    if fp == 0 { 0 } else { fp + 16 }
}
