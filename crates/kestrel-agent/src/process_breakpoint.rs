//! Physical breakpoint installations of a process.

use std::collections::BTreeSet;
use std::time::Duration;

use indexmap::IndexMap;
use kestrel_target::{BreakpointKind, Error, MemoryAccess, MemoryBlock, ThreadHandle};
use tokio::time::Instant;

use crate::arch::ArchProvider;
use crate::thread::DebuggedThread;

/// Reference of a logical breakpoint onto a process breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakpointRef {
    /// Identifier of the logical breakpoint.
    pub id: u32,

    /// Thread the reference applies to, every thread if unset.
    pub thread: Option<u64>,

    /// How the reference wants the breakpoint installed.
    pub kind: BreakpointKind,
}

impl BreakpointRef {
    fn applies_to(&self, thread_koid: u64) -> bool {
        self.thread.is_none_or(|koid| koid == thread_koid)
    }
}

/// Single installation at one address of one process, shared by every
/// logical breakpoint resolving to that address.
#[derive(Debug)]
pub struct ProcessBreakpoint {
    address: u64,
    refs: Vec<BreakpointRef>,

    /// Instruction bytes overwritten by the trap.
    original: Vec<u8>,
    software_installed: bool,

    /// Threads whose hardware slots hold this breakpoint.
    hardware_threads: BTreeSet<u64>,

    /// Threads currently stepping over this breakpoint.
    stepping_over: BTreeSet<u64>,

    /// Steppers whose hardware install was removed for the step.
    hardware_lifted: BTreeSet<u64>,

    /// Threads this breakpoint suspended while some thread steps over it.
    suspended: BTreeSet<u64>,
}

impl ProcessBreakpoint {
    pub(crate) fn new(address: u64) -> Self {
        Self {
            address,
            refs: Vec::new(),
            original: Vec::new(),
            software_installed: false,
            hardware_threads: BTreeSet::new(),
            stepping_over: BTreeSet::new(),
            hardware_lifted: BTreeSet::new(),
            suspended: BTreeSet::new(),
        }
    }

    /// Returns the code address of the breakpoint.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the logical breakpoints referencing this one.
    pub fn refs(&self) -> &[BreakpointRef] {
        &self.refs
    }

    /// Returns whether the trap instruction is currently written.
    pub fn software_installed(&self) -> bool {
        self.software_installed
    }

    /// Returns whether some thread has this breakpoint in a hardware slot.
    pub fn hardware_installed(&self) -> bool {
        !self.hardware_threads.is_empty()
    }

    /// Returns whether the thread is stepping over this breakpoint.
    pub fn is_stepping_over(&self, thread_koid: u64) -> bool {
        self.stepping_over.contains(&thread_koid)
    }

    /// Returns whether a hit on this thread concerns some logical breakpoint.
    pub fn should_hit_thread(&self, thread_koid: u64) -> bool {
        self.refs.iter().any(|r| r.applies_to(thread_koid))
    }

    /// Returns the identifiers of the logical breakpoints hit by a thread.
    ///
    /// The caller updates hit counts and deletes one-shot breakpoints once
    /// done with this registry.
    pub fn on_hit(&self, kind: BreakpointKind, thread_koid: u64) -> Vec<u32> {
        let mut ids: Vec<_> = self
            .refs
            .iter()
            .filter(|r| r.kind == kind && r.applies_to(thread_koid))
            .map(|r| r.id)
            .collect();

        ids.dedup();
        ids
    }

    /// Adds a reference and installs whatever it requires.
    ///
    /// On failure, the reference is not kept.
    pub(crate) fn register<T: ThreadHandle>(
        &mut self,
        r: BreakpointRef,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        memory: &mut dyn MemoryAccess,
        arch: &dyn ArchProvider,
    ) -> kestrel_target::Result<()> {
        if self.refs.contains(&r) {
            return Err(Error::AlreadyBound);
        }

        self.refs.push(r);

        if let Err(e) = self.update(threads, memory, arch) {
            self.refs.retain(|other| *other != r);

            if let Err(e) = self.update(threads, memory, arch) {
                tracing::warn!(addr = format_args!("{:#x}", self.address), error = %e, "roll back breakpoint");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Removes a reference, uninstalling whatever is not needed anymore.
    ///
    /// Returns whether the breakpoint is still referenced.
    pub(crate) fn unregister<T: ThreadHandle>(
        &mut self,
        r: &BreakpointRef,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        memory: &mut dyn MemoryAccess,
        arch: &dyn ArchProvider,
    ) -> bool {
        self.refs.retain(|other| other != r);

        if let Err(e) = self.update(threads, memory, arch) {
            tracing::warn!(addr = format_args!("{:#x}", self.address), error = %e, "uninstall breakpoint");
        }

        !self.refs.is_empty()
    }

    /// Removes every reference and every installation.
    pub(crate) fn clear<T: ThreadHandle>(
        &mut self,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        memory: &mut dyn MemoryAccess,
        arch: &dyn ArchProvider,
    ) {
        self.refs.clear();

        if let Err(e) = self.update(threads, memory, arch) {
            tracing::warn!(addr = format_args!("{:#x}", self.address), error = %e, "uninstall breakpoint");
        }
    }

    /// Brings the installations in line with the references.
    ///
    /// Hardware installs are attempted on every wanted thread, the first
    /// failure is returned.
    pub(crate) fn update<T: ThreadHandle>(
        &mut self,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        memory: &mut dyn MemoryAccess,
        arch: &dyn ArchProvider,
    ) -> kestrel_target::Result<()> {
        let wants_software = self.refs.iter().any(|r| r.kind == BreakpointKind::Software);

        // while stepping over, the trap is put back by the last stepper
        if wants_software && !self.software_installed && self.stepping_over.is_empty() {
            self.install_software(memory, arch)?;
        } else if !wants_software && self.software_installed {
            self.uninstall_software(memory)?;
        }

        let wanted = self.hardware_threads_wanted(threads);
        let mut result = Ok(());

        let unwanted: Vec<_> = self.hardware_threads.difference(&wanted).copied().collect();
        for koid in unwanted {
            self.hardware_threads.remove(&koid);

            if self.hardware_lifted.remove(&koid) {
                continue;
            }

            if let Some(thread) = threads.get_mut(&koid) {
                if let Err(e) = arch.uninstall_hw_breakpoint(thread.handle_mut(), self.address) {
                    tracing::warn!(thread = koid, error = %e, "uninstall hardware breakpoint");
                }
            }
        }

        for koid in wanted {
            if self.hardware_threads.contains(&koid) {
                continue;
            }

            let Some(thread) = threads.get_mut(&koid) else {
                continue;
            };

            match arch.install_hw_breakpoint(thread.handle_mut(), self.address) {
                Ok(()) => {
                    self.hardware_threads.insert(koid);
                }
                Err(e) => {
                    tracing::warn!(thread = koid, error = %e, "install hardware breakpoint");

                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        result
    }

    fn hardware_threads_wanted<T: ThreadHandle>(
        &self,
        threads: &IndexMap<u64, DebuggedThread<T>>,
    ) -> BTreeSet<u64> {
        let hardware = self
            .refs
            .iter()
            .filter(|r| r.kind == BreakpointKind::Hardware);

        if hardware.clone().any(|r| r.thread.is_none()) {
            threads.keys().copied().collect()
        } else {
            hardware
                .filter_map(|r| r.thread)
                .filter(|koid| threads.contains_key(koid))
                .collect()
        }
    }

    fn install_software(
        &mut self,
        memory: &mut dyn MemoryAccess,
        arch: &dyn ArchProvider,
    ) -> kestrel_target::Result<()> {
        let trap = arch.break_instruction();

        let mut original = vec![0u8; trap.len()];
        let read = memory.read_memory(self.address, &mut original)?;
        if read != original.len() {
            return Err(Error::PartialTransfer {
                actual: read,
                expected: original.len(),
            });
        }

        let written = memory.write_memory(self.address, trap)?;
        if written != trap.len() {
            // put back what was overwritten
            if let Err(e) = memory.write_memory(self.address, &original[..written]) {
                tracing::warn!(addr = format_args!("{:#x}", self.address), error = %e, "restore original bytes");
            }

            return Err(Error::PartialTransfer {
                actual: written,
                expected: trap.len(),
            });
        }

        self.original = original;
        self.software_installed = true;

        Ok(())
    }

    fn uninstall_software(&mut self, memory: &mut dyn MemoryAccess) -> kestrel_target::Result<()> {
        // the memory is gone anyway if this fails
        self.software_installed = false;

        let written = memory.write_memory(self.address, &self.original)?;
        if written != self.original.len() {
            return Err(Error::PartialTransfer {
                actual: written,
                expected: self.original.len(),
            });
        }

        Ok(())
    }

    /// Replaces the trap bytes within a block read from the process by the
    /// original instruction bytes.
    pub fn fixup_memory_block(&self, block: &mut MemoryBlock) {
        if !self.software_installed || !block.valid {
            return;
        }

        let block_end = block.address + block.data.len() as u64;
        let bp_end = self.address + self.original.len() as u64;

        if block_end <= self.address || bp_end <= block.address {
            return;
        }

        for (i, byte) in self.original.iter().enumerate() {
            let addr = self.address + i as u64;

            if addr >= block.address && addr < block_end {
                block.data[(addr - block.address) as usize] = *byte;
            }
        }
    }

    /// Starts stepping a thread over this breakpoint, given the thread is
    /// stopped on it with single-step armed.
    ///
    /// The first stepper lifts the trap instruction, which requires every
    /// other thread to be stopped until the last stepper is done.
    pub(crate) async fn begin_step_over<T: ThreadHandle>(
        &mut self,
        thread_koid: u64,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        memory: &mut dyn MemoryAccess,
        arch: &dyn ArchProvider,
        suspend_deadline: Duration,
    ) {
        if self.stepping_over.is_empty() && self.software_installed {
            if let Err(e) = self.uninstall_software(memory) {
                tracing::warn!(addr = format_args!("{:#x}", self.address), error = %e, "lift breakpoint");
            }

            for (&koid, thread) in threads.iter_mut() {
                if koid == thread_koid {
                    continue;
                }

                match thread.suspend(false).await {
                    Ok(true) => {
                        self.suspended.insert(koid);
                    }
                    Ok(false) => (),
                    Err(e) => tracing::warn!(thread = koid, error = %e, "suspend"),
                }
            }

            let deadline = Instant::now() + suspend_deadline;
            for koid in &self.suspended {
                if let Some(thread) = threads.get_mut(koid) {
                    thread.wait_for_suspension(deadline).await;
                }
            }
        }

        let Some(thread) = threads.get_mut(&thread_koid) else {
            return;
        };

        if self.hardware_threads.contains(&thread_koid) {
            match arch.uninstall_hw_breakpoint(thread.handle_mut(), self.address) {
                Ok(()) => {
                    self.hardware_lifted.insert(thread_koid);
                }
                Err(e) => tracing::warn!(thread = thread_koid, error = %e, "lift hardware breakpoint"),
            }
        }

        self.stepping_over.insert(thread_koid);
        self.suspended.remove(&thread_koid);

        thread.resume_exception();
        thread.resume_suspension();
    }

    /// Ends the step over of a thread, which is still stopped by its single
    /// step exception (or gone).
    ///
    /// Returns the threads to resume according to their run mode, which is
    /// empty as long as other threads are stepping over.
    pub(crate) fn end_step_over<T: ThreadHandle>(
        &mut self,
        thread_koid: u64,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        memory: &mut dyn MemoryAccess,
        arch: &dyn ArchProvider,
    ) -> Vec<u64> {
        if !self.stepping_over.remove(&thread_koid) {
            tracing::warn!(thread = thread_koid, "not stepping over this breakpoint");
            return vec![thread_koid];
        }

        let mut thread = threads.get_mut(&thread_koid);

        if self.hardware_lifted.remove(&thread_koid) {
            if let Some(thread) = thread.as_deref_mut() {
                if let Err(e) = arch.install_hw_breakpoint(thread.handle_mut(), self.address) {
                    tracing::warn!(thread = thread_koid, error = %e, "restore hardware breakpoint");
                    self.hardware_threads.remove(&thread_koid);
                }
            }
        }

        if !self.stepping_over.is_empty() {
            // park the thread until every stepper is done
            if let Some(thread) = thread {
                match thread.hold_suspension() {
                    Ok(true) => {
                        self.suspended.insert(thread_koid);
                    }
                    Ok(false) => (),
                    Err(e) => tracing::warn!(thread = thread_koid, error = %e, "suspend"),
                }
                thread.resume_exception();
            }

            return Vec::new();
        }

        let wants_software = self.refs.iter().any(|r| r.kind == BreakpointKind::Software);
        if wants_software && !self.software_installed {
            if let Err(e) = self.install_software(memory, arch) {
                tracing::warn!(addr = format_args!("{:#x}", self.address), error = %e, "restore breakpoint");
            }
        }

        let mut to_resume: Vec<_> = std::mem::take(&mut self.suspended).into_iter().collect();
        to_resume.push(thread_koid);
        to_resume
    }

    /// Forgets a thread which exited.
    pub(crate) fn forget_thread(&mut self, thread_koid: u64) {
        self.hardware_threads.remove(&thread_koid);
        self.hardware_lifted.remove(&thread_koid);
        self.suspended.remove(&thread_koid);
    }

    /// Releases the threads suspended for a step over, when the breakpoint
    /// is destroyed mid-step.
    pub(crate) fn take_suspended(&mut self) -> Vec<u64> {
        self.stepping_over.clear();
        std::mem::take(&mut self.suspended).into_iter().collect()
    }
}
