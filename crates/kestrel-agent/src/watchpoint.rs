use std::collections::BTreeSet;

use indexmap::IndexMap;
use kestrel_target::{AddressRange, Error, ThreadHandle};

use crate::arch::ArchProvider;
use crate::thread::DebuggedThread;

/// Reference of a logical watchpoint onto a process watchpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchpointRef {
    /// Identifier of the logical watchpoint.
    pub id: u32,

    /// Thread the reference applies to, every thread if unset.
    pub thread: Option<u64>,
}

/// Hardware watchpoint of a process, installed per thread.
#[derive(Debug)]
pub struct ProcessWatchpoint {
    range: AddressRange,
    refs: Vec<WatchpointRef>,
    installed_threads: BTreeSet<u64>,
}

impl ProcessWatchpoint {
    /// Creates a watchpoint over `range`, aligned down to the granule.
    pub(crate) fn new(range: AddressRange, granule: u64) -> Self {
        let begin = range.begin & !(granule - 1);

        Self {
            range: AddressRange::new(begin, range.end.max(begin + granule)),
            refs: Vec::new(),
            installed_threads: BTreeSet::new(),
        }
    }

    /// Returns the watched range, starting at a granule boundary.
    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Returns the logical watchpoints referencing this one.
    pub fn refs(&self) -> &[WatchpointRef] {
        &self.refs
    }

    /// Returns the threads whose hardware slots hold this watchpoint.
    pub fn installed_threads(&self) -> &BTreeSet<u64> {
        &self.installed_threads
    }

    /// Returns the identifiers of the logical watchpoints hit by a thread.
    pub fn on_hit(&self, thread_koid: u64) -> Vec<u32> {
        self.refs
            .iter()
            .filter(|r| r.thread.is_none_or(|koid| koid == thread_koid))
            .map(|r| r.id)
            .collect()
    }

    pub(crate) fn register<T: ThreadHandle>(
        &mut self,
        r: WatchpointRef,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        arch: &dyn ArchProvider,
    ) -> kestrel_target::Result<()> {
        if self.refs.contains(&r) {
            return Err(Error::AlreadyBound);
        }

        self.refs.push(r);

        if let Err(e) = self.update(threads, arch) {
            self.refs.retain(|other| *other != r);

            if let Err(e) = self.update(threads, arch) {
                tracing::warn!(error = %e, "roll back watchpoint");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Returns whether the watchpoint is still referenced.
    pub(crate) fn unregister<T: ThreadHandle>(
        &mut self,
        r: &WatchpointRef,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        arch: &dyn ArchProvider,
    ) -> bool {
        self.refs.retain(|other| other != r);

        if let Err(e) = self.update(threads, arch) {
            tracing::warn!(error = %e, "uninstall watchpoint");
        }

        !self.refs.is_empty()
    }

    pub(crate) fn clear<T: ThreadHandle>(
        &mut self,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        arch: &dyn ArchProvider,
    ) {
        self.refs.clear();

        if let Err(e) = self.update(threads, arch) {
            tracing::warn!(error = %e, "uninstall watchpoint");
        }
    }

    /// Installs the watchpoint on the threads in scope and uninstalls it
    /// from the others.
    ///
    /// Threads on which the install fails are left out. Fails only if the
    /// watchpoint ends up installed nowhere while some thread is in scope.
    pub(crate) fn update<T: ThreadHandle>(
        &mut self,
        threads: &mut IndexMap<u64, DebuggedThread<T>>,
        arch: &dyn ArchProvider,
    ) -> kestrel_target::Result<()> {
        let wanted: BTreeSet<u64> = if self.refs.iter().any(|r| r.thread.is_none()) {
            threads.keys().copied().collect()
        } else {
            self.refs
                .iter()
                .filter_map(|r| r.thread)
                .filter(|koid| threads.contains_key(koid))
                .collect()
        };

        let unwanted: Vec<_> = self
            .installed_threads
            .difference(&wanted)
            .copied()
            .collect();

        for koid in unwanted {
            self.installed_threads.remove(&koid);

            if let Some(thread) = threads.get_mut(&koid) {
                if let Err(e) = arch.uninstall_watchpoint(thread.handle_mut(), self.range) {
                    tracing::warn!(thread = koid, error = %e, "uninstall watchpoint");
                }
            }
        }

        let mut first_error = None;

        for koid in &wanted {
            if self.installed_threads.contains(koid) {
                continue;
            }

            let Some(thread) = threads.get_mut(koid) else {
                continue;
            };

            match arch.install_watchpoint(thread.handle_mut(), self.range) {
                Ok(()) => {
                    self.installed_threads.insert(*koid);
                }
                Err(e) => {
                    tracing::warn!(thread = koid, error = %e, "install watchpoint");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !wanted.is_empty() && self.installed_threads.is_empty() => Err(e),
            _ => Ok(()),
        }
    }

    pub(crate) fn forget_thread(&mut self, thread_koid: u64) {
        self.installed_threads.remove(&thread_koid);
    }
}
