use std::path::Path;
use std::sync::Arc;

use kestrel_target::{Location, Module, SymbolResolver};
use wholesym::{SymbolManager, SymbolManagerConfig};

use crate::elf::MappedElf;
use crate::unwind::FramehopUnwinder;

/// Resolves addresses of a debugged process against its mapped binaries.
pub struct ModuleResolver {
    symbol_manager: Arc<SymbolManager>,
    binaries: Vec<MappedElf>,
}

impl ModuleResolver {
    /// Creates a resolver without any binary.
    pub fn new() -> Self {
        let mut symbol_manager = SymbolManager::with_config(SymbolManagerConfig::default());
        symbol_manager.set_observer(Some(Arc::new(SymbolManagerObserver)));

        Self {
            symbol_manager: Arc::new(symbol_manager),
            binaries: Vec::new(),
        }
    }

    /// Creates a resolver for the given modules.
    pub fn with_modules(modules: &[Module]) -> Self {
        let mut this = Self::new();
        this.set_modules(modules);
        this
    }

    /// Replaces the known binaries with the given modules.
    ///
    /// Symbols of binaries that are still mapped at the same range are kept.
    pub fn set_modules(&mut self, modules: &[Module]) {
        let mut old = std::mem::take(&mut self.binaries);

        for module in modules {
            let kept = old
                .iter()
                .position(|elf| *elf.addr_range() == (module.base..module.end))
                .map(|idx| old.swap_remove(idx));

            let binary =
                kept.unwrap_or_else(|| MappedElf::new(module, self.symbol_manager.clone()));

            self.binaries.push(binary);
        }
    }

    /// Returns the known binaries.
    pub fn binaries(&self) -> &[MappedElf] {
        &self.binaries
    }

    /// Builds a CFI unwinder for the known binaries.
    pub async fn unwinder(&self) -> FramehopUnwinder {
        FramehopUnwinder::from_binaries(&self.binaries).await
    }

    fn binary_at(&self, addr: u64) -> Option<&MappedElf> {
        self.binaries.iter().find(|elf| elf.contains(addr))
    }
}

impl Default for ModuleResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver for ModuleResolver {
    async fn resolve(&self, address: u64) -> kestrel_target::Result<Location> {
        let Some(binary) = self.binary_at(address) else {
            return Ok(Location::address_only(address));
        };

        binary.lookup(address).await.map_err(Into::into)
    }
}

struct SymbolManagerObserver;

impl wholesym::SymbolManagerObserver for SymbolManagerObserver {
    fn on_new_download_before_connect(&self, download_id: u64, url: &str) {
        tracing::debug!(download_id, url, "downloading");
    }

    fn on_download_started(&self, _download_id: u64) {}

    fn on_download_progress(
        &self,
        _download_id: u64,
        _bytes_so_far: u64,
        _total_bytes: Option<u64>,
    ) {
    }

    fn on_download_completed(
        &self,
        download_id: u64,
        _uncompressed_size_in_bytes: u64,
        _time_until_headers: std::time::Duration,
        _time_until_completed: std::time::Duration,
    ) {
        tracing::debug!(download_id, "download completed");
    }

    fn on_download_failed(&self, download_id: u64, reason: wholesym::DownloadError) {
        tracing::debug!(download_id, error = %reason, "download failed");
    }

    fn on_download_canceled(&self, _download_id: u64) {}

    fn on_file_created(&self, _path: &Path, _size_in_bytes: u64) {}

    fn on_file_accessed(&self, path: &Path) {
        tracing::trace!(path = %path.display(), "symbol file accessed");
    }

    fn on_file_missed(&self, path: &Path) {
        tracing::trace!(path = %path.display(), "symbol file missed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use kestrel_target::{Module, SymbolResolver};
    use test_log::test;

    use super::ModuleResolver;

    fn module(path: &str, base: u64) -> Module {
        Module {
            name: path.to_owned(),
            path: PathBuf::from(path),
            base,
            end: base + 0x1000,
        }
    }

    #[test(tokio::test)]
    async fn unmapped_address_is_address_only() {
        let resolver = ModuleResolver::with_modules(&[module("/nonexistent/libfoo.so", 0x10000)]);

        let location = resolver.resolve(0x5000).await.expect("resolve");
        assert!(!location.symbolized);
        assert_eq!(location.address, 0x5000);
    }

    #[test(tokio::test)]
    async fn missing_binary_is_an_error() {
        let resolver = ModuleResolver::with_modules(&[module("/nonexistent/libfoo.so", 0x10000)]);

        assert!(resolver.resolve(0x10010).await.is_err());
    }

    #[test]
    fn modules_are_kept_across_updates() {
        let mut resolver = ModuleResolver::new();
        resolver.set_modules(&[module("/a.so", 0x1000), module("/b.so", 0x8000)]);
        resolver.set_modules(&[module("/b.so", 0x8000), module("/c.so", 0x20000)]);

        let bases: Vec<_> = resolver
            .binaries()
            .iter()
            .map(|elf| elf.addr_range().start)
            .collect();

        assert_eq!(bases, [0x8000, 0x20000]);
    }
}
