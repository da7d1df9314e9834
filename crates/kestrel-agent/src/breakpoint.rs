//! Client-visible breakpoints and watchpoints.
//!
//! A logical breakpoint only keeps its settings and hit count. Its
//! installations live in the registries of the processes it has locations
//! in, where they are shared with the other logical breakpoints at the same
//! address.

use kestrel_target::{AddressRange, BreakpointKind, BreakpointStats};

/// Settings of a logical breakpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointSettings {
    /// Client identifier of the breakpoint.
    pub id: u32,

    /// Whether the breakpoint is installed at all.
    pub enabled: bool,

    /// Whether the breakpoint is deleted after its first hit.
    pub one_shot: bool,

    /// How the breakpoint is installed.
    pub kind: BreakpointKind,

    /// Where the breakpoint is installed.
    pub locations: Vec<BreakpointLocation>,
}

/// Resolved location of a logical breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BreakpointLocation {
    /// Process to install the breakpoint in.
    pub process_koid: u64,

    /// Thread the breakpoint applies to, every thread if unset.
    pub thread_koid: Option<u64>,

    /// Code address.
    pub address: u64,
}

/// Settings of a logical watchpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchpointSettings {
    /// Client identifier of the watchpoint.
    pub id: u32,

    /// Whether the watchpoint is deleted after its first hit.
    pub one_shot: bool,

    /// Where the watchpoint is installed.
    pub locations: Vec<WatchpointLocation>,
}

/// Resolved location of a logical watchpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchpointLocation {
    /// Process to install the watchpoint in.
    pub process_koid: u64,

    /// Thread the watchpoint applies to, every thread if unset.
    pub thread_koid: Option<u64>,

    /// Watched range.
    pub range: AddressRange,
}

/// Logical breakpoint.
#[derive(Debug)]
pub struct Breakpoint {
    settings: BreakpointSettings,
    hit_count: u32,

    /// Locations which were successfully registered, with the kind they
    /// were registered as.
    pub(crate) registered: Vec<(BreakpointLocation, BreakpointKind)>,
}

impl Breakpoint {
    pub(crate) fn new(settings: BreakpointSettings) -> Self {
        Self {
            settings,
            hit_count: 0,
            registered: Vec::new(),
        }
    }

    /// Returns the current settings.
    pub fn settings(&self) -> &BreakpointSettings {
        &self.settings
    }

    /// Returns the number of hits so far.
    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub(crate) fn set_settings(&mut self, settings: BreakpointSettings) {
        self.settings = settings;
    }

    /// Locations the breakpoint should be registered at.
    pub(crate) fn wanted_locations(&self) -> &[BreakpointLocation] {
        if self.settings.enabled {
            &self.settings.locations
        } else {
            &[]
        }
    }

    pub(crate) fn on_hit(&mut self) -> BreakpointStats {
        self.hit_count = self.hit_count.saturating_add(1);

        BreakpointStats {
            id: self.settings.id,
            hit_count: self.hit_count,
            should_delete: self.settings.one_shot,
        }
    }
}

/// Logical watchpoint.
#[derive(Debug)]
pub struct Watchpoint {
    settings: WatchpointSettings,
    hit_count: u32,
    pub(crate) registered: Vec<WatchpointLocation>,
}

impl Watchpoint {
    pub(crate) fn new(settings: WatchpointSettings) -> Self {
        Self {
            settings,
            hit_count: 0,
            registered: Vec::new(),
        }
    }

    /// Returns the current settings.
    pub fn settings(&self) -> &WatchpointSettings {
        &self.settings
    }

    /// Returns the number of hits so far.
    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub(crate) fn set_settings(&mut self, settings: WatchpointSettings) {
        self.settings = settings;
    }

    pub(crate) fn on_hit(&mut self) -> BreakpointStats {
        self.hit_count = self.hit_count.saturating_add(1);

        BreakpointStats {
            id: self.settings.id,
            hit_count: self.hit_count,
            should_delete: self.settings.one_shot,
        }
    }
}
