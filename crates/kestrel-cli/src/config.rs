use std::time::Duration;

use kestrel_agent::{AgentConfig, BreakpointLocation, BreakpointSettings};
use kestrel_agent::{WatchpointLocation, WatchpointSettings};
use kestrel_target::{AddressRange, BreakpointKind};

/// Configuration of a debugging session.
#[derive(Debug, Default, PartialEq, knus::Decode)]
pub struct SessionConfig {
    /// Thread suspension tunables.
    #[knus(child, default)]
    pub suspend: SuspendConfig,

    /// Stack tunables.
    #[knus(child, default)]
    pub stack: StackConfig,

    /// Breakpoints installed once attached.
    #[knus(children(name = "breakpoint"))]
    pub breakpoints: Vec<BreakpointConfig>,

    /// Watchpoints installed once attached.
    #[knus(children(name = "watchpoint"))]
    pub watchpoints: Vec<WatchpointConfig>,
}

/// Thread suspension tunables.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct SuspendConfig {
    /// Interval between two checks of a pending suspension.
    #[knus(child, default = 10, unwrap(argument))]
    pub poll_interval_ms: u64,

    /// Overall deadline of a suspension.
    #[knus(child, default = 1000, unwrap(argument))]
    pub deadline_ms: u64,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            deadline_ms: 1000,
        }
    }
}

/// Stack tunables.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct StackConfig {
    /// Number of frames reported with stop notifications.
    #[knus(child, default = 2, unwrap(argument))]
    pub minimal_frames: usize,

    /// Number of frames of a resolved stack.
    #[knus(child, default = 256, unwrap(argument))]
    pub full_frames: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            minimal_frames: 2,
            full_frames: 256,
        }
    }
}

/// Breakpoint at a code address.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct BreakpointConfig {
    /// Code address.
    #[knus(argument)]
    pub address: u64,

    /// Whether the breakpoint is deleted after its first hit.
    #[knus(property, default)]
    pub one_shot: bool,

    /// Whether a hardware slot is used instead of a trap instruction.
    #[knus(property, default)]
    pub hardware: bool,

    /// Thread the breakpoint is restricted to.
    #[knus(property)]
    pub thread: Option<u64>,
}

/// Watchpoint over a data range.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct WatchpointConfig {
    /// Start of the watched range.
    #[knus(argument)]
    pub address: u64,

    /// Size of the watched range.
    #[knus(property, default = 8)]
    pub size: u64,

    /// Whether the watchpoint is deleted after its first hit.
    #[knus(property, default)]
    pub one_shot: bool,

    /// Thread the watchpoint is restricted to.
    #[knus(property)]
    pub thread: Option<u64>,
}

impl SessionConfig {
    /// Returns the engine tunables.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            suspend_poll_interval: Duration::from_millis(self.suspend.poll_interval_ms),
            suspend_deadline: Duration::from_millis(self.suspend.deadline_ms),
            minimal_stack_frames: self.stack.minimal_frames,
            full_stack_frames: self.stack.full_frames,
        }
    }

    /// Returns the breakpoint settings for the given process.
    ///
    /// Identifiers are numbered from 1, in configuration order.
    pub fn breakpoint_settings(&self, process_koid: u64) -> Vec<BreakpointSettings> {
        self.breakpoints
            .iter()
            .zip(1..)
            .map(|(bp, id)| BreakpointSettings {
                id,
                enabled: true,
                one_shot: bp.one_shot,
                kind: if bp.hardware {
                    BreakpointKind::Hardware
                } else {
                    BreakpointKind::Software
                },
                locations: vec![BreakpointLocation {
                    process_koid,
                    thread_koid: bp.thread,
                    address: bp.address,
                }],
            })
            .collect()
    }

    /// Returns the watchpoint settings for the given process.
    ///
    /// Identifiers follow the ones of the breakpoints.
    pub fn watchpoint_settings(&self, process_koid: u64) -> Vec<WatchpointSettings> {
        let first_id = self.breakpoints.len() as u32 + 1;

        self.watchpoints
            .iter()
            .zip(first_id..)
            .map(|(wp, id)| WatchpointSettings {
                id,
                one_shot: wp.one_shot,
                locations: vec![WatchpointLocation {
                    process_koid,
                    thread_koid: wp.thread,
                    range: AddressRange::new(wp.address, wp.address.saturating_add(wp.size)),
                }],
            })
            .collect()
    }
}
