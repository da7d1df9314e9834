use std::time::Duration;

/// Tunables of the debug engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    /// Interval between two checks of a pending suspension.
    pub suspend_poll_interval: Duration,

    /// Overall deadline of a synchronous suspension.
    pub suspend_deadline: Duration,

    /// Number of frames of a minimal stack.
    pub minimal_stack_frames: usize,

    /// Number of frames of a full stack.
    pub full_stack_frames: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            suspend_poll_interval: Duration::from_millis(10),
            suspend_deadline: Duration::from_secs(1),
            minimal_stack_frames: 2,
            full_stack_frames: 256,
        }
    }
}
