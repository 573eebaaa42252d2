//! Engine configuration (§6). Loading these values from a file or environment is the
//! out-of-scope "configuration loading" collaborator; this crate only owns the struct.

use std::time::Duration;

/// Tunables recognized by the session layer.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Duration after which, absent keep-alives, a session expires.
    pub session_timeout: Duration,
    /// Maximum number of unacknowledged events buffered per session.
    pub event_buffer_bound: usize,
    /// Number of unrelated commits a command-sequence gap may persist for before the session
    /// holding it is expired with `SequenceGap`.
    pub command_gap_threshold: u64,
    /// How long a cached leader lease remains valid for `BOUNDED_LINEARIZABLE` reads.
    pub linearizable_lease: Duration,
    /// Maximum number of buffers live at once in the shared [`buffer::BufferPool`].
    /// `None` means unbounded.
    pub pool_capacity: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            session_timeout: Duration::from_secs(30),
            event_buffer_bound: 1024,
            command_gap_threshold: 64,
            linearizable_lease: Duration::from_secs(5),
            pool_capacity: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for [`EngineConfig`], mirroring the field-at-a-time construction style used
/// throughout the `raft` crate's own `Config`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfigBuilder {
    config: OptionalConfig,
}

#[derive(Debug, Clone, Copy, Default)]
struct OptionalConfig {
    session_timeout: Option<Duration>,
    event_buffer_bound: Option<usize>,
    command_gap_threshold: Option<u64>,
    linearizable_lease: Option<Duration>,
    pool_capacity: Option<Option<usize>>,
}

impl EngineConfigBuilder {
    pub fn session_timeout(mut self, value: Duration) -> Self {
        self.config.session_timeout = Some(value);
        self
    }

    pub fn event_buffer_bound(mut self, value: usize) -> Self {
        self.config.event_buffer_bound = Some(value);
        self
    }

    pub fn command_gap_threshold(mut self, value: u64) -> Self {
        self.config.command_gap_threshold = Some(value);
        self
    }

    pub fn linearizable_lease(mut self, value: Duration) -> Self {
        self.config.linearizable_lease = Some(value);
        self
    }

    pub fn pool_capacity(mut self, value: Option<usize>) -> Self {
        self.config.pool_capacity = Some(value);
        self
    }

    pub fn build(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            session_timeout: self.config.session_timeout.unwrap_or(defaults.session_timeout),
            event_buffer_bound: self
                .config
                .event_buffer_bound
                .unwrap_or(defaults.event_buffer_bound),
            command_gap_threshold: self
                .config
                .command_gap_threshold
                .unwrap_or(defaults.command_gap_threshold),
            linearizable_lease: self
                .config
                .linearizable_lease
                .unwrap_or(defaults.linearizable_lease),
            pool_capacity: self.config.pool_capacity.unwrap_or(defaults.pool_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_only_set_fields() {
        let cfg = EngineConfig::builder()
            .command_gap_threshold(10)
            .build();
        assert_eq!(cfg.command_gap_threshold, 10);
        assert_eq!(cfg.session_timeout, EngineConfig::default().session_timeout);
    }
}
