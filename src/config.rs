//! Kernel configuration.
//!
//! An immutable snapshot handed to the kernel at construction and
//! replaceable at runtime through `set_config`; live deadline updates are
//! applied to any running timers. Builder methods follow the crate-wide
//! `with_*` convention.
//!
//! # Example
//!
//! ```rust
//! use rs_loconet::config::Config;
//!
//! let config = Config::default()
//!     .with_fast_clock_master(true)
//!     .with_fast_clock_sync_interval_ms(30_000)
//!     .with_echo_timeout_ms(200);
//!
//! assert!(config.fast_clock_master);
//! assert_eq!(config.echo_timeout_ms, 200);
//! ```

/// Kernel configuration snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Log every received and transmitted frame at debug level.
    pub debug_log: bool,
    /// Observe the bus without ever transmitting.
    pub listen_only: bool,
    /// Act as the fast-clock master: broadcast fast time periodically.
    pub fast_clock_master: bool,
    /// Interval between fast-clock broadcasts, in milliseconds.
    pub fast_clock_sync_interval_ms: u32,
    /// Consecutive unacknowledged broadcasts before fast-clock support
    /// is considered absent and broadcasting stops.
    pub fast_clock_ack_limit: u8,
    /// How long to wait for the bus echo of a transmitted frame.
    pub echo_timeout_ms: u32,
    /// How long to wait for a command-station response.
    pub response_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_log: false,
            listen_only: false,
            fast_clock_master: false,
            fast_clock_sync_interval_ms: 60_000,
            fast_clock_ack_limit: 3,
            echo_timeout_ms: 250,
            response_timeout_ms: 750,
        }
    }
}

impl Config {
    /// Enable or disable frame-level debug logging.
    pub fn with_debug_log(mut self, enabled: bool) -> Self {
        self.debug_log = enabled;
        self
    }

    /// Enable or disable listen-only mode.
    pub fn with_listen_only(mut self, enabled: bool) -> Self {
        self.listen_only = enabled;
        self
    }

    /// Enable or disable the fast-clock master role.
    pub fn with_fast_clock_master(mut self, enabled: bool) -> Self {
        self.fast_clock_master = enabled;
        self
    }

    /// Set the fast-clock broadcast interval.
    pub fn with_fast_clock_sync_interval_ms(mut self, ms: u32) -> Self {
        self.fast_clock_sync_interval_ms = ms;
        self
    }

    /// Set the unacknowledged-broadcast limit.
    pub fn with_fast_clock_ack_limit(mut self, limit: u8) -> Self {
        self.fast_clock_ack_limit = limit;
        self
    }

    /// Set the echo timeout.
    pub fn with_echo_timeout_ms(mut self, ms: u32) -> Self {
        self.echo_timeout_ms = ms;
        self
    }

    /// Set the response timeout.
    pub fn with_response_timeout_ms(mut self, ms: u32) -> Self {
        self.response_timeout_ms = ms;
        self
    }
}
