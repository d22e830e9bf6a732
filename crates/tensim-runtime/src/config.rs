//! Runtime configuration
//!
//! Defaults come from [`RuntimeConfig::default`]; `from_env` layers
//! `TENSIM_WATCHDOG_MS` and `TENSIM_DEBUG_CHECKS` on top. Front ends apply
//! their own flags last with the `with_*` builders.

use std::time::Duration;
use tensim_chip::GridTopology;
use tracing::{debug, warn};

/// Environment variable holding the launch watchdog in milliseconds
pub const ENV_WATCHDOG_MS: &str = "TENSIM_WATCHDOG_MS";

/// Environment variable toggling debug protocol checks (`1`/`0`, `true`/`false`)
pub const ENV_DEBUG_CHECKS: &str = "TENSIM_DEBUG_CHECKS";

/// Device runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Grid and memory geometry
    pub topology: GridTopology,

    /// How long `launch_program` waits for all engines before reporting a hang
    pub watchdog: Duration,

    /// Enable protocol checks that real hardware does not perform
    /// (reserve/push pairing, over-pop, wrap straddle, unfenced semaphores,
    /// address-generator bounds)
    pub debug_checks: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            topology: GridTopology::REFERENCE,
            watchdog: Duration::from_secs(10),
            debug_checks: cfg!(debug_assertions),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration overridden by environment variables
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_WATCHDOG_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.watchdog = Duration::from_millis(ms),
                _ => warn!("Ignoring {ENV_WATCHDOG_MS}={raw:?}: expected a positive integer"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_DEBUG_CHECKS) {
            match parse_flag(&raw) {
                Some(on) => config.debug_checks = on,
                None => warn!("Ignoring {ENV_DEBUG_CHECKS}={raw:?}: expected 0/1/true/false"),
            }
        }

        debug!(
            "Runtime config: {}x{} grid, watchdog {:?}, debug checks {}",
            config.topology.grid_x, config.topology.grid_y, config.watchdog, config.debug_checks
        );
        config
    }

    /// Small grid, short watchdog, checks on (tests and demos)
    pub const fn small() -> Self {
        Self {
            topology: GridTopology::SMALL,
            watchdog: Duration::from_secs(2),
            debug_checks: true,
        }
    }

    /// Replace the topology
    #[must_use]
    pub const fn with_topology(mut self, topology: GridTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Replace the watchdog
    #[must_use]
    pub const fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Enable or disable debug checks
    #[must_use]
    pub const fn with_debug_checks(mut self, on: bool) -> Self {
        self.debug_checks = on;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let cfg = RuntimeConfig::default()
            .with_watchdog(Duration::from_millis(250))
            .with_debug_checks(false)
            .with_topology(GridTopology::SMALL);
        assert_eq!(cfg.watchdog, Duration::from_millis(250));
        assert!(!cfg.debug_checks);
        assert_eq!(cfg.topology.total_cores(), 16);
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" False "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
