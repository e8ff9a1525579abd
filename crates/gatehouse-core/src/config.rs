//! Library-side engine settings.

use std::time::Duration;

/// Tunables for one [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between automatic retries of a failed attempt.
    pub retry_delay: Duration,
    /// Check and repair the file mirror when the orchestrator opens.
    pub check_on_startup: bool,
    /// Largest artifact accepted for staging.
    pub max_artifact_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            check_on_startup: true,
            max_artifact_bytes: 100 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults suited to tests: no retry delay, no startup check.
    pub fn immediate() -> Self {
        Self {
            retry_delay: Duration::ZERO,
            check_on_startup: false,
            ..Self::default()
        }
    }
}
