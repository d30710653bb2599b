use crate::error::ProcError;
use crate::stop::StopAt;
use serde::{Deserialize, Serialize};

/// Registry-wide tuning, fixed at [`Registry::new`] time apart from
/// `stop_at`, which attach-time degradation may rewrite (a static binary
/// with an unresolvable main() drops the whole registry back to
/// `PreInit`).
///
/// [`Registry::new`]: crate::registry::Registry::new
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Width of the pid hash (chained buckets).
    pub pid_buckets: usize,
    /// Maximum number of non-retired cached targets.
    pub cache_cap: usize,
    /// Rendezvous point driven by the attach state machine.
    pub stop_at: StopAt,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pid_buckets: 64,
            cache_cap: 8,
            stop_at: StopAt::PostInit,
        }
    }
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Config, ProcError> {
        let cfg: Config = serde_json::from_str(raw).map_err(ProcError::Config)?;
        Ok(cfg.normalised())
    }

    /// A zero-width hash is unusable; clamp rather than error.
    fn normalised(mut self) -> Config {
        if self.pid_buckets == 0 {
            self.pid_buckets = 1;
        }
        self
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
