//! ConfigResolver — normalizes per-execution config from graph + environment + defaults.
//!
//! Precedence is environment override (an operational escape hatch) over the
//! graph-declared value, which in turn falls back to the compiled-in defaults baked
//! into [`crate::graph::GraphConfig::default`].

use crate::error::{GraphError, Result};
use crate::graph::GraphConfig;

const ENV_MAX_PARALLEL: &str = "INTENTGRAPH_MAX_PARALLEL";
const ENV_TIMEOUT_SECS: &str = "INTENTGRAPH_TIMEOUT_SECS";
const ENV_MAX_ATTEMPTS: &str = "INTENTGRAPH_MAX_ATTEMPTS";
const ENV_BACKOFF_MULTIPLIER: &str = "INTENTGRAPH_BACKOFF_MULTIPLIER";

/// A resolved, validated configuration, ready for the scheduler to consume.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_multiplier: u32,
    pub max_parallel: u32,
    pub retry_on_errors: Vec<String>,
    pub no_retry_errors: Vec<String>,
}

/// Non-fatal warnings surfaced during resolution (e.g. unusually large bounds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning(pub String);

pub struct ConfigResolver;

impl ConfigResolver {
    /// Resolve a graph's config block, applying environment overrides and defaults,
    /// then validate bounds eagerly. Returns the resolved config plus any non-fatal
    /// warnings (logged by the caller via `tracing::warn!`).
    pub fn resolve(config: &GraphConfig) -> Result<(ResolvedConfig, Vec<ConfigWarning>)> {
        let timeout_secs = env_override(ENV_TIMEOUT_SECS).unwrap_or(config.timeout_secs);
        let max_attempts = env_override(ENV_MAX_ATTEMPTS).unwrap_or(config.retry.max_attempts);
        let backoff_multiplier =
            env_override(ENV_BACKOFF_MULTIPLIER).unwrap_or(config.retry.backoff_multiplier);
        let max_parallel = env_override(ENV_MAX_PARALLEL).unwrap_or(config.concurrency.max_parallel);

        if !(1..=3600).contains(&timeout_secs) {
            return Err(GraphError::ConfigInvalid(format!(
                "timeout must be within 1..=3600 seconds, got {timeout_secs}"
            )));
        }
        if !(1..=10).contains(&max_attempts) {
            return Err(GraphError::ConfigInvalid(format!(
                "retry.maxAttempts must be within 1..=10, got {max_attempts}"
            )));
        }
        if !(1..=10).contains(&backoff_multiplier) {
            return Err(GraphError::ConfigInvalid(format!(
                "retry.backoffMultiplier must be within 1..=10, got {backoff_multiplier}"
            )));
        }
        if !(1..=100).contains(&max_parallel) {
            return Err(GraphError::ConfigInvalid(format!(
                "concurrency.maxParallel must be within 1..=100, got {max_parallel}"
            )));
        }

        let mut warnings = Vec::new();
        if max_parallel > 50 {
            warnings.push(ConfigWarning(format!(
                "maxParallel={max_parallel} is unusually high (>50)"
            )));
        }
        if timeout_secs > 1800 {
            warnings.push(ConfigWarning(format!(
                "timeout={timeout_secs}s is unusually high (>1800)"
            )));
        }

        Ok((
            ResolvedConfig {
                timeout_secs,
                max_attempts,
                backoff_multiplier,
                max_parallel,
                retry_on_errors: config.retry.retry_on_errors.clone(),
                no_retry_errors: config.retry.no_retry_errors.clone(),
            },
            warnings,
        ))
    }
}

fn env_override<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphConfig;
    use std::sync::Mutex;

    // Serialize env-mutating tests; std::env is process-global.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_graph_is_silent() {
        let _g = ENV_LOCK.lock().unwrap();
        let (resolved, warnings) = ConfigResolver::resolve(&GraphConfig::default()).unwrap();
        assert_eq!(resolved.timeout_secs, 300);
        assert_eq!(resolved.max_parallel, 5);
        assert_eq!(resolved.max_attempts, 3);
        assert_eq!(resolved.backoff_multiplier, 2);
        assert!(warnings.is_empty());
    }

    #[test]
    fn rejects_out_of_bounds_max_parallel() {
        let _g = ENV_LOCK.lock().unwrap();
        let mut config = GraphConfig::default();
        config.concurrency.max_parallel = 0;
        assert!(ConfigResolver::resolve(&config).is_err());

        config.concurrency.max_parallel = 101;
        assert!(ConfigResolver::resolve(&config).is_err());

        config.concurrency.max_parallel = 100;
        assert!(ConfigResolver::resolve(&config).is_ok());
        config.concurrency.max_parallel = 1;
        assert!(ConfigResolver::resolve(&config).is_ok());
    }

    #[test]
    fn warns_on_high_max_parallel() {
        let _g = ENV_LOCK.lock().unwrap();
        let mut config = GraphConfig::default();
        config.concurrency.max_parallel = 75;
        let (_, warnings) = ConfigResolver::resolve(&config).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn environment_overrides_graph_value() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var(ENV_MAX_PARALLEL, "9");
        let mut config = GraphConfig::default();
        config.concurrency.max_parallel = 3;
        let (resolved, _) = ConfigResolver::resolve(&config).unwrap();
        assert_eq!(resolved.max_parallel, 9);
        std::env::remove_var(ENV_MAX_PARALLEL);
    }
}
