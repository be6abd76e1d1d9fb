//! Runtime configuration.

use std::time::Duration;

// ─── Sandbox limits ─────────────────────────────────────────────────────

/// Per-instance interpreter limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Maximum operations per script run (default: 1_000_000). 0 = unlimited.
    pub max_operations: u64,
    /// Maximum function call nesting (default: 64).
    pub max_call_depth: usize,
    /// Maximum length of any string value in bytes (default: 1 MB).
    pub max_string_size: usize,
    /// Maximum array length (default: 10_000).
    pub max_array_size: usize,
    /// Maximum object map size (default: 10_000).
    pub max_map_size: usize,
    /// Outbound HTTP timeout in seconds (default: 10).
    pub http_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_depth: 64,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            http_timeout_secs: 10,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_operations: parse_or(&lookup, "EXTENSION_MAX_OPERATIONS", defaults.max_operations),
            max_call_depth: parse_or(&lookup, "EXTENSION_MAX_CALL_DEPTH", defaults.max_call_depth),
            max_string_size: parse_or(
                &lookup,
                "EXTENSION_MAX_STRING_SIZE",
                defaults.max_string_size,
            ),
            max_array_size: parse_or(&lookup, "EXTENSION_MAX_ARRAY_SIZE", defaults.max_array_size),
            max_map_size: parse_or(&lookup, "EXTENSION_MAX_MAP_SIZE", defaults.max_map_size),
            http_timeout_secs: parse_or(
                &lookup,
                "EXTENSION_HTTP_TIMEOUT_SECS",
                defaults.http_timeout_secs,
            ),
        }
    }
}

// ─── Runtime ────────────────────────────────────────────────────────────

/// Configuration shared by the loader, pools and hook adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum instances per extension pool (default: 4).
    pub pool_size: usize,
    /// How long a hook firing or provider call waits for an instance
    /// (default: 5000 ms).
    pub acquire_timeout: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            acquire_timeout: Duration::from_millis(5000),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let pool_size: usize = parse_or(&lookup, "EXTENSION_POOL_SIZE", defaults.pool_size);
        let timeout_ms: u64 = parse_or(
            &lookup,
            "EXTENSION_ACQUIRE_TIMEOUT_MS",
            defaults.acquire_timeout.as_millis() as u64,
        );
        Self {
            // A pool of zero could never serve a call.
            pool_size: pool_size.max(1),
            acquire_timeout: Duration::from_millis(timeout_ms),
            sandbox: SandboxConfig::from_lookup(lookup),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_operations, 1_000_000);
        assert_eq!(config.max_call_depth, 64);
        assert_eq!(config.max_string_size, 1024 * 1024);
        assert_eq!(config.http_timeout_secs, 10);
    }

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_runtime_config_from_lookup() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("EXTENSION_POOL_SIZE", "8"),
            ("EXTENSION_ACQUIRE_TIMEOUT_MS", "250"),
            ("EXTENSION_MAX_OPERATIONS", "5000"),
            ("EXTENSION_MAX_CALL_DEPTH", "16"),
            ("EXTENSION_HTTP_TIMEOUT_SECS", "3"),
        ]));
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.sandbox.max_operations, 5000);
        assert_eq!(config.sandbox.max_call_depth, 16);
        assert_eq!(config.sandbox.http_timeout_secs, 3);
        // Unset keys keep their defaults.
        assert_eq!(config.sandbox.max_map_size, 10_000);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("EXTENSION_POOL_SIZE", "many"),
            ("EXTENSION_MAX_STRING_SIZE", "-1"),
        ]));
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.sandbox.max_string_size, 1024 * 1024);
    }

    #[test]
    fn test_zero_pool_size_clamped() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[("EXTENSION_POOL_SIZE", "0")]));
        assert_eq!(config.pool_size, 1);
    }
}
