//! Tunables for delta search and the pack caches.
//!
//! These limits bound the memory the builder may hold during preparation:
//! the per-worker sliding-window payloads and the global cache of computed
//! deltas. All limits are explicit and enforced.
//!
//! # Design Notes
//! - Limits are validated at startup; invalid combinations are treated as
//!   programmer errors (panic in `validate`).
//! - The recognized key set mirrors the conventional `pack.*` option names.
//!   The big-file threshold historically shared the delta-cache-size key in
//!   one reference implementation; here it is a distinct key.

use super::errors::ConfigError;

/// Default number of recent candidates considered as delta bases.
///
/// The search itself uses one extra slot for the object under consideration.
pub const DEFAULT_WINDOW: usize = 10;

/// Default upper bound on delta chain length.
pub const DEFAULT_DEPTH: u32 = 50;

/// Configuration key for [`PackConfig::max_delta_cache_size`].
pub const KEY_DELTA_CACHE_SIZE: &str = "pack.deltaCacheSize";
/// Configuration key for [`PackConfig::cache_max_small_delta_size`].
pub const KEY_DELTA_CACHE_LIMIT: &str = "pack.deltaCacheLimit";
/// Configuration key for [`PackConfig::big_file_threshold`].
pub const KEY_BIG_FILE_THRESHOLD: &str = "pack.bigFileThreshold";
/// Configuration key for [`PackConfig::window_memory_limit`].
pub const KEY_WINDOW_MEMORY: &str = "pack.windowMemory";

/// Source of integer configuration values.
///
/// Implement this over your configuration store; unknown keys return `None`
/// and fall back to the defaults.
pub trait ConfigSource {
    /// Looks up an integer value by key.
    fn get_i64(&self, key: &str) -> Option<i64>;
}

/// Memory and search tunables for the pack builder.
#[derive(Clone, Copy, Debug)]
pub struct PackConfig {
    /// Global budget for cached deltas produced during search, in bytes.
    ///
    /// Zero means unlimited. Deltas that do not fit are recomputed at write
    /// time instead of being held in memory.
    pub max_delta_cache_size: u64,

    /// Deltas smaller than this are always cache-admissible, in bytes.
    pub cache_max_small_delta_size: u64,

    /// Objects larger than this are never delta candidates, in bytes.
    pub big_file_threshold: u64,

    /// Budget for per-worker window payloads and indexes, in bytes.
    ///
    /// Zero means unlimited. When exceeded, the oldest window slots are
    /// dropped until the usage fits (at least one slot is always kept).
    pub window_memory_limit: u64,

    /// Number of previous candidates considered as delta bases.
    pub window: usize,

    /// Upper bound on delta chain length.
    pub depth: u32,
}

impl PackConfig {
    /// Defaults matching the conventional `pack.*` option defaults.
    pub const DEFAULT: Self = Self {
        max_delta_cache_size: 256 * 1024 * 1024,
        cache_max_small_delta_size: 1000,
        big_file_threshold: 512 * 1024 * 1024,
        window_memory_limit: 0,
        window: DEFAULT_WINDOW,
        depth: DEFAULT_DEPTH,
    };

    /// Builds a configuration from a source, falling back to defaults for
    /// missing keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Negative`] for any negative value.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, ConfigError> {
        fn get(
            source: &impl ConfigSource,
            key: &'static str,
            default: u64,
        ) -> Result<u64, ConfigError> {
            match source.get_i64(key) {
                None => Ok(default),
                Some(v) if v < 0 => Err(ConfigError::Negative { key, value: v }),
                Some(v) => Ok(v as u64),
            }
        }

        let d = Self::DEFAULT;
        Ok(Self {
            max_delta_cache_size: get(source, KEY_DELTA_CACHE_SIZE, d.max_delta_cache_size)?,
            cache_max_small_delta_size: get(
                source,
                KEY_DELTA_CACHE_LIMIT,
                d.cache_max_small_delta_size,
            )?,
            big_file_threshold: get(source, KEY_BIG_FILE_THRESHOLD, d.big_file_threshold)?,
            window_memory_limit: get(source, KEY_WINDOW_MEMORY, d.window_memory_limit)?,
            window: d.window,
            depth: d.depth,
        })
    }

    /// Validates that the tunables are internally consistent.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid (indicates a configuration
    /// bug).
    #[track_caller]
    pub const fn validate(&self) {
        assert!(self.window >= 1, "window must allow at least one base");
        assert!(self.window <= 10_000, "unreasonably large window");
        assert!(self.depth >= 1, "depth must allow at least one delta");
        assert!(self.depth <= 4096, "unreasonably deep delta chains");
    }
}

impl Default for PackConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

const _: () = PackConfig::DEFAULT.validate();

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource(HashMap<&'static str, i64>);

    impl ConfigSource for MapSource {
        fn get_i64(&self, key: &str) -> Option<i64> {
            self.0.get(key).copied()
        }
    }

    #[test]
    fn default_config_valid() {
        PackConfig::DEFAULT.validate();
    }

    #[test]
    fn from_source_overrides_and_defaults() {
        let source = MapSource(HashMap::from([
            (KEY_DELTA_CACHE_SIZE, 1024i64),
            (KEY_WINDOW_MEMORY, 4096i64),
        ]));
        let cfg = PackConfig::from_source(&source).unwrap();
        assert_eq!(cfg.max_delta_cache_size, 1024);
        assert_eq!(cfg.window_memory_limit, 4096);
        assert_eq!(
            cfg.big_file_threshold,
            PackConfig::DEFAULT.big_file_threshold
        );
        assert_eq!(cfg.window, DEFAULT_WINDOW);
    }

    #[test]
    fn from_source_rejects_negative() {
        let source = MapSource(HashMap::from([(KEY_DELTA_CACHE_LIMIT, -1i64)]));
        let err = PackConfig::from_source(&source).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Negative {
                key: KEY_DELTA_CACHE_LIMIT,
                value: -1
            }
        );
    }
}
