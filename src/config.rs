//! Runtime configuration types.

use std::path::Path;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable holding the application-heap size in MiB.
pub const HEAP_SIZE_ENV: &str = "TAGVM_HEAP_SIZE";

pub const MIB: usize = 1024 * 1024;
pub const MIN_HEAP_MIB: usize = 16;
pub const MAX_HEAP_MIB: usize = 1024;
pub const DEFAULT_HEAP_MIB: usize = 64;

/// Cycle-collection backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectorKind {
    /// Trial deletion over the candidate set
    #[default]
    TrialDeletion,
    /// Stop-the-world mark and sweep over every block
    MarkSweep,
}

/// Output format for GC statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Application heap size in bytes
    pub heap_bytes: usize,
    /// Engine-internal region size in bytes
    pub internal_bytes: usize,
    /// Free-list node pool size in bytes
    pub node_pool_bytes: usize,
    pub collector: CollectorKind,
    /// Allocation volume between cycle-collection passes
    pub cycle_trigger_bytes: u64,
    pub max_call_depth: usize,
    /// Print GC statistics on exit
    pub gc_stats: Option<StatsFormat>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_bytes: DEFAULT_HEAP_MIB * MIB,
            internal_bytes: MIB,
            node_pool_bytes: 256 * 1024,
            collector: CollectorKind::TrialDeletion,
            cycle_trigger_bytes: 4 * MIB as u64,
            max_call_depth: 2000,
            gc_stats: None,
        }
    }
}

impl RuntimeConfig {
    /// Load overrides from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `TAGVM_HEAP_SIZE` from the process environment.
    pub fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(HEAP_SIZE_ENV) {
            self.apply_heap_size_var(&raw);
        }
    }

    fn apply_heap_size_var(&mut self, raw: &str) {
        match raw.trim().parse::<usize>() {
            Ok(mib) => self.heap_bytes = clamp_heap_mib(mib) * MIB,
            Err(_) => warn!("ignoring malformed {}={:?}", HEAP_SIZE_ENV, raw),
        }
    }

    /// Set the heap size from a MiB count, clamped to the supported range.
    pub fn set_heap_mib(&mut self, mib: usize) {
        self.heap_bytes = clamp_heap_mib(mib) * MIB;
    }
}

pub fn clamp_heap_mib(mib: usize) -> usize {
    let clamped = mib.clamp(MIN_HEAP_MIB, MAX_HEAP_MIB);
    if clamped != mib {
        warn!(
            "heap size {} MiB out of range, using {} MiB",
            mib, clamped
        );
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.heap_bytes, 64 * MIB);
        assert_eq!(config.collector, CollectorKind::TrialDeletion);
        assert_eq!(config.max_call_depth, 2000);
    }

    #[test]
    fn test_heap_size_clamped() {
        let mut config = RuntimeConfig::default();
        config.apply_heap_size_var("4");
        assert_eq!(config.heap_bytes, MIN_HEAP_MIB * MIB);
        config.apply_heap_size_var("100000");
        assert_eq!(config.heap_bytes, MAX_HEAP_MIB * MIB);
        config.apply_heap_size_var(" 128 ");
        assert_eq!(config.heap_bytes, 128 * MIB);
    }

    #[test]
    fn test_malformed_heap_size_ignored() {
        let mut config = RuntimeConfig::default();
        config.apply_heap_size_var("lots");
        assert_eq!(config.heap_bytes, DEFAULT_HEAP_MIB * MIB);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "collector = \"mark-sweep\"\nmax_call_depth = 50").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.collector, CollectorKind::MarkSweep);
        assert_eq!(config.max_call_depth, 50);
        assert_eq!(config.heap_bytes, DEFAULT_HEAP_MIB * MIB);
    }

    #[test]
    fn test_from_file_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "collector = 3").unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
