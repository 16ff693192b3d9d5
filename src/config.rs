use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SnapshotError};

const DEFAULT_HTTP_CHUNK_SIZE: u64 = 50000;
const DEFAULT_LRU_CACHE_ENTRY: usize = 5000;
const DEFAULT_LAYER_VALID_INTERVAL: u64 = 60;

pub const MEMORY_CACHE_TYPE: &str = "memory";

/// Snapshotter configuration, loaded from a TOML file.
///
/// All fields are optional; zero values select the documented defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of entries each blob cache keeps before evicting.
    pub lru_max_entry: usize,

    /// Granularity of HTTP byte-range requests against layer blobs.
    pub http_chunk_size: u64,

    /// Cache backend for raw HTTP chunks: "memory" or anything else for
    /// the directory cache.
    pub http_cache_type: String,

    /// Cache backend for decompressed file chunks.
    pub filesystem_cache_type: String,

    /// Seconds a mounted layer is trusted before the registry is probed
    /// again. Zero selects the 60s default, a negative value probes on
    /// every check.
    pub layer_valid_interval: i64,

    /// Regular expressions over registry hosts that should be reached
    /// over plain HTTP.
    pub insecure: Vec<String>,

    /// Disables the landmark-driven prefetch at mount time.
    pub noprefetch: bool,

    /// Prefetch size used when a layer carries no prefetch landmark.
    pub default_prefetch_size: u64,

    /// Ordered filesystem plugin IDs; the first is tried first when
    /// preparing remote snapshots.
    pub filesystems: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| SnapshotError::InvalidArgument(format!("bad config {path:?}: {e}")))
    }

    pub fn chunk_size(&self) -> u64 {
        if self.http_chunk_size == 0 {
            DEFAULT_HTTP_CHUNK_SIZE
        } else {
            self.http_chunk_size
        }
    }

    pub fn lru_max_entry(&self) -> usize {
        if self.lru_max_entry == 0 {
            DEFAULT_LRU_CACHE_ENTRY
        } else {
            self.lru_max_entry
        }
    }

    /// `Duration::ZERO` means "probe the registry on every check".
    pub fn layer_valid_interval(&self) -> Duration {
        match self.layer_valid_interval {
            0 => Duration::from_secs(DEFAULT_LAYER_VALID_INTERVAL),
            n if n < 0 => Duration::ZERO,
            n => Duration::from_secs(n as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_kick_in_for_zero_values() {
        let c = Config::default();
        assert_eq!(c.chunk_size(), 50000);
        assert_eq!(c.lru_max_entry(), 5000);
        assert_eq!(c.layer_valid_interval(), Duration::from_secs(60));
    }

    #[test]
    fn negative_interval_means_check_every_time() {
        let c = Config {
            layer_valid_interval: -1,
            ..Default::default()
        };
        assert_eq!(c.layer_valid_interval(), Duration::ZERO);
    }

    #[test]
    fn loads_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
http_chunk_size = 4096
lru_max_entry = 16
insecure = ["^reg\\.local(:.*)?$"]
noprefetch = true
filesystems = ["stargz"]
"#
        )
        .unwrap();
        let c = Config::load(f.path()).unwrap();
        assert_eq!(c.chunk_size(), 4096);
        assert_eq!(c.lru_max_entry(), 16);
        assert_eq!(c.insecure, vec!["^reg\\.local(:.*)?$".to_string()]);
        assert!(c.noprefetch);
        assert_eq!(c.filesystems, vec!["stargz".to_string()]);
    }
}
