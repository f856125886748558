//! Daemon configuration, sourced from the environment.
//!
//! Every option has a default except the watch roots; an empty watch list is
//! accepted and yields an idle daemon.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Default media extensions recognized by the watcher (lowercase, no dot).
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff"];

/// Default chunk size for streaming content hashing (4 MiB).
pub const DEFAULT_HASH_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory trees to watch for convertible media files.
    pub watch_dirs: Vec<PathBuf>,
    /// Location of the SQLite store.
    pub db_path: PathBuf,
    /// Log filter passed to the subscriber (e.g. "info", "mediamorph=debug").
    pub log_level: String,
    /// Cadence of the periodic full scan.
    pub poll_interval: Duration,
    /// Minimum time a file must sit unchanged before it is considered stable.
    pub stability_delay: Duration,
    /// Number of conversion workers.
    pub max_workers: usize,
    /// Quality parameter (1-100) handed to converters that honor it.
    pub convert_quality: u8,
    /// Whether converters attempt full-metadata preservation.
    pub preserve_metadata: bool,
    /// Chunk size for streaming content hashing.
    pub hash_chunk_size: usize,
    /// Root for per-run temporary directories.
    pub temp_dir: PathBuf,
    /// Built-in converter names to register at startup.
    pub builtin_converters: Vec<String>,
    /// File extensions (lowercase, no dot) treated as media files.
    pub media_extensions: Vec<String>,
    /// Upper bound for a single conversion.
    pub convert_timeout: Duration,
    /// Grace period for draining in-flight tasks on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_dirs: Vec::new(),
            db_path: PathBuf::from("/data/mediamorph.db"),
            log_level: "info".to_string(),
            poll_interval: Duration::from_secs(60),
            stability_delay: Duration::from_secs(2),
            max_workers: 4,
            convert_quality: 90,
            preserve_metadata: true,
            hash_chunk_size: DEFAULT_HASH_CHUNK_SIZE,
            temp_dir: env::temp_dir(),
            builtin_converters: Vec::new(),
            media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            convert_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(20),
        }
    }
}

/// Loads the configuration from the process environment.
pub fn load_config() -> Config {
    Config::from_lookup(|key| env::var(key).ok())
}

impl Config {
    /// Builds a configuration from a key lookup function. Extracted from
    /// [`load_config`] so tests can inject values without touching the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();

        Self {
            watch_dirs: split_list(&lookup("WATCH_DIRS").unwrap_or_default())
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            db_path: lookup("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            poll_interval: secs_or(&lookup, "POLL_INTERVAL", defaults.poll_interval),
            stability_delay: secs_or(
                &lookup,
                "METADATA_STABILITY_DELAY",
                defaults.stability_delay,
            ),
            max_workers: parse_or(&lookup, "MAX_WORKERS", defaults.max_workers),
            convert_quality: parse_or(&lookup, "CONVERT_QUALITY", defaults.convert_quality),
            preserve_metadata: bool_or(&lookup, "PRESERVE_METADATA", defaults.preserve_metadata),
            hash_chunk_size: parse_or(&lookup, "HASH_CHUNK_SIZE", defaults.hash_chunk_size),
            temp_dir: lookup("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            builtin_converters: split_list(&lookup("BUILTIN_CONVERTERS").unwrap_or_default()),
            media_extensions: match lookup("MEDIA_EXTENSIONS") {
                Some(raw) if !raw.trim().is_empty() => split_list(&raw)
                    .into_iter()
                    .map(|e| e.trim_start_matches('.').to_lowercase())
                    .collect(),
                _ => defaults.media_extensions,
            },
            convert_timeout: secs_or(&lookup, "CONVERT_TIMEOUT", defaults.convert_timeout),
            shutdown_grace: secs_or(&lookup, "SHUTDOWN_GRACE", defaults.shutdown_grace),
        }
    }

    /// Validates fatal misconfigurations. An empty watch list is permitted
    /// (the daemon starts idle); a relative watch root is not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for dir in &self.watch_dirs {
            if !dir.is_absolute() {
                return Err(ConfigError::Validation {
                    message: format!("watch directory must be absolute: {}", dir.display()),
                });
            }
        }

        if !(1..=100).contains(&self.convert_quality) {
            return Err(ConfigError::Validation {
                message: format!(
                    "convert_quality must be between 1 and 100, got {}",
                    self.convert_quality
                ),
            });
        }

        if self.hash_chunk_size < 1024 {
            return Err(ConfigError::Validation {
                message: format!(
                    "hash_chunk_size must be at least 1024 bytes, got {}",
                    self.hash_chunk_size
                ),
            });
        }

        if self.media_extensions.is_empty() {
            return Err(ConfigError::Validation {
                message: "media_extensions must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
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

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn bool_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let map = HashMap::new();
        let config = Config::from_lookup(lookup_from(&map));

        assert!(config.watch_dirs.is_empty());
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.convert_quality, 90);
        assert!(config.preserve_metadata);
        assert_eq!(config.hash_chunk_size, DEFAULT_HASH_CHUNK_SIZE);
        assert_eq!(config.media_extensions, DEFAULT_MEDIA_EXTENSIONS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watch_dirs_split_and_trimmed() {
        let mut map = HashMap::new();
        map.insert("WATCH_DIRS", "/photos, /scans ,,/import");
        let config = Config::from_lookup(lookup_from(&map));

        assert_eq!(
            config.watch_dirs,
            vec![
                PathBuf::from("/photos"),
                PathBuf::from("/scans"),
                PathBuf::from("/import")
            ]
        );
    }

    #[test]
    fn test_relative_watch_dir_rejected() {
        let mut map = HashMap::new();
        map.insert("WATCH_DIRS", "photos");
        let config = Config::from_lookup(lookup_from(&map));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_quality_bounds_enforced() {
        let mut map = HashMap::new();
        map.insert("CONVERT_QUALITY", "101");
        let config = Config::from_lookup(lookup_from(&map));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_numbers_fall_back_to_defaults() {
        let mut map = HashMap::new();
        map.insert("MAX_WORKERS", "not-a-number");
        map.insert("POLL_INTERVAL", "-5");
        let config = Config::from_lookup(lookup_from(&map));

        assert_eq!(config.max_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_media_extensions_normalized() {
        let mut map = HashMap::new();
        map.insert("MEDIA_EXTENSIONS", ".JPG,png, .WebP");
        let config = Config::from_lookup(lookup_from(&map));

        assert_eq!(config.media_extensions, vec!["jpg", "png", "webp"]);
    }

    #[test]
    fn test_builtin_converters_list() {
        let mut map = HashMap::new();
        map.insert("BUILTIN_CONVERTERS", "jpeg2heic, png2avif");
        let config = Config::from_lookup(lookup_from(&map));

        assert_eq!(config.builtin_converters, vec!["jpeg2heic", "png2avif"]);
    }

    #[test]
    fn test_preserve_metadata_parsing() {
        for (raw, expected) in [("false", false), ("0", false), ("TRUE", true), ("junk", true)] {
            let mut map = HashMap::new();
            map.insert("PRESERVE_METADATA", raw);
            let config = Config::from_lookup(lookup_from(&map));
            assert_eq!(config.preserve_metadata, expected, "raw={raw}");
        }
    }
}
