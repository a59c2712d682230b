//! Application configuration loading for CLI defaults.
//!
//! The file is a flat list of `key = value` lines: strings are double
//! quoted, integers and booleans bare, `#` starts a comment outside quotes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use harvester_core::HarvesterConfig;

/// File configuration for harvester defaults. Every field is optional; unset
/// fields keep the library defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// JSON file of source rules.
    pub rules_path: Option<PathBuf>,
    /// Where downloaded documents are written.
    pub output_dir: Option<PathBuf>,
    /// Disk cache root; unset keeps the cache in memory only.
    pub cache_dir: Option<PathBuf>,
    pub cache_enabled: Option<bool>,
    pub memory_cache_capacity: Option<u64>,
    /// Global cap on concurrent requests (1..=256).
    pub max_in_flight: Option<u64>,
    /// Minimum spacing between requests to one origin in milliseconds.
    pub politeness_delay_ms: Option<u64>,
    /// Fetch attempts per request, across header profiles (1..=10).
    pub max_attempts: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub breaker_failure_threshold: Option<u64>,
    pub breaker_recovery_secs: Option<u64>,
    /// Chapters fetched concurrently per batch (1..=100).
    pub batch_size: Option<u64>,
    pub batch_delay_ms: Option<u64>,
    /// Retries per chapter in the main download pass (0..=10).
    pub chapter_retries: Option<u64>,
    /// Minimum share of chapters, in percent, for a download to succeed.
    pub quorum_percent: Option<u64>,
    pub max_download_minutes: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("memory_cache_capacity", self.memory_cache_capacity, 1, 1_000_000)?;
        validate_range("max_in_flight", self.max_in_flight, 1, 256)?;
        validate_range("politeness_delay_ms", self.politeness_delay_ms, 0, 60_000)?;
        validate_range("max_attempts", self.max_attempts, 1, 10)?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600)?;
        validate_range("breaker_failure_threshold", self.breaker_failure_threshold, 1, 100)?;
        validate_range("breaker_recovery_secs", self.breaker_recovery_secs, 1, 3600)?;
        validate_range("batch_size", self.batch_size, 1, 100)?;
        validate_range("batch_delay_ms", self.batch_delay_ms, 0, 60_000)?;
        validate_range("chapter_retries", self.chapter_retries, 0, 10)?;
        validate_range("quorum_percent", self.quorum_percent, 0, 100)?;
        validate_range("max_download_minutes", self.max_download_minutes, 1, 1440)?;
        validate_range("stall_timeout_secs", self.stall_timeout_secs, 1, 3600)?;
        Ok(())
    }

    /// Overlays the values that are set onto `config`.
    pub fn apply(&self, config: &mut HarvesterConfig) {
        if let Some(enabled) = self.cache_enabled {
            config.cache.enabled = enabled;
        }
        if let Some(dir) = &self.cache_dir {
            config.cache.dir = Some(dir.clone());
        }
        if let Some(capacity) = self.memory_cache_capacity {
            config.cache.memory_capacity = to_usize(capacity);
        }
        if let Some(max) = self.max_in_flight {
            config.fetch.max_in_flight = to_usize(max);
        }
        if let Some(ms) = self.politeness_delay_ms {
            config.fetch.politeness_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.max_attempts {
            config.fetch.retry = harvester_core::RetryPolicy::with_max_attempts(to_u32(attempts));
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.fetch.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = self.breaker_failure_threshold {
            config.breaker.failure_threshold = to_u32(threshold);
        }
        if let Some(secs) = self.breaker_recovery_secs {
            config.breaker.recovery_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = self.batch_size {
            config.download.batch_size = to_usize(size);
        }
        if let Some(ms) = self.batch_delay_ms {
            config.download.batch_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = self.chapter_retries {
            config.download.retry_times = to_u32(retries);
        }
        if let Some(percent) = self.quorum_percent {
            config.download.quorum_ratio = f64::from(to_u32(percent)) / 100.0;
        }
        if let Some(minutes) = self.max_download_minutes {
            config.download.max_duration = Duration::from_secs(minutes * 60);
        }
        if let Some(secs) = self.stall_timeout_secs {
            config.tracker.stall_timeout = Duration::from_secs(secs);
        }
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn to_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Log level used when neither `RUST_LOG` nor a CLI flag decides.
    #[must_use]
    pub fn log_level(self) -> &'static str {
        match self {
            Self::Default => "warn",
            Self::Verbose => "info",
            Self::Quiet => "error",
            Self::Debug => "debug",
        }
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/harvester/config.toml`
/// 2. `$HOME/.config/harvester/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("harvester")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("harvester")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from `explicit` when given (it must exist), otherwise from
/// the default path if present.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_no = line_index + 1;
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "rules_path" => cfg.rules_path = Some(parse_string_literal(value).with_context(context)?.into()),
            "output_dir" => cfg.output_dir = Some(parse_string_literal(value).with_context(context)?.into()),
            "cache_dir" => cfg.cache_dir = Some(parse_string_literal(value).with_context(context)?.into()),
            "cache_enabled" => cfg.cache_enabled = Some(parse_boolean(value).with_context(context)?),
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.verbosity = Some(
                    parse_verbosity(&parsed)
                        .with_context(|| format!("Invalid `verbosity` value '{parsed}' on line {line_no}"))?,
                );
            }
            "memory_cache_capacity"
            | "max_in_flight"
            | "politeness_delay_ms"
            | "max_attempts"
            | "connect_timeout_secs"
            | "breaker_failure_threshold"
            | "breaker_recovery_secs"
            | "batch_size"
            | "batch_delay_ms"
            | "chapter_retries"
            | "quorum_percent"
            | "max_download_minutes"
            | "stall_timeout_secs" => {
                let parsed = Some(parse_integer_u64(value).with_context(context)?);
                *integer_slot(&mut cfg, key) = parsed;
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn integer_slot<'a>(cfg: &'a mut FileConfig, key: &str) -> &'a mut Option<u64> {
    match key {
        "memory_cache_capacity" => &mut cfg.memory_cache_capacity,
        "max_in_flight" => &mut cfg.max_in_flight,
        "politeness_delay_ms" => &mut cfg.politeness_delay_ms,
        "max_attempts" => &mut cfg.max_attempts,
        "connect_timeout_secs" => &mut cfg.connect_timeout_secs,
        "breaker_failure_threshold" => &mut cfg.breaker_failure_threshold,
        "breaker_recovery_secs" => &mut cfg.breaker_recovery_secs,
        "batch_size" => &mut cfg.batch_size,
        "batch_delay_ms" => &mut cfg.batch_delay_ms,
        "chapter_retries" => &mut cfg.chapter_retries,
        "quorum_percent" => &mut cfg.quorum_percent,
        "max_download_minutes" => &mut cfg.max_download_minutes,
        _ => &mut cfg.stall_timeout_secs,
    }
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
            # harvester defaults
            rules_path = "/etc/harvester/rules.json"
            batch_size = 8   # smaller batches
            cache_enabled = false
            verbosity = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.rules_path, Some(PathBuf::from("/etc/harvester/rules.json")));
        assert_eq!(cfg.batch_size, Some(8));
        assert_eq!(cfg.cache_enabled, Some(false));
        assert_eq!(cfg.verbosity, Some(VerbositySetting::Debug));
        assert_eq!(cfg.output_dir, None);
    }

    #[test]
    fn test_hash_inside_string_is_kept() {
        let cfg = parse_config_str(r#"output_dir = "/tmp/#books" # comment"#).unwrap();
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/tmp/#books")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse_config_str("colour = \"blue\"").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key: 'colour' on line 1"));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = parse_config_str("batch_size = 0").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
        assert!(parse_config_str("quorum_percent = 101").is_err());
        assert!(parse_config_str("max_in_flight = -1").is_err());
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert!(parse_config_str("output_dir = books").is_err());
        assert!(parse_config_str("cache_enabled = yes").is_err());
        assert!(parse_config_str("just a line").is_err());
    }

    #[test]
    fn test_apply_overrides_library_defaults() {
        let cfg = parse_config_str(
            "batch_size = 4\nquorum_percent = 80\nmax_download_minutes = 30\nmax_in_flight = 3\nchapter_retries = 1",
        )
        .unwrap();
        let mut config = HarvesterConfig::default();
        cfg.apply(&mut config);
        assert_eq!(config.download.batch_size, 4);
        assert!((config.download.quorum_ratio - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.download.max_duration, Duration::from_secs(1800));
        assert_eq!(config.fetch.max_in_flight, 3);
        assert_eq!(config.download.retry_times, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("config.toml");
        fs::write(&path, "batch_size = 3\n").unwrap();
        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.config.unwrap().batch_size, Some(3));
    }
}
