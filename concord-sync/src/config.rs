//! Typed engine configuration.
//!
//! Every timeout, window and limit the engine uses lives here, so there is
//! exactly one place a value like the presence timeout comes from. Files
//! are TOML; `${VAR}` references are replaced from the environment before
//! parsing.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//!
//! [storage]
//! path = "${CONCORD_DATA}/db"
//!
//! [rate_limit]
//! limit = 10
//! window_secs = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use concord_core::AuthorNamespace;

use crate::error::ConfigError;
use crate::storage::StoreConfig;

/// Upper bound for every duration setting, in seconds (100 years). Keeps
/// `now - duration` well inside chrono's range.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// [`MAX_DURATION_SECS`] in days.
pub const MAX_DURATION_DAYS: u32 = 100 * 365;

fn bounded_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn bounded_days(days: u32) -> chrono::Duration {
    chrono::Duration::days(i64::from(days.min(MAX_DURATION_DAYS)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// A session with no heartbeat for this long is no longer active.
    pub timeout_secs: u64,
    /// Interval clients are expected to heartbeat at.
    pub heartbeat_interval_secs: u64,
    /// Ended sessions are forgotten after this long.
    pub ended_retention_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            heartbeat_interval_secs: 30,
            ended_retention_secs: 3600,
        }
    }
}

impl PresenceConfig {
    pub fn timeout(&self) -> chrono::Duration {
        bounded_secs(self.timeout_secs)
    }

    pub fn ended_retention(&self) -> chrono::Duration {
        bounded_secs(self.ended_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Operations older than this may be pruned.
    pub retention_days: u32,
    /// Documents with activity this recent are never pruned.
    pub recent_activity_days: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            recent_activity_days: 7,
            cleanup_interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> chrono::Duration {
        bounded_days(self.retention_days)
    }

    pub fn recent_activity(&self) -> chrono::Duration {
        bounded_days(self.recent_activity_days)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.clamp(1, MAX_DURATION_SECS))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Writes admitted per `(document, author)` per window.
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Retries after a lost commit race or a storage failure.
    pub max_retries: u32,
    /// Operations fetched per page while replaying.
    pub replay_page_size: usize,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            replay_page_size: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Events buffered per subscriber before it starts lagging.
    pub capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frames larger than this are rejected.
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_message_bytes: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// RocksDB directory. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            path: None,
            block_cache_size: store.block_cache_size,
            bloom_filter_bits: store.bloom_filter_bits,
            sync_writes: store.sync_writes,
            max_open_files: store.max_open_files,
            write_buffer_size: store.write_buffer_size,
        }
    }
}

impl StorageConfig {
    /// RocksDB settings, if a path is configured.
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.path.as_ref().map(|path| StoreConfig {
            path: path.clone(),
            block_cache_size: self.block_cache_size,
            bloom_filter_bits: self.bloom_filter_bits,
            sync_writes: self.sync_writes,
            max_open_files: self.max_open_files,
            write_buffer_size: self.write_buffer_size,
        })
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub presence: PresenceConfig,
    pub retention: RetentionConfig,
    pub rate_limit: RateLimitConfig,
    pub commit: CommitConfig,
    pub broadcast: BroadcastConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub authors: AuthorNamespace,
}

impl EngineConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse TOML after substituting `${VAR}` from the environment.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env(raw, |name| std::env::var(name).ok())?;
        let config: EngineConfig = toml::from_str(&substituted)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presence.timeout_secs == 0 {
            return Err(ConfigError::Invalid("presence.timeout_secs must be > 0".into()));
        }
        if self.presence.heartbeat_interval_secs >= self.presence.timeout_secs {
            return Err(ConfigError::Invalid(
                "presence.heartbeat_interval_secs must be below presence.timeout_secs".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_secs must be > 0".into()));
        }
        for (name, secs) in [
            ("presence.timeout_secs", self.presence.timeout_secs),
            ("presence.heartbeat_interval_secs", self.presence.heartbeat_interval_secs),
            ("presence.ended_retention_secs", self.presence.ended_retention_secs),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            ("retention.cleanup_interval_secs", self.retention.cleanup_interval_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {MAX_DURATION_SECS}"
                )));
            }
        }
        if self.retention.retention_days > MAX_DURATION_DAYS {
            return Err(ConfigError::Invalid(format!(
                "retention.retention_days must be at most {MAX_DURATION_DAYS}"
            )));
        }
        if self.retention.recent_activity_days > self.retention.retention_days {
            return Err(ConfigError::Invalid(
                "retention.recent_activity_days must not exceed retention.retention_days".into(),
            ));
        }
        if self.commit.replay_page_size == 0 {
            return Err(ConfigError::Invalid("commit.replay_page_size must be > 0".into()));
        }
        if self.broadcast.capacity == 0 {
            return Err(ConfigError::Invalid("broadcast.capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Replace every `${NAME}` with `lookup(NAME)`. Unset variables are an error.
fn substitute_env<F>(raw: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Invalid("unterminated ${ in config".into()))?;
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| ConfigError::MissingEnv(name.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.presence.timeout_secs, 300);
        assert_eq!(config.retention.retention_days, 30);
        assert_eq!(config.retention.recent_activity_days, 7);
        assert_eq!(config.rate_limit.limit, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.commit.max_retries, 3);
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
        assert!(config.storage.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [rate_limit]
            limit = 5

            [authors]
            allowed_prefixes = ["user:"]
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.limit, 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.authors.allowed_prefixes, vec!["user:".to_string()]);
        assert_eq!(config.presence.timeout_secs, 300);
    }

    #[test]
    fn test_env_substitution() {
        let out = substitute_env("path = \"${DATA}/db\"", |name| {
            (name == "DATA").then(|| "/var/concord".to_string())
        })
        .unwrap();
        assert_eq!(out, "path = \"/var/concord/db\"");
    }

    #[test]
    fn test_missing_env_is_error() {
        let err = substitute_env("x = \"${NOPE}\"", |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(name) if name == "NOPE"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_toml("[presence]\ntimeout_secs = 10\nheartbeat_interval_secs = 30\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        for toml in [
            "[presence]\ntimeout_secs = 9223372036854775807\n",
            "[presence]\nended_retention_secs = 9223372036854775807\n",
            "[rate_limit]\nwindow_secs = 9223372036854775807\n",
            "[retention]\nretention_days = 4294967295\nrecent_activity_days = 1\n",
            "[retention]\ncleanup_interval_secs = 9223372036854775807\n",
        ] {
            let err = EngineConfig::from_toml(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml}: {err:?}");
        }

        let mut config = EngineConfig::default();
        config.retention.retention_days = MAX_DURATION_DAYS;
        config.presence.ended_retention_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_accessors_never_overflow() {
        let mut config = EngineConfig::default();
        config.presence.timeout_secs = u64::MAX;
        config.retention.retention_days = u32::MAX;
        config.retention.recent_activity_days = u32::MAX;
        assert_eq!(config.presence.timeout().num_seconds(), MAX_DURATION_SECS as i64);
        assert_eq!(config.retention.retention().num_days(), i64::from(MAX_DURATION_DAYS));

        let now = chrono::Utc::now();
        assert!(now - config.retention.retention() < now);
        assert!(now - config.retention.recent_activity() < now);
    }

    #[test]
    fn test_storage_config_only_with_path() {
        let mut storage = StorageConfig::default();
        assert!(storage.store_config().is_none());
        storage.path = Some(PathBuf::from("/tmp/concord"));
        assert_eq!(storage.store_config().unwrap().path, PathBuf::from("/tmp/concord"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concord.toml");
        std::fs::write(&path, "[server]\nbind_addr = \"0.0.0.0:7000\"\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000");
    }
}
