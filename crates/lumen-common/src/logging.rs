//! Logging setup.
//!
//! Installs a global `tracing` subscriber whose filter sits behind a reload
//! layer, so operators can raise or lower verbosity per partition while the
//! node runs.
//!
//! ```no_run
//! use lumen_common::config::LoggingConfig;
//! use lumen_common::logging::init_with_handle;
//!
//! let handle = init_with_handle(&LoggingConfig::default()).unwrap();
//! handle.set_partition_level("Herder", "trace").ok();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result};

/// Log partitions and the crate targets they cover.
pub const LOG_PARTITIONS: &[(&str, &str)] = &[
    ("Herder", "lumen_herder"),
    ("SCP", "lumen_scp"),
    ("Crypto", "lumen_crypto"),
    ("Common", "lumen_common"),
];

/// Handle for changing log levels at runtime.
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: Arc<Handle<EnvFilter, Registry>>,
    state: Arc<RwLock<LevelState>>,
}

#[derive(Debug, Clone)]
struct LevelState {
    global: String,
    partitions: BTreeMap<String, String>,
}

impl LogLevelHandle {
    /// Set the global level; partition overrides are cleared.
    pub fn set_level(&self, level: &str) -> Result<()> {
        let level = normalize_level(level)?;
        let mut state = self.state.write();
        state.global = level;
        state.partitions.clear();
        self.apply(&state)
    }

    /// Override the level of one partition.
    pub fn set_partition_level(&self, partition: &str, level: &str) -> Result<()> {
        let level = normalize_level(level)?;
        let (name, _) = find_partition(partition)
            .ok_or_else(|| Error::Logging(format!("unknown partition: {partition}")))?;
        let mut state = self.state.write();
        state.partitions.insert(name.to_string(), level);
        self.apply(&state)
    }

    /// Current levels, keyed by partition, plus `Global`.
    pub fn levels(&self) -> BTreeMap<String, String> {
        let state = self.state.read();
        let mut result = BTreeMap::new();
        for (name, _) in LOG_PARTITIONS {
            let level = state
                .partitions
                .get(*name)
                .cloned()
                .unwrap_or_else(|| state.global.clone());
            result.insert(name.to_string(), level);
        }
        result.insert("Global".to_string(), state.global.clone());
        result
    }

    fn apply(&self, state: &LevelState) -> Result<()> {
        let filter = build_filter(&state.global, &state.partitions)?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Logging(e.to_string()))?;
        tracing::debug!(global = %state.global, "Updated log levels");
        Ok(())
    }
}

fn normalize_level(level: &str) -> Result<String> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace".to_string()),
        "debug" => Ok("debug".to_string()),
        "info" => Ok("info".to_string()),
        "warn" | "warning" => Ok("warn".to_string()),
        "error" => Ok("error".to_string()),
        _ => Err(Error::Logging(format!("invalid log level: {level}"))),
    }
}

fn find_partition(partition: &str) -> Option<(&'static str, &'static str)> {
    LOG_PARTITIONS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(partition))
        .copied()
}

/// Build the filter for a global level plus per-partition overrides.
pub fn build_filter(global: &str, partitions: &BTreeMap<String, String>) -> Result<EnvFilter> {
    let mut filter = EnvFilter::new(global);
    for (partition, level) in partitions {
        let (_, target) = find_partition(partition)
            .ok_or_else(|| Error::Logging(format!("unknown partition: {partition}")))?;
        let directive = format!("{target}={level}")
            .parse()
            .map_err(|e| Error::Logging(format!("bad directive for {partition}: {e}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG`, when set, takes precedence over the configured levels.
pub fn init_with_handle(config: &LoggingConfig) -> Result<LogLevelHandle> {
    let global = config.level.as_str().to_string();
    let partitions: BTreeMap<String, String> = config
        .partitions
        .iter()
        .map(|(name, level)| (name.clone(), level.as_str().to_string()))
        .collect();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&global, &partitions)?,
    };
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(env_filter);

    let installed = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true),
            )
            .try_init(),
    };
    installed.map_err(|e| Error::Logging(e.to_string()))?;

    Ok(LogLevelHandle {
        handle: Arc::new(reload_handle),
        state: Arc::new(RwLock::new(LevelState { global, partitions })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("WARNING").unwrap(), "warn");
        assert_eq!(normalize_level("Trace").unwrap(), "trace");
        assert!(normalize_level("loud").is_err());
    }

    #[test]
    fn test_partition_lookup_is_case_insensitive() {
        assert_eq!(find_partition("herder"), Some(("Herder", "lumen_herder")));
        assert_eq!(find_partition("scp").map(|p| p.1), Some("lumen_scp"));
        assert!(find_partition("Bucket").is_none());
    }

    #[test]
    fn test_build_filter_with_overrides() {
        let mut partitions = BTreeMap::new();
        partitions.insert("Herder".to_string(), "trace".to_string());
        let filter = build_filter("info", &partitions).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("lumen_herder=trace"));
    }

    #[test]
    fn test_build_filter_unknown_partition() {
        let mut partitions = BTreeMap::new();
        partitions.insert("Nope".to_string(), "debug".to_string());
        assert!(matches!(
            build_filter("info", &partitions),
            Err(Error::Logging(_))
        ));
    }
}
