//! Environment-driven configuration.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATABASE_URL` | `postgres://localhost/formulary` | Store connection string |
//! | `FORMULARY_MAX_CONNECTIONS` | `10` | Pool size |
//! | `FORMULARY_CONNECT_TIMEOUT_SECS` | `30` | Pool acquire timeout |
//! | `FORMULARY_TOPIC_MAP` | built-in rules | YAML file replacing the topic rules |
//! | `FORMULARY_TOPIC_FALLBACK` | `uncategorized` | `uncategorized` or `ancestor` |
//! | `FORMULARY_MIGRATION_LOCK` | `true` | Advisory lock around migration runs |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::defaults;
use crate::error::{Error, Result};
use crate::topic::{TopicFallback, TopicMap};

/// Runtime configuration for the catalog tools.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub topic_map_path: Option<PathBuf>,
    /// Overrides the fallback declared by the topic map, when set.
    pub topic_fallback: Option<TopicFallback>,
    pub migration_lock: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            max_connections: defaults::POOL_MAX_CONNECTIONS,
            connect_timeout_secs: defaults::POOL_CONNECT_TIMEOUT_SECS,
            topic_map_path: None,
            topic_fallback: None,
            migration_lock: defaults::MIGRATION_LOCK_ENABLED,
        }
    }
}

impl CatalogConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse_var(&get, "FORMULARY_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            connect_timeout_secs: parse_var(&get, "FORMULARY_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.connect_timeout_secs),
            topic_map_path: get("FORMULARY_TOPIC_MAP").map(PathBuf::from),
            topic_fallback: get("FORMULARY_TOPIC_FALLBACK")
                .map(|v| v.parse())
                .transpose()?,
            migration_lock: get("FORMULARY_MIGRATION_LOCK")
                .map(|v| parse_bool("FORMULARY_MIGRATION_LOCK", &v))
                .transpose()?
                .unwrap_or(defaults.migration_lock),
        })
    }

    /// The topic map: the configured file or the built-in rules, with the
    /// fallback override applied.
    pub fn load_topic_map(&self) -> Result<TopicMap> {
        let map = match &self.topic_map_path {
            Some(path) => TopicMap::from_file(path).map_err(|e| {
                Error::Config(format!("topic map {}: {}", path.display(), e))
            })?,
            None => TopicMap::builtin(),
        };
        Ok(match self.topic_fallback {
            Some(fallback) => map.with_fallback(fallback),
            None => map,
        })
    }
}

fn parse_var<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{} has an invalid value '{}'", key, v)))
        })
        .transpose()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<CatalogConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CatalogConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(config(&[]).unwrap(), CatalogConfig::default());
    }

    #[test]
    fn test_reads_overrides() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://db/catalog"),
            ("FORMULARY_MAX_CONNECTIONS", "4"),
            ("FORMULARY_TOPIC_FALLBACK", "ancestor"),
            ("FORMULARY_MIGRATION_LOCK", "off"),
        ])
        .unwrap();
        assert_eq!(cfg.database_url, "postgres://db/catalog");
        assert_eq!(cfg.max_connections, 4);
        assert_eq!(cfg.topic_fallback, Some(TopicFallback::Ancestor));
        assert!(!cfg.migration_lock);
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(config(&[("FORMULARY_MAX_CONNECTIONS", "many")]).is_err());
        assert!(config(&[("FORMULARY_MIGRATION_LOCK", "maybe")]).is_err());
        assert!(config(&[("FORMULARY_TOPIC_FALLBACK", "nearest")]).is_err());
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let cfg = config(&[("DATABASE_URL", "  ")]).unwrap();
        assert_eq!(cfg.database_url, crate::defaults::DATABASE_URL);
    }

    #[test]
    fn test_topic_map_fallback_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topics.yaml");
        std::fs::write(&path, "fallback: ancestor\nrules:\n  optics: optics\n").unwrap();

        let mut cfg = CatalogConfig {
            topic_map_path: Some(path),
            ..Default::default()
        };
        assert_eq!(cfg.load_topic_map().unwrap().fallback(), TopicFallback::Ancestor);

        cfg.topic_fallback = Some(TopicFallback::Uncategorized);
        assert_eq!(
            cfg.load_topic_map().unwrap().fallback(),
            TopicFallback::Uncategorized
        );
    }

    #[test]
    fn test_missing_topic_map_is_a_config_error() {
        let cfg = CatalogConfig {
            topic_map_path: Some(PathBuf::from("/nonexistent/topics.yaml")),
            ..Default::default()
        };
        assert!(matches!(cfg.load_topic_map(), Err(Error::Config(_))));
    }
}
