//! Configuration for Cellar caches, backends and sessions.
//!
//! Constants live on unit structs; per-cache settings are carried by
//! [`BackendConfig`], which can be deserialized from JSON or parsed from a flat
//! option mapping such as `cache.type = sqlite`.

use crate::error::{CellarError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Backend-level defaults.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const BACKEND_TYPE: &'static str = "memory";
    pub const DOCUMENTS_TABLE: &'static str = "cellar_documents";
    pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

    // Advisory locks
    pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
    pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
    pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
}

/// Session defaults.
pub struct SessionDefaults;

impl SessionDefaults {
    pub const COOKIE_NAME: &'static str = "cellar.session.id";
    pub const ID_HEADER: &'static str = "x-cellar-session";
    pub const NAMESPACE_PREFIX: &'static str = "session:";
    pub const DOCUMENT_KEY: &'static str = "session";
    pub const ID_BYTES: usize = 16;
}

/// Configuration of one backend plus the cache-level expiration default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend selector (`sqlite`, `document`, `memory`, or a registered tag).
    #[serde(rename = "type", default = "default_backend_type")]
    pub kind: String,
    /// Connection string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Data directory for file-based backends. Accepted and ignored by the
    /// document store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Lock directory for file-based backends. Accepted and ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,
    /// Entry lifetime in seconds; `None` means entries never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,
    /// Backend-specific options, forwarded verbatim.
    #[serde(flatten)]
    pub extras: BTreeMap<String, String>,
}

fn default_backend_type() -> String {
    CacheDefaults::BACKEND_TYPE.to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(CacheDefaults::BACKEND_TYPE)
    }
}

impl BackendConfig {
    /// Create a configuration for the given backend type.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            url: None,
            data_dir: None,
            lock_dir: None,
            expire: None,
            extras: BTreeMap::new(),
        }
    }

    /// Shorthand for a SQLite document store at `url`.
    pub fn sqlite(url: impl Into<String>) -> Self {
        Self::new("sqlite").with_url(url)
    }

    /// Shorthand for the in-process memory store.
    pub fn memory() -> Self {
        Self::new("memory")
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_expire(mut self, seconds: u64) -> Self {
        self.expire = Some(seconds);
        self
    }

    /// Builder form of [`BackendConfig::try_set_option`].
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        self.try_set_option(&name.into(), value.into())?;
        Ok(self)
    }

    /// Set a single option by name, routing known names to their fields.
    ///
    /// `expire` accepts whole seconds; anything else is an error. Unknown
    /// names land in the extras and are validated by the code that reads them.
    pub fn try_set_option(&mut self, name: &str, value: String) -> Result<()> {
        match name {
            "type" => self.kind = value,
            "url" => self.url = Some(value),
            "data_dir" => self.data_dir = Some(PathBuf::from(value)),
            "lock_dir" => self.lock_dir = Some(PathBuf::from(value)),
            "expire" => {
                let seconds = value.trim().parse::<u64>().map_err(|_| {
                    CellarError::config(format!("expire must be whole seconds, got '{}'", value))
                })?;
                self.expire = Some(seconds);
            }
            _ => {
                self.extras.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    /// Parse `<prefix>.<option>` entries out of a flat mapping.
    ///
    /// Keys without the prefix are ignored, as are region-scoped keys
    /// (`<prefix>.<region>.<option>`) and the `regions` list itself.
    pub fn from_options<I, K, V>(prefix: &str, options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();
        let scoped = format!("{}.", prefix);

        for (key, value) in options {
            let Some(name) = key.as_ref().strip_prefix(&scoped) else {
                continue;
            };
            if name == "regions" || name.contains('.') {
                continue;
            }
            config.try_set_option(name, value.into())?;
        }

        Ok(config)
    }

    /// Expiration as a duration.
    pub fn expire_duration(&self) -> Option<Duration> {
        self.expire.map(Duration::from_secs)
    }

    /// Look up a backend-specific option.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.extras.get(name).map(String::as_str)
    }

    /// Look up a backend-specific numeric option, failing on malformed values.
    pub fn option_u64(&self, name: &str) -> Result<Option<u64>> {
        match self.option(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
                CellarError::config(format!(
                    "option '{}' must be an unsigned integer, got '{}'",
                    name, raw
                ))
            }),
        }
    }

    /// Stale threshold for advisory locks (`lock_stale_after`, seconds).
    pub fn lock_stale_after(&self) -> Result<Duration> {
        Ok(self
            .option_u64("lock_stale_after")?
            .map(Duration::from_secs)
            .unwrap_or(CacheDefaults::LOCK_STALE_AFTER))
    }

    /// Key identifying the store this configuration connects to.
    ///
    /// Caches with different names or expirations on the same store share one
    /// backend instance through this key.
    pub fn store_key(&self) -> String {
        let extras: Vec<String> = self
            .extras
            .iter()
            .filter(|(name, _)| name.as_str() != "lock_stale_after")
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        format!(
            "{}|{}|{}",
            self.kind.to_ascii_lowercase(),
            self.url.as_deref().unwrap_or_default(),
            extras.join("&")
        )
    }

    /// Fully normalized key including cache-level settings.
    pub fn normalized_key(&self) -> String {
        let extras: Vec<String> = self
            .extras
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.kind.to_ascii_lowercase(),
            self.url.as_deref().unwrap_or_default(),
            self.data_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.lock_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.expire.map(|e| e.to_string()).unwrap_or_default(),
            extras.join("&")
        )
    }
}

/// Parse named cache regions from a flat option mapping.
///
/// `<prefix>.regions` lists region names separated by commas. Each region starts
/// from the base `<prefix>.<option>` settings and overrides them with
/// `<prefix>.<region>.<option>` entries.
pub fn parse_regions<K, V>(
    prefix: &str,
    options: &[(K, V)],
) -> Result<HashMap<String, BackendConfig>>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let base = BackendConfig::from_options(
        prefix,
        options
            .iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref().to_string())),
    )?;

    let regions_key = format!("{}.regions", prefix);
    let names: Vec<String> = options
        .iter()
        .find(|(k, _)| k.as_ref() == regions_key)
        .map(|(_, v)| {
            v.as_ref()
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut regions = HashMap::new();
    for name in names {
        let mut config = base.clone();
        let scoped = format!("{}.{}.", prefix, name);
        for (key, value) in options {
            if let Some(option) = key.as_ref().strip_prefix(&scoped) {
                config.try_set_option(option, value.as_ref().to_string())?;
            }
        }
        regions.insert(name, config);
    }

    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_options_routes_known_and_extra_options() {
        let options = vec![
            ("cache.type", "sqlite"),
            ("cache.url", "sqlite:///tmp/cellar.db"),
            ("cache.data_dir", "./cache"),
            ("cache.expire", "86400"),
            ("cache.busy_timeout_ms", "250"),
            ("session.type", "memory"),
        ];
        let config = BackendConfig::from_options("cache", options).unwrap();

        assert_eq!(config.kind, "sqlite");
        assert_eq!(config.url.as_deref(), Some("sqlite:///tmp/cellar.db"));
        assert_eq!(config.data_dir, Some(PathBuf::from("./cache")));
        assert_eq!(config.expire, Some(86400));
        assert_eq!(config.option("busy_timeout_ms"), Some("250"));
        assert_eq!(config.option_u64("busy_timeout_ms").unwrap(), Some(250));
    }

    #[test]
    fn test_bad_expire_is_rejected() {
        let err = BackendConfig::from_options("cache", vec![("cache.expire", "soon")]).unwrap_err();
        assert!(matches!(err, CellarError::InvalidBackendConfiguration { .. }));
    }

    #[test]
    fn test_bad_numeric_extra_is_rejected() {
        let config = BackendConfig::memory()
            .with_option("lock_stale_after", "never")
            .unwrap();
        assert!(config.lock_stale_after().is_err());
    }

    #[test]
    fn test_builder_rejects_bad_expire() {
        let err = BackendConfig::memory().with_option("expire", "soon").unwrap_err();
        assert!(matches!(err, CellarError::InvalidBackendConfiguration { .. }));

        let config = BackendConfig::memory().with_option("expire", " 90 ").unwrap();
        assert_eq!(config.expire, Some(90));
    }

    #[test]
    fn test_deserialize_flattens_extras() {
        let config: BackendConfig = serde_json::from_str(
            r#"{"type": "sqlite", "url": "cellar.db", "expire": 60, "table": "docs"}"#,
        )
        .unwrap();
        assert_eq!(config.kind, "sqlite");
        assert_eq!(config.expire_duration(), Some(Duration::from_secs(60)));
        assert_eq!(config.option("table"), Some("docs"));
    }

    #[test]
    fn test_store_key_ignores_cache_level_settings() {
        let short = BackendConfig::sqlite("a.db").with_expire(10);
        let long = BackendConfig::sqlite("a.db")
            .with_expire(3600)
            .with_data_dir("./cache");
        assert_eq!(short.store_key(), long.store_key());
        assert_ne!(short.normalized_key(), long.normalized_key());
    }

    #[test]
    fn test_parse_regions_inherits_base_options() {
        let options = vec![
            ("cache.type", "memory"),
            ("cache.expire", "60"),
            ("cache.regions", "short, long"),
            ("cache.long.expire", "3600"),
            ("cache.long.type", "sqlite"),
            ("cache.long.url", "long.db"),
        ];
        let regions = parse_regions("cache", &options).unwrap();

        assert_eq!(regions.len(), 2);
        assert_eq!(regions["short"].kind, "memory");
        assert_eq!(regions["short"].expire, Some(60));
        assert_eq!(regions["long"].kind, "sqlite");
        assert_eq!(regions["long"].expire, Some(3600));
        assert_eq!(regions["long"].url.as_deref(), Some("long.db"));
    }
}
