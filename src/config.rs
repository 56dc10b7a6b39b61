//! Configuration loading and process-wide cached values
//!
//! Configuration comes from a TOML file (`copyvet.toml` by default, path
//! overridable via `COPYVET_CONFIG`) with environment-variable overrides
//! for the secrets, so deployments can keep keys out of the file.
//!
//! Values that are fetched from the wiki at runtime (ignore lists) live
//! behind [`TtlCache`], an explicit read-through cache with a fixed TTL
//! and an explicit invalidation call, rather than implicit globals.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::wikitext::SiteMarkup;

pub const DEFAULT_CONFIG_PATH: &str = "copyvet.toml";

/// TTL for wiki-fetched lists and other derived configuration.
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub meta: MetaConfig,
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,
}

/// External similarity-detection service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SimilarityConfig {
    /// API host, e.g. `example.tii-sandbox.com`.
    pub domain: String,
    #[serde(default)]
    pub key: String,
    /// Public host the service should deliver webhooks to.
    #[serde(default)]
    pub webhook_domain: Option<String>,
    /// Shared secret for webhook HMAC signatures.
    #[serde(default)]
    pub webhook_signing_secret: Option<String>,
    #[serde(default = "default_report_priority")]
    pub report_priority: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Cross-site settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaConfig {
    /// Site hosting the ignore-list pages.
    #[serde(default = "default_meta_domain")]
    pub domain: String,
    #[serde(default)]
    pub url_ignore_list_title: String,
    #[serde(default)]
    pub user_ignore_list_title: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// OAuth bearer token for authenticated wiki writes (triage tagging).
    #[serde(default)]
    pub wiki_oauth_token: Option<String>,
    /// User recorded on remediation rows the service itself closes.
    #[serde(default = "default_status_user")]
    pub status_user: String,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            domain: default_meta_domain(),
            url_ignore_list_title: String::new(),
            user_ignore_list_title: String::new(),
            stream_url: default_stream_url(),
            wiki_oauth_token: None,
            status_user: default_status_user(),
        }
    }
}

/// Per-site settings, keyed by domain in the `[sites."…"]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<i64>,
    #[serde(default)]
    pub triage_namespaces: Vec<i64>,
    #[serde(default = "default_category_namespaces")]
    pub category_namespaces: Vec<String>,
    #[serde(default = "default_file_namespaces")]
    pub file_namespaces: Vec<String>,
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespaces: default_namespaces(),
            triage_namespaces: Vec::new(),
            category_namespaces: default_category_namespaces(),
            file_namespaces: default_file_namespaces(),
            file_extensions: default_file_extensions(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://copyvet.db".to_string()
}

fn default_report_priority() -> String {
    "LOW".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_meta_domain() -> String {
    "meta.wikimedia.org".to_string()
}

fn default_stream_url() -> String {
    "https://stream.wikimedia.org/v2/stream/mediawiki.page_change.v1".to_string()
}

fn default_status_user() -> String {
    "copyvet".to_string()
}

fn default_namespaces() -> Vec<i64> {
    vec![0]
}

fn default_category_namespaces() -> Vec<String> {
    vec!["Category".to_string()]
}

fn default_file_namespaces() -> Vec<String> {
    vec!["File".to_string(), "Image".to_string()]
}

fn default_file_extensions() -> Vec<String> {
    [
        "png", "gif", "jpg", "jpeg", "webp", "svg", "tiff", "tif", "ogg", "ogv", "oga", "mp3",
        "wav", "webm", "pdf", "djvu", "mid", "flac", "xcf", "stl",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Load configuration from `path` (or the default location), applying
    /// environment overrides for the database URL and service secrets.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("COPYVET_CONFIG").ok();
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env_path.map(Into::into))
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;

        if let Ok(url) = std::env::var("COPYVET_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(key) = std::env::var("COPYVET_SIMILARITY_KEY") {
            config.similarity.key = key;
        }
        if let Ok(secret) = std::env::var("COPYVET_WEBHOOK_SECRET") {
            config.similarity.webhook_signing_secret = Some(secret);
        }

        if config.similarity.key.is_empty() {
            return Err(Error::Config(
                "similarity API key not configured; set [similarity] key or COPYVET_SIMILARITY_KEY"
                    .to_string(),
            ));
        }
        if config.enabled_domains().is_empty() {
            return Err(Error::Config("no enabled sites configured".to_string()));
        }

        info!(path = %path.display(), sites = config.enabled_domains().len(), "configuration loaded");
        Ok(config)
    }

    pub fn enabled_domains(&self) -> Vec<&str> {
        self.sites
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(domain, _)| domain.as_str())
            .collect()
    }

    pub fn site(&self, domain: &str) -> Option<&SiteConfig> {
        self.sites.get(domain)
    }

    /// Markup configuration for a site, falling back to the defaults for
    /// domains without an explicit section.
    pub fn site_markup(&self, domain: &str) -> Result<SiteMarkup> {
        let fallback = SiteConfig::default();
        let cfg = self.site(domain).unwrap_or(&fallback);
        SiteMarkup::new(
            &cfg.category_namespaces,
            &cfg.file_namespaces,
            &cfg.file_extensions,
        )
    }
}

/// Read-through cache slot with a fixed TTL.
///
/// `get_with` returns the cached value while it is fresh and otherwise
/// rebuilds it with the supplied loader; `invalidate` forces the next
/// read to reload regardless of age.
pub struct TtlCache<T> {
    ttl: Duration,
    slot: RwLock<Option<(Instant, Arc<T>)>>,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    pub async fn get_with<F, Fut>(&self, load: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let slot = self.slot.read().await;
            if let Some((at, value)) = &*slot {
                if at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }
        }
        // load without holding the lock; concurrent refreshes are
        // harmless, the last one wins
        let value = Arc::new(load().await?);
        let mut slot = self.slot.write().await;
        *slot = Some((Instant::now(), value.clone()));
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
database_url = "sqlite://test.db"

[similarity]
domain = "api.example.com"
key = "secret-key"
webhook_domain = "hooks.example.org"
webhook_signing_secret = "hunter2"

[meta]
url_ignore_list_title = "Project:URL ignore list"

[sites."en.wikipedia.org"]
enabled = true
namespaces = [0, 2]
triage_namespaces = [0]

[sites."de.wikipedia.org"]
enabled = false
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.database_url, "sqlite://test.db");
        assert_eq!(config.similarity.domain, "api.example.com");
        assert_eq!(config.similarity.report_priority, "LOW");
        assert_eq!(config.enabled_domains(), vec!["en.wikipedia.org"]);
        let site = config.site("en.wikipedia.org").unwrap();
        assert_eq!(site.namespaces, vec![0, 2]);
        assert_eq!(site.triage_namespaces, vec![0]);
        assert_eq!(site.category_namespaces, vec!["Category"]);
    }

    #[tokio::test]
    async fn ttl_cache_reloads_after_invalidate() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(3600));
        let first = cache.get_with(|| async { Ok(1) }).await.unwrap();
        assert_eq!(*first, 1);
        // fresh: loader not consulted
        let second = cache.get_with(|| async { Ok(2) }).await.unwrap();
        assert_eq!(*second, 1);
        cache.invalidate().await;
        let third = cache.get_with(|| async { Ok(3) }).await.unwrap();
        assert_eq!(*third, 3);
    }
}
