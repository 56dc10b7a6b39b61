//! URL and user ignore lists, maintained as wiki pages and cached with
//! a one-hour TTL.
//!
//! The URL list is one regex per line, `#` starting a comment; invalid
//! lines are logged and skipped so a bad edit to the page cannot take
//! the service down. The user list is the set of user pages linked from
//! the configured page.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, warn};

use crate::config::{Config, TtlCache, CACHE_TTL};
use crate::error::Result;
use crate::types::Site;

use super::wiki_client::WikiClient;

static USER_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[\s*[Uu]ser\s*:([^\]|#/]+)").expect("valid regex"));

pub struct IgnoreLists {
    urls: TtlCache<Vec<Regex>>,
    users: TtlCache<HashSet<String>>,
}

impl Default for IgnoreLists {
    fn default() -> Self {
        Self::new()
    }
}

impl IgnoreLists {
    pub fn new() -> Self {
        Self {
            urls: TtlCache::new(CACHE_TTL),
            users: TtlCache::new(CACHE_TTL),
        }
    }

    /// URL patterns a source must not match to qualify.
    pub async fn url_patterns(
        &self,
        wiki: &WikiClient,
        config: &Config,
    ) -> Result<Arc<Vec<Regex>>> {
        self.urls
            .get_with(|| load_url_patterns(wiki, config))
            .await
    }

    /// Users whose edits are never queued.
    pub async fn users(&self, wiki: &WikiClient, config: &Config) -> Result<Arc<HashSet<String>>> {
        self.users.get_with(|| load_users(wiki, config)).await
    }

    /// Drop both cached lists so the next read refetches.
    pub async fn refresh(&self) {
        self.urls.invalidate().await;
        self.users.invalidate().await;
    }
}

fn list_site(config: &Config) -> Option<Site> {
    let site = Site::from_domain(&config.meta.domain);
    if site.is_none() {
        warn!(domain = %config.meta.domain, "cannot parse meta domain, ignore lists disabled");
    }
    site
}

async fn load_url_patterns(wiki: &WikiClient, config: &Config) -> Result<Vec<Regex>> {
    let title = &config.meta.url_ignore_list_title;
    if title.is_empty() {
        return Ok(Vec::new());
    }
    let Some(site) = list_site(config) else {
        return Ok(Vec::new());
    };
    let Some(text) = wiki.page_text(&site, title).await? else {
        return Ok(Vec::new());
    };
    Ok(parse_url_patterns(&text))
}

fn parse_url_patterns(text: &str) -> Vec<Regex> {
    let mut patterns = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match Regex::new(&format!("(?i){line}")) {
            Ok(re) => patterns.push(re),
            Err(e) => error!(line, %e, "invalid regex ignored"),
        }
    }
    patterns
}

async fn load_users(wiki: &WikiClient, config: &Config) -> Result<HashSet<String>> {
    let title = &config.meta.user_ignore_list_title;
    if title.is_empty() {
        return Ok(HashSet::new());
    }
    let Some(site) = list_site(config) else {
        return Ok(HashSet::new());
    };
    let Some(text) = wiki.page_text(&site, title).await? else {
        return Ok(HashSet::new());
    };
    Ok(parse_users(&text))
}

fn parse_users(text: &str) -> HashSet<String> {
    USER_LINK_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().trim().replace('_', " ");
            if name.is_empty() {
                None
            } else {
                Some(name)
            }
        })
        .collect()
}
