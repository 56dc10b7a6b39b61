//! Change-event intake: consume the upstream SSE feed, filter events,
//! and queue candidates.
//!
//! The feed is treated as an already-filtered event source in the sense
//! that copyvet never talks back to it; the intake filter here decides
//! which delivered events are worth queueing at all.

use std::collections::HashSet;

use futures::StreamExt;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::queries;
use crate::error::{Error, Result};
use crate::types::{ChangeEvent, Site};

use super::ignore_lists::IgnoreLists;
use super::wiki_client::WikiClient;

/// Revisions smaller than this are skipped at intake; the extractor
/// applies the same floor again to the fetched text.
const MIN_EVENT_SIZE: i64 = 500;

/// Intake filter. An event is queued only when every clause passes.
pub fn accept_event(
    event: &ChangeEvent,
    config: &Config,
    ignored_users: &HashSet<String>,
) -> bool {
    if event.page_change_kind != "create" && event.page_change_kind != "edit" {
        return false;
    }
    if event.revision.rev_size < MIN_EVENT_SIZE {
        return false;
    }
    // unchanged content hash means a null edit or a revert to the prior text
    if event.revision.rev_sha1.is_some() && event.revision.rev_sha1.as_deref() == event.prior_sha1()
    {
        return false;
    }
    let Some(site_config) = config.site(&event.meta.domain) else {
        return false;
    };
    if !site_config.enabled {
        return false;
    }
    if !site_config.namespaces.contains(&event.page.namespace_id) {
        return false;
    }
    let editor = &event.revision.editor;
    if editor.is_bot || editor.is_system || ignored_users.contains(&editor.user_text) {
        return false;
    }
    true
}

/// Consume the change feed and queue accepted events, optionally
/// starting from a past timestamp and stopping after `total` stored
/// candidates.
pub async fn ingest_changes(
    pool: &SqlitePool,
    config: &Config,
    wiki: &WikiClient,
    ignore: &IgnoreLists,
    since: Option<chrono::DateTime<chrono::Utc>>,
    total: Option<u64>,
) -> Result<()> {
    let ignored_users = ignore.users(wiki, config).await?;

    let mut url = config.meta.stream_url.clone();
    if let Some(since) = since {
        url.push_str(&format!("?since={}", since.to_rfc3339()));
    }
    info!(url = %url, "connecting to change stream");
    let response = reqwest::Client::builder()
        .user_agent(concat!("copyvet/", env!("CARGO_PKG_VERSION")))
        .build()?
        .get(&url)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::Service {
            status: response.status().as_u16(),
            body: "change stream refused the connection".to_string(),
        });
    }

    let mut stored: u64 = 0;
    let mut buffer = String::new();
    let mut data_lines: Vec<String> = Vec::new();
    let mut bytes = response.bytes_stream();

    'stream: while let Some(chunk) = bytes.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim_start().to_string());
                continue;
            }
            if !line.is_empty() {
                // id:/event: framing lines carry nothing we use
                continue;
            }
            if data_lines.is_empty() {
                continue;
            }
            let payload = data_lines.join("\n");
            data_lines.clear();

            let event: ChangeEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    debug!(%e, "skipping unparsable stream event");
                    continue;
                }
            };
            if !accept_event(&event, config, &ignored_users) {
                continue;
            }
            if store_event(pool, &event).await {
                stored += 1;
                if let Some(total) = total {
                    if stored >= total {
                        info!(stored, "reached requested total, stopping intake");
                        break 'stream;
                    }
                }
            }
        }
    }
    info!(stored, "change intake finished");
    Ok(())
}

/// Queue one accepted event. Duplicate revisions and malformed titles
/// are logged and skipped, never aborting the stream.
async fn store_event(pool: &SqlitePool, event: &ChangeEvent) -> bool {
    let Some(site) = Site::from_domain(&event.meta.domain) else {
        warn!(domain = %event.meta.domain, "cannot derive site from domain");
        return false;
    };
    match queries::insert_candidate(
        pool,
        &site,
        event.page.namespace_id,
        &event.page.page_title,
        event.revision.rev_id,
        event.revision.rev_parent_id,
        event.revision.rev_dt,
        &event.revision.editor.user_text,
    )
    .await
    {
        Ok(true) => {
            debug!(rev_id = event.revision.rev_id, title = %event.page.page_title, "queued candidate");
            true
        }
        Ok(false) => false,
        Err(e) if e.is_conflict() => {
            warn!(rev_id = event.revision.rev_id, "revision already queued");
            false
        }
        Err(e) => {
            warn!(rev_id = event.revision.rev_id, %e, "failed to queue candidate");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> Config {
        let toml = r#"
[similarity]
domain = "api.example.com"
key = "k"

[sites."en.wikipedia.org"]
enabled = true
namespaces = [0, 118]

[sites."de.wikipedia.org"]
enabled = false
"#;
        toml::from_str(toml).unwrap()
    }

    fn event(overrides: impl FnOnce(&mut serde_json::Value)) -> ChangeEvent {
        let mut value = json!({
            "page_change_kind": "edit",
            "revision": {
                "rev_id": 1089519971,
                "rev_parent_id": 1088665641,
                "rev_dt": "2023-04-01T12:00:00Z",
                "rev_size": 1000,
                "rev_sha1": "aaa111",
                "editor": {
                    "is_bot": false,
                    "is_system": false,
                    "user_text": "Example editor"
                }
            },
            "prior_state": {
                "revision": {"rev_sha1": "bbb222"}
            },
            "page": {"namespace_id": 0, "page_title": "Example_page"},
            "meta": {"domain": "en.wikipedia.org"}
        });
        overrides(&mut value);
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn human_edit_on_enabled_site_is_accepted() {
        let config = test_config();
        assert!(accept_event(&event(|_| {}), &config, &HashSet::new()));
    }

    #[test]
    fn non_edit_kinds_are_rejected() {
        let config = test_config();
        let e = event(|v| v["page_change_kind"] = json!("delete"));
        assert!(!accept_event(&e, &config, &HashSet::new()));
    }

    #[test]
    fn small_revisions_are_rejected() {
        let config = test_config();
        let e = event(|v| v["revision"]["rev_size"] = json!(499));
        assert!(!accept_event(&e, &config, &HashSet::new()));
    }

    #[test]
    fn unchanged_content_hash_is_rejected() {
        let config = test_config();
        let e = event(|v| v["prior_state"]["revision"]["rev_sha1"] = json!("aaa111"));
        assert!(!accept_event(&e, &config, &HashSet::new()));
    }

    #[test]
    fn disabled_or_unknown_domains_are_rejected() {
        let config = test_config();
        let disabled = event(|v| v["meta"]["domain"] = json!("de.wikipedia.org"));
        assert!(!accept_event(&disabled, &config, &HashSet::new()));
        let unknown = event(|v| v["meta"]["domain"] = json!("fr.wikipedia.org"));
        assert!(!accept_event(&unknown, &config, &HashSet::new()));
    }

    #[test]
    fn namespace_outside_site_set_is_rejected() {
        let config = test_config();
        let e = event(|v| v["page"]["namespace_id"] = json!(2));
        assert!(!accept_event(&e, &config, &HashSet::new()));
    }

    #[test]
    fn bots_system_accounts_and_ignored_users_are_rejected() {
        let config = test_config();
        let bot = event(|v| v["revision"]["editor"]["is_bot"] = json!(true));
        assert!(!accept_event(&bot, &config, &HashSet::new()));
        let system = event(|v| v["revision"]["editor"]["is_system"] = json!(true));
        assert!(!accept_event(&system, &config, &HashSet::new()));

        let mut ignored = HashSet::new();
        ignored.insert("Example editor".to_string());
        assert!(!accept_event(&event(|_| {}), &config, &ignored));
    }

    #[test]
    fn new_page_without_prior_state_is_accepted() {
        let config = test_config();
        let e = event(|v| {
            v["page_change_kind"] = json!("create");
            v["revision"]["rev_parent_id"] = json!(0);
            v.as_object_mut().unwrap().remove("prior_state");
        });
        assert!(accept_event(&e, &config, &HashSet::new()));
    }
}
