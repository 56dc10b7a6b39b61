//! Wiki content collaborator: revision lookup and triage tagging over
//! the MediaWiki Action API.
//!
//! Lookups are read-only and anonymous; the optional triage call uses an
//! OAuth bearer token when one is configured.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::Site;

const USER_AGENT: &str = concat!(
    "copyvet/",
    env!("CARGO_PKG_VERSION"),
    " (https://meta.wikimedia.org/wiki/Copyvet)"
);

const REVISION_PROPS: &str = "ids|flags|timestamp|user|size|sha1|contentmodel|comment|tags|roles";

/// One revision as returned by the lookup, with hidden-content flags
/// surfaced explicitly.
#[derive(Debug, Clone)]
pub struct RevisionInfo {
    pub rev_id: i64,
    pub parent_id: i64,
    pub page_id: i64,
    pub ns: i64,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub user: Option<String>,
    pub comment: Option<String>,
    pub comment_hidden: bool,
    pub tags: Vec<String>,
    pub text: Option<String>,
    pub text_hidden: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    query: Option<QueryBody>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    badrevids: Option<Value>,
    #[serde(default)]
    pages: Vec<PageBody>,
}

#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    pageid: i64,
    ns: i64,
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<RevisionBody>,
}

#[derive(Debug, Deserialize)]
struct RevisionBody {
    revid: i64,
    #[serde(default)]
    parentid: i64,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    commenthidden: bool,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    slots: Option<Slots>,
}

#[derive(Debug, Deserialize)]
struct Slots {
    #[serde(default)]
    main: Option<MainSlot>,
}

#[derive(Debug, Deserialize)]
struct MainSlot {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    texthidden: bool,
}

pub struct WikiClient {
    http: reqwest::Client,
    oauth_token: Option<String>,
}

impl WikiClient {
    pub fn new(oauth_token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, oauth_token })
    }

    async fn query(&self, site: &Site, params: &[(&str, String)]) -> Result<String> {
        let mut request = self.http.get(site.api_url()).query(&[
            ("format", "json"),
            ("formatversion", "2"),
        ]);
        request = request.query(params);
        if let Some(token) = &self.oauth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Service {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    /// Load the given revisions with metadata (and content when asked).
    ///
    /// Returns `None` when the API reports any requested id as unknown,
    /// which covers deleted pages and suppressed revisions.
    pub async fn load_revisions(
        &self,
        site: &Site,
        revids: &[i64],
        content: bool,
    ) -> Result<Option<HashMap<i64, RevisionInfo>>> {
        let revids_param = revids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("|");
        let mut props = REVISION_PROPS.to_string();
        if content {
            props.push_str("|content");
        }
        let body = self
            .query(
                site,
                &[
                    ("action", "query".to_string()),
                    ("revids", revids_param),
                    ("prop", "revisions".to_string()),
                    ("rvprop", props),
                    ("rvslots", "main".to_string()),
                ],
            )
            .await?;
        parse_revisions_response(&body)
    }

    /// Up to `limit` most recent revisions of a page, with content.
    pub async fn latest_revisions(
        &self,
        site: &Site,
        title: &str,
        limit: u32,
    ) -> Result<Vec<RevisionInfo>> {
        let body = self
            .query(
                site,
                &[
                    ("action", "query".to_string()),
                    ("titles", title.to_string()),
                    ("prop", "revisions".to_string()),
                    ("rvprop", format!("{REVISION_PROPS}|content")),
                    ("rvslots", "main".to_string()),
                    ("rvlimit", limit.to_string()),
                ],
            )
            .await?;
        let revisions = parse_revisions_response(&body)?
            .map(|map| {
                let mut revisions: Vec<RevisionInfo> = map.into_values().collect();
                revisions.sort_by_key(|r| std::cmp::Reverse(r.rev_id));
                revisions
            })
            .unwrap_or_default();
        Ok(revisions)
    }

    /// Whether a title resolves to an existing, regular page.
    pub async fn page_exists(&self, site: &Site, title: &str) -> Result<bool> {
        let body = self
            .query(
                site,
                &[
                    ("action", "query".to_string()),
                    ("titles", title.to_string()),
                ],
            )
            .await?;
        let parsed: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Protocol(format!("page lookup: {e}")))?;
        let Some(query) = parsed.query else {
            return Ok(false);
        };
        Ok(query
            .pages
            .first()
            .map(|page| !page.missing && !page.invalid && page.ns >= 0)
            .unwrap_or(false))
    }

    /// Tag a revision for the wiki's triage queue. Requires the triage
    /// extension and an authorized token; failures are the caller's to
    /// log, the signal is optional.
    pub async fn tag_for_triage(&self, site: &Site, page_id: i64, rev_id: i64) -> Result<()> {
        let body = self
            .query(
                site,
                &[
                    ("action", "pagetriagelist".to_string()),
                    ("page_id", page_id.to_string()),
                ],
            )
            .await?;
        let list: Value = serde_json::from_str(&body)
            .map_err(|e| Error::Protocol(format!("pagetriagelist: {e}")))?;
        let missing_metadata = list
            .pointer("/pagetriagelist/pages_missing_metadata")
            .and_then(Value::as_array)
            .map(|pages| pages.iter().any(|p| p.as_i64() == Some(page_id)))
            .unwrap_or(false);
        if missing_metadata {
            debug!(page_id, "page not in triage queue, skipping tag");
            return Ok(());
        }

        let token = self.csrf_token(site).await?;
        let mut request = self.http.post(site.api_url()).form(&[
            ("action", "pagetriagetagcopyvio".to_string()),
            ("revid", rev_id.to_string()),
            ("token", token),
            ("format", "json".to_string()),
            ("formatversion", "2".to_string()),
        ]);
        if let Some(oauth) = &self.oauth_token {
            request = request.bearer_auth(oauth);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Service {
                status: status.as_u16(),
                body,
            });
        }
        let result: Value =
            serde_json::from_str(&body).map_err(|e| Error::Protocol(format!("triage tag: {e}")))?;
        if let Some(error) = result.get("error") {
            warn!(rev_id, %error, "triage tagging rejected");
            return Err(Error::Protocol(format!("triage tag rejected: {error}")));
        }
        debug!(rev_id, "revision added to triage queue");
        Ok(())
    }

    /// Raw text of a page's latest revision, `None` when the page does
    /// not exist or its text is hidden.
    pub async fn page_text(&self, site: &Site, title: &str) -> Result<Option<String>> {
        let revisions = self.latest_revisions(site, title, 1).await?;
        Ok(revisions.into_iter().next().and_then(|r| r.text))
    }

    async fn csrf_token(&self, site: &Site) -> Result<String> {
        let body = self
            .query(
                site,
                &[
                    ("action", "query".to_string()),
                    ("meta", "tokens".to_string()),
                    ("type", "csrf".to_string()),
                ],
            )
            .await?;
        let value: Value =
            serde_json::from_str(&body).map_err(|e| Error::Protocol(format!("token query: {e}")))?;
        value
            .pointer("/query/tokens/csrftoken")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("no csrf token in response".to_string()))
    }
}

/// Parse a revisions query response into a map keyed by revision id.
/// `badrevids` in the response means at least one requested revision is
/// gone, which invalidates the whole lookup.
fn parse_revisions_response(body: &str) -> Result<Option<HashMap<i64, RevisionInfo>>> {
    let parsed: ApiResponse =
        serde_json::from_str(body).map_err(|e| Error::Protocol(format!("revision query: {e}")))?;
    if let Some(error) = parsed.error {
        return Err(Error::Protocol(format!("revision query error: {error}")));
    }
    let Some(query) = parsed.query else {
        return Ok(Some(HashMap::new()));
    };
    if query.badrevids.is_some() {
        return Ok(None);
    }

    let mut revisions = HashMap::new();
    for page in query.pages {
        if page.missing || page.invalid {
            return Ok(None);
        }
        for rev in page.revisions {
            let (text, text_hidden) = match rev.slots.and_then(|s| s.main) {
                Some(main) => (main.content, main.texthidden),
                None => (None, false),
            };
            revisions.insert(
                rev.revid,
                RevisionInfo {
                    rev_id: rev.revid,
                    parent_id: rev.parentid,
                    page_id: page.pageid,
                    ns: page.ns,
                    title: page.title.clone(),
                    timestamp: rev.timestamp,
                    user: rev.user,
                    comment: rev.comment,
                    comment_hidden: rev.commenthidden,
                    tags: rev.tags,
                    text,
                    text_hidden,
                },
            );
        }
    }
    Ok(Some(revisions))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "batchcomplete": true,
        "query": {
            "pages": [
                {
                    "pageid": 123,
                    "ns": 0,
                    "title": "Example",
                    "revisions": [
                        {
                            "revid": 1089519971,
                            "parentid": 1088665641,
                            "timestamp": "2023-04-01T12:00:00Z",
                            "user": "Example editor",
                            "comment": "expanded the lead",
                            "tags": ["mobile edit"],
                            "slots": {
                                "main": {
                                    "contentmodel": "wikitext",
                                    "content": "Some article text."
                                }
                            }
                        },
                        {
                            "revid": 1088665641,
                            "parentid": 1088000000,
                            "timestamp": "2023-03-20T08:30:00Z",
                            "tags": [],
                            "slots": {
                                "main": {
                                    "texthidden": true
                                }
                            }
                        }
                    ]
                }
            ]
        }
    }"#;

    #[test]
    fn parses_revisions_with_hidden_flags() {
        let revisions = parse_revisions_response(SAMPLE).unwrap().unwrap();
        assert_eq!(revisions.len(), 2);

        let visible = &revisions[&1089519971];
        assert_eq!(visible.page_id, 123);
        assert_eq!(visible.title, "Example");
        assert_eq!(visible.text.as_deref(), Some("Some article text."));
        assert!(!visible.text_hidden);
        assert_eq!(visible.comment.as_deref(), Some("expanded the lead"));
        assert_eq!(visible.tags, vec!["mobile edit"]);

        let hidden = &revisions[&1088665641];
        assert!(hidden.text_hidden);
        assert_eq!(hidden.text, None);
        assert_eq!(hidden.user, None);
    }

    #[test]
    fn bad_revids_invalidate_the_lookup() {
        let body = r#"{"query": {"badrevids": {"999": {"revid": 999}}, "pages": []}}"#;
        assert!(parse_revisions_response(body).unwrap().is_none());
    }

    #[test]
    fn missing_page_invalidates_the_lookup() {
        let body = r#"{"query": {"pages": [{"ns": 0, "title": "Gone", "missing": true}]}}"#;
        assert!(parse_revisions_response(body).unwrap().is_none());
    }

    #[test]
    fn malformed_body_is_a_protocol_error() {
        assert!(parse_revisions_response("not json").is_err());
    }
}
