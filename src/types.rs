//! Shared value types: site identity and change-event payloads

use serde::{Deserialize, Serialize};

/// Identity of a wiki site, stored as (project, language) and derived
/// from / rendered to a domain name.
///
/// The domain form is `<lang>.<project>.org`; sites like
/// `meta.wikimedia.org` parse the same way with `lang = "meta"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Site {
    pub project: String,
    pub lang: String,
}

impl Site {
    pub fn new(lang: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            lang: lang.into(),
        }
    }

    /// Parse a `<lang>.<project>.org` domain.
    pub fn from_domain(domain: &str) -> Option<Self> {
        let mut parts = domain.split('.');
        let lang = parts.next()?;
        let project = parts.next()?;
        match (parts.next(), parts.next()) {
            (Some("org"), None) if !lang.is_empty() && !project.is_empty() => {
                Some(Self::new(lang, project))
            }
            _ => None,
        }
    }

    pub fn domain(&self) -> String {
        format!("{}.{}.org", self.lang, self.project)
    }

    /// MediaWiki Action API endpoint for this site.
    pub fn api_url(&self) -> String {
        format!("https://{}/w/api.php", self.domain())
    }
}

/// One event from the upstream change feed, in the shape the feed
/// delivers it. Only the fields the intake filter looks at are modeled.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    pub page_change_kind: String,
    pub revision: RevisionEvent,
    #[serde(default)]
    pub prior_state: Option<PriorState>,
    pub page: PageEvent,
    pub meta: MetaEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevisionEvent {
    pub rev_id: i64,
    #[serde(default)]
    pub rev_parent_id: i64,
    pub rev_dt: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub rev_size: i64,
    #[serde(default)]
    pub rev_sha1: Option<String>,
    pub editor: EditorEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditorEvent {
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub is_system: bool,
    pub user_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageEvent {
    pub namespace_id: i64,
    pub page_title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaEvent {
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorState {
    #[serde(default)]
    pub revision: Option<PriorRevision>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorRevision {
    #[serde(default)]
    pub rev_sha1: Option<String>,
}

impl ChangeEvent {
    /// Content hash of the revision this event replaced, when known.
    pub fn prior_sha1(&self) -> Option<&str> {
        self.prior_state
            .as_ref()
            .and_then(|s| s.revision.as_ref())
            .and_then(|r| r.rev_sha1.as_deref())
    }
}

/// Strip a namespace prefix from an API-reported full title.
///
/// The API returns titles like `Talk:Foo`; stored titles carry only the
/// local part. Main-namespace titles may legitimately contain colons, so
/// the prefix is only removed for non-zero namespaces.
pub fn strip_namespace(title: &str, ns: i64) -> String {
    if ns != 0 {
        if let Some((_, rest)) = title.split_once(':') {
            return rest.to_string();
        }
    }
    title.to_string()
}

/// Render a stored underscore title in display form.
pub fn title_with_spaces(title: &str) -> String {
    title.replace('_', " ")
}

/// Render a display title in stored (underscore) form.
pub fn title_with_underscores(title: &str) -> String {
    title.replace(' ', "_")
}
