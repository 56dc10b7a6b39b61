//! External similarity-detection service client
//!
//! Wraps the service's REST API with a persistent session: bearer-token
//! auth, a descriptive client identity, bounded exponential-backoff
//! retry on 429/500, and terms-of-service recovery: a 451 response
//! triggers acceptance of the latest terms version followed by exactly
//! one retransmission of the original request.

use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SimilarityConfig;
use crate::db::Source;
use crate::error::{Error, Result};
use crate::types::Site;

pub const WEBHOOK_EVENT_TYPES: [&str; 2] = ["SUBMISSION_COMPLETE", "SIMILARITY_COMPLETE"];
pub const WEBHOOK_PATH: &str = "/tca-webhook";

const WEBHOOK_DESCRIPTION: &str = "copyvet backend webhook";
const USER_AGENT: &str = concat!("copyvet-backend-bot/", env!("CARGO_PKG_VERSION"));
const SYSTEM_USER: &str = ":system:";

/// Corpora every report searches.
const SEARCH_REPOSITORIES: [&str; 5] = [
    "INTERNET",
    "SUBMITTED_WORK",
    "PUBLICATION",
    "CROSSREF",
    "CROSSREF_POSTED_CONTENT",
];

/// State of an external submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionInfo {
    pub id: Uuid,
    pub status: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// State of a similarity report.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportInfo {
    pub submission_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub top_source_largest_matched_word_count: i64,
}

pub struct SimilarityClient {
    http: reqwest::Client,
    base_url: String,
    report_priority: String,
    webhook_domain: Option<String>,
    webhook_signing_secret: Option<String>,
    max_retries: u32,
}

impl SimilarityClient {
    pub fn new(config: &SimilarityConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.key))
            .map_err(|e| Error::Config(format!("invalid API key: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            "X-Integration-Name",
            HeaderValue::from_static("copyvet backend"),
        );
        headers.insert(
            "X-Integration-Version",
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("https://{}/api/v1", config.domain),
            report_priority: config.report_priority.clone(),
            webhook_domain: config.webhook_domain.clone(),
            webhook_signing_secret: config.webhook_signing_secret.clone(),
            max_retries: config.max_retries,
        })
    }

    /// Send a request with transport-level retry; when `recover_terms`
    /// is set, a 451 answer accepts the latest terms and retransmits
    /// once.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        recover_terms: bool,
    ) -> Result<reqwest::Response> {
        let mut attempt: u32 = 0;
        let mut terms_accepted = !recover_terms;
        loop {
            let this_try = request
                .try_clone()
                .ok_or_else(|| Error::Protocol("request body is not replayable".to_string()))?;
            let response = this_try.send().await?;
            let status = response.status().as_u16();

            if (status == 429 || status == 500) && attempt < self.max_retries {
                let delay = Duration::from_secs(1 << attempt.min(5));
                debug!(status, attempt, ?delay, "retrying similarity request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            if status == 451 && !terms_accepted {
                let version = Box::pin(self.latest_eula_version()).await?;
                Box::pin(self.accept_eula(&version)).await?;
                terms_accepted = true;
                continue;
            }
            return Ok(response);
        }
    }

    /// Read a JSON body, turning any non-success status into a
    /// `Service` error with the body preserved for the logs.
    async fn read_json(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), body = %body, "similarity service error");
            return Err(Error::Service {
                status: status.as_u16(),
                body,
            });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| Error::Protocol(format!("invalid JSON: {e}")))
    }

    pub async fn latest_eula_version(&self) -> Result<String> {
        let request = self
            .http
            .get(format!("{}/eula/latest", self.base_url))
            .query(&[("lang", "en-US")]);
        let data = self.read_json(self.execute(request, false).await?).await?;
        data.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("eula response without version".to_string()))
    }

    pub async fn accept_eula(&self, version: &str) -> Result<()> {
        info!(version, "accepting terms of service");
        let request = self
            .http
            .post(format!("{}/eula/{version}/accept", self.base_url))
            .json(&json!({
                "version": version,
                "user_id": SYSTEM_USER,
                "accepted_timestamp": Utc::now().to_rfc3339(),
                "language": "en-US",
            }));
        self.read_json(self.execute(request, false).await?).await?;
        Ok(())
    }

    pub async fn create_webhook(&self) -> Result<()> {
        let domain = self
            .webhook_domain
            .as_deref()
            .ok_or_else(|| Error::Config("webhook domain not configured".to_string()))?;
        let secret = self
            .webhook_signing_secret
            .as_deref()
            .ok_or_else(|| Error::Config("webhook signing secret not configured".to_string()))?;
        info!("creating webhook");
        let request = self
            .http
            .post(format!("{}/webhooks", self.base_url))
            .json(&json!({
                "description": WEBHOOK_DESCRIPTION,
                "signing_secret": base64::engine::general_purpose::STANDARD.encode(secret),
                "url": format!("https://{domain}{WEBHOOK_PATH}"),
                "event_types": WEBHOOK_EVENT_TYPES,
            }));
        let data = self.read_json(self.execute(request, true).await?).await?;
        info!(webhook = %data, "webhook created");
        Ok(())
    }

    /// Delete every webhook this service registered earlier, matched by
    /// description. Idempotent: deleting nothing is fine.
    pub async fn delete_webhooks(&self) -> Result<()> {
        let request = self.http.get(format!("{}/webhooks", self.base_url));
        let data = self.read_json(self.execute(request, true).await?).await?;
        let webhooks = data.as_array().cloned().unwrap_or_default();
        for webhook in webhooks {
            if webhook.get("description").and_then(Value::as_str) != Some(WEBHOOK_DESCRIPTION) {
                continue;
            }
            let Some(id) = webhook.get("id").and_then(Value::as_str) else {
                continue;
            };
            info!(id, "deleting webhook");
            let request = self.http.delete(format!("{}/webhooks/{id}", self.base_url));
            self.read_json(self.execute(request, true).await?).await?;
        }
        Ok(())
    }

    /// Register a submission for a revision; returns the opaque id the
    /// service assigned.
    pub async fn create_submission(
        &self,
        site: &Site,
        title: &str,
        timestamp: DateTime<Utc>,
        owner: &str,
    ) -> Result<Uuid> {
        debug!(title, "creating submission");
        let group = site.domain();
        let request = self
            .http
            .post(format!("{}/submissions", self.base_url))
            .json(&json!({
                "owner": owner,
                "title": title,
                "submitter": SYSTEM_USER,
                "metadata": {
                    "group": {
                        "id": group,
                        "name": group,
                        "type": "FOLDER",
                    },
                    "original_submitted_time": timestamp.to_rfc3339(),
                },
                "owner_default_permission_set": "USER",
                "submitter_default_permission_set": "ADMINISTRATOR",
            }));
        let data = self.read_json(self.execute(request, true).await?).await?;
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::Protocol("submission response without id".to_string()))?;
        debug!(submission_id = %id, "submission created");
        Ok(id)
    }

    /// Upload the candidate text. A 409/CONFLICT answer means a previous
    /// run already uploaded it, which counts as success.
    pub async fn upload_submission(&self, submission_id: Uuid, text: &str) -> Result<()> {
        debug!(submission_id = %submission_id, "uploading submission text");
        let request = self
            .http
            .put(format!(
                "{}/submissions/{submission_id}/original",
                self.base_url
            ))
            .header("Content-Type", "binary/octet-stream")
            .header(
                "Content-Disposition",
                format!("inline; filename='{submission_id}.txt'"),
            )
            .body(text.as_bytes().to_vec());
        let response = self.execute(request, true).await?;
        if response.status().as_u16() == 409 {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            if body.get("code").and_then(Value::as_str) == Some("CONFLICT") {
                debug!(submission_id = %submission_id, "text was already uploaded");
                return Ok(());
            }
            return Err(Error::Service {
                status: 409,
                body: body.to_string(),
            });
        }
        self.read_json(response).await?;
        debug!(submission_id = %submission_id, "upload successful");
        Ok(())
    }

    pub async fn submission_info(&self, submission_id: Uuid) -> Result<SubmissionInfo> {
        let request = self
            .http
            .get(format!("{}/submissions/{submission_id}", self.base_url));
        let data = self.read_json(self.execute(request, true).await?).await?;
        let info: SubmissionInfo = serde_json::from_value(data)
            .map_err(|e| Error::Protocol(format!("submission info: {e}")))?;
        if info.id != submission_id {
            return Err(Error::Protocol(format!(
                "submission info for {} answered {}",
                submission_id, info.id
            )));
        }
        Ok(info)
    }

    /// Ask the service to generate a similarity report over the fixed
    /// search scope.
    pub async fn generate_report(&self, submission_id: Uuid) -> Result<()> {
        debug!(submission_id = %submission_id, "requesting report generation");
        let request = self
            .http
            .put(format!(
                "{}/submissions/{submission_id}/similarity",
                self.base_url
            ))
            .json(&json!({
                "generation_settings": {
                    "search_repositories": SEARCH_REPOSITORIES,
                    "priority": self.report_priority,
                },
            }));
        self.read_json(self.execute(request, true).await?).await?;
        Ok(())
    }

    pub async fn report_info(&self, submission_id: Uuid) -> Result<ReportInfo> {
        let request = self.http.get(format!(
            "{}/submissions/{submission_id}/similarity",
            self.base_url
        ));
        let data = self.read_json(self.execute(request, true).await?).await?;
        let info: ReportInfo =
            serde_json::from_value(data).map_err(|e| Error::Protocol(format!("report info: {e}")))?;
        if info.submission_id != submission_id {
            return Err(Error::Protocol(format!(
                "report info for {} answered {}",
                submission_id, info.submission_id
            )));
        }
        Ok(info)
    }

    /// Sources of a finished report: one per match aggregate, taking its
    /// first listed source.
    pub async fn report_sources(&self, submission_id: Uuid) -> Result<Vec<Source>> {
        let request = self.http.get(format!(
            "{}/submissions/{submission_id}/similarity/view/overview",
            self.base_url
        ));
        let data = self.read_json(self.execute(request, true).await?).await?;
        parse_report_sources(&data)
    }
}

fn parse_report_sources(data: &Value) -> Result<Vec<Source>> {
    let aggregates = data
        .get("match_aggregates")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Protocol("overview without match_aggregates".to_string()))?;
    let mut sources = Vec::with_capacity(aggregates.len());
    for aggregate in aggregates {
        let Some(first) = aggregate
            .get("match_sources")
            .and_then(Value::as_array)
            .and_then(|s| s.first())
        else {
            continue;
        };
        let description = first
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let url = first
            .get("link")
            .and_then(Value::as_str)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        let percent = first.get("percent").and_then(Value::as_f64).unwrap_or(0.0);
        sources.push(Source {
            description,
            url,
            percent,
        });
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overview_takes_first_source_per_aggregate() {
        let data = json!({
            "submission_id": "0191d7ab-0000-7000-8000-000000000000",
            "match_aggregates": [
                {
                    "match_sources": [
                        {"description": "Example site", "link": "https://example.com/a", "percent": 75.0},
                        {"description": "Mirror", "link": "https://mirror.example/a", "percent": 74.0}
                    ]
                },
                {
                    "match_sources": [
                        {"description": "Archived copy", "link": "", "percent": 52.5}
                    ]
                },
                {
                    "match_sources": []
                }
            ]
        });
        let sources = parse_report_sources(&data).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].description, "Example site");
        assert_eq!(sources[0].url.as_deref(), Some("https://example.com/a"));
        assert_eq!(sources[0].percent, 75.0);
        // empty link becomes a missing URL
        assert_eq!(sources[1].url, None);
    }

    #[test]
    fn overview_without_aggregates_is_malformed() {
        assert!(parse_report_sources(&json!({"submission_id": "x"})).is_err());
    }

    #[test]
    fn webhook_event_types_are_fixed() {
        assert_eq!(
            WEBHOOK_EVENT_TYPES,
            ["SUBMISSION_COMPLETE", "SIMILARITY_COMPLETE"]
        );
    }
}
