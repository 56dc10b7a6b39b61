//! Reconciler: advance or terminate queued candidates on signals from
//! the external service, whether delivered by webhook or collected by a
//! poll sweep.
//!
//! Every transition is decided by a pure function over (current status,
//! event payload) and applied with its own commit, guarded by an
//! explicit pre-state check at the webhook entry point. Either trigger
//! can therefore fire any number of times, in any interleaving, without
//! corrupting a candidate: re-running a transition the row already took
//! is a no-op, and the unique constraints backstop duplicate promotion.

use std::sync::Arc;

use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{queries, QueuedCandidate, Source, Status, TimeCmp};
use crate::error::Result;
use crate::types::{strip_namespace, title_with_underscores};

use super::ignore_lists::IgnoreLists;
use super::similarity_client::{ReportInfo, SimilarityClient, SubmissionInfo};
use super::wiki_client::WikiClient;

/// How old a candidate must be before a poll sweep reconsiders it,
/// giving webhook delivery priority.
pub fn staleness_delta() -> Duration {
    Duration::minutes(30)
}

/// What a submission-complete signal means for a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionAction {
    /// Processing finished: request report generation.
    RequestReport,
    /// Recoverable failure: retry from scratch as a new submission.
    RetryAsNew,
    /// Unrecoverable failure: drop the candidate.
    Abandon,
    /// Still processing (or an unrecognized status): leave the row alone.
    Wait,
}

/// Pure transition decision for a submission-complete signal.
pub fn submission_transition(info: &SubmissionInfo) -> SubmissionAction {
    match info.status.as_str() {
        "COMPLETE" => SubmissionAction::RequestReport,
        "ERROR" => {
            if info.error_code.as_deref() == Some("PROCESSING_ERROR") {
                SubmissionAction::RetryAsNew
            } else {
                SubmissionAction::Abandon
            }
        }
        _ => SubmissionAction::Wait,
    }
}

/// Keep the sources that justify promotion: above the match floor, and
/// not pointing at an ignored URL.
pub fn qualifying_sources(sources: Vec<Source>, ignore: &[Regex]) -> Vec<Source> {
    sources
        .into_iter()
        .filter(|source| source.percent > 50.0)
        .filter(|source| match &source.url {
            None => true,
            Some(url) => !ignore.iter().any(|re| re.is_match(url)),
        })
        .collect()
}

pub struct Reconciler {
    pool: SqlitePool,
    config: Arc<Config>,
    similarity: Arc<SimilarityClient>,
    wiki: Arc<WikiClient>,
    ignore: Arc<IgnoreLists>,
}

impl Reconciler {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        similarity: Arc<SimilarityClient>,
        wiki: Arc<WikiClient>,
        ignore: Arc<IgnoreLists>,
    ) -> Self {
        Self {
            pool,
            config,
            similarity,
            wiki,
            ignore,
        }
    }

    /// Entry point for authenticated webhook deliveries. Unknown
    /// submissions and rows already past the event's pre-state are
    /// silent no-ops.
    pub async fn dispatch_webhook(&self, event_type: &str, payload: Value) {
        let submission_id = payload
            .get("submission_id")
            .and_then(Value::as_str)
            .or_else(|| payload.get("id").and_then(Value::as_str))
            .and_then(|s| Uuid::parse_str(s).ok());
        let Some(submission_id) = submission_id else {
            debug!("webhook payload without a submission id");
            return;
        };

        let candidate = match queries::candidate_by_submission_id(&self.pool, submission_id).await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                debug!(submission_id = %submission_id, "no queued candidate for webhook");
                return;
            }
            Err(e) => {
                warn!(submission_id = %submission_id, %e, "webhook candidate lookup failed");
                return;
            }
        };

        match event_type {
            "SUBMISSION_COMPLETE" => {
                if candidate.status > Status::Uploaded {
                    debug!(submission_id = %submission_id, status = ?candidate.status, "already past upload, ignoring replay");
                    return;
                }
                match serde_json::from_value::<SubmissionInfo>(payload) {
                    Ok(info) => {
                        if let Err(e) = self.on_submission_event(&candidate, &info).await {
                            warn!(submission_id = %submission_id, %e, "submission event handling failed");
                        }
                    }
                    Err(e) => debug!(%e, "unparsable submission-complete payload"),
                }
            }
            "SIMILARITY_COMPLETE" => {
                if candidate.status > Status::Pending {
                    debug!(submission_id = %submission_id, status = ?candidate.status, "already past pending, ignoring replay");
                    return;
                }
                match serde_json::from_value::<ReportInfo>(payload) {
                    Ok(info) => {
                        if let Err(e) = self.on_similarity_event(&candidate, &info).await {
                            warn!(submission_id = %submission_id, %e, "similarity event handling failed");
                        }
                    }
                    Err(e) => debug!(%e, "unparsable similarity-complete payload"),
                }
            }
            other => debug!(event_type = other, "unknown webhook event type"),
        }
    }

    /// Apply a submission-complete signal to a candidate.
    pub async fn on_submission_event(
        &self,
        candidate: &QueuedCandidate,
        info: &SubmissionInfo,
    ) -> Result<()> {
        match submission_transition(info) {
            SubmissionAction::RequestReport => {
                let Some(submission_id) = candidate.submission_id else {
                    warn!(id = candidate.id, "submission signal for a candidate without submission id");
                    return Ok(());
                };
                match self.similarity.generate_report(submission_id).await {
                    Ok(()) => queries::set_status(&self.pool, candidate.id, Status::Pending).await?,
                    // leave the row Uploaded; the next sweep retries
                    Err(e) => warn!(submission_id = %submission_id, %e, "report generation failed"),
                }
            }
            SubmissionAction::RetryAsNew => {
                info!(id = candidate.id, "submission hit a processing error, retrying as new");
                queries::reset_unsubmitted(&self.pool, candidate.id).await?;
            }
            SubmissionAction::Abandon => {
                error!(
                    id = candidate.id,
                    error_code = info.error_code.as_deref().unwrap_or("unknown"),
                    "submission failed unrecoverably"
                );
                queries::delete_candidate(&self.pool, candidate.id).await?;
            }
            SubmissionAction::Wait => {
                if info.status != "PROCESSING" {
                    error!(status = %info.status, "unhandled submission status");
                }
            }
        }
        Ok(())
    }

    /// Apply a similarity-complete signal: promote on qualifying
    /// matches, otherwise drop the candidate.
    pub async fn on_similarity_event(
        &self,
        candidate: &QueuedCandidate,
        info: &ReportInfo,
    ) -> Result<()> {
        if info.status != "COMPLETE" {
            return Ok(());
        }
        if info.top_source_largest_matched_word_count == 0 {
            debug!(id = candidate.id, "report found no matched words");
            return queries::delete_candidate(&self.pool, candidate.id).await;
        }
        let Some(submission_id) = candidate.submission_id else {
            warn!(id = candidate.id, "similarity signal for a candidate without submission id");
            return Ok(());
        };

        let sources = match self.similarity.report_sources(submission_id).await {
            Ok(sources) => sources,
            Err(e) => {
                // leave the row Pending; the next sweep retries
                warn!(submission_id = %submission_id, %e, "fetching report sources failed");
                return Ok(());
            }
        };
        let ignore = self.ignore.url_patterns(&self.wiki, &self.config).await?;
        let qualifying = qualifying_sources(sources, &ignore);

        if !qualifying.is_empty() {
            if let Some((page_id, page_ns, page_title)) =
                self.refresh_candidate_page(candidate).await?
            {
                let mut promoted = candidate.clone();
                promoted.page_ns = page_ns;
                promoted.page_title = page_title;
                queries::promote(&self.pool, &promoted, &qualifying).await?;
                info!(
                    submission_id = %submission_id,
                    rev_id = candidate.rev_id,
                    sources = qualifying.len(),
                    "candidate promoted to confirmed match"
                );
                self.send_triage_signal(&promoted, page_id).await;
                return Ok(());
            }
            debug!(id = candidate.id, "page no longer locatable, dropping");
        } else {
            debug!(id = candidate.id, "no qualifying sources");
        }
        queries::delete_candidate(&self.pool, candidate.id).await
    }

    /// Notify the wiki's triage queue when the promoted page falls in a
    /// namespace configured for it. Best effort: failures are logged.
    async fn send_triage_signal(&self, candidate: &QueuedCandidate, page_id: i64) {
        let site = candidate.site();
        let in_triage_scope = self
            .config
            .site(&site.domain())
            .map(|cfg| cfg.triage_namespaces.contains(&candidate.page_ns))
            .unwrap_or(false);
        if !in_triage_scope {
            return;
        }
        if let Err(e) = self
            .wiki
            .tag_for_triage(&site, page_id, candidate.rev_id)
            .await
        {
            warn!(rev_id = candidate.rev_id, %e, "triage signal failed");
        }
    }

    /// Re-resolve the candidate's page from its stored revision id,
    /// persisting the current namespace/title. `None` when the page or
    /// revision is gone.
    async fn refresh_candidate_page(
        &self,
        candidate: &QueuedCandidate,
    ) -> Result<Option<(i64, i64, String)>> {
        let site = candidate.site();
        let Some(revisions) = self
            .wiki
            .load_revisions(&site, &[candidate.rev_id], false)
            .await?
        else {
            return Ok(None);
        };
        let Some(rev) = revisions.get(&candidate.rev_id) else {
            return Ok(None);
        };
        let title = title_with_underscores(&strip_namespace(&rev.title, rev.ns));
        queries::update_candidate_page(&self.pool, candidate.id, rev.ns, &title).await?;
        Ok(Some((rev.page_id, rev.ns, title)))
    }

    /// Poll sweep: reconcile stale pending reports, then stale uploaded
    /// submissions. Per-item failures are logged and skipped.
    pub async fn reconcile_reports(&self) -> Result<()> {
        let cutoff = Utc::now() - staleness_delta();

        for candidate in queries::candidates_by_status(
            &self.pool,
            &[Status::Pending],
            Some(cutoff),
            TimeCmp::AtOrBefore,
            None,
        )
        .await?
        {
            let Some(submission_id) = candidate.submission_id else {
                continue;
            };
            match self.similarity.report_info(submission_id).await {
                Ok(info) => {
                    if let Err(e) = self.on_similarity_event(&candidate, &info).await {
                        warn!(submission_id = %submission_id, %e, "report reconciliation failed");
                    }
                }
                Err(e) => warn!(submission_id = %submission_id, %e, "report info fetch failed"),
            }
        }

        for candidate in queries::candidates_by_status(
            &self.pool,
            &[Status::Uploaded],
            Some(cutoff),
            TimeCmp::AtOrBefore,
            None,
        )
        .await?
        {
            let Some(submission_id) = candidate.submission_id else {
                continue;
            };
            match self.similarity.submission_info(submission_id).await {
                Ok(info) => {
                    if let Err(e) = self.on_submission_event(&candidate, &info).await {
                        warn!(submission_id = %submission_id, %e, "submission reconciliation failed");
                    }
                }
                Err(e) => warn!(submission_id = %submission_id, %e, "submission info fetch failed"),
            }
        }
        Ok(())
    }

    /// Maintenance sweep over promoted matches: re-resolve the page
    /// location for rows at least `older_than` stale; vanished pages are
    /// closed as fixed, moved pages get their stored location refreshed.
    pub async fn refresh_remediation(&self, older_than: Duration) -> Result<()> {
        let cutoff = Utc::now() - older_than;
        for confirmed in queries::matches_by_status(
            &self.pool,
            &[Status::Ready],
            Some(cutoff),
            TimeCmp::AtOrBefore,
            None,
        )
        .await?
        {
            let site = confirmed.site();
            match self.wiki.load_revisions(&site, &[confirmed.rev_id], false).await {
                Ok(None) => {
                    info!(rev_id = confirmed.rev_id, "page gone, closing remediation row");
                    queries::mark_match_fixed(
                        &self.pool,
                        confirmed.id,
                        &self.config.meta.status_user,
                    )
                    .await?;
                }
                Ok(Some(revisions)) => {
                    let Some(rev) = revisions.get(&confirmed.rev_id) else {
                        continue;
                    };
                    let title = title_with_underscores(&strip_namespace(&rev.title, rev.ns));
                    queries::update_match_page(&self.pool, confirmed.id, rev.ns, &title).await?;
                }
                Err(e) => warn!(rev_id = confirmed.rev_id, %e, "location refresh failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: &str, error_code: Option<&str>) -> SubmissionInfo {
        SubmissionInfo {
            id: Uuid::new_v4(),
            status: status.to_string(),
            error_code: error_code.map(str::to_string),
        }
    }

    #[test]
    fn complete_submission_requests_a_report() {
        assert_eq!(
            submission_transition(&info("COMPLETE", None)),
            SubmissionAction::RequestReport
        );
    }

    #[test]
    fn processing_error_retries_as_new_submission() {
        assert_eq!(
            submission_transition(&info("ERROR", Some("PROCESSING_ERROR"))),
            SubmissionAction::RetryAsNew
        );
    }

    #[test]
    fn other_errors_abandon_the_candidate() {
        assert_eq!(
            submission_transition(&info("ERROR", Some("UNSUPPORTED_FILETYPE"))),
            SubmissionAction::Abandon
        );
        assert_eq!(
            submission_transition(&info("ERROR", None)),
            SubmissionAction::Abandon
        );
    }

    #[test]
    fn processing_and_unknown_statuses_wait() {
        assert_eq!(
            submission_transition(&info("PROCESSING", None)),
            SubmissionAction::Wait
        );
        assert_eq!(
            submission_transition(&info("SOMETHING_NEW", None)),
            SubmissionAction::Wait
        );
    }

    fn source(percent: f64, url: Option<&str>) -> Source {
        Source {
            description: "a source".to_string(),
            url: url.map(str::to_string),
            percent,
        }
    }

    #[test]
    fn sources_qualify_above_fifty_percent() {
        let sources = vec![source(75.0, Some("https://example.com/x")), source(50.0, None)];
        let kept = qualifying_sources(sources, &[]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].percent, 75.0);
    }

    #[test]
    fn ignored_urls_disqualify_a_source() {
        let ignore = vec![Regex::new(r"(?i)example\.com").unwrap()];
        let sources = vec![
            source(80.0, Some("https://example.com/mirror")),
            source(80.0, Some("https://independent.org/page")),
            source(80.0, None),
        ];
        let kept = qualifying_sources(sources, &ignore);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].url.as_deref(), Some("https://independent.org/page"));
        assert_eq!(kept[1].url, None);
    }
}
