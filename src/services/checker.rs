//! Batch driver: extract added text for queued candidates and walk them
//! through the create/upload transitions.
//!
//! Extraction fans out over a bounded pool and results are consumed in
//! completion order; the external-service transitions then run
//! sequentially in this task, committing after every successful call so
//! a crash mid-batch loses nothing already paid for. A failing item is
//! logged and skipped; the next invocation picks it up again.

use std::sync::Arc;

use futures::StreamExt;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{queries, QueuedCandidate, Status, TimeCmp};
use crate::error::Result;
use crate::wikitext::check_diff;

use super::similarity_client::SimilarityClient;
use super::wiki_client::WikiClient;

/// Default worker-pool size: one extraction per host core.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn submission_title(candidate: &QueuedCandidate) -> String {
    format!("Revision {} of {}", candidate.rev_id, candidate.page_name())
}

/// Run one batch over candidates still in the submission half of the
/// pipeline ({unsubmitted, created}), newest revision first.
pub async fn check_changes(
    pool: &SqlitePool,
    config: Arc<Config>,
    wiki: Arc<WikiClient>,
    similarity: &SimilarityClient,
    pool_size: usize,
    limit: Option<i64>,
) -> Result<()> {
    let candidates = queries::candidates_by_status(
        pool,
        &[Status::Unsubmitted, Status::Created],
        None,
        TimeCmp::AtOrBefore,
        limit,
    )
    .await?;
    if candidates.is_empty() {
        return Ok(());
    }
    info!(count = candidates.len(), pool_size, "checking queued candidates");

    let jobs = candidates.into_iter().map(|candidate| {
        let wiki = wiki.clone();
        let config = config.clone();
        async move {
            let extracted = extract_added_text(&wiki, &config, &candidate).await;
            (candidate, extracted)
        }
    });
    let mut completed = futures::stream::iter(jobs).buffer_unordered(pool_size.max(1));

    while let Some((candidate, extracted)) = completed.next().await {
        let text = match extracted {
            Ok(Some(text)) => text,
            Ok(None) => {
                // nothing worth checking in this revision
                if let Err(e) = queries::delete_candidate(pool, candidate.id).await {
                    warn!(rev_id = candidate.rev_id, %e, "failed to drop candidate");
                } else {
                    debug!(rev_id = candidate.rev_id, "no added text, candidate dropped");
                }
                continue;
            }
            Err(e) => {
                warn!(rev_id = candidate.rev_id, %e, "extraction failed, will retry next run");
                continue;
            }
        };

        let submission_id = match candidate.submission_id {
            Some(existing) => existing,
            None => {
                let title = submission_title(&candidate);
                match similarity
                    .create_submission(
                        &candidate.site(),
                        &title,
                        candidate.rev_timestamp,
                        &candidate.rev_user_text,
                    )
                    .await
                {
                    Ok(submission_id) => {
                        if let Err(e) =
                            queries::set_submission_created(pool, candidate.id, submission_id).await
                        {
                            warn!(rev_id = candidate.rev_id, %e, "failed to record submission id");
                            continue;
                        }
                        submission_id
                    }
                    Err(e) => {
                        warn!(rev_id = candidate.rev_id, %e, "submission creation failed");
                        continue;
                    }
                }
            }
        };

        match similarity.upload_submission(submission_id, &text).await {
            Ok(()) => {
                if let Err(e) = queries::set_status(pool, candidate.id, Status::Uploaded).await {
                    warn!(rev_id = candidate.rev_id, %e, "failed to record upload");
                } else {
                    debug!(rev_id = candidate.rev_id, submission_id = %submission_id, "candidate uploaded");
                }
            }
            Err(e) => warn!(rev_id = candidate.rev_id, %e, "upload failed"),
        }
    }
    Ok(())
}

async fn extract_added_text(
    wiki: &WikiClient,
    config: &Config,
    candidate: &QueuedCandidate,
) -> Result<Option<String>> {
    let site = candidate.site();
    let markup = config.site_markup(&site.domain())?;
    check_diff(wiki, &markup, &site, candidate.rev_parent_id, candidate.rev_id).await
}
