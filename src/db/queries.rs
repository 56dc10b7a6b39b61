//! Queries and state transitions over the candidate queue and the
//! confirmed-match tables
//!
//! Every mutating query refreshes `status_timestamp`, and every
//! transition is a single statement (or a single transaction for
//! promotion) committed on its own, so a crash between transitions
//! leaves the row in the last durable state for the next run to resume.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::Site;

use super::models::{ConfirmedMatch, QueuedCandidate, Source, Status};

const CANDIDATE_COLUMNS: &str = "id, project, lang, page_ns, page_title, rev_id, rev_parent_id, \
     rev_timestamp, rev_user_text, submission_id, status, status_timestamp";

const MATCH_COLUMNS: &str = "id, submission_id, project, lang, page_ns, page_title, rev_id, \
     rev_parent_id, rev_timestamp, rev_user_text, status, status_timestamp, status_user_text";

/// Direction of the `status_timestamp` comparison in status-scoped
/// selections. `AtOrBefore` selects rows stale enough for a sweep;
/// `AtOrAfter` selects recently touched rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeCmp {
    AtOrBefore,
    AtOrAfter,
}

fn status_list(statuses: &[Status]) -> String {
    statuses
        .iter()
        .map(|s| s.as_i64().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Queue a revision for evaluation. Returns `false` without inserting
/// when a confirmed match already covers the revision. A duplicate queue
/// row surfaces as a unique-violation error for the caller to log.
pub async fn insert_candidate(
    pool: &SqlitePool,
    site: &Site,
    page_ns: i64,
    page_title: &str,
    rev_id: i64,
    rev_parent_id: i64,
    rev_timestamp: DateTime<Utc>,
    rev_user_text: &str,
) -> Result<bool> {
    let confirmed: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM confirmed_matches WHERE project = ? AND lang = ? AND rev_id = ?)",
    )
    .bind(&site.project)
    .bind(&site.lang)
    .bind(rev_id)
    .fetch_one(pool)
    .await?;
    if confirmed {
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO queued_candidates
            (project, lang, page_ns, page_title, rev_id, rev_parent_id,
             rev_timestamp, rev_user_text, status, status_timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&site.project)
    .bind(&site.lang)
    .bind(page_ns)
    .bind(page_title)
    .bind(rev_id)
    .bind(rev_parent_id)
    .bind(rev_timestamp)
    .bind(rev_user_text)
    .bind(Status::Unsubmitted.as_i64())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(true)
}

/// Queued candidates in any of `statuses`, most recent revision first.
/// With a cutoff, only rows whose `status_timestamp` satisfies the
/// comparison are returned; the boundary itself is included either way.
pub async fn candidates_by_status(
    pool: &SqlitePool,
    statuses: &[Status],
    cutoff: Option<DateTime<Utc>>,
    cmp: TimeCmp,
    limit: Option<i64>,
) -> Result<Vec<QueuedCandidate>> {
    let mut sql = format!(
        "SELECT {CANDIDATE_COLUMNS} FROM queued_candidates WHERE status IN ({})",
        status_list(statuses)
    );
    if cutoff.is_some() {
        sql.push_str(match cmp {
            TimeCmp::AtOrBefore => " AND status_timestamp <= ?",
            TimeCmp::AtOrAfter => " AND status_timestamp >= ?",
        });
    }
    sql.push_str(" ORDER BY rev_timestamp DESC");
    if limit.is_some() {
        sql.push_str(" LIMIT ?");
    }

    let mut query = sqlx::query_as::<_, QueuedCandidate>(&sql);
    if let Some(cutoff) = cutoff {
        query = query.bind(cutoff);
    }
    if let Some(limit) = limit {
        query = query.bind(limit);
    }
    Ok(query.fetch_all(pool).await?)
}

/// Confirmed matches in any of `statuses`, most recent revision first.
pub async fn matches_by_status(
    pool: &SqlitePool,
    statuses: &[Status],
    cutoff: Option<DateTime<Utc>>,
    cmp: TimeCmp,
    limit: Option<i64>,
) -> Result<Vec<ConfirmedMatch>> {
    let mut sql = format!(
        "SELECT {MATCH_COLUMNS} FROM confirmed_matches WHERE status IN ({})",
        status_list(statuses)
    );
    if cutoff.is_some() {
        sql.push_str(match cmp {
            TimeCmp::AtOrBefore => " AND status_timestamp <= ?",
            TimeCmp::AtOrAfter => " AND status_timestamp >= ?",
        });
    }
    sql.push_str(" ORDER BY rev_timestamp DESC");
    if limit.is_some() {
        sql.push_str(" LIMIT ?");
    }

    let mut query = sqlx::query_as::<_, ConfirmedMatch>(&sql);
    if let Some(cutoff) = cutoff {
        query = query.bind(cutoff);
    }
    if let Some(limit) = limit {
        query = query.bind(limit);
    }
    Ok(query.fetch_all(pool).await?)
}

pub async fn candidate_by_submission_id(
    pool: &SqlitePool,
    submission_id: Uuid,
) -> Result<Option<QueuedCandidate>> {
    let sql =
        format!("SELECT {CANDIDATE_COLUMNS} FROM queued_candidates WHERE submission_id = ?");
    Ok(sqlx::query_as::<_, QueuedCandidate>(&sql)
        .bind(submission_id)
        .fetch_optional(pool)
        .await?)
}

/// Record the external submission id assigned to a candidate.
pub async fn set_submission_created(
    pool: &SqlitePool,
    id: i64,
    submission_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE queued_candidates SET submission_id = ?, status = ?, status_timestamp = ? WHERE id = ?",
    )
    .bind(submission_id)
    .bind(Status::Created.as_i64())
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_status(pool: &SqlitePool, id: i64, status: Status) -> Result<()> {
    sqlx::query("UPDATE queued_candidates SET status = ?, status_timestamp = ? WHERE id = ?")
        .bind(status.as_i64())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Send a candidate back to the start of the pipeline, dropping its
/// submission id so the next batch run creates a fresh submission.
pub async fn reset_unsubmitted(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE queued_candidates SET submission_id = NULL, status = ?, status_timestamp = ? WHERE id = ?",
    )
    .bind(Status::Unsubmitted.as_i64())
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_candidate(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM queued_candidates WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_candidate_page(
    pool: &SqlitePool,
    id: i64,
    page_ns: i64,
    page_title: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE queued_candidates SET page_ns = ?, page_title = ?, status_timestamp = ? WHERE id = ?",
    )
    .bind(page_ns)
    .bind(page_title)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Promotion: materialize a confirmed match from a queued candidate and
/// its filtered sources, deleting the candidate, all in one transaction.
/// The unique constraint on `submission_id` makes a second concurrent
/// promotion of the same submission fail the insert and roll back.
pub async fn promote(
    pool: &SqlitePool,
    candidate: &QueuedCandidate,
    sources: &[Source],
) -> Result<()> {
    let submission_id = candidate
        .submission_id
        .ok_or_else(|| Error::Protocol("promotion of a candidate without submission id".into()))?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO confirmed_matches
            (submission_id, project, lang, page_ns, page_title, rev_id,
             rev_parent_id, rev_timestamp, rev_user_text, status, status_timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(submission_id)
    .bind(&candidate.project)
    .bind(&candidate.lang)
    .bind(candidate.page_ns)
    .bind(&candidate.page_title)
    .bind(candidate.rev_id)
    .bind(candidate.rev_parent_id)
    .bind(candidate.rev_timestamp)
    .bind(&candidate.rev_user_text)
    .bind(Status::Ready.as_i64())
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    for source in sources {
        sqlx::query(
            "INSERT INTO match_sources (submission_id, description, url, percent) VALUES (?, ?, ?, ?)",
        )
        .bind(submission_id)
        .bind(&source.description)
        .bind(&source.url)
        .bind(source.percent)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("DELETE FROM queued_candidates WHERE id = ?")
        .bind(candidate.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn sources_for_match(pool: &SqlitePool, submission_id: Uuid) -> Result<Vec<Source>> {
    Ok(sqlx::query_as::<_, Source>(
        "SELECT description, url, percent FROM match_sources WHERE submission_id = ? ORDER BY id",
    )
    .bind(submission_id)
    .fetch_all(pool)
    .await?)
}

pub async fn update_match_page(
    pool: &SqlitePool,
    id: i64,
    page_ns: i64,
    page_title: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE confirmed_matches SET page_ns = ?, page_title = ?, status_timestamp = ? WHERE id = ?",
    )
    .bind(page_ns)
    .bind(page_title)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Close a remediation row whose page no longer exists.
pub async fn mark_match_fixed(pool: &SqlitePool, id: i64, acting_user: &str) -> Result<()> {
    sqlx::query(
        "UPDATE confirmed_matches SET status = ?, status_user_text = ?, status_timestamp = ? WHERE id = ?",
    )
    .bind(Status::Fixed.as_i64())
    .bind(acting_user)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Aggregate used by the health endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusWindow {
    pub length: i64,
    pub newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
}

pub async fn queue_stats(pool: &SqlitePool) -> Result<StatusWindow> {
    let (length, newest, oldest) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
        "SELECT COUNT(*), MAX(status_timestamp), MIN(status_timestamp) FROM queued_candidates",
    )
    .fetch_one(pool)
    .await?;
    Ok(StatusWindow {
        length,
        newest,
        oldest,
    })
}

pub async fn ready_stats(pool: &SqlitePool) -> Result<StatusWindow> {
    let (length, newest, oldest) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
        "SELECT COUNT(*), MAX(status_timestamp), MIN(status_timestamp) FROM confirmed_matches WHERE status = ?",
    )
    .bind(Status::Ready.as_i64())
    .fetch_one(pool)
    .await?;
    Ok(StatusWindow {
        length,
        newest,
        oldest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        create_schema(&pool).await.expect("schema");
        pool
    }

    fn test_site() -> Site {
        Site::new("en", "wikipedia")
    }

    async fn seed(pool: &SqlitePool, rev_id: i64, rev_timestamp: DateTime<Utc>) -> QueuedCandidate {
        insert_candidate(
            pool,
            &test_site(),
            0,
            "Test_page",
            rev_id,
            rev_id - 1,
            rev_timestamp,
            "Example editor",
        )
        .await
        .unwrap();
        candidates_by_status(pool, &[Status::Unsubmitted], None, TimeCmp::AtOrBefore, None)
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.rev_id == rev_id)
            .expect("inserted candidate")
    }

    async fn force_status_timestamp(pool: &SqlitePool, id: i64, at: DateTime<Utc>) {
        sqlx::query("UPDATE queued_candidates SET status_timestamp = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ingested_candidate_starts_unsubmitted() {
        let pool = memory_pool().await;
        let candidate = seed(&pool, 1000, Utc::now()).await;
        assert_eq!(candidate.status, Status::Unsubmitted);
        assert_eq!(candidate.submission_id, None);
        assert_eq!(candidate.project, "wikipedia");
        assert_eq!(candidate.lang, "en");
    }

    #[tokio::test]
    async fn duplicate_revision_is_a_conflict() {
        let pool = memory_pool().await;
        let now = Utc::now();
        seed(&pool, 1000, now).await;
        let err = insert_candidate(&pool, &test_site(), 0, "Test_page", 1000, 999, now, "B")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn selection_orders_newest_revision_first_and_honors_limit() {
        let pool = memory_pool().await;
        let base = Utc::now();
        seed(&pool, 1, base - Duration::hours(2)).await;
        seed(&pool, 2, base - Duration::hours(1)).await;
        seed(&pool, 3, base).await;

        let all = candidates_by_status(&pool, &[Status::Unsubmitted], None, TimeCmp::AtOrBefore, None)
            .await
            .unwrap();
        let ids: Vec<i64> = all.iter().map(|c| c.rev_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let capped =
            candidates_by_status(&pool, &[Status::Unsubmitted], None, TimeCmp::AtOrBefore, Some(2))
                .await
                .unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].rev_id, 3);
    }

    #[tokio::test]
    async fn status_scope_and_timestamp_boundary() {
        let pool = memory_pool().await;
        let now = Utc::now();
        let stale = seed(&pool, 10, now).await;
        let fresh = seed(&pool, 11, now).await;
        set_status(&pool, stale.id, Status::Uploaded).await.unwrap();
        set_status(&pool, fresh.id, Status::Uploaded).await.unwrap();

        let cutoff = now - Duration::minutes(30);
        force_status_timestamp(&pool, stale.id, cutoff).await;
        force_status_timestamp(&pool, fresh.id, now).await;

        // boundary timestamp is included under <=
        let swept =
            candidates_by_status(&pool, &[Status::Uploaded], Some(cutoff), TimeCmp::AtOrBefore, None)
                .await
                .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].rev_id, 10);

        // a status outside the requested set is never returned
        let none =
            candidates_by_status(&pool, &[Status::Pending], Some(now), TimeCmp::AtOrBefore, None)
                .await
                .unwrap();
        assert!(none.is_empty());

        let recent =
            candidates_by_status(&pool, &[Status::Uploaded], Some(cutoff), TimeCmp::AtOrAfter, None)
                .await
                .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn submission_id_lookup_follows_creation() {
        let pool = memory_pool().await;
        let candidate = seed(&pool, 500, Utc::now()).await;
        let sid = Uuid::new_v4();
        assert!(candidate_by_submission_id(&pool, sid).await.unwrap().is_none());

        set_submission_created(&pool, candidate.id, sid).await.unwrap();
        let found = candidate_by_submission_id(&pool, sid).await.unwrap().unwrap();
        assert_eq!(found.id, candidate.id);
        assert_eq!(found.status, Status::Created);
        assert_eq!(found.submission_id, Some(sid));
    }

    #[tokio::test]
    async fn reset_clears_submission_id() {
        let pool = memory_pool().await;
        let candidate = seed(&pool, 600, Utc::now()).await;
        let sid = Uuid::new_v4();
        set_submission_created(&pool, candidate.id, sid).await.unwrap();
        set_status(&pool, candidate.id, Status::Uploaded).await.unwrap();

        reset_unsubmitted(&pool, candidate.id).await.unwrap();
        let rows =
            candidates_by_status(&pool, &[Status::Unsubmitted], None, TimeCmp::AtOrBefore, None)
                .await
                .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].submission_id, None);
    }

    #[tokio::test]
    async fn promotion_moves_candidate_and_sources() {
        let pool = memory_pool().await;
        let candidate = seed(&pool, 700, Utc::now()).await;
        let sid = Uuid::new_v4();
        set_submission_created(&pool, candidate.id, sid).await.unwrap();
        let candidate = candidate_by_submission_id(&pool, sid).await.unwrap().unwrap();

        let sources = vec![Source {
            description: "Somewhere on the web".to_string(),
            url: Some("https://example.com/article".to_string()),
            percent: 75.0,
        }];
        promote(&pool, &candidate, &sources).await.unwrap();

        assert!(candidate_by_submission_id(&pool, sid).await.unwrap().is_none());
        let ready = matches_by_status(&pool, &[Status::Ready], None, TimeCmp::AtOrBefore, None)
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].submission_id, sid);
        assert_eq!(sources_for_match(&pool, sid).await.unwrap(), sources);
    }

    #[tokio::test]
    async fn second_promotion_of_same_submission_fails() {
        let pool = memory_pool().await;
        let candidate = seed(&pool, 800, Utc::now()).await;
        let sid = Uuid::new_v4();
        set_submission_created(&pool, candidate.id, sid).await.unwrap();
        let candidate = candidate_by_submission_id(&pool, sid).await.unwrap().unwrap();

        promote(&pool, &candidate, &[]).await.unwrap();
        // a concurrent invocation still holding the stale row loses
        let err = promote(&pool, &candidate, &[]).await.unwrap_err();
        assert!(err.is_conflict());
        let ready = matches_by_status(&pool, &[Status::Ready], None, TimeCmp::AtOrBefore, None)
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
    }

    #[tokio::test]
    async fn confirmed_revision_is_not_requeued() {
        let pool = memory_pool().await;
        let candidate = seed(&pool, 900, Utc::now()).await;
        let sid = Uuid::new_v4();
        set_submission_created(&pool, candidate.id, sid).await.unwrap();
        let candidate = candidate_by_submission_id(&pool, sid).await.unwrap().unwrap();
        promote(&pool, &candidate, &[]).await.unwrap();

        let inserted = insert_candidate(
            &pool,
            &test_site(),
            0,
            "Test_page",
            900,
            899,
            Utc::now(),
            "Example editor",
        )
        .await
        .unwrap();
        assert!(!inserted);
    }

    #[tokio::test]
    async fn stats_report_window_or_null() {
        let pool = memory_pool().await;
        let empty = queue_stats(&pool).await.unwrap();
        assert_eq!(empty.length, 0);
        assert_eq!(empty.newest, None);
        assert_eq!(empty.oldest, None);

        seed(&pool, 42, Utc::now()).await;
        let stats = queue_stats(&pool).await.unwrap();
        assert_eq!(stats.length, 1);
        assert!(stats.newest.is_some());
        assert!(stats.oldest.is_some());

        let ready = ready_stats(&pool).await.unwrap();
        assert_eq!(ready.length, 0);
    }

    #[tokio::test]
    async fn fixed_match_leaves_ready_scope() {
        let pool = memory_pool().await;
        let candidate = seed(&pool, 950, Utc::now()).await;
        let sid = Uuid::new_v4();
        set_submission_created(&pool, candidate.id, sid).await.unwrap();
        let candidate = candidate_by_submission_id(&pool, sid).await.unwrap().unwrap();
        promote(&pool, &candidate, &[]).await.unwrap();

        let ready = matches_by_status(&pool, &[Status::Ready], None, TimeCmp::AtOrBefore, None)
            .await
            .unwrap();
        mark_match_fixed(&pool, ready[0].id, "copyvet").await.unwrap();

        assert!(matches_by_status(&pool, &[Status::Ready], None, TimeCmp::AtOrBefore, None)
            .await
            .unwrap()
            .is_empty());
        let fixed = matches_by_status(&pool, &[Status::Fixed], None, TimeCmp::AtOrBefore, None)
            .await
            .unwrap();
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].status_user_text.as_deref(), Some("copyvet"));
    }
}
