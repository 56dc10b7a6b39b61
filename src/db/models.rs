//! Row models and the candidate status domain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Site;

/// Lifecycle status, a single ordered integer domain.
///
/// Negative values form the submission pipeline, zero and above the
/// post-promotion remediation phase. The ordering is load-bearing: it is
/// how dispatch detects "this row already advanced past the event" and
/// how the poll sweeps scope their selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    Unknown = -99,
    Unsubmitted = -4,
    Created = -3,
    Uploaded = -2,
    Pending = -1,
    Ready = 0,
    Fixed = 1,
    NoAction = 2,
}

impl Status {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for Status {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            -99 => Status::Unknown,
            -4 => Status::Unsubmitted,
            -3 => Status::Created,
            -2 => Status::Uploaded,
            -1 => Status::Pending,
            0 => Status::Ready,
            1 => Status::Fixed,
            2 => Status::NoAction,
            other => return Err(format!("unknown status value {other}")),
        })
    }
}

/// A revision queued for similarity evaluation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedCandidate {
    pub id: i64,
    pub project: String,
    pub lang: String,
    pub page_ns: i64,
    pub page_title: String,
    pub rev_id: i64,
    pub rev_parent_id: i64,
    pub rev_timestamp: DateTime<Utc>,
    pub rev_user_text: String,
    pub submission_id: Option<Uuid>,
    #[sqlx(try_from = "i64")]
    pub status: Status,
    pub status_timestamp: DateTime<Utc>,
}

/// A revision with confirmed qualifying similarity, awaiting human
/// remediation by downstream tooling.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfirmedMatch {
    pub id: i64,
    pub submission_id: Uuid,
    pub project: String,
    pub lang: String,
    pub page_ns: i64,
    pub page_title: String,
    pub rev_id: i64,
    pub rev_parent_id: i64,
    pub rev_timestamp: DateTime<Utc>,
    pub rev_user_text: String,
    #[sqlx(try_from = "i64")]
    pub status: Status,
    pub status_timestamp: DateTime<Utc>,
    pub status_user_text: Option<String>,
}

/// One external match record attached to a confirmed match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    pub description: String,
    pub url: Option<String>,
    pub percent: f64,
}

impl QueuedCandidate {
    /// Site identity derived from the stored fields; no I/O.
    pub fn site(&self) -> Site {
        Site::new(self.lang.clone(), self.project.clone())
    }

    /// Display form of the stored title.
    pub fn page_name(&self) -> String {
        crate::types::title_with_spaces(&self.page_title)
    }
}

impl ConfirmedMatch {
    pub fn site(&self) -> Site {
        Site::new(self.lang.clone(), self.project.clone())
    }

    pub fn page_name(&self) -> String {
        crate::types::title_with_spaces(&self.page_title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_spans_both_phases() {
        assert!(Status::Unknown < Status::Unsubmitted);
        assert!(Status::Unsubmitted < Status::Created);
        assert!(Status::Created < Status::Uploaded);
        assert!(Status::Uploaded < Status::Pending);
        assert!(Status::Pending < Status::Ready);
        assert!(Status::Ready < Status::Fixed);
        assert!(Status::Fixed < Status::NoAction);
    }

    #[test]
    fn status_round_trips_through_i64() {
        for status in [
            Status::Unknown,
            Status::Unsubmitted,
            Status::Created,
            Status::Uploaded,
            Status::Pending,
            Status::Ready,
            Status::Fixed,
            Status::NoAction,
        ] {
            assert_eq!(Status::try_from(status.as_i64()).unwrap(), status);
        }
        assert!(Status::try_from(42).is_err());
    }
}
