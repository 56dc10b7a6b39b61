//! copyvet - wiki copyright-infringement screening backend
//!
//! Watches a change-event feed for substantial additions to configured
//! wikis, extracts the added plain text, submits it to an external
//! similarity-detection service, and promotes confirmed matches into a
//! remediation queue for human review.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod types;
pub mod wikitext;

pub use api::{build_router, AppState};
pub use error::{Error, Result};
