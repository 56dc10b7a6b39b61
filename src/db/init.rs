//! Database initialization
//!
//! Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`), so every
//! entry point can call [`init_database`] unconditionally; `provision`
//! simply calls it explicitly.

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::error::Result;

/// Open the connection pool and make sure the schema exists.
pub async fn init_database(database_url: &str) -> Result<SqlitePool> {
    let pool = connect(database_url).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Open the connection pool with write-friendly SQLite settings.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    // mode=rwc creates the database file on first run
    let url = if database_url.contains('?') {
        database_url.to_string()
    } else {
        format!("{database_url}?mode=rwc")
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    // WAL allows the webhook server, poll sweeps and batch driver to share
    // the database as independent processes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    info!(url = %database_url, "database pool ready");
    Ok(pool)
}

/// Create all tables and indexes.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_queued_candidates_table(pool).await?;
    create_confirmed_matches_table(pool).await?;
    create_match_sources_table(pool).await?;
    Ok(())
}

async fn create_queued_candidates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queued_candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            lang TEXT NOT NULL,
            page_ns INTEGER NOT NULL,
            page_title TEXT NOT NULL,
            rev_id INTEGER NOT NULL,
            rev_parent_id INTEGER NOT NULL DEFAULT 0,
            rev_timestamp TEXT NOT NULL,
            rev_user_text TEXT NOT NULL,
            submission_id TEXT UNIQUE,
            status INTEGER NOT NULL DEFAULT -4,
            status_timestamp TEXT NOT NULL,
            CHECK (rev_id > 0),
            CHECK (rev_parent_id >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_queued_rev ON queued_candidates(project, lang, rev_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queued_status ON queued_candidates(status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_confirmed_matches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS confirmed_matches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id TEXT NOT NULL UNIQUE,
            project TEXT NOT NULL,
            lang TEXT NOT NULL,
            page_ns INTEGER NOT NULL,
            page_title TEXT NOT NULL,
            rev_id INTEGER NOT NULL,
            rev_parent_id INTEGER NOT NULL DEFAULT 0,
            rev_timestamp TEXT NOT NULL,
            rev_user_text TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            status_timestamp TEXT NOT NULL,
            status_user_text TEXT,
            CHECK (rev_id > 0),
            CHECK (status >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_confirmed_rev ON confirmed_matches(project, lang, rev_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_confirmed_page ON confirmed_matches(project, lang, page_ns, page_title)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_confirmed_rev_time ON confirmed_matches(project, lang, rev_timestamp)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_confirmed_status ON confirmed_matches(status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_match_sources_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS match_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id TEXT NOT NULL
                REFERENCES confirmed_matches(submission_id)
                ON DELETE CASCADE ON UPDATE CASCADE,
            description TEXT NOT NULL,
            url TEXT,
            percent REAL NOT NULL,
            CHECK (percent >= 0.0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_match_sources_submission ON match_sources(submission_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
