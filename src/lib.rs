use crate::config::PoolSettings;
use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use std::path::Path;
use tracing::{info, instrument};

pub mod analyzer;
pub mod app;
pub mod cli;
pub mod config;
pub mod cycle_runs;
pub mod error;
pub mod insights;
pub mod models;
pub mod openai;
pub mod optimizer;
pub mod pipeline;
pub mod prompt_versions;
pub mod prompts;
pub mod scheduler;
pub mod time_util;
pub mod transcripts;

pub mod test_utils;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Build the connection pool for the pipeline database. Every connection
/// gets a busy timeout so lock waits are bounded.
pub fn create_pool(path: &Path, settings: &PoolSettings) -> Result<DbPool> {
    let busy_timeout = settings.busy_timeout;
    let manager = SqliteConnectionManager::file(path)
        .with_init(move |conn| conn.busy_timeout(busy_timeout));
    let pool = Pool::builder()
        .max_size(settings.max_size)
        .min_idle(settings.min_idle)
        .idle_timeout(Some(settings.idle_timeout))
        .max_lifetime(Some(settings.max_lifetime))
        .connection_timeout(settings.connection_timeout)
        .build(manager)?;
    Ok(pool)
}

fn markov_migration_steps() -> Vec<M<'static>> {
    vec![
        M::up(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL,         -- Unix seconds, UTC
                speaker TEXT NOT NULL,
                content TEXT NOT NULL,
                emotion TEXT,
                importance REAL NOT NULL DEFAULT 0,
                session_id TEXT,
                source_call_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                category TEXT NOT NULL CHECK (category IN (
                    'communication_style', 'preferences', 'triggers', 'failures'
                )),
                observation TEXT NOT NULL,
                confidence REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
                evidence TEXT NOT NULL DEFAULT '[]',  -- JSON array of excerpts
                created_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS base_prompts (
                name TEXT PRIMARY KEY,
                template_type TEXT NOT NULL DEFAULT 'base',
                content TEXT NOT NULL,
                available INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subject_prompts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                template_type TEXT NOT NULL,
                content TEXT NOT NULL,
                version INTEGER NOT NULL CHECK (version > 0),
                active INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(subject_id, version)
            );
            "#,
        ),
        M::up(
            r#"
            CREATE INDEX IF NOT EXISTS idx_turns_recorded_subject
                ON conversation_turns(recorded_at, subject_id);

            CREATE INDEX IF NOT EXISTS idx_insights_subject_active
                ON insights(subject_id, active);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_subject_prompts_single_active
                ON subject_prompts(subject_id) WHERE active = 1;
            "#,
        ),
        M::up(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                subjects_seen INTEGER NOT NULL,
                insight_count INTEGER NOT NULL,
                subjects_with_insights INTEGER NOT NULL,
                optimized_count INTEGER NOT NULL,
                failure_count INTEGER NOT NULL,
                cancelled INTEGER NOT NULL DEFAULT 0,
                fatal_error TEXT
            );
            "#,
        ),
    ]
}

// Database initialization
#[instrument(skip(conn))]
pub fn init_markov_db(conn: &mut Connection) -> Result<()> {
    info!("Initializing pipeline database");
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let migrations = Migrations::new(markov_migration_steps());
    migrations.to_latest(conn)?;

    Ok(())
}

#[cfg(test)]
mod migration_tests {
    use super::{init_markov_db, markov_migration_steps};
    use anyhow::Result;
    use rusqlite::{params, Connection, OptionalExtension};
    use rusqlite_migration::Migrations;

    fn has_object(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
        Ok(conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = ?1 AND name = ?2",
                [kind, name],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    #[test]
    fn migrations_apply_on_fresh_database() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;

        init_markov_db(&mut conn)?;

        for table in [
            "conversation_turns",
            "insights",
            "base_prompts",
            "subject_prompts",
            "cycle_runs",
        ] {
            assert!(has_object(&conn, "table", table)?, "missing {}", table);
        }
        assert!(has_object(
            &conn,
            "index",
            "idx_subject_prompts_single_active"
        )?);

        Ok(())
    }

    #[test]
    fn migrations_upgrade_existing_schema() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;

        let mut partial_steps = markov_migration_steps();
        let first_step = vec![partial_steps.remove(0)];
        Migrations::new(first_step).to_latest(&mut conn)?;
        assert!(!has_object(&conn, "table", "cycle_runs")?);

        init_markov_db(&mut conn)?;

        assert!(has_object(&conn, "table", "cycle_runs")?);
        assert!(has_object(&conn, "index", "idx_turns_recorded_subject")?);

        Ok(())
    }

    #[test]
    fn schema_rejects_a_second_active_prompt() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        init_markov_db(&mut conn)?;

        conn.execute(
            "INSERT INTO subject_prompts
                (subject_id, template_type, content, version, active, created_at)
             VALUES (?1, 'optimized', 'v1', 1, 1, 0)",
            params![3],
        )?;
        let second = conn.execute(
            "INSERT INTO subject_prompts
                (subject_id, template_type, content, version, active, created_at)
             VALUES (?1, 'optimized', 'v2', 2, 1, 0)",
            params![3],
        );
        assert!(second.is_err());

        let duplicate_version = conn.execute(
            "INSERT INTO subject_prompts
                (subject_id, template_type, content, version, active, created_at)
             VALUES (?1, 'optimized', 'again', 1, 0, 0)",
            params![3],
        );
        assert!(duplicate_version.is_err());

        Ok(())
    }

    #[test]
    fn schema_rejects_unknown_category_and_bad_confidence() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        init_markov_db(&mut conn)?;

        let bad_category = conn.execute(
            "INSERT INTO insights
                (subject_id, category, observation, confidence, created_at)
             VALUES (1, 'mood', 'x', 0.5, 0)",
            [],
        );
        assert!(bad_category.is_err());

        let bad_confidence = conn.execute(
            "INSERT INTO insights
                (subject_id, category, observation, confidence, created_at)
             VALUES (1, 'triggers', 'x', 1.5, 0)",
            [],
        );
        assert!(bad_confidence.is_err());

        Ok(())
    }
}
