use crate::config::PoolSettings;
use crate::models::{ConversationTurn, SubjectId};
use crate::{create_pool, init_markov_db, DbPool};
use anyhow::Result;
use rusqlite::params;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging in a thread-safe way.
/// This function ensures that logging is initialized only once across all tests,
/// even when multiple test files are running in parallel.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        // Another harness may already have installed a subscriber.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// A migrated, file-backed database that is removed when dropped.
pub struct TestDb {
    pub pool: DbPool,
    pub file: tempfile::NamedTempFile,
}

pub fn test_pool_settings() -> PoolSettings {
    PoolSettings {
        max_size: 8,
        min_idle: Some(1),
        connection_timeout: Duration::from_secs(5),
        busy_timeout: Duration::from_secs(5),
        ..PoolSettings::default()
    }
}

pub fn new_test_db() -> Result<TestDb> {
    let file = tempfile::NamedTempFile::new()?;
    let pool = create_pool(file.path(), &test_pool_settings())?;
    {
        let mut conn = pool.get()?;
        init_markov_db(&mut conn)?;
    }
    Ok(TestDb { pool, file })
}

pub fn turn_at(
    subject_id: SubjectId,
    timestamp: i64,
    speaker: &str,
    content: &str,
) -> ConversationTurn {
    ConversationTurn {
        id: 0,
        subject_id,
        timestamp,
        speaker: speaker.to_string(),
        content: content.to_string(),
        emotion: None,
        importance: 0.5,
        session_id: Some(format!("session-{}", subject_id)),
        source_call_id: None,
    }
}

pub fn seed_base_template(pool: &DbPool, name: &str, content: &str) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO base_prompts (name, template_type, content, available, created_at)
         VALUES (?, 'base', ?, 1, 0)",
        params![name, content],
    )?;
    Ok(())
}

/// Count of active prompt rows for one subject.
pub fn active_prompt_rows(pool: &DbPool, subject_id: SubjectId) -> Result<i64> {
    let conn = pool.get()?;
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM subject_prompts WHERE subject_id = ? AND active = 1",
        params![subject_id],
        |row| row.get(0),
    )?)
}
