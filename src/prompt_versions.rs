//! Versioned, single-active prompt lineage per subject.
//!
//! Every activation creates a new version `1 + max(existing)` and makes it
//! the only active row for the subject. The read-then-write runs inside an
//! immediate transaction, so concurrent activations for the same subject
//! are serialized by SQLite's write lock; `UNIQUE(subject_id, version)` and
//! the partial unique index on active rows back this up at the schema level.

use crate::error::PipelineError;
use crate::models::{PromptTemplate, SubjectId};
use crate::DbPool;
use anyhow::Result;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::{info, instrument};

pub const OPTIMIZED_TEMPLATE_TYPE: &str = "optimized";

#[derive(Clone)]
pub struct PromptVersionManager {
    db: DbPool,
    base_template_name: String,
}

impl PromptVersionManager {
    pub fn new(db: DbPool, base_template_name: impl Into<String>) -> Self {
        Self {
            db,
            base_template_name: base_template_name.into(),
        }
    }

    pub fn base_template_name(&self) -> &str {
        &self.base_template_name
    }

    /// The shared base template must exist and be available. Its absence is
    /// a configuration error, not something a single subject can recover
    /// from.
    #[instrument(skip(self), fields(name = %self.base_template_name))]
    pub fn ensure_base_template(&self) -> Result<PromptTemplate, PipelineError> {
        match self.load_base_template() {
            Ok(Some(template)) => Ok(template),
            Ok(None) => Err(PipelineError::Configuration(format!(
                "base prompt template '{}' is missing or unavailable",
                self.base_template_name
            ))),
            Err(e) => Err(PipelineError::Configuration(format!(
                "failed to load base prompt template '{}': {:#}",
                self.base_template_name, e
            ))),
        }
    }

    /// Content of the highest active version for the subject, falling back
    /// to the shared base template.
    #[instrument(skip(self), err)]
    pub fn get_active_prompt(&self, subject_id: SubjectId) -> Result<String> {
        let conn = self.db.get()?;
        let personalized: Option<String> = conn
            .query_row(
                "SELECT content
                 FROM subject_prompts
                 WHERE subject_id = ? AND active = 1
                 ORDER BY version DESC
                 LIMIT 1",
                params![subject_id],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        if let Some(content) = personalized {
            return Ok(content);
        }

        self.load_base_template()?.map(|t| t.content).ok_or_else(|| {
            anyhow::anyhow!(
                "base prompt template '{}' is missing or unavailable",
                self.base_template_name
            )
        })
    }

    /// Deactivate every version for the subject and insert the next one as
    /// active, atomically.
    #[instrument(skip(self, content), fields(content_len = content.len()))]
    pub fn activate_new_version(
        &self,
        subject_id: SubjectId,
        content: &str,
    ) -> Result<PromptTemplate, PipelineError> {
        self.try_activate(subject_id, content).map_err(|e| {
            PipelineError::Activation {
                subject_id,
                reason: format!("{:#}", e),
            }
        })
    }

    fn try_activate(
        &self,
        subject_id: SubjectId,
        content: &str,
    ) -> Result<PromptTemplate> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE subject_prompts SET active = 0 WHERE subject_id = ? AND active = 1",
            params![subject_id],
        )?;

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM subject_prompts WHERE subject_id = ?",
            params![subject_id],
            |row| row.get(0),
        )?;
        let created_at = chrono::Utc::now().timestamp();

        tx.execute(
            "INSERT INTO subject_prompts (
                subject_id, template_type, content, version, active, created_at
            ) VALUES (?, ?, ?, ?, 1, ?)",
            params![
                subject_id,
                OPTIMIZED_TEMPLATE_TYPE,
                content,
                version,
                created_at
            ],
        )?;
        tx.commit()?;

        info!("Activated prompt version {} for subject {}", version, subject_id);
        Ok(PromptTemplate {
            subject_id: Some(subject_id),
            template_type: OPTIMIZED_TEMPLATE_TYPE.to_string(),
            content: content.to_string(),
            version,
            active: true,
            created_at,
        })
    }

    /// Every version for the subject, oldest first.
    #[instrument(skip(self), err)]
    pub fn history(&self, subject_id: SubjectId) -> Result<Vec<PromptTemplate>> {
        let conn = self.db.get()?;
        let mut stmt = conn.prepare(
            "SELECT subject_id, template_type, content, version, active, created_at
             FROM subject_prompts
             WHERE subject_id = ?
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![subject_id], |row| {
            Ok(PromptTemplate {
                subject_id: Some(row.get(0)?),
                template_type: row.get(1)?,
                content: row.get(2)?,
                version: row.get(3)?,
                active: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Insert or replace a base template and mark it available.
    #[instrument(skip(self, content), err)]
    pub fn install_base_template(&self, name: &str, content: &str) -> Result<()> {
        let conn = self.db.get()?;
        conn.execute(
            "INSERT INTO base_prompts (name, template_type, content, available, created_at)
             VALUES (?, 'base', ?, 1, ?)
             ON CONFLICT(name) DO UPDATE SET
                content = excluded.content,
                available = 1,
                created_at = excluded.created_at",
            params![name, content, chrono::Utc::now().timestamp()],
        )?;
        info!("Installed base prompt template '{}'", name);
        Ok(())
    }

    fn load_base_template(&self) -> Result<Option<PromptTemplate>> {
        let conn = self.db.get()?;
        let template = conn
            .query_row(
                "SELECT template_type, content, created_at
                 FROM base_prompts
                 WHERE name = ? AND available = 1",
                params![self.base_template_name],
                |row| {
                    Ok(PromptTemplate {
                        subject_id: None,
                        template_type: row.get(0)?,
                        content: row.get(1)?,
                        version: 1,
                        active: true,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{active_prompt_rows, new_test_db, seed_base_template};
    use pretty_assertions::assert_eq;
    use rusqlite::params;

    const BASE: &str = "You are EVA, a warm and patient companion.";

    fn manager_with_base() -> anyhow::Result<(crate::test_utils::TestDb, PromptVersionManager)>
    {
        let db = new_test_db()?;
        seed_base_template(&db.pool, "eva_base_v2", BASE)?;
        let manager = PromptVersionManager::new(db.pool.clone(), "eva_base_v2");
        Ok((db, manager))
    }

    #[test]
    fn falls_back_to_base_template() -> anyhow::Result<()> {
        let (_db, manager) = manager_with_base()?;
        assert_eq!(manager.get_active_prompt(11)?, BASE);
        Ok(())
    }

    #[test]
    fn missing_base_template_is_fatal_configuration() -> anyhow::Result<()> {
        let db = new_test_db()?;
        let manager = PromptVersionManager::new(db.pool.clone(), "eva_base_v2");
        let err = manager.ensure_base_template().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(manager.get_active_prompt(1).is_err());
        Ok(())
    }

    #[test]
    fn unavailable_base_template_does_not_count() -> anyhow::Result<()> {
        let (db, manager) = manager_with_base()?;
        db.pool.get()?.execute(
            "UPDATE base_prompts SET available = 0 WHERE name = ?",
            params!["eva_base_v2"],
        )?;
        assert!(manager.ensure_base_template().is_err());
        Ok(())
    }

    #[test]
    fn activation_returns_new_content_and_bumps_version() -> anyhow::Result<()> {
        let (db, manager) = manager_with_base()?;

        let v1 = manager.activate_new_version(11, "prompt v1")?;
        assert_eq!(v1.version, 1);
        assert_eq!(manager.get_active_prompt(11)?, "prompt v1");

        let v2 = manager.activate_new_version(11, "prompt v2")?;
        assert_eq!(v2.version, 2);
        assert_eq!(manager.get_active_prompt(11)?, "prompt v2");
        assert_eq!(active_prompt_rows(&db.pool, 11)?, 1);

        // Other subjects are untouched.
        assert_eq!(manager.get_active_prompt(12)?, BASE);

        let history = manager.history(11)?;
        let versions: Vec<_> = history.iter().map(|t| (t.version, t.active)).collect();
        assert_eq!(versions, vec![(1, false), (2, true)]);
        Ok(())
    }

    #[test]
    fn versions_are_never_reused_after_deactivation() -> anyhow::Result<()> {
        let (db, manager) = manager_with_base()?;
        manager.activate_new_version(5, "a")?;
        manager.activate_new_version(5, "b")?;
        db.pool.get()?.execute(
            "UPDATE subject_prompts SET active = 0 WHERE subject_id = 5",
            [],
        )?;
        assert_eq!(manager.get_active_prompt(5)?, BASE);

        let next = manager.activate_new_version(5, "c")?;
        assert_eq!(next.version, 3);
        Ok(())
    }

    #[test]
    fn concurrent_activations_serialize() -> anyhow::Result<()> {
        let (db, manager) = manager_with_base()?;

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager.activate_new_version(77, &format!("candidate {}", i))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap()?;
        }

        let versions: Vec<_> =
            manager.history(77)?.iter().map(|t| t.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(active_prompt_rows(&db.pool, 77)?, 1);
        Ok(())
    }

    #[test]
    fn failed_activation_keeps_the_previous_version() -> anyhow::Result<()> {
        let (db, manager) = manager_with_base()?;
        manager.activate_new_version(11, "prompt v1")?;
        db.pool.get()?.execute_batch(
            "CREATE TRIGGER reject_prompts BEFORE INSERT ON subject_prompts
             BEGIN SELECT RAISE(ABORT, 'prompts are frozen'); END;",
        )?;

        let err = manager.activate_new_version(11, "prompt v2").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Activation { subject_id: 11, .. }
        ));
        assert!(err.to_string().contains("prompts are frozen"));
        assert_eq!(manager.get_active_prompt(11)?, "prompt v1");
        Ok(())
    }

    #[test]
    fn install_base_template_replaces_content() -> anyhow::Result<()> {
        let (_db, manager) = manager_with_base()?;
        manager.install_base_template("eva_base_v2", "new base")?;
        assert_eq!(manager.ensure_base_template()?.content, "new base");
        assert_eq!(manager.get_active_prompt(1)?, "new base");
        Ok(())
    }
}
