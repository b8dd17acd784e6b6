use crate::error::PipelineError;
use crate::models::{Insight, StoredInsight, SubjectId};
use crate::DbPool;
use anyhow::Result;
use rusqlite::params;
use tracing::{error, info, instrument};

struct InsightRow {
    id: i64,
    created_at: i64,
    active: bool,
    subject_id: SubjectId,
    category: String,
    observation: String,
    confidence: f64,
    evidence: String,
}

/// Appends extracted insights to the store, one row per insight.
#[derive(Clone)]
pub struct InsightWriter {
    db: DbPool,
}

impl InsightWriter {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Write every insight as a new active row. Rows are inserted one at a
    /// time; on failure the rows already written stay written and the error
    /// carries how many there were.
    #[instrument(skip(self, insights), fields(count = insights.len()))]
    pub fn persist(&self, insights: &[Insight]) -> Result<usize, PipelineError> {
        let Some(first) = insights.first() else {
            return Ok(0);
        };
        let subject_id = first.subject_id;

        let conn = self.db.get().map_err(|e| PipelineError::Persistence {
            subject_id,
            written: 0,
            reason: e.to_string(),
        })?;

        let mut written = 0;
        for insight in insights {
            if let Err(e) = insert_insight(&conn, insight) {
                error!(
                    "Failed to persist insight {} of {} for subject {}: {:#}",
                    written + 1,
                    insights.len(),
                    insight.subject_id,
                    e
                );
                return Err(PipelineError::Persistence {
                    subject_id: insight.subject_id,
                    written,
                    reason: format!("{:#}", e),
                });
            }
            written += 1;
        }

        info!("Persisted {} insights for subject {}", written, subject_id);
        Ok(written)
    }

    /// Active insights for one subject, newest first.
    #[instrument(skip(self), err)]
    pub fn list_active(&self, subject_id: SubjectId) -> Result<Vec<StoredInsight>> {
        let conn = self.db.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, active, subject_id, category,
                    observation, confidence, evidence
             FROM insights
             WHERE subject_id = ? AND active = 1
             ORDER BY created_at DESC, id DESC",
        )?;

        let rows = stmt.query_map(params![subject_id], |row| {
            Ok(InsightRow {
                id: row.get(0)?,
                created_at: row.get(1)?,
                active: row.get(2)?,
                subject_id: row.get(3)?,
                category: row.get(4)?,
                observation: row.get(5)?,
                confidence: row.get(6)?,
                evidence: row.get(7)?,
            })
        })?;

        let mut insights = Vec::new();
        for row in rows {
            let row = row?;
            insights.push(StoredInsight {
                id: row.id,
                created_at: row.created_at,
                active: row.active,
                insight: Insight {
                    subject_id: row.subject_id,
                    category: row.category.parse()?,
                    observation: row.observation,
                    confidence: row.confidence,
                    evidence: serde_json::from_str(&row.evidence)?,
                },
            });
        }
        Ok(insights)
    }
}

fn insert_insight(conn: &rusqlite::Connection, insight: &Insight) -> Result<()> {
    let evidence = serde_json::to_string(&insight.evidence)?;
    conn.execute(
        "INSERT INTO insights (
            subject_id, category, observation, confidence,
            evidence, created_at, active
        ) VALUES (?, ?, ?, ?, ?, ?, 1)",
        params![
            insight.subject_id,
            insight.category.as_str(),
            insight.observation,
            insight.confidence,
            evidence,
            chrono::Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}
