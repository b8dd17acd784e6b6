use crate::pipeline::RunSummary;
use crate::DbPool;
use anyhow::Result;
use rusqlite::params;
use serde::Serialize;
use tracing::instrument;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CycleRun {
    pub id: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub subjects_seen: i64,
    pub insight_count: i64,
    pub subjects_with_insights: i64,
    pub optimized_count: i64,
    pub failure_count: i64,
    pub cancelled: bool,
    pub fatal_error: Option<String>,
}

#[instrument(skip(db, summary), err)]
pub fn record_cycle_run(db: &DbPool, summary: &RunSummary) -> Result<i64> {
    let conn = db.get()?;
    let id = conn.query_row(
        "INSERT INTO cycle_runs (
            started_at, finished_at, subjects_seen, insight_count,
            subjects_with_insights, optimized_count, failure_count,
            cancelled, fatal_error
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id",
        params![
            summary.started_at,
            summary.finished_at,
            summary.subjects_seen as i64,
            summary.insight_count as i64,
            summary.subjects_with_insights as i64,
            summary.optimized_count as i64,
            summary.failure_count() as i64,
            summary.cancelled,
            summary.fatal.as_ref().map(|e| e.to_string()),
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

#[instrument(skip(db), err)]
pub fn recent_cycle_runs(db: &DbPool, limit: usize) -> Result<Vec<CycleRun>> {
    let conn = db.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, started_at, finished_at, subjects_seen, insight_count,
                subjects_with_insights, optimized_count, failure_count,
                cancelled, fatal_error
         FROM cycle_runs
         ORDER BY started_at DESC, id DESC
         LIMIT ?",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(CycleRun {
            id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            subjects_seen: row.get(3)?,
            insight_count: row.get(4)?,
            subjects_with_insights: row.get(5)?,
            optimized_count: row.get(6)?,
            failure_count: row.get(7)?,
            cancelled: row.get(8)?,
            fatal_error: row.get(9)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::test_utils::new_test_db;

    #[test]
    fn records_and_lists_newest_first() -> Result<()> {
        let db = new_test_db()?;

        let mut first = RunSummary::started(100);
        first.finished_at = 110;
        first.insight_count = 3;
        record_cycle_run(&db.pool, &first)?;

        let mut second = RunSummary::started(200);
        second.finished_at = 201;
        second.fatal =
            Some(PipelineError::Retrieval("connection refused".to_string()));
        record_cycle_run(&db.pool, &second)?;

        let runs = recent_cycle_runs(&db.pool, 10)?;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].started_at, 200);
        assert!(runs[0]
            .fatal_error
            .as_deref()
            .unwrap()
            .contains("connection refused"));
        assert_eq!(runs[1].insight_count, 3);
        assert!(runs[1].fatal_error.is_none());

        assert_eq!(recent_cycle_runs(&db.pool, 1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn failure_count_includes_lost_subject_tasks() -> Result<()> {
        let db = new_test_db()?;

        let mut summary = RunSummary::started(300);
        summary.finished_at = 305;
        summary.failures.push(PipelineError::Extraction {
            subject_id: 4,
            reason: "bad json".to_string(),
        });
        summary.task_failures = 2;
        record_cycle_run(&db.pool, &summary)?;

        let runs = recent_cycle_runs(&db.pool, 1)?;
        assert_eq!(runs[0].failure_count, 3);
        Ok(())
    }
}
