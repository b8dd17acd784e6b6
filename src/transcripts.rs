use crate::error::PipelineError;
use crate::models::{ConversationTurn, SubjectId};
use crate::time_util::format_clock;
use crate::DbPool;
use anyhow::Result;
use chrono_tz::Tz;
use rusqlite::params;
use std::collections::BTreeMap;
use tracing::{info, instrument};

/// Reads recorded conversation turns and groups them per subject.
#[derive(Clone)]
pub struct TranscriptAggregator {
    db: DbPool,
}

impl TranscriptAggregator {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// All turns with `window_start <= timestamp < window_end`, ordered by
    /// subject then time. Any store failure is a retrieval error.
    #[instrument(skip(self), err)]
    pub fn fetch_recent_turns(
        &self,
        window_start: i64,
        window_end: i64,
    ) -> Result<Vec<ConversationTurn>, PipelineError> {
        query_turns(&self.db, window_start, window_end)
            .map_err(|e| PipelineError::Retrieval(format!("{:#}", e)))
    }

    pub fn fetch_grouped(
        &self,
        window_start: i64,
        window_end: i64,
    ) -> Result<BTreeMap<SubjectId, Vec<ConversationTurn>>, PipelineError> {
        let turns = self.fetch_recent_turns(window_start, window_end)?;
        let grouped = group_by_subject(turns);
        info!("Grouped turns into {} subjects", grouped.len());
        Ok(grouped)
    }
}

fn query_turns(
    db: &DbPool,
    window_start: i64,
    window_end: i64,
) -> Result<Vec<ConversationTurn>> {
    let conn = db.get()?;
    let mut stmt = conn.prepare(
        "SELECT
            id, subject_id, recorded_at, speaker, content,
            emotion, importance, session_id, source_call_id
         FROM conversation_turns
         WHERE recorded_at >= ? AND recorded_at < ?
         ORDER BY subject_id ASC, recorded_at ASC, id ASC",
    )?;

    let rows = stmt.query_map(params![window_start, window_end], |row| {
        Ok(ConversationTurn {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            timestamp: row.get(2)?,
            speaker: row.get(3)?,
            content: row.get(4)?,
            emotion: row.get(5)?,
            importance: row.get(6)?,
            session_id: row.get(7)?,
            source_call_id: row.get(8)?,
        })
    })?;

    let turns = rows.collect::<Result<Vec<_>, _>>()?;
    info!("Found {} conversation turns in window", turns.len());
    Ok(turns)
}

/// Group turns by subject. Keys iterate in ascending subject order and each
/// group keeps the chronological order of its input.
pub fn group_by_subject(
    turns: Vec<ConversationTurn>,
) -> BTreeMap<SubjectId, Vec<ConversationTurn>> {
    let mut grouped: BTreeMap<SubjectId, Vec<ConversationTurn>> =
        BTreeMap::new();
    for turn in turns {
        grouped.entry(turn.subject_id).or_default().push(turn);
    }
    for group in grouped.values_mut() {
        // Stable sort keeps insertion order for equal timestamps.
        group.sort_by_key(|turn| turn.timestamp);
    }
    grouped
}

/// Model-facing digest: one `[HH:MM] speaker: content` line per turn.
pub fn render_transcript(turns: &[ConversationTurn], timezone: Tz) -> String {
    turns
        .iter()
        .map(|turn| {
            format!(
                "[{}] {}: {}",
                format_clock(turn.timestamp, timezone),
                turn.speaker,
                turn.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Record a turn. The assistant runtime owns this table; the pipeline only
/// writes to it from tests and fixtures.
#[instrument(skip(conn, turn), fields(subject_id = turn.subject_id))]
pub fn insert_turn(
    conn: &rusqlite::Connection,
    turn: &ConversationTurn,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO conversation_turns (
            subject_id, recorded_at, speaker, content,
            emotion, importance, session_id, source_call_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            turn.subject_id,
            turn.timestamp,
            turn.speaker,
            turn.content,
            turn.emotion,
            turn.importance,
            turn.session_id,
            turn.source_call_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
