use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type SubjectId = i64;

/// A single utterance recorded by the assistant runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: i64,
    pub subject_id: SubjectId,
    /// Unix seconds, UTC.
    pub timestamp: i64,
    pub speaker: String,
    pub content: String,
    pub emotion: Option<String>,
    pub importance: f64,
    pub session_id: Option<String>,
    pub source_call_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    CommunicationStyle,
    Preferences,
    Triggers,
    Failures,
}

impl InsightCategory {
    pub const ALL: [InsightCategory; 4] = [
        InsightCategory::CommunicationStyle,
        InsightCategory::Preferences,
        InsightCategory::Triggers,
        InsightCategory::Failures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::CommunicationStyle => "communication_style",
            InsightCategory::Preferences => "preferences",
            InsightCategory::Triggers => "triggers",
            InsightCategory::Failures => "failures",
        }
    }
}

impl fmt::Display for InsightCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InsightCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown insight category: {}", s))
    }
}

/// A behavioral observation about one subject, derived from its turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub subject_id: SubjectId,
    pub category: InsightCategory,
    pub observation: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredInsight {
    pub id: i64,
    pub created_at: i64,
    pub active: bool,
    #[serde(flatten)]
    pub insight: Insight,
}

/// One version of a system prompt. `subject_id` is `None` for the shared
/// base template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptTemplate {
    pub subject_id: Option<SubjectId>,
    pub template_type: String,
    pub content: String,
    pub version: i64,
    pub active: bool,
    pub created_at: i64,
}
