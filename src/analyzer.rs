//! Insight extraction: turns one subject's transcript into validated,
//! typed insights through a schema-constrained model call.
//!
//! Extraction never touches the store and never retries. A model failure or
//! a response that does not match the insight shape is an extraction error
//! for that subject alone.

use crate::config::Settings;
use crate::error::PipelineError;
use crate::models::{ConversationTurn, Insight, InsightCategory, SubjectId};
use crate::openai::{GenerationParams, TextGenerator};
use crate::prompts::{
    fill_template, insight_response_schema, INSIGHT_EXTRACTION_PROMPT,
};
use crate::transcripts::render_transcript;
use anyhow::{anyhow, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, info, instrument};

#[derive(Debug, Deserialize)]
struct InsightResponse {
    insights: Vec<RawInsight>,
}

#[derive(Debug, Deserialize)]
struct RawInsight {
    category: InsightCategory,
    observation: String,
    confidence: f64,
    #[serde(default)]
    evidence: Vec<String>,
}

#[derive(Clone)]
pub struct InsightExtractor {
    generator: TextGenerator,
    params: GenerationParams,
    timezone: Tz,
}

impl InsightExtractor {
    pub fn new(generator: TextGenerator, settings: &Settings) -> Self {
        Self {
            generator,
            params: settings
                .generation
                .clone()
                .with_response_schema(insight_response_schema()),
            timezone: settings.timezone,
        }
    }

    #[instrument(skip(self, turns), fields(turns = turns.len()))]
    pub async fn extract_insights(
        &self,
        subject_id: SubjectId,
        turns: &[ConversationTurn],
    ) -> Result<Vec<Insight>, PipelineError> {
        if turns.is_empty() {
            debug!("No turns for subject {}, skipping model call", subject_id);
            return Ok(Vec::new());
        }

        let transcript = render_transcript(turns, self.timezone);
        let prompt = build_extraction_prompt(&transcript);

        let response = self
            .generator
            .generate(&prompt, &self.params)
            .await
            .map_err(|e| PipelineError::Extraction {
                subject_id,
                reason: e.to_string(),
            })?;

        let insights = parse_insight_response(subject_id, &response).map_err(
            |e| PipelineError::Extraction {
                subject_id,
                reason: format!("invalid model response: {:#}", e),
            },
        )?;

        info!(
            "Extracted {} insights for subject {}",
            insights.len(),
            subject_id
        );
        Ok(insights)
    }
}

pub fn build_extraction_prompt(transcript: &str) -> String {
    fill_template(INSIGHT_EXTRACTION_PROMPT, &[("transcript", transcript)])
}

/// Parse and validate the model's reply into insights for `subject_id`.
pub fn parse_insight_response(
    subject_id: SubjectId,
    text: &str,
) -> Result<Vec<Insight>> {
    let response: InsightResponse = parse_json_body(text)?;

    response
        .insights
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            if !raw.confidence.is_finite()
                || !(0.0..=1.0).contains(&raw.confidence)
            {
                return Err(anyhow!(
                    "insight {} has confidence {} outside [0, 1]",
                    index,
                    raw.confidence
                ));
            }
            let observation = raw.observation.trim();
            if observation.is_empty() {
                return Err(anyhow!("insight {} has an empty observation", index));
            }
            Ok(Insight {
                subject_id,
                category: raw.category,
                observation: observation.to_string(),
                confidence: raw.confidence,
                evidence: raw.evidence,
            })
        })
        .collect()
}

// Models sometimes wrap JSON in prose or code fences; fall back to the
// outermost object span.
fn parse_json_body<T: for<'de> Deserialize<'de>>(value: &str) -> Result<T> {
    if let Ok(parsed) = serde_json::from_str::<T>(value.trim()) {
        return Ok(parsed);
    }

    let start_index = value.find('{').ok_or_else(|| anyhow!("missing {{"))?;
    let end_index = value.rfind('}').ok_or_else(|| anyhow!("missing }}"))?;
    if start_index >= end_index {
        return Err(anyhow!("malformed json object boundaries"));
    }
    let trimmed = &value[start_index..=end_index];
    Ok(serde_json::from_str(trimmed)?)
}
