use crate::config::Settings;
use crate::error::PipelineError;
use crate::models::{Insight, SubjectId};
use crate::openai::{GenerationParams, TextGenerator};
use crate::prompts::{fill_template, PROMPT_OPTIMIZATION_PROMPT};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationDecision {
    /// Too few insights to justify a rewrite.
    Skipped { insight_count: usize, required: usize },
    Rewritten(String),
}

/// Rewrites a subject's active prompt from its insights.
#[derive(Clone)]
pub struct PromptOptimizer {
    generator: TextGenerator,
    params: GenerationParams,
    min_insights: usize,
    // Configured but not consulted by any decision yet.
    quality_threshold: f64,
}

impl PromptOptimizer {
    pub fn new(generator: TextGenerator, settings: &Settings) -> Self {
        Self {
            generator,
            params: settings.generation.clone(),
            min_insights: settings.min_insights_for_optimization,
            quality_threshold: settings.optimization_threshold_score,
        }
    }

    pub fn min_insights(&self) -> usize {
        self.min_insights
    }

    pub fn quality_threshold(&self) -> f64 {
        self.quality_threshold
    }

    pub fn meets_threshold(&self, insight_count: usize) -> bool {
        insight_count >= self.min_insights
    }

    #[instrument(skip(self, current_prompt, insights), fields(insights = insights.len()))]
    pub async fn optimize(
        &self,
        subject_id: SubjectId,
        current_prompt: &str,
        insights: &[Insight],
    ) -> Result<OptimizationDecision, PipelineError> {
        if !self.meets_threshold(insights.len()) {
            info!(
                "Skipping subject {} ({} insights, {} required)",
                subject_id,
                insights.len(),
                self.min_insights
            );
            return Ok(OptimizationDecision::Skipped {
                insight_count: insights.len(),
                required: self.min_insights,
            });
        }

        let prompt = build_optimization_prompt(current_prompt, insights);
        let rewritten = self
            .generator
            .generate(&prompt, &self.params)
            .await
            .map_err(|e| PipelineError::Optimization {
                subject_id,
                reason: e.to_string(),
            })?;

        info!("Generated optimized prompt for subject {}", subject_id);
        Ok(OptimizationDecision::Rewritten(rewritten))
    }
}

/// `- [category] observation (confidence: NN%)`, one line per insight.
pub fn render_insights(insights: &[Insight]) -> String {
    insights
        .iter()
        .map(|insight| {
            format!(
                "- [{}] {} (confidence: {:.0}%)",
                insight.category,
                insight.observation,
                insight.confidence * 100.0
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_optimization_prompt(
    current_prompt: &str,
    insights: &[Insight],
) -> String {
    fill_template(
        PROMPT_OPTIMIZATION_PROMPT,
        &[
            ("current_prompt", current_prompt),
            ("insights", &render_insights(insights)),
        ],
    )
}
