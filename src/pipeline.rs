use crate::analyzer::InsightExtractor;
use crate::config::Settings;
use crate::cycle_runs;
use crate::error::PipelineError;
use crate::insights::InsightWriter;
use crate::models::{ConversationTurn, SubjectId};
use crate::openai::{OpenAIClientTrait, TextGenerator};
use crate::optimizer::{OptimizationDecision, PromptOptimizer};
use crate::prompt_versions::PromptVersionManager;
use crate::time_util::lookback_window;
use crate::transcripts::TranscriptAggregator;
use crate::DbPool;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one cycle. Per-subject errors are collected in `failures`;
/// an error that stopped the cycle before any subject ran is in `fatal`.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub started_at: i64,
    pub finished_at: i64,
    pub subjects_seen: usize,
    pub subjects_processed: usize,
    pub insight_count: usize,
    pub subjects_with_insights: usize,
    pub optimized_count: usize,
    pub failures: Vec<PipelineError>,
    /// Subject tasks that panicked or were aborted before reporting.
    pub task_failures: usize,
    pub fatal: Option<PipelineError>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn started(started_at: i64) -> Self {
        Self {
            started_at,
            ..Self::default()
        }
    }

    /// `(insight_count, optimized_count)` as reported to the trigger.
    pub fn counts(&self) -> (usize, usize) {
        (self.insight_count, self.optimized_count)
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len() + self.task_failures
    }

    fn absorb(&mut self, report: SubjectReport) {
        self.subjects_processed += 1;
        self.insight_count += report.insights_written;
        if report.insights_written > 0 {
            self.subjects_with_insights += 1;
        }
        if report.activated_version.is_some() {
            self.optimized_count += 1;
        }
        self.failures.extend(report.errors);
    }
}

#[derive(Debug)]
pub struct SubjectReport {
    pub subject_id: SubjectId,
    pub insights_extracted: usize,
    pub insights_written: usize,
    pub activated_version: Option<i64>,
    pub errors: Vec<PipelineError>,
}

impl SubjectReport {
    fn new(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            insights_extracted: 0,
            insights_written: 0,
            activated_version: None,
            errors: Vec::new(),
        }
    }

    fn fail(&mut self, error: PipelineError) {
        warn!(
            subject_id = self.subject_id,
            kind = error.kind(),
            "Subject {} failed: {}",
            self.subject_id,
            error
        );
        self.errors.push(error);
    }
}

/// One aggregation pass followed by independent per-subject processing.
pub struct Pipeline {
    settings: Arc<Settings>,
    db: DbPool,
    aggregator: TranscriptAggregator,
    extractor: InsightExtractor,
    writer: InsightWriter,
    versions: PromptVersionManager,
    optimizer: PromptOptimizer,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        settings: Arc<Settings>,
        db: DbPool,
        client: Arc<dyn OpenAIClientTrait>,
        shutdown: CancellationToken,
    ) -> Self {
        let generator = TextGenerator::new(
            client,
            settings.model.clone(),
            settings.model_timeout,
        );
        let optimizer = PromptOptimizer::new(generator.clone(), &settings);
        info!(
            "Pipeline configured: model {}, min insights {}, quality threshold {} (not enforced), max iterations {} (not enforced)",
            generator.model(),
            optimizer.min_insights(),
            optimizer.quality_threshold(),
            settings.max_prompt_iterations
        );

        Self {
            aggregator: TranscriptAggregator::new(db.clone()),
            extractor: InsightExtractor::new(generator, &settings),
            writer: InsightWriter::new(db.clone()),
            versions: PromptVersionManager::new(
                db.clone(),
                settings.base_template_name.clone(),
            ),
            optimizer,
            semaphore: Arc::new(Semaphore::new(
                settings.max_concurrent_subjects,
            )),
            shutdown,
            settings,
            db,
        }
    }

    pub fn versions(&self) -> &PromptVersionManager {
        &self.versions
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub async fn run_cycle(self: &Arc<Self>) -> RunSummary {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run a cycle over the lookback window ending at `now`. Never fails:
    /// fatal errors end up in `RunSummary::fatal`.
    #[instrument(skip(self), fields(env = %self.settings.environment))]
    pub async fn run_cycle_at(self: &Arc<Self>, now: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::started(now.timestamp());
        info!("Starting optimization cycle");

        let (window_start, window_end) =
            match lookback_window(now, self.settings.analysis_lookback_hours) {
                Ok(window) => window,
                Err(e) => {
                    error!("Aborting cycle: {}", e);
                    summary.fatal = Some(e);
                    return self.finish(summary);
                }
            };
        let grouped =
            match self.aggregator.fetch_grouped(window_start, window_end) {
                Ok(grouped) => grouped,
                Err(e) => {
                    error!("Aborting cycle: {}", e);
                    summary.fatal = Some(e);
                    return self.finish(summary);
                }
            };

        if let Err(e) = self.versions.ensure_base_template() {
            error!("Aborting cycle: {}", e);
            summary.fatal = Some(e);
            return self.finish(summary);
        }

        summary.subjects_seen = grouped.len();
        let mut tasks = JoinSet::new();

        for (subject_id, turns) in grouped {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Cancellation requested, not starting further subjects");
                    summary.cancelled = true;
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Subject semaphore closed: {}", e);
                        break;
                    }
                }
            };

            let pipeline = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                pipeline.process_subject(subject_id, turns).await
            });
        }

        // Subjects already started always run to completion.
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(report) => summary.absorb(report),
                Err(e) => {
                    error!("Subject task failed: {}", e);
                    summary.task_failures += 1;
                }
            }
        }

        self.finish(summary)
    }

    #[instrument(skip(self, turns), fields(turns = turns.len()))]
    async fn process_subject(
        &self,
        subject_id: SubjectId,
        turns: Vec<ConversationTurn>,
    ) -> SubjectReport {
        let mut report = SubjectReport::new(subject_id);

        let insights =
            match self.extractor.extract_insights(subject_id, &turns).await {
                Ok(insights) => insights,
                Err(e) => {
                    report.fail(e);
                    return report;
                }
            };
        report.insights_extracted = insights.len();

        match self.writer.persist(&insights) {
            Ok(written) => report.insights_written = written,
            Err(e) => {
                if let PipelineError::Persistence { written, .. } = &e {
                    report.insights_written = *written;
                }
                report.fail(e);
            }
        }

        if !self.optimizer.meets_threshold(insights.len()) {
            debug!(
                "Subject {} below optimization threshold ({} insights)",
                subject_id,
                insights.len()
            );
            return report;
        }

        let current_prompt = match self.versions.get_active_prompt(subject_id)
        {
            Ok(prompt) => prompt,
            Err(e) => {
                report.fail(PipelineError::Optimization {
                    subject_id,
                    reason: format!("failed to load active prompt: {:#}", e),
                });
                return report;
            }
        };

        match self
            .optimizer
            .optimize(subject_id, &current_prompt, &insights)
            .await
        {
            Ok(OptimizationDecision::Rewritten(content)) => {
                match self.versions.activate_new_version(subject_id, &content) {
                    Ok(template) => {
                        report.activated_version = Some(template.version)
                    }
                    Err(e) => report.fail(e),
                }
            }
            Ok(OptimizationDecision::Skipped { .. }) => {}
            Err(e) => report.fail(e),
        }

        report
    }

    fn finish(&self, mut summary: RunSummary) -> RunSummary {
        summary.finished_at = Utc::now().timestamp();
        if let Err(e) = cycle_runs::record_cycle_run(&self.db, &summary) {
            warn!("Failed to record cycle run: {:#}", e);
        }
        info!(
            "Cycle finished: {} insights from {} subjects, {} prompts updated, {} subject failures",
            summary.insight_count,
            summary.subjects_with_insights,
            summary.optimized_count,
            summary.failure_count()
        );
        summary
    }
}
