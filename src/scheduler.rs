use crate::error::PipelineError;
use crate::pipeline::{Pipeline, RunSummary};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A cron expression evaluated in the configured timezone.
#[derive(Debug, Clone)]
pub struct CycleSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CycleSchedule {
    /// Accepts the classic five-field form (`min hour dom mon dow`) as well
    /// as the six/seven-field form with leading seconds.
    pub fn parse(expression: &str, timezone: Tz) -> Result<Self, PipelineError> {
        let fields = expression.split_whitespace().count();
        let normalized = if fields == 5 {
            format!("0 {}", expression.trim())
        } else {
            expression.trim().to_string()
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            PipelineError::Configuration(format!(
                "invalid cron schedule '{}': {}",
                expression, e
            ))
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.timezone))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

fn report(summary: &RunSummary) {
    if let Some(fatal) = &summary.fatal {
        error!("Cycle aborted ({}): {}", fatal.kind(), fatal);
        return;
    }
    let (insights, optimized) = summary.counts();
    info!(
        "Cycle complete: {} insights, {} prompts optimized, {} of {} subjects failed",
        insights,
        optimized,
        summary.failure_count(),
        summary.subjects_seen
    );
}

/// Run cycles on the schedule until the pipeline's shutdown token fires.
/// Cycles run one after another; a fire time that passes while a cycle is
/// still running is skipped.
pub async fn run_scheduler(
    pipeline: Arc<Pipeline>,
    schedule: CycleSchedule,
    run_now: bool,
) {
    let shutdown = pipeline.shutdown_token().clone();
    info!(
        "Scheduler started with '{}' ({})",
        schedule.expression(),
        schedule.timezone
    );

    if run_now && !shutdown.is_cancelled() {
        info!("Running cycle immediately");
        report(&pipeline.run_cycle().await);
    }

    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            warn!("Schedule '{}' has no upcoming runs", schedule.expression());
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!("Next cycle at {}", next);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        report(&pipeline.run_cycle().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::cycle_runs::recent_cycle_runs;
    use crate::openai::fake::FakeOpenAIClient;
    use crate::test_utils::{new_test_db, seed_base_template};
    use chrono::TimeZone;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn five_field_expression_fires_at_local_time() {
        let schedule = CycleSchedule::parse("0 23 * * *", chrono_tz::UTC).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap())
        );

        let sao_paulo =
            CycleSchedule::parse("0 23 * * *", chrono_tz::America::Sao_Paulo)
                .unwrap();
        assert_eq!(
            sao_paulo.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn six_field_expression_is_used_as_is() {
        let schedule =
            CycleSchedule::parse("30 0 6 * * *", chrono_tz::UTC).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 6, 0, 30).unwrap())
        );
    }

    #[test]
    fn invalid_expression_is_a_configuration_error() {
        let err = CycleSchedule::parse("every night", chrono_tz::UTC).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn run_now_then_stops_on_shutdown() -> anyhow::Result<()> {
        let db = new_test_db()?;
        seed_base_template(&db.pool, "eva_base_v2", "base")?;
        let shutdown = CancellationToken::new();
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(Settings::for_testing(db.file.path())),
            db.pool.clone(),
            Arc::new(FakeOpenAIClient::new()),
            shutdown.clone(),
        ));
        let schedule = CycleSchedule::parse("0 23 * * *", chrono_tz::UTC)?;

        let handle =
            tokio::spawn(run_scheduler(pipeline.clone(), schedule, true));
        // Wait for the immediate cycle to be recorded, then stop.
        for _ in 0..200 {
            if !recent_cycle_runs(&db.pool, 1)?.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await??;

        assert_eq!(recent_cycle_runs(&db.pool, 10)?.len(), 1);
        Ok(())
    }
}
