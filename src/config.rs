//! Immutable runtime settings, validated once at startup and handed to every
//! component constructor.

use crate::cli::CommonArgs;
use crate::error::PipelineError;
use crate::openai::GenerationParams;
use crate::time_util;
use chrono_tz::Tz;
use clap::ValueEnum;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One year of history.
pub const MAX_LOOKBACK_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Indented span tree for humans
    Tree,
    /// One JSON object per line
    Json,
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: u32,
    pub min_idle: Option<u32>,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub connection_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 25,
            min_idle: Some(5),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub model_api_key: Secret,
    pub model_api_base: Option<String>,
    pub model: String,
    pub cron_schedule: String,
    pub analysis_lookback_hours: i64,
    pub min_insights_for_optimization: usize,
    /// Carried for operators; no optimization decision reads it.
    pub optimization_threshold_score: f64,
    /// Carried for operators; no optimization decision reads it.
    pub max_prompt_iterations: u32,
    pub base_template_name: String,
    pub max_concurrent_subjects: usize,
    pub model_timeout: Duration,
    pub generation: GenerationParams,
    pub timezone: Tz,
    pub pool: PoolSettings,
    pub log_level: String,
    pub log_format: LogFormat,
    pub environment: String,
}

fn required(
    value: Option<String>,
    name: &str,
) -> Result<String, PipelineError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PipelineError::Configuration(format!("{} is required", name))),
    }
}

/// Accepts a bare file path or a `sqlite:` URL. Any other scheme is a
/// database this pipeline cannot open.
fn sqlite_path(database_url: &str) -> Result<PathBuf, PipelineError> {
    let database_url = database_url.trim();
    let path = match database_url.split_once("://") {
        Some(("sqlite", path)) => path,
        Some((scheme, _)) => {
            return Err(PipelineError::Configuration(format!(
                "DATABASE_URL scheme '{}' is not supported, use a file path or sqlite://",
                scheme
            )))
        }
        None => database_url.strip_prefix("sqlite:").unwrap_or(database_url),
    };
    if path.is_empty() {
        return Err(PipelineError::Configuration(
            "DATABASE_URL has an empty path".to_string(),
        ));
    }
    Ok(PathBuf::from(path))
}

impl Settings {
    pub fn from_args(args: &CommonArgs) -> Result<Self, PipelineError> {
        let database_url =
            required(args.database_url.clone(), "DATABASE_URL")?;
        let database_path = sqlite_path(&database_url)?;
        let model_api_key =
            required(args.model_api_key.clone(), "GOOGLE_API_KEY")?;

        if args.analysis_lookback_hours <= 0
            || args.analysis_lookback_hours > MAX_LOOKBACK_HOURS
        {
            return Err(PipelineError::Configuration(format!(
                "ANALYSIS_LOOKBACK_HOURS must be between 1 and {}",
                MAX_LOOKBACK_HOURS
            )));
        }
        if args.min_conversations_for_optimization == 0 {
            return Err(PipelineError::Configuration(
                "MIN_CONVERSATIONS_FOR_OPTIMIZATION must be at least 1"
                    .to_string(),
            ));
        }
        if args.max_concurrent_subjects == 0 {
            return Err(PipelineError::Configuration(
                "MAX_CONCURRENT_SUBJECTS must be at least 1".to_string(),
            ));
        }
        if args.db_max_connections == 0 {
            return Err(PipelineError::Configuration(
                "db-max-connections must be at least 1".to_string(),
            ));
        }

        let db_timeout = Duration::from_secs(args.db_timeout_secs);

        Ok(Self {
            database_path,
            model_api_key: Secret::new(model_api_key),
            model_api_base: args.model_api_base.clone(),
            model: args.model.clone(),
            cron_schedule: args.cron_schedule.clone(),
            analysis_lookback_hours: args.analysis_lookback_hours,
            min_insights_for_optimization: args
                .min_conversations_for_optimization,
            optimization_threshold_score: args.optimization_threshold_score,
            max_prompt_iterations: args.max_prompt_iterations,
            base_template_name: args.base_template_name.clone(),
            max_concurrent_subjects: args.max_concurrent_subjects,
            model_timeout: Duration::from_secs(args.model_timeout_secs),
            generation: GenerationParams {
                temperature: args.temperature,
                top_p: args.top_p,
                top_k: args.top_k,
                max_tokens: args.max_tokens,
                response_schema: None,
            },
            timezone: time_util::get_local_timezone(args.timezone.as_deref()),
            pool: PoolSettings {
                max_size: args.db_max_connections,
                min_idle: Some(args.db_min_idle.min(args.db_max_connections)),
                idle_timeout: Duration::from_secs(args.db_idle_timeout_secs),
                max_lifetime: Duration::from_secs(args.db_max_lifetime_secs),
                connection_timeout: db_timeout,
                busy_timeout: db_timeout,
            },
            log_level: args.log_level.clone(),
            log_format: args.log_format,
            environment: args.environment.clone(),
        })
    }

    // Settings for tests: UTC clock, small pool, short timeouts
    pub fn for_testing(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            model_api_key: Secret::new("test-key"),
            model_api_base: None,
            model: "gemini-test".to_string(),
            cron_schedule: "0 23 * * *".to_string(),
            analysis_lookback_hours: 24,
            min_insights_for_optimization: 5,
            optimization_threshold_score: 7.0,
            max_prompt_iterations: 3,
            base_template_name: "eva_base_v2".to_string(),
            max_concurrent_subjects: 3,
            model_timeout: Duration::from_secs(5),
            generation: GenerationParams::default(),
            timezone: chrono_tz::UTC,
            pool: PoolSettings {
                max_size: 8,
                min_idle: Some(1),
                connection_timeout: Duration::from_secs(5),
                busy_timeout: Duration::from_secs(5),
                ..PoolSettings::default()
            },
            log_level: "debug".to_string(),
            log_format: LogFormat::Tree,
            environment: "test".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use clap::Parser;

    fn parse(extra: &[&str]) -> CommonArgs {
        let mut argv = vec!["markov_scheduler"];
        argv.extend_from_slice(extra);
        argv.push("once");
        Args::try_parse_from(argv).unwrap().common
    }

    #[test]
    fn missing_database_url_is_a_configuration_error() {
        let mut args = parse(&["--google-api-key", "k"]);
        args.database_url = None;
        let err = Settings::from_args(&args).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("DATABASE_URL"), "{}", err);
    }

    #[test]
    fn missing_model_key_is_a_configuration_error() {
        let mut args = parse(&["--database-url", "/tmp/x.db"]);
        args.model_api_key = Some("   ".to_string());
        let err = Settings::from_args(&args).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("GOOGLE_API_KEY"), "{}", err);
    }

    #[test]
    fn valid_args_build_settings() {
        let args = parse(&[
            "--database-url",
            "/tmp/x.db",
            "--google-api-key",
            "k",
            "--timezone",
            "America/Sao_Paulo",
            "--top-k",
            "20",
        ]);
        let settings = Settings::from_args(&args).unwrap();
        assert_eq!(settings.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(settings.model_api_key.expose(), "k");
        assert_eq!(settings.timezone, chrono_tz::America::Sao_Paulo);
        assert_eq!(settings.generation.top_k, 20);
        assert_eq!(settings.pool.max_size, 25);
        assert_eq!(settings.pool.max_lifetime, Duration::from_secs(300));
        assert!(!format!("{:?}", settings).contains("\"k\""));
    }

    fn valid_args() -> CommonArgs {
        parse(&["--database-url", "/tmp/x.db", "--google-api-key", "k"])
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut args = valid_args();
        args.min_conversations_for_optimization = 0;
        assert!(Settings::from_args(&args).is_err());
    }

    #[test]
    fn lookback_must_stay_within_a_year() {
        let mut args = valid_args();
        args.analysis_lookback_hours = MAX_LOOKBACK_HOURS;
        assert!(Settings::from_args(&args).is_ok());

        for hours in [0, MAX_LOOKBACK_HOURS + 1, 3_000_000_000] {
            args.analysis_lookback_hours = hours;
            let err = Settings::from_args(&args).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{}", hours);
        }
    }

    #[test]
    fn database_url_accepts_paths_and_sqlite_urls() {
        assert_eq!(sqlite_path("/var/lib/markov.db").unwrap(), PathBuf::from("/var/lib/markov.db"));
        assert_eq!(
            sqlite_path("sqlite:///var/lib/markov.db").unwrap(),
            PathBuf::from("/var/lib/markov.db")
        );
        assert_eq!(sqlite_path("sqlite:markov.db").unwrap(), PathBuf::from("markov.db"));

        let err = sqlite_path("postgres://eva@localhost/eva").unwrap_err();
        assert!(err.to_string().contains("postgres"), "{}", err);
        assert!(sqlite_path("sqlite://").is_err());
    }
}
