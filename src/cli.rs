use crate::config::LogFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the scheduler and execute a cycle on every schedule tick
    Run {
        /// Also run one cycle immediately at startup
        #[arg(long, env = "RUN_NOW")]
        run_now: bool,

        /// Lock file preventing two schedulers from running at once
        #[arg(long, default_value = "/tmp/markov_scheduler.lock")]
        lock_file: PathBuf,
    },

    /// Run a single cycle and exit
    Once,

    /// Print the prompt version lineage for a subject
    History {
        #[arg(long)]
        subject: i64,
    },

    /// Print the active stored insights for a subject
    Insights {
        #[arg(long)]
        subject: i64,
    },

    /// Install or replace the shared base template
    SetBaseTemplate {
        /// File holding the template text
        #[arg(long)]
        file: PathBuf,

        /// Logical name; defaults to --base-template-name
        #[arg(long)]
        name: Option<String>,
    },

    /// Print the most recent cycle runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Settings shared by every subcommand
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Pipeline database, as a file path or `sqlite://` URL
    #[arg(long = "database-url", env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// API key for the generative model
    #[arg(long = "google-api-key", env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub model_api_key: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "MODEL_API_BASE")]
    pub model_api_base: Option<String>,

    /// Model used for extraction and optimization
    #[arg(long, env = "MODEL_NAME", default_value = "gemini-2.0-flash")]
    pub model: String,

    /// Cron expression for the nightly cycle
    #[arg(long, env = "CRON_SCHEDULE", default_value = "0 23 * * *")]
    pub cron_schedule: String,

    /// How far back each cycle looks for conversation turns
    #[arg(long, env = "ANALYSIS_LOOKBACK_HOURS", default_value_t = 24)]
    pub analysis_lookback_hours: i64,

    /// Minimum insights a subject needs before its prompt is rewritten
    #[arg(
        long,
        env = "MIN_CONVERSATIONS_FOR_OPTIMIZATION",
        default_value_t = 5
    )]
    pub min_conversations_for_optimization: usize,

    /// Quality score threshold for optimized prompts (not applied yet)
    #[arg(long, env = "OPTIMIZATION_THRESHOLD_SCORE", default_value_t = 7.0)]
    pub optimization_threshold_score: f64,

    /// Iteration cap for prompt rewrites (not applied yet)
    #[arg(long, env = "MAX_PROMPT_ITERATIONS", default_value_t = 3)]
    pub max_prompt_iterations: u32,

    /// Logical name of the shared base template
    #[arg(long, env = "BASE_TEMPLATE_NAME", default_value = "eva_base_v2")]
    pub base_template_name: String,

    /// Maximum subjects processed concurrently
    #[arg(long, env = "MAX_CONCURRENT_SUBJECTS", default_value_t = 4)]
    pub max_concurrent_subjects: usize,

    /// Seconds before a model call is abandoned
    #[arg(long, default_value_t = 60)]
    pub model_timeout_secs: u64,

    /// Seconds to wait for a database connection or lock
    #[arg(long, default_value_t = 10)]
    pub db_timeout_secs: u64,

    /// Maximum pooled database connections
    #[arg(long, default_value_t = 25)]
    pub db_max_connections: u32,

    /// Idle connections the pool keeps open
    #[arg(long, default_value_t = 5)]
    pub db_min_idle: u32,

    /// Seconds an idle connection is kept before being reaped
    #[arg(long, default_value_t = 60)]
    pub db_idle_timeout_secs: u64,

    /// Seconds before a connection is recycled
    #[arg(long, default_value_t = 300)]
    pub db_max_lifetime_secs: u64,

    #[arg(long, default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0.95)]
    pub top_p: f32,

    #[arg(long, default_value_t = 40)]
    pub top_k: u32,

    #[arg(long, default_value_t = 2048)]
    pub max_tokens: u32,

    /// Timezone for transcript clock times and the schedule
    /// (e.g., "America/Sao_Paulo"). Defaults to the system timezone.
    #[arg(long, env = "TIMEZONE")]
    pub timezone: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Deployment environment tag attached to every log line
    #[arg(long = "env", env = "ENV", default_value = "development")]
    pub environment: String,
}
