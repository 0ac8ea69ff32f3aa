//! Reels: content scheduling and generation daemon
//!
//! Main binary with subcommands:
//! - `daemon`: Resume stored items and run the pipeline until interrupted
//! - `post`: Add one item and run it until it is scheduled or settled
//! - `list`: Show stored items
//! - `cancel` / `edit` / `retry`: Manage a single stored item

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reels_scheduler::{ItemState, OrchestratorConfig, RetryPolicy};

mod backends;
mod commands;
mod daemon;

/// Parse an RFC 3339 timestamp into UTC.
fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

#[derive(Parser)]
#[command(name = "reels")]
#[command(about = "Schedule, generate and publish short-form videos", long_about = None)]
struct Cli {
    /// Item store file (defaults to the platform data directory)
    #[arg(long, global = true, env = "REELS_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Pipeline tuning shared by every command that runs the orchestrator.
#[derive(Args, Debug, Clone)]
struct Tuning {
    /// Concurrent generation workers
    #[arg(long, env = "REELS_GEN_WORKERS", default_value = "2")]
    gen_workers: usize,

    /// Pending generation requests before intake waits
    #[arg(long, env = "REELS_GEN_QUEUE_SIZE", default_value = "64")]
    gen_queue_size: usize,

    /// Retries for transient generation errors
    #[arg(long, env = "REELS_GEN_RETRIES", default_value = "3")]
    gen_retries: u32,

    /// Concurrent publish calls across all accounts
    #[arg(long, env = "REELS_PUBLISH_WORKERS", default_value = "4")]
    publish_workers: usize,

    /// Retries for transient or rate-limited publish errors
    #[arg(long, env = "REELS_PUBLISH_RETRIES", default_value = "5")]
    publish_retries: u32,

    /// First retry delay in milliseconds
    #[arg(long, env = "REELS_BASE_DELAY_MS", default_value = "500")]
    base_delay_ms: u64,

    /// Backoff multiplier between retries
    #[arg(long, env = "REELS_BACKOFF_FACTOR", default_value = "2.0")]
    backoff_factor: f64,

    /// Longest retry delay in milliseconds
    #[arg(long, env = "REELS_MAX_DELAY_MS", default_value = "30000")]
    max_delay_ms: u64,

    /// Scheduler polling interval in milliseconds
    #[arg(long, env = "REELS_TICK_MS", default_value = "1000")]
    tick_ms: u64,

    /// Hard limit on a single backend or publish call, in seconds
    #[arg(long, env = "REELS_CALL_TIMEOUT_SECS", default_value = "30")]
    call_timeout_secs: u64,

    /// Caption for uploads that arrive without one
    #[arg(long, env = "REELS_DEFAULT_CAPTION")]
    default_caption: Option<String>,

    /// Simulated latency of the demo backend and publisher, in milliseconds
    #[arg(long, env = "REELS_DEMO_LATENCY_MS", default_value = "1500")]
    demo_latency_ms: u64,
}

impl Tuning {
    fn retry(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    fn to_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        let call_timeout = Duration::from_secs(self.call_timeout_secs);

        config.generation.workers = self.gen_workers;
        config.generation.queue_size = self.gen_queue_size;
        config.generation.call_timeout = call_timeout;
        config.generation.retry = self.retry(self.gen_retries);

        config.publish.workers = self.publish_workers;
        config.publish.call_timeout = call_timeout;
        config.publish.retry = self.retry(self.publish_retries);

        config.scheduler.tick_interval = Duration::from_millis(self.tick_ms);

        if let Some(caption) = &self.default_caption {
            config.default_caption = caption.clone();
        }
        config
    }

    fn demo_latency(&self) -> Duration {
        Duration::from_millis(self.demo_latency_ms)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Resume stored items and run the pipeline until Ctrl-C
    Daemon {
        #[command(flatten)]
        tuning: Tuning,
    },

    /// Add one item and run it until it is scheduled, published or failed
    #[command(group(clap::ArgGroup::new("source").required(true).args(["media", "prompt"])))]
    Post {
        /// Reference to already-uploaded media
        #[arg(long)]
        media: Option<String>,

        /// Generate the video from this prompt instead
        #[arg(long)]
        prompt: Option<String>,

        /// Caption text
        #[arg(long)]
        caption: Option<String>,

        /// Hashtags, comma or space separated
        #[arg(long)]
        hashtags: Option<String>,

        /// Have the backend write the caption and hashtags
        #[arg(long)]
        generate_caption: bool,

        /// Account to post to
        #[arg(long, env = "REELS_ACCOUNT")]
        account: Option<String>,

        /// Publish time (RFC 3339)
        #[arg(long, value_parser = parse_time, conflicts_with = "in_secs")]
        at: Option<DateTime<Utc>>,

        /// Publish this many seconds from now
        #[arg(long)]
        in_secs: Option<u64>,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// List stored items
    List {
        /// Only items in this state (e.g. scheduled, failed)
        #[arg(long)]
        state: Option<ItemState>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Cancel a pending item
    Cancel {
        /// Item id
        id: String,
    },

    /// Change the caption or hashtags of a scheduled item
    Edit {
        /// Item id
        id: String,

        /// New caption
        #[arg(long)]
        caption: Option<String>,

        /// New hashtags, comma or space separated
        #[arg(long)]
        hashtags: Option<String>,
    },

    /// Send a failed item back through the pipeline
    Retry {
        /// Item id
        id: String,

        #[command(flatten)]
        tuning: Tuning,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "reels=info,reels_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let store_path = cli.store.unwrap_or_else(daemon::default_store_path);

    match cli.command {
        Commands::Daemon { tuning } => {
            daemon::run(daemon::DaemonConfig {
                store_path,
                orchestrator: tuning.to_config(),
                demo_latency: tuning.demo_latency(),
            })
            .await
        }

        Commands::Post {
            media,
            prompt,
            caption,
            hashtags,
            generate_caption,
            account,
            at,
            in_secs,
            tuning,
        } => {
            let scheduled_at = at.or_else(|| {
                in_secs.map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64))
            });
            commands::post(
                &store_path,
                &tuning,
                commands::PostArgs {
                    media,
                    prompt,
                    caption,
                    hashtags,
                    generate_caption,
                    account,
                    scheduled_at,
                },
            )
            .await
        }

        Commands::List { state, json } => commands::list(&store_path, state, json).await,

        Commands::Cancel { id } => commands::cancel(&store_path, &id).await,

        Commands::Edit {
            id,
            caption,
            hashtags,
        } => commands::edit(&store_path, &id, caption, hashtags).await,

        Commands::Retry { id, tuning } => commands::retry(&store_path, &tuning, &id).await,
    }
}
