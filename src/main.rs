use clap::{Args, Parser, Subcommand};
use milktea::logcat::LogLevel;
use milktea::query::{Direction, LogFilters, QueryCursor, TextMode};
use milktea::{BugreportService, CommandError, ParseSummary};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "milktea")]
#[command(about = "Android bugreport logcat indexer", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a bugreport and build (or reuse) its logcat index
    Parse { path: PathBuf },

    /// Print logcat stats, optionally filtered
    Stats {
        path: PathBuf,
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Page through logcat rows
    Query {
        path: PathBuf,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long)]
        backward: bool,
        /// Cursor JSON echoed from a previous response
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Jump to a time and page forward from the anchor
    Jump {
        path: PathBuf,
        /// Target time, `YYYY-MM-DD HH:MM:SS` or `HH:MM:SS`
        #[arg(long)]
        at: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Lower time bound, `YYYY-MM-DD HH:MM:SS` in the report timezone
    #[arg(long)]
    from: Option<String>,

    /// Upper time bound
    #[arg(long)]
    to: Option<String>,

    /// Level to include; repeatable
    #[arg(long = "level", value_parser = parse_level)]
    levels: Vec<LogLevel>,

    /// Tag filter, `|` separates OR alternatives
    #[arg(long)]
    tag: Option<String>,

    #[arg(long)]
    pid: Option<u32>,

    #[arg(long)]
    tid: Option<u32>,

    /// Message text to include
    #[arg(long)]
    text: Option<String>,

    /// Message text to exclude
    #[arg(long)]
    not_text: Option<String>,

    /// Treat --text as a regular expression
    #[arg(long)]
    regex: bool,

    #[arg(long)]
    case_sensitive: bool,
}

fn parse_level(raw: &str) -> Result<LogLevel, String> {
    raw.parse()
}

impl FilterArgs {
    fn into_filters(self) -> LogFilters {
        LogFilters {
            ts_from: self.from,
            ts_to: self.to,
            levels: if self.levels.is_empty() {
                None
            } else {
                Some(self.levels)
            },
            tag: self.tag,
            pid: self.pid,
            tid: self.tid,
            text: self.text,
            not_text: self.not_text,
            text_mode: if self.regex {
                Some(TextMode::Regex)
            } else {
                None
            },
            case_sensitive: if self.case_sensitive { Some(true) } else { None },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "milktea=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = milktea::config::load_or_default(cli.config.as_deref());
    let service = BugreportService::new(config);

    match cli.command {
        Commands::Parse { path } => {
            let summary = load(&service, path).await?;
            print_json(&summary)?;
        }
        Commands::Stats { path, filters } => {
            load(&service, path).await?;
            let stats = service.get_logcat_stats(filters.into_filters()).await?;
            print_json(&stats)?;
        }
        Commands::Query {
            path,
            filters,
            limit,
            backward,
            cursor,
        } => {
            load(&service, path).await?;
            let cursor = cursor
                .map(|raw| serde_json::from_str::<QueryCursor>(&raw))
                .transpose()
                .map_err(|err| format!("invalid cursor JSON: {err}"))?;
            let direction = if backward {
                Direction::Backward
            } else {
                Direction::Forward
            };
            let response = service
                .query_logcat_v2(filters.into_filters(), cursor, limit, direction)
                .await?;
            print_json(&response)?;
        }
        Commands::Jump {
            path,
            at,
            filters,
            limit,
        } => {
            load(&service, path).await?;
            let response = service
                .jump_to_time(filters.into_filters(), at, limit)
                .await?;
            print_json(&response)?;
        }
    }

    Ok(())
}

/// Parses the report while relaying progress events to the log.
async fn load(service: &BugreportService, path: PathBuf) -> Result<ParseSummary, CommandError> {
    let handle = service.parse_bugreport_streaming(path);
    let mut progress = handle.progress();

    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let event = progress.borrow_and_update().clone();
            tracing::info!(
                phase = ?event.phase,
                percent = format!("{:.1}", event.percent),
                rows = event.rows_processed,
                "parsing bugreport"
            );
        }
    });

    let summary = handle.wait().await;
    reporter.abort();
    summary
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
