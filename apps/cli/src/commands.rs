//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use patchscout_core::{
    Collaborators, ConcurrencyLimiter, FrontierStore, GuardReason, KeywordScorer, MemoryFrontier,
    Orchestrator, ProgressReporter, ReprocessOptions, RunConfig, RunReport, SavePipeline,
    StopSignal, StorageSink, seed,
};
use patchscout_crawler::{HttpFetcher, PageFetcher};
use patchscout_shared::{
    AppConfig, RelevanceDecision, RunStats, Topic, init_config, load_config, new_id,
};
use patchscout_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PatchScout: discover and save content cited by encyclopedia pages.
#[derive(Parser)]
#[command(
    name = "patchscout",
    version,
    about = "Crawl citations from encyclopedia pages and save the relevant ones per topic.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Manage topics.
    Topic {
        #[command(subcommand)]
        action: TopicAction,
    },

    /// Queue seed URLs for a topic.
    Seed {
        /// Topic handle.
        #[arg(long)]
        patch: String,

        /// URLs to queue.
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Run the crawl loop for a topic.
    Crawl {
        /// Topic handle.
        #[arg(long)]
        patch: String,

        /// Wall-clock budget (defaults to config).
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Maximum candidates to process (defaults to config).
        #[arg(long)]
        max_candidates: Option<usize>,

        /// Fetch, extract, and score without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Decide undecided citations of a topic.
    Reprocess {
        /// Topic handle.
        #[arg(long)]
        patch: String,

        /// Maximum citations to process.
        #[arg(long, default_value = "50")]
        limit: u32,

        /// List what would be processed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask a running crawl of a topic to stop.
    Stop {
        /// Topic handle.
        #[arg(long)]
        patch: String,
    },

    /// Show citation decisions, saved content, and the last run of a topic.
    Status {
        /// Topic handle.
        #[arg(long)]
        patch: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Topic subcommands.
#[derive(Subcommand)]
pub(crate) enum TopicAction {
    /// Create a topic.
    Add {
        /// Short unique handle.
        #[arg(long)]
        handle: String,

        /// Display title, used for relevance scoring.
        #[arg(long)]
        title: String,

        /// Alternative names (repeatable).
        #[arg(long = "alias")]
        aliases: Vec<String>,

        /// Tags (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List all topics.
    List,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "patchscout=info",
        1 => "patchscout=debug",
        _ => "patchscout=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Topic { action } => match action {
            TopicAction::Add {
                handle,
                title,
                aliases,
                tags,
            } => cmd_topic_add(handle, title, aliases, tags).await,
            TopicAction::List => cmd_topic_list().await,
        },
        Command::Seed { patch, urls } => cmd_seed(&patch, &urls).await,
        Command::Crawl {
            patch,
            duration_secs,
            max_candidates,
            dry_run,
        } => cmd_crawl(&patch, duration_secs, max_candidates, dry_run).await,
        Command::Reprocess {
            patch,
            limit,
            dry_run,
        } => cmd_reprocess(&patch, limit, dry_run).await,
        Command::Stop { patch } => cmd_stop(&patch).await,
        Command::Status { patch } => cmd_status(&patch).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load and validate the config, then open the database.
async fn open(readonly: bool) -> Result<(AppConfig, Arc<Storage>)> {
    let config = load_config()?;
    config.validate()?;
    let path = config.database_path()?;
    let storage = if readonly {
        if !path.exists() {
            return Err(eyre!(
                "no database at {} yet; create a topic with `patchscout topic add`",
                path.display()
            ));
        }
        Storage::open_readonly(&path).await?
    } else {
        Storage::open(&path).await?
    };
    Ok((config, Arc::new(storage)))
}

async fn resolve_topic(storage: &Storage, handle: &str) -> Result<Topic> {
    storage
        .get_topic_by_handle(handle)
        .await?
        .ok_or_else(|| eyre!("no topic with handle '{handle}' (see `patchscout topic list`)"))
}

fn print_stats(stats: &RunStats) {
    println!("  Fetched:   {}", stats.fetched);
    println!("  Enqueued:  {}", stats.enqueued);
    println!("  Deduped:   {}", stats.deduped);
    println!("  Skipped:   {}", stats.skipped);
    println!("  Extracted: {}", stats.extracted);
    println!("  Persisted: {}", stats.persisted);
    println!("  Errors:    {}", stats.errors);
    println!("  Time:      {:.1}s", stats.duration_seconds);
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_topic_add(
    handle: String,
    title: String,
    aliases: Vec<String>,
    tags: Vec<String>,
) -> Result<()> {
    let (_, storage) = open(false).await?;
    if storage.get_topic_by_handle(&handle).await?.is_some() {
        return Err(eyre!("topic '{handle}' already exists"));
    }
    let topic = Topic {
        id: new_id(),
        handle,
        title,
        aliases,
        tags,
    };
    storage.insert_topic(&topic).await?;
    info!(handle = %topic.handle, id = %topic.id, "topic created");
    println!("Created topic '{}' ({})", topic.handle, topic.id);
    Ok(())
}

async fn cmd_topic_list() -> Result<()> {
    let (_, storage) = open(true).await?;
    let topics = storage.list_topics().await?;
    if topics.is_empty() {
        println!("No topics yet. Create one with `patchscout topic add`.");
        return Ok(());
    }
    for topic in topics {
        if topic.aliases.is_empty() {
            println!("  {:<20} {}", topic.handle, topic.title);
        } else {
            println!(
                "  {:<20} {} (aka {})",
                topic.handle,
                topic.title,
                topic.aliases.join(", ")
            );
        }
    }
    Ok(())
}

async fn cmd_seed(handle: &str, urls: &[String]) -> Result<()> {
    let (_, storage) = open(false).await?;
    let topic = resolve_topic(&storage, handle).await?;
    let report = seed(storage.as_ref(), &topic.id, urls).await?;
    println!("Queued {} seed URL(s) for '{handle}'", report.accepted);
    for rejected in &report.rejected {
        println!("  skipped invalid URL: {rejected}");
    }
    Ok(())
}

async fn cmd_crawl(
    handle: &str,
    duration_secs: Option<u64>,
    max_candidates: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let (config, storage) = open(dry_run).await?;
    let topic = resolve_topic(&storage, handle).await?;

    let frontier: Arc<dyn FrontierStore> = if dry_run {
        let snapshot = storage.frontier_snapshot(&topic.id).await?;
        info!(queued = snapshot.len(), "dry run on a copy of the frontier");
        Arc::new(MemoryFrontier::from_candidates(&topic.id, snapshot))
    } else {
        storage.clone()
    };
    let stop: Arc<dyn StopSignal> = storage.clone();
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(&config.fetch)?);

    let orchestrator = Orchestrator::new(
        Collaborators {
            storage: Arc::clone(&storage),
            frontier,
            stop,
            fetcher,
            scorer: Arc::new(KeywordScorer::new()),
        },
        &config,
    )?;

    let run = RunConfig {
        topic,
        duration: Duration::from_secs(duration_secs.unwrap_or(config.defaults.duration_secs)),
        max_candidates: max_candidates.unwrap_or(config.defaults.max_candidates),
        dry_run,
    };

    let reporter = CliProgress::new();
    let report = orchestrator.run(&run, &reporter).await?;

    println!();
    if dry_run {
        println!("  Dry run {:?} (nothing written)", report.outcome);
    } else {
        println!("  Crawl {:?}", report.outcome);
    }
    if let Some(run_id) = &report.run_id {
        println!("  Run:       {run_id}");
    }
    print_stats(&report.stats);
    println!();
    Ok(())
}

async fn cmd_reprocess(handle: &str, limit: u32, dry_run: bool) -> Result<()> {
    let (config, storage) = open(dry_run).await?;
    let topic = resolve_topic(&storage, handle).await?;
    let pending = storage.list_undecided_citations(&topic.id, limit).await?;

    if dry_run {
        println!("{} citation(s) would be processed:", pending.len());
        for citation in &pending {
            let attempts = if citation.fetch_attempts > 0 {
                format!(" ({} failed fetches)", citation.fetch_attempts)
            } else {
                String::new()
            };
            println!("  {}{attempts}", citation.citation_url);
        }
        return Ok(());
    }

    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(&config.fetch)?);
    let pipeline = SavePipeline::new(
        Arc::clone(&storage),
        fetcher,
        Arc::new(KeywordScorer::new()),
        Arc::new(StorageSink::new(Arc::clone(&storage), topic.id.clone())),
        config.relevance.clone(),
    );
    let options = ReprocessOptions {
        topic_name: topic.title.clone(),
        topic_handle: topic.handle.clone(),
        aliases: topic.aliases.clone(),
        save_as_content: true,
        save_as_memory: config.relevance.save_as_memory,
    };
    let limiter = ConcurrencyLimiter::new(config.fetch.concurrency);
    let ids: Vec<String> = pending.into_iter().map(|c| c.id).collect();

    let spinner = CliProgress::new();
    spinner.spinner.set_message(format!("Reprocessing {} citation(s)", ids.len()));
    let report = pipeline.reprocess_batch(&ids, &options, &limiter).await;
    spinner.spinner.finish_and_clear();

    println!();
    println!("  Processed: {}", report.processed);
    println!("  Saved:     {}", report.saved);
    println!("  Failed:    {}", report.failed);
    println!("  Pending:   {}", ids.len() - report.processed - report.failed);
    println!();
    Ok(())
}

async fn cmd_stop(handle: &str) -> Result<()> {
    let (_, storage) = open(false).await?;
    let topic = resolve_topic(&storage, handle).await?;
    storage.request_stop(&topic.id).await?;
    println!("Stop requested for '{handle}'; the running crawl ends after its current candidate.");
    Ok(())
}

async fn cmd_status(handle: &str) -> Result<()> {
    let (_, storage) = open(true).await?;
    let topic = resolve_topic(&storage, handle).await?;

    let counts = storage.count_citations_by_decision(&topic.id).await?;
    let content = storage.count_content(&topic.id).await?;
    let queued = storage.frontier_len(&topic.id).await?;
    let stop = storage.is_stop_requested(&topic.id).await?;

    println!();
    println!("  Topic:     {} ({})", topic.title, topic.handle);
    println!("  Queued:    {queued}");
    println!("  Content:   {content}");
    println!("  Citations:");
    println!("    undecided      {}", counts.undecided);
    println!("    saved          {}", counts.saved);
    println!("    denied         {}", counts.denied);
    println!("    denied_verify  {}", counts.denied_verify);
    println!("    internal       {}", counts.internal);
    if stop {
        println!("  Stop requested");
    }

    match storage.last_crawl_run(&topic.id).await? {
        Some(run) => {
            println!(
                "  Last run:  {} ({})",
                run.started_at.to_rfc3339(),
                run.outcome.as_deref().unwrap_or("running")
            );
            if let Some(json) = run.stats_json {
                let stats: RunStats = serde_json::from_str(&json)?;
                print_stats(&stats);
            }
        }
        None => println!("  Last run:  never"),
    }

    let recent = storage
        .list_citations_by_decision(&topic.id, RelevanceDecision::Saved)
        .await?;
    if !recent.is_empty() {
        println!("  Saved citations:");
        for citation in recent.iter().rev().take(10) {
            let score = citation.ai_priority_score.unwrap_or_default();
            println!("    [{score:>3}] {}", citation.citation_url);
        }
    }
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn page_fetched(&self, url: &str, stats: &RunStats) {
        self.spinner.set_message(format!(
            "[{} fetched, {} queued, {} saved] {url}",
            stats.fetched, stats.enqueued, stats.persisted
        ));
    }

    fn requeued(&self, url: &str, reason: GuardReason) {
        self.spinner.set_message(format!("Holding back ({reason}) {url}"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
