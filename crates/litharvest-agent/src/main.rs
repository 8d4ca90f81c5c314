//! litharvest — bulk bibliographic metadata harvester.
//! Entry point for the CLI binary.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use litharvest_common::RecordSource;
use litharvest_db::{Database, InMemoryRecordStore, PgRecordRepository, RecordStore};
use litharvest_ingestion::{
    run_pipeline, ArxivClient, HarvestJob, MetadataSource, PubMedClient, SortOrder, WindowOrder, WindowSpan,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "litharvest", version, about = "Harvest PubMed and arXiv metadata into PostgreSQL")]
struct Cli {
    /// Config file (default: $LITHARVEST_CONFIG, then ./litharvest.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest records until the store holds the target count
    Harvest(HarvestArgs),
    /// Print stored record statistics
    Count,
    /// List records not yet handed to the downstream indexer
    PendingSync {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Stamp the listed records as synced
        #[arg(long)]
        mark: bool,
    },
}

#[derive(Args)]
struct HarvestArgs {
    #[arg(long, value_enum, default_value_t = SourceArg::Pubmed)]
    source: SourceArg,
    /// Stop once the store holds this many records
    #[arg(long)]
    target: Option<u64>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// First publication date (YYYY-MM-DD)
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Last publication date (YYYY-MM-DD, default: today)
    #[arg(long)]
    end: Option<NaiveDate>,
    /// Provider query (PubMed term or arXiv search_query syntax). Repeat to
    /// run several queries in order until the target is met.
    #[arg(long = "query")]
    queries: Vec<String>,
    /// Window width, e.g. 1m, 3m, 14d
    #[arg(long)]
    span: Option<WindowSpan>,
    #[arg(long, value_enum)]
    order: Option<OrderArg>,
    #[arg(long, value_enum)]
    sort: Option<SortArg>,
    /// Fetch full text for every stored record
    #[arg(long)]
    enrich: bool,
    /// Harvest into an in-memory store; nothing is written to the database
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Pubmed,
    Arxiv,
}

impl From<SourceArg> for RecordSource {
    fn from(s: SourceArg) -> Self {
        match s {
            SourceArg::Pubmed => RecordSource::PubMed,
            SourceArg::Arxiv => RecordSource::Arxiv,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Chronological,
    MostRecentFirst,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Relevance,
    Date,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries the JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("litharvest=debug,info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    info!("litharvest {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Harvest(args) => harvest(&config, args).await,
        Command::Count => count(&config).await,
        Command::PendingSync { limit, mark } => pending_sync(&config, limit, mark).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<Database> {
    info!("Connecting to PostgreSQL...");
    let db = Database::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    db.initialize().await.context("Failed to initialize schema")?;
    Ok(db)
}

fn build_job(config: &Config, args: &HarvestArgs) -> anyhow::Result<HarvestJob> {
    let h = &config.harvest;
    let end_date = args.end.unwrap_or_else(|| chrono::Utc::now().date_naive());
    let start_date = match args.start {
        Some(start) => start,
        None => h.start_date(end_date)?,
    };

    Ok(HarvestJob {
        target: args.target.unwrap_or(h.target),
        batch_size: args.batch_size.unwrap_or(h.batch_size),
        start_date,
        end_date,
        queries: if args.queries.is_empty() { h.queries.clone() } else { args.queries.clone() },
        span: args.span.unwrap_or(h.span),
        order: match args.order {
            Some(OrderArg::Chronological) => WindowOrder::Chronological,
            Some(OrderArg::MostRecentFirst) => WindowOrder::MostRecentFirst,
            None => h.order,
        },
        sort: match args.sort {
            Some(SortArg::Relevance) => SortOrder::Relevance,
            Some(SortArg::Date) => SortOrder::Date,
            None => h.sort,
        },
        max_consecutive_failures: h.max_consecutive_failures,
        pacing_delay_ms: h.pacing_delay_ms,
        enrich_full_text: args.enrich || h.enrich_full_text,
    })
}

fn build_source(config: &Config, source: RecordSource) -> anyhow::Result<Box<dyn MetadataSource>> {
    let retry = config.retry_policy()?;
    Ok(match source {
        RecordSource::PubMed => {
            let settings = config.pubmed_settings()?;
            if settings.email.is_none() {
                warn!("pubmed.email is not set; NCBI asks every client to identify itself");
            }
            Box::new(PubMedClient::new(settings, retry)?)
        }
        RecordSource::Arxiv => Box::new(ArxivClient::new(config.arxiv_settings()?, retry)?),
    })
}

async fn harvest(config: &Config, args: HarvestArgs) -> anyhow::Result<()> {
    let job = build_job(config, &args)?;
    let source = build_source(config, args.source.into())?;

    let store: Arc<dyn RecordStore> = if args.dry_run {
        info!("Dry run: records are kept in memory only");
        Arc::new(InMemoryRecordStore::new())
    } else {
        let db = connect(config).await?;
        Arc::new(PgRecordRepository::new(db.pool().clone()))
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current batch");
            on_signal.cancel();
        }
    });

    match run_pipeline(&job, source.as_ref(), store, cancel).await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure.summary)?);
            Err(anyhow::Error::new(failure.error).context("Harvest aborted"))
        }
    }
}

async fn count(config: &Config) -> anyhow::Result<()> {
    let db = connect(config).await?;
    let stats = db.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn pending_sync(config: &Config, limit: usize, mark: bool) -> anyhow::Result<()> {
    let db = connect(config).await?;
    let repo = PgRecordRepository::new(db.pool().clone());

    let pending = repo.records_lacking_downstream_sync(limit).await?;
    for row in &pending {
        println!("{}\t{}\t{}", row.id, row.record.natural_key, row.record.title);
    }
    info!("{} records awaiting downstream sync", pending.len());

    if mark && !pending.is_empty() {
        let ids: Vec<_> = pending.iter().map(|r| r.id).collect();
        let marked = repo.mark_synced(&ids).await?;
        info!("Marked {marked} records as synced");
    }
    Ok(())
}
