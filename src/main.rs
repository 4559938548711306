use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zgjedhjet::aggregate::Aggregator;
use zgjedhjet::config::{self, ServiceConfig};
use zgjedhjet::error::ElectionError;
use zgjedhjet::import::{ImportOptions, Importer};
use zgjedhjet::index::IndexSynchronizer;
use zgjedhjet::models::{parse_filter, ResultFilter};
use zgjedhjet::opensearch::OpenSearchIndex;
use zgjedhjet::ranker::SuggestionRanker;
use zgjedhjet::sqlite::SqliteStore;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "zgjedhjet")]
#[command(about = "Import, aggregate and search election results")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv). RUST_LOG takes precedence when set
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// SQLite database holding the records and suggestion counters
    #[arg(long, global = true, env = "ZGJEDHJET_DB", default_value = config::DEFAULT_DB_PATH)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the dataset with the rows of a CSV file
    Import(ImportArgs),
    /// Per-party totals from the record store
    Results(FilterArgs),
    /// Push every stored record into the search index
    IndexSync(SearchArgs),
    /// Per-party totals from the search index
    Filter(FilterSearchArgs),
    /// Municipality names matching a prefix
    Suggest(SuggestArgs),
    /// Most suggested municipalities
    Stats(StatsArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// Path to the results CSV
    #[arg(short, long)]
    input: PathBuf,

    /// Parse and report without touching the database
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct FilterArgs {
    /// Ballot category, or TeGjitha for all
    #[arg(long)]
    kategoria: Option<String>,

    /// Municipality, or TeGjitha for all
    #[arg(long)]
    komuna: Option<String>,

    /// Exact polling center name
    #[arg(long)]
    qendra_e_votimit: Option<String>,

    /// Exact polling place
    #[arg(long)]
    vendvotimi: Option<String>,

    /// Report only this party column, or TeGjitha for all
    #[arg(long)]
    partia: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> Result<ResultFilter, ElectionError> {
        let invalid = |e: zgjedhjet::models::UnknownVariant| ElectionError::validation(e.to_string());
        Ok(ResultFilter {
            category: parse_filter(self.kategoria.as_deref()).map_err(invalid)?,
            municipality: parse_filter(self.komuna.as_deref()).map_err(invalid)?,
            polling_center: self.qendra_e_votimit.clone(),
            polling_place: self.vendvotimi.clone(),
            party: parse_filter(self.partia.as_deref()).map_err(invalid)?,
        })
    }
}

#[derive(Args)]
struct SearchArgs {
    /// OpenSearch endpoint
    #[arg(long, env = "OPENSEARCH_URL", default_value = config::DEFAULT_OPENSEARCH_URL)]
    opensearch_url: String,

    /// Search index name
    #[arg(long, default_value = config::INDEX_NAME)]
    index: String,
}

#[derive(Args)]
struct FilterSearchArgs {
    #[command(flatten)]
    search: SearchArgs,

    #[command(flatten)]
    filters: FilterArgs,
}

#[derive(Args)]
struct SuggestArgs {
    #[command(flatten)]
    search: SearchArgs,

    /// Municipality name prefix
    #[arg(short, long)]
    query: String,
}

#[derive(Args)]
struct StatsArgs {
    /// Number of municipalities to list
    #[arg(long, default_value_t = config::DEFAULT_TOP_K)]
    top: usize,
}

fn make_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb.set_message(msg.to_string());
    pb
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{out}");
    Ok(())
}

/// Print a service result. Internal detail only goes to the log.
fn report<T: Serialize>(result: Result<T, ElectionError>) -> Result<bool> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(true)
        }
        Err(e) => {
            error!(status = e.status_code(), error = %e, "Request failed");
            print_json(&json!({
                "status": e.status_code(),
                "message": e.public_message(),
            }))?;
            Ok(false)
        }
    }
}

struct Services {
    store: Arc<SqliteStore>,
    config: ServiceConfig,
}

impl Services {
    fn open(db: &Path) -> Result<Self> {
        let config = ServiceConfig::default();
        let store = SqliteStore::open(db)
            .with_context(|| format!("Failed to open database at {}", db.display()))?
            .with_transaction_timeout(config.store_timeout);
        Ok(Self {
            store: Arc::new(store),
            config,
        })
    }

    fn ranker(&self) -> Arc<SuggestionRanker> {
        Arc::new(SuggestionRanker::new(
            Arc::new(self.store.suggestion_cache()),
            self.config.suggestions_key.clone(),
            self.config.cache_timeout,
        ))
    }

    fn synchronizer(&self, args: &SearchArgs) -> Result<IndexSynchronizer> {
        let config = self.config.clone().with_index_name(&args.index);
        let index = OpenSearchIndex::new(&args.opensearch_url, &args.index, config.search_timeout)
            .with_context(|| format!("Failed to create OpenSearch client for {}", args.opensearch_url))?;
        Ok(IndexSynchronizer::new(
            self.store.clone(),
            Arc::new(index),
            self.ranker(),
            config,
        ))
    }
}

async fn run_command(cli: Cli) -> Result<bool> {
    let services = Services::open(&cli.db)?;

    match cli.command {
        Commands::Import(args) => {
            let importer = Importer::new(services.store.clone());
            let pb = make_spinner(&format!("Importing {} ...", args.input.display()));
            let start = Instant::now();
            let result = importer
                .import_file(&args.input, ImportOptions { dry_run: args.dry_run })
                .await;
            pb.finish_and_clear();
            info!(
                status = result.status_code(),
                duration_secs = start.elapsed().as_secs_f64(),
                "Import finished"
            );
            print_json(&result)?;
            Ok(result.success)
        }
        Commands::Results(filters) => {
            let aggregator = Aggregator::new(services.store.clone(), services.config.clone());
            let result = match filters.to_filter() {
                Ok(filter) => aggregator.aggregate(filter).await,
                Err(e) => Err(e),
            };
            report(result)
        }
        Commands::IndexSync(args) => {
            let sync = services.synchronizer(&args)?;
            let pb = make_spinner(&format!("Syncing search index {} ...", args.index));
            let result = sync.sync_index().await;
            pb.finish_and_clear();
            report(result)
        }
        Commands::Filter(args) => {
            let sync = services.synchronizer(&args.search)?;
            let result = match args.filters.to_filter() {
                Ok(filter) => sync.search(filter).await,
                Err(e) => Err(e),
            };
            report(result)
        }
        Commands::Suggest(args) => {
            let sync = services.synchronizer(&args.search)?;
            report(sync.suggest(&args.query).await)
        }
        Commands::Stats(args) => report(services.ranker().top_k(args.top).await),
    }
}

fn run(cli: Cli) -> Result<bool> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("zgjedhjet-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run_command(cli))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
