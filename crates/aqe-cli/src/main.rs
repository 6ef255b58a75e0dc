use anyhow::{anyhow, Context, Result};
use aqe_core::{
    AqeConfig, ConfidencePolicy, Engine, HistoryStore, JsonLinesHistoryLog, MemoryStorage,
    PurchasesGenerator, QueryOptions,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod render;

/// Queries run by `workload`, cycling through the supported shapes.
const WORKLOAD: &[&str] = &[
    "SELECT COUNT(*) FROM purchases",
    "SELECT SUM(amount) FROM purchases",
    "SELECT AVG(amount) FROM purchases WHERE category = 'Electronics'",
    "SELECT country, COUNT(*) FROM purchases GROUP BY country",
    "SELECT category, SUM(amount) FROM purchases GROUP BY category",
    "SELECT COUNT(DISTINCT customer_id) FROM purchases",
    "SELECT COUNT(*) FROM purchases WHERE country = 'US'",
    "SELECT MAX(amount) FROM purchases",
    "SELECT country, COUNT(*) FROM purchases GROUP BY country ORDER BY COUNT(*) DESC LIMIT 5",
];

#[derive(Parser)]
#[command(name = "aqe-cli")]
#[command(about = "Approximate aggregate queries over a synthetic purchases table", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct EngineArgs {
    /// Rows in the generated purchases table
    #[arg(long, default_value_t = 200_000)]
    rows: usize,
    /// Distinct countries in the generated table (at most 50)
    #[arg(long, default_value_t = 50)]
    countries: usize,
    /// Seed for data generation
    #[arg(long, default_value_t = 42)]
    data_seed: u64,
    /// JSON file with engine settings; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON-lines file that persists the performance history
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct QueryArgs {
    /// Tolerated relative error (default from config)
    #[arg(long)]
    max_rel_error: Option<f64>,
    /// Always run the exact query
    #[arg(long)]
    no_optimization: bool,
    /// Skip the exact comparison run
    #[arg(long)]
    no_compare: bool,
    /// Force sampling at this fraction
    #[arg(long)]
    sample_fraction: Option<f64>,
    /// Abort the query after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl QueryArgs {
    fn options(&self) -> QueryOptions {
        let mut options = QueryOptions::new().with_optimization(!self.no_optimization);
        if let Some(tolerance) = self.max_rel_error {
            options = options.with_max_rel_error(tolerance);
        }
        if self.no_compare {
            options = options.with_compare_exact(false);
        }
        if let Some(fraction) = self.sample_fraction {
            options = options.with_sample_fraction(fraction);
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        options
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one SQL query and print the result with its strategy decision
    Query {
        sql: String,
        #[command(flatten)]
        engine: EngineArgs,
        #[command(flatten)]
        query: QueryArgs,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a mixed workload repeatedly and summarize what the engine learned
    Workload {
        /// Passes over the workload
        #[arg(long, default_value_t = 3)]
        iterations: usize,
        #[command(flatten)]
        engine: EngineArgs,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Print learning statistics from a history file
    Stats {
        history: PathBuf,
        /// JSON file with engine settings
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let log_format = std::env::var("AQE_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::WARN.into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::WARN.into()),
            )
            .init();
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Query {
            sql,
            engine,
            query,
            json,
        } => {
            let engine = build_engine(engine)?;
            let resp = engine.run_sql(sql, &query.options())?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
            } else {
                println!("{}", render::result_table(&resp.result));
                println!("{}", render::response_summary(&resp));
            }
        }
        Commands::Workload {
            iterations,
            engine,
            query,
        } => {
            let engine = build_engine(engine)?;
            let options = query.options();
            let mut runs = Vec::new();
            for pass in 0..*iterations {
                for sql in WORKLOAD {
                    let resp = engine
                        .run_sql(sql, &options)
                        .with_context(|| format!("workload query failed: {sql}"))?;
                    runs.push((pass + 1, *sql, resp));
                }
            }
            println!("{}", render::workload_table(&runs));
            println!("{}", render::stats_table(&engine.learning_stats()));
        }
        Commands::Stats {
            history,
            config,
            json,
        } => {
            if !history.exists() {
                return Err(anyhow!("history file {} not found", history.display()));
            }
            let config = load_config(config.as_deref())?;
            let store = open_history(history, &config)?;
            let engine = Engine::new(config, Arc::new(MemoryStorage::new()))?.with_history(store);
            let stats = engine.learning_stats();
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", render::stats_table(&stats));
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AqeConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<AqeConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => AqeConfig::new(),
    };
    config.validate()?;
    Ok(config)
}

fn open_history(path: &Path, config: &AqeConfig) -> Result<Arc<HistoryStore>> {
    let log = JsonLinesHistoryLog::open(path)?;
    let store = HistoryStore::with_log(ConfidencePolicy::from_config(config), Box::new(log))?;
    info!(path = %path.display(), records = store.len(), "opened history");
    Ok(Arc::new(store))
}

fn build_engine(args: &EngineArgs) -> Result<Engine> {
    let config = load_config(args.config.as_deref())?;
    let storage = MemoryStorage::with_sample_cache(config.sample_cache_entries);
    PurchasesGenerator::new(args.rows, args.countries, args.data_seed).register_into(&storage)?;
    info!(
        rows = args.rows,
        countries = args.countries,
        sample_cache = config.sample_cache_entries,
        "generated purchases table"
    );
    let engine = Engine::new(config.clone(), Arc::new(storage))?;
    Ok(match &args.history {
        Some(path) => engine.with_history(open_history(path, &config)?),
        None => engine,
    })
}
