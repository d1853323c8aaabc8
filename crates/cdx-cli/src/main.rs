use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cdx")]
#[command(about = "CDC-to-search-index replication CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cursor store (lease) commands
    Cursor {
        #[command(subcommand)]
        cmd: CursorCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run a single bounded poll cycle against the environment's configuration
    Cycle {
        #[arg(long, default_value_t = 0)]
        index: i64,

        #[arg(long, default_value_t = 1)]
        count: i64,

        #[arg(long = "wait-time", default_value_t = 0)]
        wait_time: i64,
    },
}

#[derive(Subcommand)]
enum CursorCmd {
    /// Apply cursor store migrations
    Migrate,

    /// Print the lease row for an application name
    Show {
        /// Lease key (the application name whose lease to inspect)
        #[arg(long)]
        lease_key: String,
    },

    /// Forcibly release a lease, regardless of its current owner
    Evict {
        #[arg(long)]
        lease_key: String,

        /// Owner the lease must currently be held by; refuses otherwise
        #[arg(long)]
        owner: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Cursor { cmd } => run_cursor(cmd).await?,
        Commands::ConfigHash { paths } => run_config_hash(&paths)?,
        Commands::Cycle { index, count, wait_time } => run_cycle(index, count, wait_time).await?,
    }

    Ok(())
}

async fn run_cursor(cmd: CursorCmd) -> Result<()> {
    let pool = cdx_cursor::connect_from_env().await?;

    match cmd {
        CursorCmd::Migrate => {
            cdx_cursor::migrate(&pool).await?;
            println!("migrations_applied=true");
        }
        CursorCmd::Show { lease_key } => match cdx_cursor::get(&pool, &lease_key).await? {
            Some(lease) => {
                println!("{}", serde_json::to_string_pretty(&lease).context("serializing lease")?);
            }
            None => println!("no lease row for {lease_key}"),
        },
        CursorCmd::Evict { lease_key, owner } => {
            let evicted = cdx_cursor::evict(&pool, &lease_key, &owner).await?;
            println!("evicted={evicted}");
        }
    }

    Ok(())
}

fn run_config_hash(paths: &[String]) -> Result<()> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = cdx_config::load_layered_yaml(&path_refs)?;
    println!("config_hash={}", loaded.config_hash);
    println!("{}", loaded.canonical_json);
    Ok(())
}

/// Build a real `PipelineContext` from the environment and run one cycle
/// ad hoc. Mirrors what the daemon's `POST /v1/cycle` does, minus the HTTP
/// layer, for local inspection and one-off backfills.
async fn run_cycle(index: i64, count: i64, wait_time: i64) -> Result<()> {
    use cdx_bulk::HttpBulkSink;
    use cdx_config::credentials::{CredentialSource, EnvCredentialSource};
    use cdx_config::PipelineConfig;
    use cdx_metrics::TracingMetricsSink;
    use cdx_pipeline::{CycleInput, PipelineContext};
    use cdx_stream::HttpStreamReader;

    let pool = cdx_cursor::connect_from_env().await?;
    cdx_cursor::migrate(&pool).await.context("running cursor store migrations")?;

    let config = PipelineConfig::from_env().context("loading pipeline configuration")?;
    let credentials = EnvCredentialSource;
    let resolved = credentials.resolve();

    let stream_reader: Box<dyn cdx_stream::StreamReader> =
        Box::new(HttpStreamReader::new(config.clone(), Box::new(EnvCredentialSource)));
    let bulk_sink: Box<dyn cdx_bulk::BulkSink> = Box::new(HttpBulkSink::new(
        config.handler_additional_params.search_endpoint.clone(),
        config.region.clone(),
        resolved,
    ));
    let metrics: Box<dyn cdx_metrics::MetricsSink> = Box::new(TracingMetricsSink);

    let ctx = PipelineContext::new(pool, config, stream_reader, bulk_sink, metrics)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("constructing pipeline context")?;

    let output = cdx_pipeline::run_cycle(&ctx, CycleInput { index, count, wait_time })
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("running cycle")?;

    println!("{}", serde_json::to_string_pretty(&output).context("serializing cycle output")?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
