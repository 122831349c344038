use anyhow::Result;
use astros_sync::IngestConfig;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "astros-cli")]
#[command(about = "Fetch the astros feed and append it to ClickHouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch once and insert the canonical payload (default).
    Ingest(IngestArgs),
    /// Deduplicate the raw and derived tables.
    Compact,
}

#[derive(Debug, Default, Args)]
struct IngestArgs {
    /// Overrides SOURCE_URL.
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Seconds; attempt k waits base^k.
    #[arg(long)]
    backoff_base: Option<f64>,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl IngestArgs {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(url) = self.url.clone() {
            config.source_url = url;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(base) = self.backoff_base {
            config.backoff_base_secs = base;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Ingest(IngestArgs::default())) {
        Commands::Ingest(args) => {
            args.apply(&mut config);
            let summary = astros_sync::run_ingest_once(&config).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            println!(
                "ingest complete: run_id={} hash={} captured_at={} attempts={} table={}",
                summary.run_id,
                summary.content_hash,
                summary.captured_at.to_rfc3339(),
                summary.attempts,
                config.clickhouse.qualified_raw_table()
            );
            println!("run `astros-cli compact` to remove duplicate rows");
        }
        Commands::Compact => {
            astros_sync::run_compaction(&config).await?;
            println!(
                "compaction complete: {} and {} optimized",
                config.clickhouse.qualified_raw_table(),
                config.clickhouse.qualified_derived_table()
            );
        }
    }

    Ok(())
}
