use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use sparkify_etl::config::{EtlConfig, TargetKind};
use sparkify_etl::logging;
use sparkify_etl::metrics;
use sparkify_etl::pipeline::{Orchestrator, RunInput, RunReport, Target};
use sparkify_etl::source::FsSource;
use sparkify_etl::storage::{LakeSink, SqliteSink};

#[derive(Parser)]
#[command(name = "sparkify_etl")]
#[command(about = "Load Sparkify song catalog and listening logs into a star schema")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (falls back to $SPARKIFY_CONFIG, then ./sparkify.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Destination: sqlite or lake
    #[arg(long, global = true)]
    target: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drop and recreate every star table
    Init,
    /// Normalize, build dimensions, resolve facts and load
    Run {
        /// Use the small fixed sample instead of the full data set
        #[arg(long)]
        dry_run: bool,
        /// Song catalog location (overrides config)
        #[arg(long)]
        song_data: Option<String>,
        /// Event log location (overrides config)
        #[arg(long)]
        log_data: Option<String>,
    },
}

enum Backend {
    Sqlite(SqliteSink),
    Lake(LakeSink),
}

impl Backend {
    fn open(config: &EtlConfig) -> Result<Self> {
        match config.target.kind {
            TargetKind::Sqlite => {
                let sink = SqliteSink::open(&config.target.sqlite_path).with_context(|| {
                    format!(
                        "opening SQLite database {}",
                        config.target.sqlite_path.display()
                    )
                })?;
                Ok(Backend::Sqlite(sink))
            }
            TargetKind::Lake => Ok(Backend::Lake(LakeSink::new(&config.target.lake_root))),
        }
    }

    fn target(&self) -> Target<'_> {
        match self {
            Backend::Sqlite(sink) => Target::Merge(sink),
            Backend::Lake(sink) => Target::Partitioned(sink),
        }
    }
}

fn print_report(report: &RunReport) {
    let mode = if report.dry_run { " (dry run)" } else { "" };
    println!("\n📊 Run {}{}", report.run_id, mode);
    println!("   Song data: {}", report.song_data);
    println!("   Log data:  {}", report.log_data);
    println!(
        "   Songs parsed: {} ({} unparseable)",
        report.songs_normalized.records, report.songs_normalized.parse_failures
    );
    println!(
        "   Events parsed: {} ({} unparseable)",
        report.events_normalized.records, report.events_normalized.parse_failures
    );
    println!(
        "   Song plays: {} matched, {} unmatched, {} ambiguous",
        report.resolution.matched, report.resolution.unmatched, report.resolution.ambiguous
    );
    println!(
        "\n   {:<12} {:>9} {:>9} {:>9} {:>10}",
        "table", "inserted", "existing", "conflicts", "partitions"
    );
    for load in &report.loads {
        println!(
            "   {:<12} {:>9} {:>9} {:>9} {:>10}",
            load.table,
            load.inserted,
            load.skipped_existing,
            load.key_conflicts,
            load.partitions_replaced
        );
    }
    println!("\n✅ Finished in {} ms", report.elapsed_ms);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _guard = logging::init_logging();

    let cli = Cli::parse();

    let mut config = EtlConfig::load(cli.config.as_deref())?;
    if let Some(target) = &cli.target {
        config.target.kind = target.parse()?;
    }
    metrics::init_metrics(config.metrics.addr.as_deref());

    let orchestrator = Orchestrator::new(&config)?;
    let backend = Backend::open(&config)?;

    match cli.command {
        Commands::Init => {
            println!("🔨 Creating star tables...");
            orchestrator.init_tables(backend.target()).await?;
            info!("All tables created");
            println!("✅ Tables ready");
        }
        Commands::Run {
            dry_run,
            song_data,
            log_data,
        } => {
            println!("🔄 Running ETL...");
            let mut input = RunInput::from_config(&config, dry_run);
            if let Some(song_data) = song_data {
                input.song_data = song_data;
            }
            if let Some(log_data) = log_data {
                input.log_data = log_data;
            }

            let source = FsSource::new();
            let report = orchestrator.run(&source, backend.target(), &input).await?;
            print_report(&report);
        }
    }

    Ok(())
}
