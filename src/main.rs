//! estimate-tracker CLI: catalog, collect, record-sale, review, report, status.
//!
//! Intended to be driven by an external scheduler (cron/systemd timer) that
//! invokes `collect` once per run-day.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use estimate_tracker::{
    record_sale, Clock, Collector, CommandFetch, CursorStore, PipelineConfig, RotationScheduler,
    RunScope, SaleRequest, SaleSourceOfRecord, SampleReview, Source, SourceStatistics,
    StatisticsReporter, SystemClock, TimeSeriesStore, UnitRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "estimate-tracker",
    version,
    about = "Track valuation estimates against eventual sale prices"
)]
struct Cli {
    /// Path to the TOML config file. Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "estimate-tracker.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the unit catalog.
    Catalog,

    /// Run one collection pass.
    Collect {
        /// Sample every unit instead of the next rotation slice. The cursor is untouched.
        #[arg(long, default_value_t = false)]
        all: bool,
    },

    /// Record a closed sale.
    RecordSale {
        #[arg(long)]
        unit: String,

        #[arg(long)]
        price: f64,

        /// Sale date (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,

        /// Last asking price before the sale.
        #[arg(long)]
        asking: Option<f64>,

        /// manual, mls or listing-status-change
        #[arg(long, default_value = "manual")]
        source_of_record: SaleSourceOfRecord,
    },

    /// Accept or reject a stored sample for headline statistics.
    Review {
        #[arg(long)]
        unit: String,

        #[arg(long)]
        source: Source,

        /// Capture time of the sample (RFC 3339, or YYYY-MM-DD for day-resolution captures).
        #[arg(long)]
        captured_at: String,

        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        accept: bool,

        #[arg(long)]
        reject: bool,

        #[arg(long)]
        note: Option<String>,
    },

    /// Reconcile and aggregate; prints the analysis as JSON.
    Report {
        /// Write the JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Record counts, rotation position and recent runs.
    Status,
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = PipelineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Commands::Catalog => cmd_catalog(&config),
        Commands::Collect { all } => cmd_collect(&config, all),
        Commands::RecordSale {
            unit,
            price,
            date,
            asking,
            source_of_record,
        } => cmd_record_sale(
            &config,
            SaleRequest {
                unit_id: unit,
                sale_price: price,
                sale_date: date,
                source_of_record,
                asking_price: asking,
            },
        ),
        Commands::Review {
            unit,
            source,
            captured_at,
            accept,
            reject: _,
            note,
        } => cmd_review(&config, &unit, source, &captured_at, accept, note),
        Commands::Report { output } => cmd_report(&config, output.as_deref()),
        Commands::Status => cmd_status(&config),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "estimate_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_registry(config: &PipelineConfig) -> Result<UnitRegistry> {
    UnitRegistry::load_csv(&config.catalog_path)
        .with_context(|| format!("loading unit catalog {}", config.catalog_path.display()))
}

fn open_store(config: &PipelineConfig) -> Result<TimeSeriesStore> {
    TimeSeriesStore::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))
}

fn cmd_catalog(config: &PipelineConfig) -> Result<()> {
    let registry = load_registry(config)?;

    println!("🏠 {} units loaded from {}", registry.len(), config.catalog_path.display());
    for unit in registry.all() {
        let keys: Vec<&str> = unit.lookup_keys.keys().map(|s| s.as_str()).collect();
        println!("  {:<10} {:<20} {:<40} [{}]", unit.unit_id, unit.development, unit.address, keys.join(", "));
    }

    println!();
    for source in Source::ALL {
        println!("  {:<8} keys: {}/{}", source, registry.key_coverage(source), registry.len());
    }
    let keyless = registry.keyless_units();
    if !keyless.is_empty() {
        println!("  ⚠️  no keys at all: {}", keyless.join(", "));
    }

    let scheduler = RotationScheduler::new(&registry, &config.rotation);
    println!(
        "\n🔄 Rotation: {} units/run, full cycle in {} runs (target {})",
        scheduler.units_per_run(),
        scheduler.cycle_runs(),
        config.rotation.target_cycle_runs
    );

    Ok(())
}

fn cmd_collect(config: &PipelineConfig, all: bool) -> Result<()> {
    let registry = load_registry(config)?;
    let store = open_store(config)?;

    let Some(program) = config.fetch.command.as_deref() else {
        bail!("no fetch command configured (set `command` under [fetch])");
    };
    let fetch = CommandFetch::new(program, &config.fetch.args);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut collector = Collector::new(&registry, &store, fetch, clock, config);

    let scope = if all { RunScope::All } else { RunScope::Rotation };
    let summary = collector.run(scope).context("collection run aborted")?;

    println!("{}", summary.summary());
    for (unit_id, counts) in summary.per_unit() {
        println!(
            "  {:<10} ok {}  flagged {}  transient {}  permanent {}  rejected {}  skipped {}",
            unit_id,
            counts.success,
            counts.anomaly,
            counts.transient_failure,
            counts.permanent_failure,
            counts.rejected,
            counts.skipped
        );
    }

    Ok(())
}

fn cmd_record_sale(config: &PipelineConfig, request: SaleRequest) -> Result<()> {
    let registry = load_registry(config)?;
    let store = open_store(config)?;

    let event = record_sale(&registry, &store, request, &SystemClock)?;
    println!(
        "🏷️  Recorded sale: {} sold {} for {:.0} ({})",
        event.unit_id, event.sale_date, event.sale_price, event.flag
    );

    Ok(())
}

fn parse_captured_at(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .with_context(|| format!("invalid capture time '{}'", text))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

fn cmd_review(
    config: &PipelineConfig,
    unit_id: &str,
    source: Source,
    captured_at: &str,
    accepted: bool,
    note: Option<String>,
) -> Result<()> {
    let store = open_store(config)?;
    let captured_at = parse_captured_at(captured_at)?;

    let history = store.history(unit_id, source)?;
    let Some(sample) = history.iter().find(|s| s.captured_at == captured_at) else {
        bail!("no {} sample for {} captured at {}", source, unit_id, captured_at);
    };

    store.append_review(&SampleReview {
        unit_id: unit_id.to_string(),
        source,
        captured_at,
        reviewed_at: SystemClock.now_utc(),
        accepted,
        note,
    })?;

    println!(
        "📝 {} {} sample {} at {} (flag: {})",
        if accepted { "Accepted" } else { "Rejected" },
        source,
        unit_id,
        captured_at,
        sample.anomaly_flag
    );

    Ok(())
}

fn cmd_report(config: &PipelineConfig, output: Option<&Path>) -> Result<()> {
    let store = open_store(config)?;
    let report = StatisticsReporter::new().analyze(&store, &SystemClock)?;
    let json = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => {
            std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
            println!("📊 {}", report.summary());
            for source_report in &report.sources {
                match &source_report.statistics {
                    SourceStatistics::Reported {
                        closest_to_sale, ..
                    } => println!(
                        "  {:<8} median error {:.0} ({:+.2}%), MAE {:.0}, over-estimates {:.0}%",
                        source_report.source,
                        closest_to_sale.median_error,
                        closest_to_sale.median_relative_error * 100.0,
                        closest_to_sale.mean_absolute_error,
                        closest_to_sale.bias_fraction * 100.0
                    ),
                    SourceStatistics::InsufficientSample {
                        reconciled_units, ..
                    } => println!(
                        "  {:<8} insufficient sample ({} reconciled units)",
                        source_report.source, reconciled_units
                    ),
                }
            }
            println!("✓ Wrote {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

fn cmd_status(config: &PipelineConfig) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats()?;

    println!("📦 Database: {}", config.database_path.display());
    println!("  estimates:        {} ({} flagged)", stats.estimates, stats.flagged_estimates);
    println!("  units sampled:    {}", stats.units_with_estimates);
    println!("  sales:            {}", stats.sales);
    println!("  reviews:          {}", stats.reviews);
    println!(
        "  last capture:     {}",
        stats
            .last_capture
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    match store.load_cursor()? {
        Some(cursor) => {
            let position = match UnitRegistry::load_csv(&config.catalog_path) {
                Ok(registry) => {
                    let scheduler = RotationScheduler::new(&registry, &config.rotation);
                    let stale = if cursor.catalog_fingerprint == scheduler.fingerprint() {
                        ""
                    } else {
                        " (catalog changed since)"
                    };
                    format!("{}/{}{}", cursor.position, registry.len(), stale)
                }
                Err(_) => cursor.position.to_string(),
            };
            println!("  cursor:           {}", position);
        }
        None => println!("  cursor:           not started"),
    }

    let runs = store.recent_runs(5)?;
    if !runs.is_empty() {
        println!("\n🕒 Recent runs ({} total)", stats.runs);
        for run in runs {
            println!("  {}  {}", run.finished_at.format("%Y-%m-%d %H:%M"), run.summary());
        }
    }

    Ok(())
}
