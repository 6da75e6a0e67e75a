use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::error;

use ans_despesas::logging::init_logging;
use ans_despesas::{
    discover_sources, load_registry, select_recent_periods, InconsistencyFlag, Pipeline,
    PipelineConfig,
};

/// Consolidate, validate, enrich and aggregate ANS quarterly expense files.
#[derive(Parser, Debug)]
#[command(name = "ans-despesas", version, about = "ANS quarterly expense pipeline")]
struct Cli {
    /// Directory with the quarterly source files
    #[arg(long)]
    input_dir: PathBuf,

    /// Operator registry CSV
    #[arg(long)]
    registry: PathBuf,

    /// Where the output tables and run_report.json are written
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Optional TOML config (aliases, thresholds, output format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of most recent periods to consolidate (overrides config)
    #[arg(long)]
    periods: Option<usize>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(periods) = cli.periods {
        if periods == 0 {
            bail!("--periods must be at least 1");
        }
        config.ingestion.recent_periods = periods;
    }

    println!("📂 Discovering source files in {}", cli.input_dir.display());
    let sources = discover_sources(&cli.input_dir)
        .with_context(|| format!("Failed to list {}", cli.input_dir.display()))?;
    let sources = select_recent_periods(sources, config.ingestion.recent_periods);
    for source in &sources {
        match source.period {
            Some(period) => println!("   • {} ({})", source.file_name(), period),
            None => println!("   • {}", source.file_name()),
        }
    }

    println!("\n🗂️  Loading registry {}", cli.registry.display());
    let registry = load_registry(&cli.registry, &config)?;
    println!(
        "✓ {} registry entries ({} discarded)",
        registry.entries.len(),
        registry.discarded_invalid
    );

    println!("\n🚀 Running pipeline...");
    let pipeline = Pipeline::new(config);
    let output = pipeline.run(&sources, registry)?;
    let files = output.write_to(&cli.output_dir, pipeline.config())?;

    let report = &output.report;
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Ingestion:   {}", report.ingestion.summary());
    println!("✓ Validation:  {}", report.validation.summary());
    println!("✓ Enrichment:  {}", report.enrichment.summary());
    println!("✓ Aggregation: {}", report.aggregation.summary());
    for flag in InconsistencyFlag::ALL {
        let count = match flag {
            InconsistencyFlag::CnpjSemMatch => report.enrichment.unmatched,
            _ => report.validation.count(flag),
        };
        println!("   {:<20} {}", flag.code(), count);
    }
    if !report.enrichment.top_unmatched.is_empty() {
        println!("\n🔍 Most frequent CNPJs without registry match:");
        for line in report.enrichment.top_unmatched_display() {
            println!("   {}", line);
        }
    }

    println!("\n💾 Outputs:");
    for path in [&files.consolidated, &files.enriched, &files.aggregated, &files.report] {
        println!("   {}", path.display());
    }
    println!("📋 Run {}", report.run_id);

    Ok(())
}
