//! CLI entry point for the Île-de-France real-estate analyzer.
//!
//! Provides subcommands for downloading the DVF and rent datasets, cleaning
//! the transactions, and running the price / rent / combined analyses, each
//! independently invokable and composable into a full pipeline.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use dvf_analyzer::analyzers::combined::CombinedAnalyzer;
use dvf_analyzer::analyzers::price::PriceAnalyzer;
use dvf_analyzer::analyzers::rent::RentAnalyzer;
use dvf_analyzer::cleaner::DataCleaner;
use dvf_analyzer::config::Config;
use dvf_analyzer::download::{dvf::DvfDownloader, rent::RentDownloader};
use dvf_analyzer::error::PipelineError;
use dvf_analyzer::report;
use std::ffi::OsStr;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "dvf_analyzer")]
#[command(about = "Analyze sale prices and rents for Île-de-France communes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the raw DVF department files, and optionally the rent data
    Download {
        /// Transaction vintage to fetch
        #[arg(short, long, default_value_t = 2023)]
        year: u16,

        /// Also fetch the rent indicators for this vintage
        #[arg(long)]
        rent_year: Option<u16>,

        /// Re-download even when a cached file exists
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Clean the raw transactions and cache the result
    Clean {
        #[arg(short, long, default_value_t = 2023)]
        year: u16,
    },
    /// Analyze sale prices and export the all-cities report
    Analyze {
        #[arg(short, long, default_value_t = 2023)]
        year: u16,
    },
    /// Analyze rent indicators and export the rent report
    Rent {
        /// Rent-indicator vintage
        #[arg(long, default_value_t = 2024)]
        rent_year: u16,

        /// Restrict to one department code (e.g. "75")
        #[arg(short, long)]
        department: Option<String>,
    },
    /// Join prices and rents, compute yields, export the combined report
    Combined {
        /// Transaction vintage
        #[arg(short, long, default_value_t = 2023)]
        year: u16,

        /// Rent-indicator vintage
        #[arg(long, default_value_t = 2024)]
        rent_year: u16,

        /// Restrict to one department code (e.g. "75")
        #[arg(short, long)]
        department: Option<String>,
    },
    /// Run download → clean → analyze → rent → combined in sequence
    FullPipeline {
        #[arg(short, long, default_value_t = 2023)]
        year: u16,

        #[arg(long, default_value_t = 2024)]
        rent_year: u16,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/dvf_analyzer.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("dvf_analyzer.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        report_failure(&e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let root = std::env::current_dir()?;
    let config = Config::load(&root)?;

    match cli.command {
        Commands::Download {
            year,
            rent_year,
            force,
        } => {
            download_stage(&config, year, rent_year, force).await?;
        }
        Commands::Clean { year } => {
            clean_stage(&config, year)?;
        }
        Commands::Analyze { year } => {
            analyze_stage(&config, year)?;
        }
        Commands::Rent {
            rent_year,
            department,
        } => {
            rent_stage(&config, rent_year, department.as_deref())?;
        }
        Commands::Combined {
            year,
            rent_year,
            department,
        } => {
            combined_stage(&config, year, rent_year, department.as_deref())?;
        }
        Commands::FullPipeline { year, rent_year } => {
            download_stage(&config, year, Some(rent_year), false).await?;
            clean_stage(&config, year)?;
            analyze_stage(&config, year)?;
            rent_stage(&config, rent_year, None)?;
            combined_stage(&config, year, rent_year, None)?;
            info!("Full pipeline finished");
        }
    }

    Ok(())
}

async fn download_stage(
    config: &Config,
    year: u16,
    rent_year: Option<u16>,
    force: bool,
) -> Result<()> {
    if let Some(rent_year) = rent_year {
        let rent_downloader = RentDownloader::new(config);
        rent_downloader.download(rent_year, None, force).await?;
    }

    let downloader = DvfDownloader::new(config);
    let files = downloader.download_region(year, force).await;
    if files.is_empty() {
        bail!("no DVF department file could be downloaded for {year}");
    }

    Ok(())
}

fn clean_stage(config: &Config, year: u16) -> Result<()> {
    let downloader = DvfDownloader::new(config);
    let raw = downloader.load_region(year)?;

    let cleaner = DataCleaner::new(config);
    let cleaned = cleaner.clean(raw)?;
    cleaner.save_cleaned(&cleaned, year)?;

    Ok(())
}

fn analyze_stage(config: &Config, year: u16) -> Result<()> {
    let mut analyzer = PriceAnalyzer::new(config);
    analyzer.load_data(year)?;

    let all_cities = analyzer.analyze_all_cities()?;
    if all_cities.is_empty() {
        info!(year, "No commune to analyze");
        return Ok(());
    }

    println!("\nTop 10 des villes les plus chères ({year}):");
    println!("{:-<80}", "");
    println!(
        "{:<32} {:<6} {:>16} {:>14}",
        "Ville", "Dépt", "Prix moyen €/m²", "Transactions"
    );
    println!("{:-<80}", "");
    for row in all_cities.iter().take(10) {
        println!(
            "{:<32} {:<6} {:>16.0} {:>14}",
            row.ville, row.code_departement, row.stats.prix_moyen_m2, row.stats.nombre_transactions
        );
    }
    println!("{:-<80}", "");

    let path = report::export_price_report(config, &all_cities, year)?;
    info!(report = %path.display(), cities = all_cities.len(), "Price analysis exported");
    Ok(())
}

fn rent_stage(config: &Config, rent_year: u16, department: Option<&str>) -> Result<()> {
    let analyzer = RentAnalyzer::new(config, rent_year);
    let communes = analyzer.table()?.len();
    if communes == 0 {
        info!(rent_year, "No rent data after region filtering");
        return Ok(());
    }

    let path = report::export_rent_report(config, &analyzer, department)?;
    info!(report = %path.display(), communes, "Rent analysis exported");
    Ok(())
}

fn combined_stage(
    config: &Config,
    year: u16,
    rent_year: u16,
    department: Option<&str>,
) -> Result<()> {
    let analyzer = CombinedAnalyzer::new(config, year, rent_year);

    let rows = analyzer.all_cities_combined(department)?;
    if rows.is_empty() {
        info!("No combined data available");
        return Ok(());
    }

    let path = report::export_combined_report(config, &analyzer, department)?;
    info!(report = %path.display(), cities = rows.len(), "Combined analysis exported");
    Ok(())
}

/// Prints a human-readable diagnostic and, for the known conditions, the
/// command that fixes them.
fn report_failure(err: &anyhow::Error) {
    match err.downcast_ref::<PipelineError>() {
        Some(pipeline) => {
            error!("{pipeline}");
            match pipeline {
                PipelineError::MissingData { hint, .. } => eprintln!("→ {hint}"),
                PipelineError::NoUrlConfigured(year) => {
                    eprintln!(
                        "→ add a \"rent\" entry for {year} to config_urls.json at the project root"
                    );
                }
                PipelineError::EncodingExhausted { .. } | PipelineError::MissingColumn(_) => {}
            }
        }
        None => error!(error = %err, "Pipeline stage failed"),
    }
}
