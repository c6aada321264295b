//! Loader CLI - checks mungers and jurisdictions, loads them into the CDF
//!
//! Every subcommand prints a JSON report on stdout; logs go to stderr and
//! follow `RUST_LOG` (default `info`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use loader::config::{self, Settings, UntranslatedPolicy};
use loader::jurisdiction::{self, Jurisdiction};
use loader::{hierarchy, pipeline, CdfStore, LoadReport, MemoryStore, Munger, PgStore, ResultsRun};


#[derive(Parser, Debug)]
#[command(name = "loader", about = "Munges raw election results into a CDF database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Load into an in-memory CDF instead of DB_URL
    #[arg(long, default_value = "false")]
    dry_run: bool,

    #[arg(long, default_value_t = config::DEFAULT_MAX_CONNECTIONS)]
    max_connections: u32,
}

impl StoreArgs {
    fn settings(&self, untranslated: UntranslatedPolicy, encoding: &str) -> Result<Settings> {
        Ok(Settings::new(untranslated, encoding)?.with_max_connections(self.max_connections)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a munger directory
    CheckMunger { dir: PathBuf },

    /// Check a jurisdiction directory without loading it
    CheckJurisdiction {
        dir: PathBuf,
        #[arg(long, default_value = "utf-8")]
        encoding: String,
    },

    /// Load every element file of a jurisdiction directory
    LoadJurisdiction {
        dir: PathBuf,
        #[arg(long, default_value = "utf-8")]
        encoding: String,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Munge a results file and report raw values the munger cannot translate
    CheckResults {
        #[arg(long)]
        munger: PathBuf,
        #[arg(long)]
        file: PathBuf,
        /// Directory holding the munger's auxiliary files
        #[arg(long)]
        aux_dir: Option<PathBuf>,
    },

    /// Munge a results file and load its vote counts
    LoadResults {
        #[arg(long)]
        munger: PathBuf,
        #[arg(long)]
        file: PathBuf,
        /// Name the file is registered under in _datafile
        #[arg(long)]
        short_name: String,
        #[arg(long)]
        election: String,
        /// ReportingUnit the file covers, recorded in _datafile
        #[arg(long)]
        top_reporting_unit: Option<String>,
        /// Directory holding the munger's auxiliary files
        #[arg(long)]
        aux_dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = UntranslatedPolicy::Flag)]
        untranslated: UntranslatedPolicy,
        /// Jurisdiction to load first (useful with --dry-run)
        #[arg(long = "jurisdiction")]
        preload: Option<PathBuf>,
        #[arg(long, default_value = "utf-8")]
        encoding: String,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Rebuild ComposingReportingUnitJoin from every stored ReportingUnit
    ResetHierarchy {
        #[command(flatten)]
        store: StoreArgs,
    },
}

async fn open_store(args: &StoreArgs, settings: &Settings) -> Result<Box<dyn CdfStore>> {
    if args.dry_run {
        tracing::info!("dry run - using in-memory CDF");
        return Ok(Box::new(MemoryStore::new()));
    }
    let db_url = std::env::var(config::DB_URL_VAR).context("DB_URL env var missing")?;
    let store = PgStore::connect(&db_url, settings.max_connections)
        .await
        .context("Failed to connect to database")?;
    Ok(Box::new(store))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn finish(report: &LoadReport) -> Result<()> {
    print_json(report)?;
    anyhow::ensure!(report.committed, "run {} aborted", report.run);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::CheckMunger { dir } => {
            let munger = Munger::load(&dir).await.context("Munger check failed")?;
            print_json(&serde_json::json!({
                "munger": munger.name,
                "file_type": munger.format.file_type.to_string(),
                "elements": munger.elements.iter().map(|e| e.table.name()).collect::<Vec<_>>(),
                "dictionary_entries": munger.dictionary.len(),
                "aux": munger.aux.iter().map(|a| a.abbrev.as_str()).collect::<Vec<_>>(),
                "warnings": munger.warnings,
            }))
        }

        Command::CheckJurisdiction { dir, encoding } => {
            let settings = Settings::new(UntranslatedPolicy::default(), &encoding)?;
            let juris = Jurisdiction::new(dir, settings.encoding);
            let check = jurisdiction::check_jurisdiction(&juris).await?;
            print_json(&check)?;
            anyhow::ensure!(check.is_ok(), "jurisdiction {} has problems", check.jurisdiction);
            Ok(())
        }

        Command::LoadJurisdiction {
            dir,
            encoding,
            store,
        } => {
            let settings = store.settings(UntranslatedPolicy::default(), &encoding)?;
            let juris = Jurisdiction::new(dir, settings.encoding);
            let cdf = open_store(&store, &settings).await?;
            let report = pipeline::load_jurisdiction(&*cdf, &juris).await;
            cdf.close().await;
            finish(&report)
        }

        Command::CheckResults {
            munger,
            file,
            aux_dir,
        } => {
            let munger = Munger::load(&munger).await.context("Munger check failed")?;
            let check = pipeline::check_results(&munger, &file, aux_dir.as_deref()).await?;
            print_json(&check)?;
            anyhow::ensure!(check.is_ok(), "{} has untranslatable raw values", check.file);
            Ok(())
        }

        Command::LoadResults {
            munger,
            file,
            short_name,
            election,
            top_reporting_unit,
            aux_dir,
            untranslated,
            preload,
            encoding,
            store,
        } => {
            let settings = store.settings(untranslated, &encoding)?;
            let munger = Munger::load(&munger).await.context("Munger check failed")?;
            let cdf = open_store(&store, &settings).await?;

            let result = async {
                if let Some(dir) = &preload {
                    let juris = Jurisdiction::new(dir.clone(), settings.encoding);
                    let report = pipeline::load_jurisdiction(&*cdf, &juris).await;
                    finish(&report)?;
                }
                let run = ResultsRun {
                    munger: &munger,
                    path: &file,
                    short_name: &short_name,
                    election: &election,
                    top_reporting_unit: top_reporting_unit.as_deref(),
                    aux_dir: aux_dir.as_deref(),
                    untranslated: settings.untranslated,
                };
                let report = pipeline::load_results(&*cdf, &run).await;
                finish(&report)
            }
            .await;

            cdf.close().await;
            result
        }

        Command::ResetHierarchy { store } => {
            let settings = store.settings(UntranslatedPolicy::default(), "utf-8")?;
            let cdf = open_store(&store, &settings).await?;
            let result = hierarchy::reset(&*cdf).await;
            cdf.close().await;
            print_json(&result?)
        }
    }
}
