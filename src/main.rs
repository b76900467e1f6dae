//! dhis-export - DHIS2 data value set exporter
//!
//! A CLI tool that reads settings, contacts and target documents from
//! CouchDB or a JSON dump and aggregates them into a DHIS2 data value set.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (store unreachable, invalid period, write failure, etc.)
//!   2 - Configuration error (data set not defined or without data elements)

use anyhow::{bail, Context, Result};
use chrono::Utc;
use dhis_export::cli::{Args, OutputFormat};
use dhis_export::config::{Config, CONFIG_FILE};
use dhis_export::error::ExportError;
use dhis_export::export::{catalog, parse_period, ExportOptions, Exporter};
use dhis_export::report;
use dhis_export::store::{CouchStore, DocumentStore, FileStore};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // The config decides verbosity, so it is read before logging starts.
    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(config.log_level(args.quiet));

    info!("dhis-export v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    source.log();

    match run(args, config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Export failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            let configuration = e
                .downcast_ref::<ExportError>()
                .is_some_and(ExportError::is_configuration_error);
            std::process::exit(if configuration { 2 } else { 1 });
        }
    }
}

/// Handle --init-config: generate a default .dhis-export.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("{} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("Created {} with default settings.", CONFIG_FILE);
    println!("Edit it to set the document store and aggregation policy.");
    Ok(())
}

/// Initialize logging at `level`.
///
/// Logs go to stderr so stdout stays clean for the exported JSON.
fn init_logging(level: tracing::Level) {

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Warning: a tracing subscriber was already installed");
    }
}

async fn run(args: Args, config: Config) -> Result<()> {
    let start_time = Instant::now();

    config.validate()?;

    let store = open_store(&config)?;
    let spinner = spinner(args.quiet);

    let output = if args.catalog {
        spinner.set_message("Reading export catalog...");
        let catalog = catalog(&store, Utc::now(), config.export.recent_periods).await;
        spinner.finish_and_clear();
        let catalog = catalog?;
        match args.format {
            OutputFormat::Json => report::generate_json_catalog(&catalog, config.general.pretty)?,
            OutputFormat::Markdown => report::generate_markdown_catalog(&catalog),
        }
    } else {
        let Some(data_set) = args.data_set.as_deref() else {
            bail!("--data-set is required unless --catalog is given");
        };
        let period = match args.period.as_deref() {
            Some(input) => parse_period(input)?,
            None => Utc::now(),
        };
        let options = ExportOptions {
            place_id: args.place.clone(),
            human_readable: args.human_readable,
        };

        spinner.set_message(format!("Aggregating {}...", data_set));
        let exporter = Exporter::with_policy(store, config.export.policy());
        let result = exporter.aggregate(period, data_set, &options).await;
        spinner.finish_and_clear();
        let result = result?;

        info!(
            "Exported {} data values for {} ({})",
            result.data_values.len(),
            result.data_set,
            result.period
        );
        match args.format {
            OutputFormat::Json => report::generate_json_report(&result, config.general.pretty)?,
            OutputFormat::Markdown => report::generate_markdown_report(&result),
        }
    };

    write_output(&config.general.output, &output)?;
    debug!("Done in {:.1}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

/// Open the configured document store.
fn open_store(config: &Config) -> Result<Box<dyn DocumentStore>> {
    if !config.store.docs.is_empty() {
        let path = Path::new(&config.store.docs);
        info!("Reading documents from {}", path.display());
        return Ok(Box::new(FileStore::open(path)?));
    }

    if let Some(couch) = config.store.couch() {
        return Ok(Box::new(CouchStore::new(couch)?));
    }

    bail!("No document store configured. Pass --docs or --couch-url, or set [store] in {}", CONFIG_FILE)
}

fn spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Write to the configured output file, or stdout when none is set.
fn write_output(output_path: &str, content: &str) -> Result<()> {
    if output_path.is_empty() {
        println!("{}", content);
        return Ok(());
    }

    std::fs::write(output_path, content)
        .with_context(|| format!("Failed to write export to {}", output_path))?;
    info!("Export saved to: {}", output_path);
    Ok(())
}

/// Where the configuration came from, logged once logging is up.
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile,
    Builtin,
    Unreadable(String),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::Explicit(path) => info!("Loaded config from: {}", path.display()),
            ConfigSource::DefaultFile => info!("Loaded default config from {}", CONFIG_FILE),
            ConfigSource::Builtin => debug!("No config file found, using defaults"),
            ConfigSource::Unreadable(e) => warn!("Failed to load config: {}", e),
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::Explicit(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::DefaultFile)),
        Ok(None) => Ok((Config::default(), ConfigSource::Builtin)),
        Err(e) => Ok((Config::default(), ConfigSource::Unreadable(format!("{:#}", e)))),
    }
}
