use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use tally_classify::{CategorizationOutcome, CategorizationRun, HttpClassifier};
use tally_core::{Category, PipelineConfig, ProcessingRunId, RetrySettings};
use tally_ingest::{read_csv_rows, NormalizationRun, SourceProfile};
use tally_rates::{CurrencyConverter, HttpRateProvider};
use tally_retry::RetryPolicy;
use tally_storage::{create_db, SqliteStore};

#[derive(Debug, Deserialize)]
struct AppConfig {
    #[serde(flatten)]
    pipeline: PipelineConfig,
    #[serde(default)]
    sources: Vec<SourceProfile>,
    db_path: Option<PathBuf>,
}

impl AppConfig {
    /// Loads the TOML config and resolves env-supplied secrets. Runs before
    /// the database is opened so a bad config never touches storage.
    fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{path}'"))?;
        let mut config: AppConfig =
            toml::from_str(&content).with_context(|| format!("parsing config file '{path}'"))?;
        config.pipeline.resolve_secrets()?;
        Ok(config)
    }

    fn db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        let dirs = directories::ProjectDirs::from("com", "tally", "Tally")
            .context("no home directory for the default database path")?;
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        Ok(data_dir.join("tally.db"))
    }
}

fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
    RetryPolicy::new(
        settings.max_attempts,
        Duration::from_millis(settings.initial_delay_ms),
        settings.multiplier,
        Duration::from_millis(settings.max_delay_ms),
    )
}

fn usage() -> &'static str {
    "usage: tally <command>\n\
     \n\
     commands:\n\
       import <source-id> <csv-path>        queue a bank export for normalization\n\
       add-category <id> <name> [descr]     add or update a category\n\
       normalize                            map, dedup, and convert queued rows\n\
       categorize                           AI-categorize normalized transactions\n\
       recategorize                         clear AI categories and categorize again\n\
     \n\
     config is read from tally.toml (override with TALLY_CONFIG)"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");
    if command == "help" || command == "--help" {
        println!("{}", usage());
        return Ok(());
    }

    let config_path =
        std::env::var("TALLY_CONFIG").unwrap_or_else(|_| "tally.toml".to_string());
    let config = AppConfig::load(&config_path)?;

    let db_path = config.db_path()?;
    let pool = create_db(&db_path)
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;
    let store = SqliteStore::new(pool);

    match command {
        "import" => import(&args, &store).await,
        "add-category" => add_category(&args, &store).await,
        "normalize" => normalize(&config, &store).await,
        "categorize" => categorize(&config, &store, false).await,
        "recategorize" => categorize(&config, &store, true).await,
        other => bail!("unknown command '{other}'\n{}", usage()),
    }
}

async fn import(args: &[String], store: &SqliteStore) -> Result<()> {
    let source_id = args.get(1).context("usage: tally import <source-id> <csv-path>")?;
    let path = args.get(2).context("usage: tally import <source-id> <csv-path>")?;

    let file = File::open(path).with_context(|| format!("opening {path}"))?;
    let rows = read_csv_rows(source_id, file, true)?;
    for row in &rows {
        store.add_source_row(row).await?;
    }
    println!("queued {} rows for source '{source_id}'", rows.len());
    Ok(())
}

async fn add_category(args: &[String], store: &SqliteStore) -> Result<()> {
    let id = args.get(1).context("usage: tally add-category <id> <name> [description]")?;
    let name = args.get(2).context("usage: tally add-category <id> <name> [description]")?;
    let description = args.get(3).map(String::as_str).unwrap_or("");

    store.save_category(&Category::new(id, name, description)).await?;
    println!("saved category '{id}'");
    Ok(())
}

async fn normalize(config: &AppConfig, store: &SqliteStore) -> Result<()> {
    if config.sources.is_empty() {
        bail!("no [[sources]] configured");
    }
    let rates_url = config
        .pipeline
        .rates_url
        .as_deref()
        .context("rates_url missing from configuration")?;

    let run_id = ProcessingRunId::generate();
    let provider = HttpRateProvider::new(rates_url).context("building rate service client")?;
    let converter = CurrencyConverter::new(
        provider,
        retry_policy(&config.pipeline.retry),
        &config.pipeline.reporting_currency,
        run_id.clone(),
    );

    let outcome = NormalizationRun::new(store, converter, run_id)
        .await?
        .execute(&config.sources)
        .await?;

    println!(
        "run {}: {} rows read, {} normalized, {} duplicates, {} errors",
        outcome.run_id,
        outcome.total_rows(),
        outcome.normalized(),
        outcome.duplicates(),
        outcome.errors()
    );
    for (source_id, counts) in &outcome.per_source {
        println!(
            "  {source_id}: {} rows, {} normalized, {} duplicates, {} errors",
            counts.total_rows, counts.normalized, counts.duplicates, counts.errors
        );
    }
    for message in &outcome.messages {
        println!("  {message}");
    }
    Ok(())
}

async fn categorize(config: &AppConfig, store: &SqliteStore, reclassify: bool) -> Result<()> {
    let url = config
        .pipeline
        .classifier_url
        .as_deref()
        .context("classifier_url missing from configuration")?;
    let api_key = config
        .pipeline
        .classifier_api_key
        .as_deref()
        .context("classifier API key not resolved")?;

    let classifier = HttpClassifier::new(url, api_key).context("building classifier client")?;
    let run = CategorizationRun::new(
        store,
        &classifier,
        &config.pipeline.matcher,
        retry_policy(&config.pipeline.retry),
        config.pipeline.batch_size,
        ProcessingRunId::generate(),
    );

    let outcome: CategorizationOutcome = if reclassify {
        run.recategorize_all().await?
    } else {
        run.execute().await?
    };

    println!(
        "run {}: {} processed, {} categorized, {} failed, {} skipped",
        outcome.run_id,
        outcome.processed,
        outcome.categorized,
        outcome.failed,
        outcome.skipped
    );
    for message in &outcome.messages {
        println!("  {message}");
    }
    Ok(())
}
