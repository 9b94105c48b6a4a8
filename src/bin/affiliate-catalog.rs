//! CLI binary for refreshing, inspecting and serving the affiliate catalog
//! cache.

use core::future::Future;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;

use affiliate_catalog::aggregator::CatalogAggregator;
use affiliate_catalog::cache::{CacheConfig, CacheService, CacheState};
use affiliate_catalog::config::Config;
use affiliate_catalog::error::Result as CatalogResult;
use affiliate_catalog::models::{Catalog, Category, generate_category_id};
use affiliate_catalog::scheduler::{RefreshReport, RefreshScheduler, SchedulerConfig, Trigger};
use affiliate_catalog::source::SourceRegistration;
use affiliate_catalog::storage::{CacheStore, FileStore};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, Table};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

/// Affiliate catalog cache: fetch, merge and keep merchant catalogs fresh.
#[derive(Debug, Parser)]
#[command(name = "affiliate-catalog", version, about)]
struct Cli {
    /// Override the cache directory (default: XDG data dir).
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Force-refresh every source now.
    Refresh,
    /// Print the merged catalog.
    Show {
        /// Only list merchants of this category (name, case-insensitive).
        #[arg(long)]
        category: Option<String>,
        /// Print the catalog as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show cache freshness per source.
    Status,
    /// Warm the cache, then refresh daily until interrupted.
    Run,
    /// Delete every cached catalog.
    Clear,
}

/// Everything a subcommand needs.
#[derive(Debug)]
struct App<S> {
    /// Catalog cache.
    cache: CacheService<S, Catalog>,
    /// Sources in merge priority order.
    sources: Vec<SourceRegistration>,
    /// Scheduler timing for `run` and `refresh`.
    scheduler: SchedulerConfig,
}

/// Runs the CLI, returning an appropriate exit code.
fn run() -> io::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _dotenv = dotenvy::dotenv();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(cli))
}

/// Opens the store, loads the configuration and dispatches.
async fn execute(cli: Cli) -> io::Result<ExitCode> {
    let store = match create_store(cli.data_dir) {
        Ok(store) => store,
        Err(err) => {
            writeln!(
                io::stderr().lock(),
                "{} failed to initialize cache storage: {err}",
                "error:".red().bold()
            )?;
            return Ok(ExitCode::FAILURE);
        }
    };

    if matches!(cli.command, Command::Clear) {
        return cmd_clear(&CacheService::new(store, CacheConfig::default())).await;
    }

    let Some(config) = load_config()? else {
        return Ok(ExitCode::FAILURE);
    };
    let sources = match config.registrations() {
        Ok(sources) => sources,
        Err(err) => {
            writeln!(
                io::stderr().lock(),
                "{} failed to set up sources: {err}",
                "error:".red().bold()
            )?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let app = App {
        cache: CacheService::new(store, config.cache.clone()),
        sources,
        scheduler: config.scheduler,
    };
    dispatch(app, cli.command).await
}

/// Reads the configuration from the environment, printing a hint when it
/// is incomplete.
fn load_config() -> io::Result<Option<Config>> {
    match Config::from_env() {
        Ok(config) => Ok(Some(config)),
        Err(err) => {
            let mut out = io::stderr().lock();
            writeln!(out, "{} {err}", "error:".red().bold())?;
            writeln!(
                out,
                "  {} set the {} variables in the environment or a .env file",
                "hint:".cyan(),
                "AFFILIATE_*".bold()
            )?;
            Ok(None)
        }
    }
}

/// Creates the file store, using `data_dir` if provided or the default
/// XDG data directory otherwise.
fn create_store(data_dir: Option<PathBuf>) -> CatalogResult<FileStore> {
    let dir = match data_dir {
        Some(dir) => dir,
        None => FileStore::default_dir()?,
    };
    FileStore::new(dir)
}

/// Dispatches to the appropriate subcommand handler.
async fn dispatch<S: CacheStore<Catalog>>(app: App<S>, command: Command) -> io::Result<ExitCode> {
    match command {
        Command::Refresh => cmd_refresh(&app).await,
        Command::Show { category, json } => cmd_show(&app, category.as_deref(), json).await,
        Command::Status => cmd_status(&app).await,
        Command::Run => cmd_run(app, shutdown_signal()).await,
        Command::Clear => cmd_clear(&app.cache).await,
    }
}

/// Resolves on Ctrl-C. Never resolves if the signal handler cannot be
/// installed.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        core::future::pending::<()>().await;
    }
}

/// Executes the `refresh` subcommand: force-refreshes every source.
async fn cmd_refresh<S: CacheStore<Catalog>>(app: &App<S>) -> io::Result<ExitCode> {
    let scheduler = RefreshScheduler::new(app.cache.clone(), app.sources.clone(), app.scheduler);
    let spinner = make_spinner("Refreshing affiliate sources...");
    let report = scheduler.refresh_all(Trigger::Manual).await;
    spinner.finish_and_clear();

    print_refresh_report(&report)?;
    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Executes the `show` subcommand: prints the merged catalog or one of
/// its categories.
async fn cmd_show<S: CacheStore<Catalog>>(
    app: &App<S>,
    category: Option<&str>,
    json: bool,
) -> io::Result<ExitCode> {
    let aggregator = CatalogAggregator::new(app.cache.clone(), app.sources.clone());
    let spinner = make_spinner("Loading catalog...");
    let result = aggregator.merged_catalog().await;
    spinner.finish_and_clear();

    let catalog = match result {
        Ok(catalog) => catalog,
        Err(err) => {
            writeln!(
                io::stderr().lock(),
                "{} failed to load catalog: {err}",
                "error:".red().bold()
            )?;
            return Ok(ExitCode::FAILURE);
        }
    };

    match category {
        Some(name) => {
            let Some(found) = catalog.category(generate_category_id(name)) else {
                writeln!(
                    io::stderr().lock(),
                    "{} category not found: {name}",
                    "error:".red().bold()
                )?;
                return Ok(ExitCode::FAILURE);
            };
            if json {
                print_json(found)?;
            } else {
                print_category_table(found)?;
            }
        }
        None if json => print_json(&catalog)?,
        None => print_catalog_table(&catalog)?,
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes the `status` subcommand: cache freshness per source.
async fn cmd_status<S: CacheStore<Catalog>>(app: &App<S>) -> io::Result<ExitCode> {
    let mut table = Table::new();
    _ = table.load_preset(UTF8_FULL);
    _ = table.set_header(vec![
        Cell::new("Source").fg(Color::Cyan),
        Cell::new("Key").fg(Color::Cyan),
        Cell::new("State").fg(Color::Cyan),
        Cell::new("Merchants").fg(Color::Cyan),
        Cell::new("Updated").fg(Color::Cyan),
    ]);

    for registration in &app.sources {
        let key = registration.key();
        let state = app.cache.state(key).await;
        let stored = app.cache.peek(key).await;
        let (merchants, updated) = stored.as_ref().map_or_else(
            || ("\u{2014}".to_owned(), "\u{2014}".to_owned()),
            |catalog| {
                (
                    catalog.merchant_count().to_string(),
                    format_timestamp(catalog.last_updated),
                )
            },
        );
        _ = table.add_row(vec![
            Cell::new(registration.source()),
            Cell::new(key),
            Cell::new(state).fg(state_color(state)),
            Cell::new(merchants),
            Cell::new(updated),
        ]);
    }

    let mut out = io::stdout().lock();
    writeln!(out, "{}", "Cache Status".green().bold())?;
    writeln!(out)?;
    writeln!(out, "{table}")?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `run` subcommand: warms the cache and runs the refresh
/// scheduler until `shutdown` resolves.
async fn cmd_run<S, F>(app: App<S>, shutdown: F) -> io::Result<ExitCode>
where
    S: CacheStore<Catalog>,
    F: Future<Output = ()>,
{
    let aggregator = CatalogAggregator::new(app.cache.clone(), app.sources.clone());
    let spinner = make_spinner("Warming up cache...");
    let warmed = aggregator.warmup_all().await;
    spinner.finish_and_clear();
    print_warmup_summary(&warmed)?;

    writeln!(
        io::stdout().lock(),
        "{} daily refresh at {} UTC, press Ctrl-C to stop",
        "Running:".green().bold(),
        app.scheduler.daily_at.format("%H:%M")
    )?;
    RefreshScheduler::new(app.cache, app.sources, app.scheduler)
        .run(shutdown)
        .await;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `clear` subcommand: deletes every cached catalog.
async fn cmd_clear<S: CacheStore<Catalog>>(
    cache: &CacheService<S, Catalog>,
) -> io::Result<ExitCode> {
    match cache.clear_all().await {
        Ok(()) => {
            writeln!(io::stdout().lock(), "{}", "Cache cleared.".green())?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            writeln!(
                io::stderr().lock(),
                "{} failed to clear cache: {err}",
                "error:".red().bold()
            )?;
            Ok(ExitCode::FAILURE)
        }
    }
}

// ── Output formatting ────────────────────────────────────────────────

/// Table colour for a cache state.
const fn state_color(state: CacheState) -> Color {
    match state {
        CacheState::Fresh => Color::Green,
        CacheState::Stale => Color::Yellow,
        CacheState::Expired => Color::Red,
        CacheState::Empty => Color::DarkGrey,
    }
}

/// Formats a Unix millisecond timestamp as UTC.
fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms).map_or_else(
        || "\u{2014}".to_owned(),
        |time| time.format("%Y-%m-%d %H:%M UTC").to_string(),
    )
}

/// Prints any serializable value as pretty JSON.
fn print_json<T: serde::Serialize>(value: &T) -> io::Result<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    writeln!(io::stdout().lock(), "{rendered}")
}

/// Prints the outcome of a refresh run.
fn print_refresh_report(report: &RefreshReport) -> io::Result<()> {
    let mut table = Table::new();
    _ = table.load_preset(UTF8_FULL);
    _ = table.set_header(vec![
        Cell::new("Key").fg(Color::Cyan),
        Cell::new("Result").fg(Color::Cyan),
        Cell::new("Detail").fg(Color::Cyan),
    ]);
    for key in &report.refreshed {
        _ = table.add_row(vec![
            Cell::new(key),
            Cell::new("refreshed").fg(Color::Green),
            Cell::new(""),
        ]);
    }
    for &(ref key, ref err) in &report.failed {
        _ = table.add_row(vec![
            Cell::new(key),
            Cell::new("failed").fg(Color::Red),
            Cell::new(err),
        ]);
    }

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "{} {}",
        "Refresh".green().bold(),
        format_args!("({} ok, {} failed)", report.refreshed.len(), report.failed.len()).dimmed()
    )?;
    writeln!(out)?;
    writeln!(out, "{table}")?;
    Ok(())
}

/// Prints the per-source outcome of a warm-up.
fn print_warmup_summary(results: &[(String, CatalogResult<bool>)]) -> io::Result<()> {
    let mut out = io::stdout().lock();
    for &(ref key, ref outcome) in results {
        match *outcome {
            Ok(true) => writeln!(out, "  {} {key}", "fetched".green())?,
            Ok(false) => writeln!(out, "  {} {key}", "cached".dimmed())?,
            Err(ref err) => writeln!(out, "  {} {key}: {err}", "failed".red())?,
        }
    }
    Ok(())
}

/// Prints the merged catalog's categories in a table.
fn print_catalog_table(catalog: &Catalog) -> io::Result<()> {
    let mut out = io::stdout().lock();
    if catalog.is_empty() {
        writeln!(out, "{}", "Catalog is empty.".dimmed())?;
        return Ok(());
    }

    let mut table = Table::new();
    _ = table.load_preset(UTF8_FULL);
    _ = table.set_header(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Category").fg(Color::Cyan),
        Cell::new("Merchants").fg(Color::Cyan),
    ]);
    for category in &catalog.categories {
        _ = table.add_row(vec![
            Cell::new(category.id),
            Cell::new(&category.name),
            Cell::new(category.merchants.len()),
        ]);
    }

    writeln!(
        out,
        "{} {}",
        "Catalog".green().bold(),
        format_args!(
            "({} categories, {} merchants, updated {})",
            catalog.categories.len(),
            catalog.merchant_count(),
            format_timestamp(catalog.last_updated)
        )
        .dimmed()
    )?;
    writeln!(out)?;
    writeln!(out, "{table}")?;
    Ok(())
}

/// Prints one category's merchants in a table.
fn print_category_table(category: &Category) -> io::Result<()> {
    let mut table = Table::new();
    _ = table.load_preset(UTF8_FULL);
    _ = table.set_header(vec![
        Cell::new("Merchant").fg(Color::Cyan),
        Cell::new("URL").fg(Color::Cyan),
        Cell::new("Source").fg(Color::Cyan),
    ]);
    for merchant in &category.merchants {
        _ = table.add_row(vec![
            Cell::new(&merchant.display_name),
            Cell::new(&merchant.clean_url),
            Cell::new(merchant.source),
        ]);
    }

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "{} {}",
        category.name.green().bold(),
        format_args!("({})", category.merchants.len()).dimmed()
    )?;
    writeln!(out)?;
    writeln!(out, "{table}")?;
    Ok(())
}

/// Creates a spinner with the given message.
fn make_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_owned());
    spinner.enable_steady_tick(core::time::Duration::from_millis(80));
    spinner
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            // Nothing left to report to if stderr itself fails.
            let _ignored = writeln!(io::stderr(), "fatal I/O error: {err}");
            ExitCode::FAILURE
        }
    }
}
