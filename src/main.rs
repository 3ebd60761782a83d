use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde_json::to_writer_pretty;
use stepcache::driver::ExecutionDriver;
use stepcache::history::{CacheLock, HISTORY_FILE, HistoryStore};
use stepcache::module::ModuleRegistry;
use stepcache::modules;
use stepcache::observability::log_snapshot;
use stepcache::program::Program;
use stepcache::validation::validate_program;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;
    run(cli)
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let Cli {
        program,
        clear_cache,
        cache_dir,
        dry_run,
        print_metrics,
        metrics_json,
        no_lock,
    } = cli;

    let program = Program::load(&program)?;
    let registry = build_registry();
    let report = validate_program(&program, &registry);
    for warning in &report.warnings {
        warn!(file = %program.path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %program.path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Program validation failed with {} error(s)",
            report.errors.len()
        ));
    }

    if program.is_empty() {
        warn!(file = %program.path.display(), "Program is empty");
        return Ok(());
    }

    let history_path = cache_dir.join(HISTORY_FILE);
    if dry_run {
        // Planning writes nothing, so a requested clear is simulated.
        let history = if clear_cache {
            HistoryStore::empty(&history_path)
        } else {
            HistoryStore::load_or_cold(&history_path)?
        };
        let driver = ExecutionDriver::new(&registry, history);
        for step in driver.plan(&program.steps)? {
            println!(
                "{:>3}  {:<8} {}  {}",
                step.index + 1,
                step.action,
                step.label,
                step.descriptor
            );
        }
        return Ok(());
    }

    fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create cache directory: {}", cache_dir.display()))?;
    let lock = if no_lock {
        None
    } else {
        Some(CacheLock::acquire(&cache_dir)?)
    };
    if clear_cache {
        let removed = match &lock {
            Some(lock) => lock.clear(),
            None => CacheLock::acquire(&cache_dir).and_then(|lock| lock.clear()),
        }
        .with_context(|| format!("Failed to clear cache directory: {}", cache_dir.display()))?;
        info!(cache = %cache_dir.display(), removed, "Cache cleared");
    }

    info!(file = %program.path.display(), steps = program.len(), "Running program");
    let history = HistoryStore::load_or_cold(&history_path)?;
    let mut driver = ExecutionDriver::new(&registry, history);
    let result = driver.run(&program.steps)?;

    info!(
        hits = result.count(stepcache::StepOutcome::Hit),
        ran = result.count(stepcache::StepOutcome::Ran),
        blocked = result.count(stepcache::StepOutcome::Blocked),
        "Program completed"
    );

    let snapshot = driver.metrics().snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        write_metrics(&path, &snapshot)?;
    }

    Ok(())
}

fn write_metrics(path: &Path, snapshot: &stepcache::observability::MetricsSnapshot) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create metrics directory: {}", parent.display())
        })?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
    to_writer_pretty(file, snapshot)
        .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
    info!(metrics = %path.display(), "Metrics JSON written");
    Ok(())
}

fn build_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    modules::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "stepcache",
    version,
    about = "Run a step program, reusing outputs whose producing step is unchanged"
)]
struct Cli {
    /// Program file: a JSON (or YAML) list of steps.
    program: PathBuf,
    /// Empty the cache directory (under its lock) before running.
    #[arg(long)]
    clear_cache: bool,
    #[arg(long, env = "STEPCACHE_CACHE_DIR", default_value = "cache")]
    cache_dir: PathBuf,
    /// Print what each step would do and exit.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    /// Skip the cache directory lock.
    #[arg(long)]
    no_lock: bool,
}
