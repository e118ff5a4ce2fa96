//! wildreid - individual animal re-identification for camera-trap detections.
//!
//! Detections handed over by an upstream detector are deduplicated,
//! embedded by a set of appearance extractors, and matched against a
//! registry of known individuals. Each detection either joins an existing
//! identity, seeds a new one, or is left for a reviewer.

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod input;
pub mod locking;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod season;

use clap::Parser;
use cli::{
    Cli, Command, ConfigAction, DetectionAction, ExportAction, GlobalArgs, IdentityAction,
    OutputMode, RegistryAction, RematchTarget, RunArgs, SeasonAction,
};
use config::{
    Config, config_file_path, default_registry_dir, load_config_file, load_default_config,
    save_config, validate_config,
};
use embedding::{ExtractorSet, resolve_specs};
use input::{collect_input_files, parse_inputs};
use locking::RegistryLock;
use output::csv::{DetectionRow, IdentityRow, write_csv};
use output::{
    ErrorPayload, EventType, ResultType, RunCompletedPayload, RunStartedPayload, emit_json,
    emit_json_result, progress, text,
};
use pipeline::{CancelFlag, Orchestrator, Selection, WorkerPool, extractor_timeout};
use registry::{
    DetectionId, DetectionState, Incident, JournalStore, Mutation, Registry, RegistryStore,
    SightingPolicy, corrections, integrity, profile,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub use error::{Error, Result};

/// Main entry point for the wildreid CLI.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet);

    let cancel = CancelFlag::new();
    install_interrupt_handler(cancel.clone());

    let mode = cli.global.output_mode;
    let result = handle_command(cli, &cancel);
    if let Err(e) = &result
        && mode == OutputMode::Json
    {
        emit_json(EventType::Error, &ErrorPayload::fatal(e));
    }
    result
}

fn init_logging(verbose: u8, quiet: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    // ORT logging is suppressed by default; -v shows its warnings,
    // -vv its info, -vvv everything.
    let filter_str = if quiet {
        "warn,ort=off".to_string()
    } else {
        match verbose {
            0 => "info,ort=off".to_string(),
            1 => "debug,ort=warn".to_string(),
            2 => "trace,ort=info".to_string(),
            _ => "trace".to_string(),
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    // Logs go to stderr so JSON output on stdout stays clean.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// First Ctrl+C stops the run at the next state boundary; a second one
/// removes lock files and exits.
fn install_interrupt_handler(cancel: CancelFlag) {
    let result = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            locking::cleanup_all_locks();
            std::process::exit(130); // 128 + SIGINT(2)
        }
        warn!("Interrupted; finishing in-flight detections (Ctrl+C again to abort)");
        cancel.cancel();
    });
    if let Err(e) = result {
        warn!("Failed to install Ctrl+C handler: {e}");
    }
}

/// Print a result in the selected output mode.
fn emit<T: Serialize>(
    mode: OutputMode,
    result_type: ResultType,
    data: &T,
    human: impl FnOnce(&T) -> String,
) {
    match mode {
        OutputMode::Json => emit_json_result(result_type, data),
        OutputMode::Human => println!("{}", human(data)),
    }
}

fn handle_command(cli: Cli, cancel: &CancelFlag) -> Result<()> {
    let global = &cli.global;
    match cli.command {
        Command::Config { action } => handle_config_command(action, global),
        Command::Ingest { paths, run } => {
            let config = load_config(global, Some(&run))?;
            ingest(&paths, &run, &config, global, cancel)
        }
        Command::Rematch { target, run } => {
            let config = load_config(global, Some(&run))?;
            rematch(target, &run, &config, global, cancel)
        }
        Command::Identity { action } => {
            handle_identity_command(action, &load_config(global, None)?, global.output_mode)
        }
        Command::Detection { action } => {
            handle_detection_command(action, &load_config(global, None)?, global.output_mode)
        }
        Command::Review { csv } => {
            let registry = open_registry(&load_config(global, None)?, false)?;
            let queue = registry.read(profile::review_queue)?;
            if csv {
                write_csv(None, queue.iter().map(DetectionRow::from))?;
            } else {
                emit(global.output_mode, ResultType::ReviewQueue, &queue, |q| {
                    text::review_table(q)
                });
            }
            Ok(())
        }
        Command::Season { action } => {
            handle_season_command(action, &load_config(global, None)?, global.output_mode)
        }
        Command::Incidents { all } => {
            let registry = open_registry(&load_config(global, None)?, false)?;
            let incidents: Vec<Incident> = registry.read(|s| {
                s.incidents
                    .values()
                    .filter(|i| all || !i.resolved)
                    .cloned()
                    .collect()
            })?;
            emit(global.output_mode, ResultType::Incidents, &incidents, |i| {
                text::incidents(i)
            });
            Ok(())
        }
        Command::Export { action } => {
            handle_export_command(action, &load_config(global, None)?, global.output_mode)
        }
        Command::Registry { action } => {
            handle_registry_command(action, &load_config(global, None)?, global.output_mode)
        }
    }
}

/// Load, override and validate the configuration.
fn load_config(global: &GlobalArgs, run: Option<&RunArgs>) -> Result<Config> {
    let mut config = match &global.config {
        Some(path) => load_config_file(path)?,
        None => load_default_config()?,
    };

    if let Some(dir) = &global.registry {
        config.registry.dir = Some(dir.clone());
    }
    if let Some(run) = run {
        if let Some(threshold) = run.threshold {
            config.matching.threshold = threshold;
        }
        if let Some(workers) = run.workers {
            config.workers.count = workers;
        }
    }

    validate_config(&config)?;
    Ok(config)
}

fn registry_dir(config: &Config) -> Result<PathBuf> {
    config
        .registry
        .dir
        .clone()
        .map_or_else(default_registry_dir, Ok)
}

/// Open the registry. Writers take the directory lock; readers do not.
fn open_registry(config: &Config, writable: bool) -> Result<Registry> {
    let dir = registry_dir(config)?;
    let store: Box<dyn RegistryStore> = if writable {
        Box::new(JournalStore::open(&dir)?)
    } else {
        Box::new(JournalStore::open_read_only(&dir))
    };
    Registry::open(store, config.registry.compact_every)
}

fn primary_name(config: &Config) -> Result<&str> {
    config
        .primary_extractor()
        .map(|e| e.name.as_str())
        .ok_or_else(|| Error::ConfigValidation {
            message: "at least one extractor must be configured".to_string(),
        })
}

/// Open the registry for writing, build the extractors and check the
/// registry before a run.
fn build_orchestrator(config: &Config, cancel: &CancelFlag) -> Result<Arc<Orchestrator>> {
    let registry = Arc::new(open_registry(config, true)?);
    let extractors = ExtractorSet::from_config(&config.extractors, extractor_timeout(config))?;
    let orchestrator = Orchestrator::new(Arc::clone(&registry), extractors, config, cancel.clone())?;

    let raised = integrity::sweep(&registry, &orchestrator.primary().name)?;
    if !raised.is_empty() {
        warn!(
            "{} identities quarantined by the integrity check; see `wildreid incidents`",
            raised.len()
        );
    }

    for spec in &orchestrator.policy().specs {
        let stale = registry.read(|s| s.index.stale_entries(&spec.name, &spec.version))?;
        if stale > 0 {
            warn!(
                "{stale} identities carry '{}' embeddings from a version other than {}; \
                 they are not matched on it until their detections are re-matched",
                spec.name, spec.version
            );
        }
    }

    Ok(Arc::new(orchestrator))
}

fn ingest(
    paths: &[PathBuf],
    run: &RunArgs,
    config: &Config,
    global: &GlobalArgs,
    cancel: &CancelFlag,
) -> Result<()> {
    let start = Instant::now();

    let files = collect_input_files(paths)?;
    if files.is_empty() {
        return Err(Error::NoInputRecords);
    }
    info!("Found {} detection file(s)", files.len());
    let detections = parse_inputs(&files)?;

    let orchestrator = build_orchestrator(config, cancel)?;
    let registry = orchestrator.registry();

    let (fresh, known): (Vec<_>, Vec<_>) = registry.read(|s| {
        detections
            .into_iter()
            .partition(|d| !s.detections.contains_key(&d.id))
    })?;
    if !known.is_empty() {
        warn!(
            "Skipping {} detection(s) already in the registry",
            known.len()
        );
    }

    let detections = dedup::suppress(fresh, config.dedup.iou_threshold);
    let queued: Vec<DetectionId> = detections
        .iter()
        .filter(|d| d.state != DetectionState::Duplicate)
        .map(|d| d.id)
        .collect();
    let started = RunStartedPayload {
        queued: queued.len(),
        skipped_known: known.len(),
        spatial_duplicates: detections.len() - queued.len(),
        workers: config.workers.count,
    };
    info!(
        "Queued {} detection(s); {} overlapping box(es) marked duplicate",
        started.queued, started.spatial_duplicates
    );

    registry.commit(|_| {
        Ok((
            detections.into_iter().map(Mutation::detection).collect(),
            (),
        ))
    })?;

    run_pool(orchestrator, config, &queued, run, global, start, &started)
}

fn rematch(
    target: RematchTarget,
    run: &RunArgs,
    config: &Config,
    global: &GlobalArgs,
    cancel: &CancelFlag,
) -> Result<()> {
    let start = Instant::now();
    let selection = if target.all {
        Selection::All
    } else if target.unresolved {
        Selection::Unresolved
    } else {
        Selection::Ids(target.ids)
    };

    let orchestrator = build_orchestrator(config, cancel)?;
    let registry = orchestrator.registry();

    let ids = registry.read(|s| pipeline::select(s, &selection))?;
    if ids.is_empty() {
        info!("Nothing to re-match");
    }
    pipeline::reset(registry, &ids)?;

    let started = RunStartedPayload {
        queued: ids.len(),
        skipped_known: 0,
        spatial_duplicates: 0,
        workers: config.workers.count,
    };
    run_pool(orchestrator, config, &ids, run, global, start, &started)
}

fn run_pool(
    orchestrator: Arc<Orchestrator>,
    config: &Config,
    ids: &[DetectionId],
    run: &RunArgs,
    global: &GlobalArgs,
    start: Instant,
    started: &RunStartedPayload,
) -> Result<()> {
    let json = global.output_mode == OutputMode::Json;
    if json {
        emit_json(EventType::RunStarted, started);
    }

    info!(
        "Processing {} detection(s) with {} worker(s)",
        ids.len(),
        config.workers.count
    );

    let progress_enabled = !global.quiet && !run.no_progress && !json;
    let bar = progress::create_detection_progress(ids.len(), progress_enabled);
    let pool = WorkerPool::new(orchestrator, config.workers.count, config.dedup.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal {
            message: format!("Failed to create async runtime: {e}"),
        })?;
    let summary = runtime.block_on(pool.run(ids, bar.as_ref()))?;

    let cancelled = summary.cancelled > 0;
    progress::finish_progress(bar, if cancelled { "Cancelled" } else { "Complete" });

    let elapsed = start.elapsed();
    info!(
        "Complete: {} matched, {} created, {} unresolved, {} duplicates, {} pending in {:.2}s",
        summary.matched,
        summary.created,
        summary.unresolved,
        summary.duplicates,
        summary.pending,
        elapsed.as_secs_f64()
    );
    if summary.pending > 0 {
        warn!(
            "{} detection(s) failed and stay pending; retry with `wildreid rematch --unresolved`",
            summary.pending
        );
    }

    if json {
        let event = if cancelled {
            EventType::Cancelled
        } else {
            EventType::RunCompleted
        };
        emit_json(
            event,
            &RunCompletedPayload {
                summary,
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            },
        );
    } else {
        println!("{}", text::run_summary(&summary, elapsed));
    }

    Ok(())
}

fn handle_identity_command(action: IdentityAction, config: &Config, mode: OutputMode) -> Result<()> {
    match action {
        IdentityAction::List { species } => {
            let registry = open_registry(config, false)?;
            let list = registry.read(|s| profile::identities(s, species.as_deref()))?;
            emit(mode, ResultType::IdentityList, &list, |l| {
                text::identity_table(l)
            });
        }
        IdentityAction::Show { id } => {
            let registry = open_registry(config, false)?;
            let profile = registry.read(|s| profile::identity_profile(s, id))??;
            emit(mode, ResultType::IdentityProfile, &profile, |p| {
                text::identity_profile(p)
            });
        }
        IdentityAction::Rename { id, name } => {
            let registry = open_registry(config, true)?;
            let identity = corrections::rename(&registry, id, name.as_deref())?;
            emit(mode, ResultType::Correction, &identity, |i| {
                format!("{} is now labelled '{}'", i.id, i.label())
            });
        }
        IdentityAction::Merge { source, target } => {
            let registry = open_registry(config, true)?;
            let summary = corrections::merge(&registry, source, target)?;
            emit(mode, ResultType::Merge, &summary, |s| text::merge(s));
        }
        IdentityAction::Release { id } => {
            let registry = open_registry(config, true)?;
            let identity = integrity::release(&registry, id, primary_name(config)?)?;
            emit(mode, ResultType::Correction, &identity, |i| {
                format!("{} released back to matching", i.label())
            });
        }
    }
    Ok(())
}

fn handle_detection_command(
    action: DetectionAction,
    config: &Config,
    mode: OutputMode,
) -> Result<()> {
    match action {
        DetectionAction::Show { id } => {
            let registry = open_registry(config, false)?;
            let report = registry.read(|s| profile::detection_report(s, id))??;
            emit(mode, ResultType::DetectionReport, &report, |r| {
                text::detection_report(r)
            });
        }
        DetectionAction::Reject { id, negative } => {
            let registry = open_registry(config, true)?;
            corrections::reject(&registry, id, negative)?;
            let report = registry.read(|s| profile::detection_report(s, id))??;
            emit(mode, ResultType::Correction, &report, |r| {
                format!("Detection {} detached; now {}", r.id, r.state)
            });
        }
        DetectionAction::Assign { id, identity } => {
            let policy = SightingPolicy::new(
                resolve_specs(&config.extractors)?,
                config.seasonal.clone(),
                config.matching.min_blend_weight,
            );
            let registry = open_registry(config, true)?;
            corrections::assign(&registry, id, identity, &policy)?;
            let report = registry.read(|s| profile::detection_report(s, id))??;
            emit(mode, ResultType::Correction, &report, |r| {
                format!(
                    "Detection {} assigned to {}",
                    r.id,
                    r.label.as_deref().unwrap_or("-")
                )
            });
        }
    }
    Ok(())
}

fn handle_season_command(action: SeasonAction, config: &Config, mode: OutputMode) -> Result<()> {
    let registry = open_registry(config, false)?;
    match action {
        SeasonAction::Show { id, tag } => {
            let record = registry.read(|s| profile::season(s, id, &tag))??;
            emit(mode, ResultType::Season, &record, |r| match r {
                Some(info) => text::seasons(std::slice::from_ref(info)),
                None => format!("No seasonal record for {id} in {tag}"),
            });
        }
        SeasonAction::List { id } => {
            let seasons = registry.read(|s| profile::identity_profile(s, id).map(|p| p.seasons))??;
            emit(mode, ResultType::Season, &seasons, |s| text::seasons(s));
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ExportResult<'a> {
    path: Option<&'a Path>,
    rows: usize,
}

fn handle_export_command(action: ExportAction, config: &Config, mode: OutputMode) -> Result<()> {
    let registry = open_registry(config, false)?;
    let (output, rows, what) = match action {
        ExportAction::Identities { output, species } => {
            let list = registry.read(|s| profile::identities(s, species.as_deref()))?;
            let rows = write_csv(output.as_deref(), list.iter().map(IdentityRow::from))?;
            (output, rows, "identities")
        }
        ExportAction::Detections { output } => {
            let reports: Vec<_> = registry.read(|s| {
                s.detections
                    .keys()
                    .filter_map(|&id| profile::detection_report(s, id).ok())
                    .collect()
            })?;
            let rows = write_csv(output.as_deref(), reports.iter().map(DetectionRow::from))?;
            (output, rows, "detections")
        }
    };

    // Without a file the CSV itself is the output.
    if let Some(path) = &output {
        let result = ExportResult {
            path: Some(path.as_path()),
            rows,
        };
        emit(mode, ResultType::Export, &result, |r| {
            format!("Exported {} {what} to {}", r.rows, path.display())
        });
    }
    Ok(())
}

fn handle_config_command(action: ConfigAction, global: &GlobalArgs) -> Result<()> {
    let path = match &global.config {
        Some(path) => path.clone(),
        None => config_file_path()?,
    };

    match action {
        ConfigAction::Init => {
            if path.exists() {
                println!("Configuration file already exists: {}", path.display());
            } else {
                save_config(&Config::default(), &path)?;
                println!("Created configuration file: {}", path.display());
                println!("\nNext steps:");
                println!("  edit [[extractors]] to point at your models, then");
                println!("  wildreid ingest <detections.jsonl>");
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(global, None)?;
            match global.output_mode {
                OutputMode::Json => emit_json_result(
                    ResultType::Config,
                    &serde_json::json!({ "config_path": path, "config": config }),
                ),
                OutputMode::Human => {
                    let rendered = toml::to_string_pretty(&config)
                        .map_err(|e| Error::ConfigSerialize { source: e })?;
                    println!("# {}\n{rendered}", path.display());
                }
            }
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn handle_registry_command(action: RegistryAction, config: &Config, mode: OutputMode) -> Result<()> {
    let dir = registry_dir(config)?;
    match action {
        RegistryAction::Info => {
            let registry = open_registry(config, false)?;
            let stats = registry.read(profile::stats)?;
            match mode {
                OutputMode::Json => emit_json_result(
                    ResultType::Registry,
                    &serde_json::json!({
                        "dir": dir,
                        "locked": RegistryLock::is_locked(&dir),
                        "stats": stats,
                    }),
                ),
                OutputMode::Human => {
                    println!("registry:    {}", dir.display());
                    if let Some(holder) = RegistryLock::holder(&dir) {
                        println!(
                            "locked by:   pid {} on {} since {}",
                            holder.pid, holder.hostname, holder.started
                        );
                    }
                    println!("{}", text::registry_stats(&stats));
                }
            }
        }
        RegistryAction::Compact => {
            let registry = open_registry(config, true)?;
            registry.compact()?;
            emit(mode, ResultType::Registry, &dir, |d| {
                format!("Compacted registry at {}", d.display())
            });
        }
        RegistryAction::Unlock { force, older_than } => {
            if !RegistryLock::is_locked(&dir) {
                emit(mode, ResultType::Registry, &dir, |d| {
                    format!("Registry at {} is not locked", d.display())
                });
                return Ok(());
            }
            if !force && !RegistryLock::is_stale(&dir, older_than) {
                if let Some(holder) = RegistryLock::holder(&dir) {
                    warn!(
                        "Lock held by pid {} on {} since {}; use --force to remove it anyway",
                        holder.pid, holder.hostname, holder.started
                    );
                }
                return Err(Error::RegistryLocked {
                    path: RegistryLock::lock_path_for(&dir),
                });
            }
            RegistryLock::remove_stale(&dir)?;
            emit(mode, ResultType::Registry, &dir, |d| {
                format!("Removed lock from {}", d.display())
            });
        }
    }
    Ok(())
}
