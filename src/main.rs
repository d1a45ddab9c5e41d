use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use siteport_lib::import::{write_run_report, ProgressLog, ProgressStatus};
use siteport_lib::package::CURRENT_FORMAT_VERSION;
use siteport_lib::{
    export_package, run_import, AppError, ExportSettings, ImportContext, ImportSettings,
    ObjectCatalog, RunOutcome, RunSummary, SqliteStore, SystemVersion,
};

const DATA_DIR_ENV: &str = "SITEPORT_DATA_DIR";
const EXIT_FAILED: i32 = 1;
const EXIT_CANCELED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "siteport", about = "Import and export site object packages", version)]
struct Cli {
    /// SQLite database holding the target objects.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Also write JSON logs to a daily rolling file in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import a package folder or archive into the database.
    Import(ImportArgs),
    /// Export objects from the database into a package.
    Export(ExportArgs),
    /// Print a progress log written by an earlier import.
    Log {
        path: PathBuf,
        /// Only print warnings and errors.
        #[arg(long)]
        problems: bool,
    },
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Package folder or zip archive.
    package: PathBuf,
    /// Object catalog describing the importable types.
    #[arg(long)]
    catalog: PathBuf,
    /// JSON import settings; flags below override it.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    site_id: Option<i64>,
    #[arg(long)]
    admin_user_id: Option<i64>,
    /// Root the physical files are copied into.
    #[arg(long)]
    target_root: Option<PathBuf>,
    /// Folder that receives a fresh per-run unpack folder.
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    /// Keep existing objects untouched and only add new ones.
    #[arg(long)]
    only_new: bool,
    #[arg(long)]
    no_files: bool,
    #[arg(long)]
    no_deletions: bool,
    #[arg(long)]
    progress_log: Option<PathBuf>,
    /// Directory the run report is written to.
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    /// Version of the running system, packages newer than it are refused.
    #[arg(long, default_value = CURRENT_FORMAT_VERSION)]
    system_version: String,
    #[arg(long, default_value_t = 0)]
    hotfix: u32,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Package folder, or archive path with `--zip`.
    target: PathBuf,
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    site_id: Option<i64>,
    #[arg(long)]
    zip: bool,
    /// Root the physical file rules are read from.
    #[arg(long)]
    source_root: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let _guard = match &cli.log_dir {
        Some(dir) => match siteport_lib::logging::init_file_logging(dir) {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("Error: {err:#}");
                process::exit(EXIT_FAILED);
            }
        },
        None => {
            siteport_lib::init_logging();
            None
        }
    };

    match handle_cli(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            let app_error = AppError::from(err);
            eprintln!("Error: {app_error}");
            process::exit(EXIT_FAILED);
        }
    }
}

fn handle_cli(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path().context("determine database path")?,
    };
    match cli.command {
        Commands::Import(args) => runtime.block_on(handle_import(&db_path, args)),
        Commands::Export(args) => runtime.block_on(handle_export(&db_path, args)),
        Commands::Log { path, problems } => handle_log(&path, problems),
    }
}

async fn open_store(db_path: &Path, catalog: &ObjectCatalog) -> Result<SqliteStore> {
    let store = SqliteStore::open(db_path)
        .await
        .map_err(AppError::from)
        .with_context(|| format!("open database {}", db_path.display()))?;
    store
        .ensure_schema(catalog)
        .await
        .map_err(AppError::from)
        .context("prepare database schema")?;
    Ok(store)
}

async fn handle_import(db_path: &Path, args: ImportArgs) -> Result<i32> {
    let catalog = ObjectCatalog::from_json_file(&args.catalog).map_err(AppError::from)?;
    let mut settings = match &args.settings {
        Some(path) => {
            let mut settings = ImportSettings::from_json_file(path)?;
            settings.source_path = args.package.clone();
            settings
        }
        None => ImportSettings::new(args.package.clone()),
    };
    apply_import_overrides(&mut settings, &args);

    let running = SystemVersion::parse(&args.system_version, args.hotfix)
        .with_context(|| format!("parse system version {}", args.system_version))?;
    let store = open_store(db_path, &catalog).await?;
    let ctx = ImportContext::new(&catalog, &store, running);

    let cancel = settings.cancel_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(target: "siteport", event = "import_cancel_requested");
            cancel.cancel();
        }
    });

    let summary = run_import(&mut settings, &ctx).await;
    watcher.abort();
    store.pool().close().await;

    let reports_dir = match args.reports_dir {
        Some(dir) => dir,
        None => data_dir()?.join("reports"),
    };
    let report_path = write_run_report(&reports_dir, &args.package, &summary)?;

    if args.json {
        let payload = json!({ "report": report_path, "summary": summary });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("serialize run summary")?
        );
    } else {
        print_summary(&summary);
        println!("Report written to {}", report_path.display());
    }

    Ok(match summary.outcome {
        RunOutcome::Completed | RunOutcome::CompletedWithWarnings => 0,
        RunOutcome::Canceled => EXIT_CANCELED,
        RunOutcome::Failed { .. } => EXIT_FAILED,
    })
}

fn apply_import_overrides(settings: &mut ImportSettings, args: &ImportArgs) {
    if args.site_id.is_some() {
        settings.site_id = args.site_id;
    }
    if args.admin_user_id.is_some() {
        settings.admin_user_id = args.admin_user_id;
    }
    if args.target_root.is_some() {
        settings.target_root = args.target_root.clone();
    }
    if args.temp_dir.is_some() {
        settings.temporary_path = args.temp_dir.clone();
    }
    if args.progress_log.is_some() {
        settings.progress_log_path = args.progress_log.clone();
    }
    if args.only_new {
        settings.import_only_new_objects = true;
    }
    if args.no_files {
        settings.copy_files = false;
    }
    if args.no_deletions {
        settings.process_deletions = false;
    }
}

async fn handle_export(db_path: &Path, args: ExportArgs) -> Result<i32> {
    let catalog = ObjectCatalog::from_json_file(&args.catalog).map_err(AppError::from)?;
    let mut settings = match &args.settings {
        Some(path) => {
            let mut settings = ExportSettings::from_json_file(path)?;
            settings.target_path = args.target.clone();
            settings
        }
        None => ExportSettings::new(args.target.clone()),
    };
    if args.site_id.is_some() {
        settings.site_id = args.site_id;
    }
    if args.zip {
        settings.zip = true;
    }
    if args.source_root.is_some() {
        settings.source_root = args.source_root.clone();
    }

    let store = open_store(db_path, &catalog).await?;
    let result = export_package(&catalog, &store, &settings).await;
    store.pool().close().await;
    let summary = result.map_err(AppError::from)?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize export summary")?
        );
    } else {
        println!("Package written to {}", summary.root.display());
        if let Some(archive) = &summary.archive {
            println!("Archive      : {}", archive.display());
        }
        for (object_type, count) in &summary.objects {
            println!("{object_type:<32} {count:>6}");
        }
        println!("Binaries     : {}", summary.binaries);
        println!("Files        : {}", summary.files);
        println!("Delete tasks : {}", summary.tasks);
    }
    Ok(0)
}

fn handle_log(path: &Path, problems: bool) -> Result<i32> {
    let entries = ProgressLog::load(path)
        .with_context(|| format!("read progress log {}", path.display()))?;
    for entry in entries {
        if problems && !matches!(entry.status, ProgressStatus::Warning | ProgressStatus::Error) {
            continue;
        }
        println!("{} {:<8} {}", entry.timestamp, entry.status, entry.message);
    }
    Ok(0)
}

fn print_summary(summary: &RunSummary) {
    let outcome = match &summary.outcome {
        RunOutcome::Completed => "completed".to_string(),
        RunOutcome::CompletedWithWarnings => "completed with warnings".to_string(),
        RunOutcome::Canceled => "canceled".to_string(),
        RunOutcome::Failed { reason } => format!("failed: {reason}"),
    };
    println!("Import {outcome}");
    if let Some(version) = &summary.package_version {
        println!("Package version : {version}");
    }
    if let Some(from) = &summary.converted_from {
        println!("Converted from  : {from}");
    }

    println!(
        "\n{:<32} {:>7} {:>7} {:>9} {:>7} {:>8} {:>6} {:>7}",
        "Type", "Created", "Updated", "Unchanged", "Skipped", "Deferred", "Failed", "Deleted"
    );
    for (object_type, counters) in &summary.types {
        println!(
            "{:<32} {:>7} {:>7} {:>9} {:>7} {:>8} {:>6} {:>7}",
            object_type,
            counters.created,
            counters.updated,
            counters.unchanged,
            counters.skipped,
            counters.deferred,
            counters.failed,
            counters.deleted
        );
    }

    if !summary.post_process_failures.is_empty() {
        println!("\nNot imported:");
        for failure in &summary.post_process_failures {
            println!("  {failure}");
        }
    }
    if !summary.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &summary.warnings {
            println!("  {}", warning.replace('\n', " "));
        }
    }
}

fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::data_dir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| anyhow::anyhow!("failed to resolve application data directory"))?;
    Ok(base.join("siteport"))
}

fn default_db_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("siteport.sqlite3"))
}
