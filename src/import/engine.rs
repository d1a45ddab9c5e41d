//! Run orchestration: materialize the package, walk the top-level types in
//! import order, replay deletions, import rows, retry deferred objects once
//! per type, then flush queued file copies.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use super::files::{
    ensure_safe_relative_path, run_file_operations, FileCopyReport, FileOperation,
    FileOperationCollection,
};
use super::hooks::{HookDecision, Hooks, ImportPhase};
use super::object::ObjectOutcome;
use super::postprocess::{PostProcessFailure, PostProcessList};
use super::process::type_is_processed;
use super::progress::{ProgressLog, ProgressStatus};
use super::translation::{DeferralPolicy, TranslationTable};
use super::ImportError;
use crate::catalog::{ObjectCatalog, ObjectTypeInfo};
use crate::package::{
    materialize_package, remove_temporary_files, DataSet, ObjectIdentity, TaskType, FILES_DIR,
};
use crate::settings::{ImportSettings, SystemVersion};
use crate::store::SqliteStore;

/// Collaborators of a run.
pub struct ImportContext<'a> {
    pub catalog: &'a ObjectCatalog,
    pub store: &'a SqliteStore,
    pub hooks: Hooks,
    pub policy: DeferralPolicy,
    pub running_version: SystemVersion,
}

impl<'a> ImportContext<'a> {
    pub fn new(
        catalog: &'a ObjectCatalog,
        store: &'a SqliteStore,
        running_version: SystemVersion,
    ) -> Self {
        Self {
            catalog,
            store,
            hooks: Hooks::default(),
            policy: DeferralPolicy::from_catalog(catalog),
            running_version,
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_policy(mut self, policy: DeferralPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// A committed object and the synchronization task it should emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedObject {
    pub object_type: String,
    pub object_id: i64,
    pub site_id: Option<i64>,
    pub task_type: TaskType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompletedWithWarnings,
    Canceled,
    Failed { reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed | RunOutcome::CompletedWithWarnings)
    }
}

/// Per-type tallies of one run.
///
/// `deferred` counts postponements, not objects: a postponed object that is
/// retried is also tallied once more under its final outcome, so the final
/// outcome counters alone add up to the number of objects processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounters {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub failed: usize,
    pub deleted: usize,
}

impl TypeCounters {
    pub(super) fn record(&mut self, outcome: &ObjectOutcome) {
        match outcome {
            ObjectOutcome::Imported { created: true, .. } => self.created += 1,
            ObjectOutcome::Imported { created: false, .. } => self.updated += 1,
            ObjectOutcome::Unchanged { .. } => self.unchanged += 1,
            ObjectOutcome::Skipped => self.skipped += 1,
            ObjectOutcome::Deferred => self.deferred += 1,
            ObjectOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub started_at: String,
    pub finished_at: String,
    pub package_version: Option<String>,
    pub converted_from: Option<String>,
    pub types: BTreeMap<String, TypeCounters>,
    pub imported: Vec<ImportedObject>,
    pub translations: usize,
    pub warnings: Vec<String>,
    pub post_process_failures: Vec<PostProcessFailure>,
    pub files: Option<FileCopyReport>,
}

impl RunSummary {
    pub fn counters(&self, object_type: &str) -> TypeCounters {
        self.types.get(object_type).cloned().unwrap_or_default()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// State threaded through one run.
pub(super) struct ImportRun<'a> {
    pub(super) catalog: &'a ObjectCatalog,
    pub(super) store: &'a SqliteStore,
    pub(super) hooks: &'a Hooks,
    pub(super) policy: &'a DeferralPolicy,
    pub(super) settings: ImportSettings,
    pub(super) package_root: PathBuf,
    pub(super) translations: TranslationTable,
    pub(super) post_process: PostProcessList,
    pub(super) failures: Vec<PostProcessFailure>,
    pub(super) imported: Vec<ImportedObject>,
    pub(super) counters: BTreeMap<String, TypeCounters>,
    pub(super) identities: HashMap<(String, i64), ObjectIdentity>,
    /// Source ids of every top-level row shipped in the package.
    pub(super) package_ids: HashMap<String, HashSet<i64>>,
    pub(super) skipped: HashMap<String, HashSet<i64>>,
    pub(super) touched: BTreeSet<String>,
    pub(super) files: FileOperationCollection,
    pub(super) file_report: Option<FileCopyReport>,
    pub(super) package_version: Option<String>,
    pub(super) converted_from: Option<String>,
    log: ProgressLog,
}

impl<'a> ImportRun<'a> {
    fn new(ctx: &'a ImportContext<'a>, settings: ImportSettings, log: ProgressLog) -> Self {
        Self {
            catalog: ctx.catalog,
            store: ctx.store,
            hooks: &ctx.hooks,
            policy: &ctx.policy,
            package_root: settings.source_path.clone(),
            settings,
            translations: TranslationTable::new(),
            post_process: PostProcessList::new(),
            failures: Vec::new(),
            imported: Vec::new(),
            counters: BTreeMap::new(),
            identities: HashMap::new(),
            package_ids: HashMap::new(),
            skipped: HashMap::new(),
            touched: BTreeSet::new(),
            files: FileOperationCollection::new(),
            file_report: None,
            package_version: None,
            converted_from: None,
            log,
        }
    }

    pub(super) fn report(&mut self, status: ProgressStatus, message: impl Into<String>) {
        let entry = self.log.record(status, message).clone();
        self.hooks.progress(&entry);
    }

    pub(super) fn warn(&mut self, message: impl Into<String>) {
        self.report(ProgressStatus::Warning, message);
    }

    pub(super) fn check_canceled(&self) -> Result<(), ImportError> {
        if self.settings.is_canceled() {
            Err(ImportError::Canceled)
        } else {
            Ok(())
        }
    }

    pub(super) fn counter_mut(&mut self, object_type: &str) -> &mut TypeCounters {
        self.counters.entry(object_type.to_string()).or_default()
    }

    pub(super) fn count(&mut self, object_type: &str, outcome: &ObjectOutcome) {
        self.counter_mut(object_type).record(outcome);
    }

    pub(super) fn mark_skipped(&mut self, object_type: &str, source_id: Option<i64>) {
        if let Some(id) = source_id {
            self.skipped
                .entry(object_type.to_string())
                .or_default()
                .insert(id);
        }
    }

    pub(super) fn is_skipped(&self, object_type: &str, source_id: i64) -> bool {
        self.skipped
            .get(object_type)
            .is_some_and(|ids| ids.contains(&source_id))
    }

    pub(super) fn in_package(&self, object_type: &str, source_id: i64) -> bool {
        self.package_ids
            .get(object_type)
            .is_some_and(|ids| ids.contains(&source_id))
    }

    fn load_datasets(&mut self) -> Result<Vec<(&'a ObjectTypeInfo, DataSet)>, ImportError> {
        let catalog = self.catalog;
        let mut datasets = Vec::new();
        for info in catalog.import_order()? {
            let path = DataSet::path_for(&self.package_root, info);
            if !path.is_file() {
                continue;
            }
            let dataset = DataSet::load(&path, catalog)?;
            let ids: HashSet<i64> = dataset
                .rows(&info.name)
                .iter()
                .filter_map(|row| row.get_i64(&info.id_column))
                .collect();
            self.package_ids.insert(info.name.clone(), ids);
            for identity in &dataset.identities {
                self.identities.insert(
                    (identity.object_type.clone(), identity.object_id),
                    identity.clone(),
                );
            }
            datasets.push((info, dataset));
        }
        Ok(datasets)
    }

    async fn import_all(&mut self) -> Result<(), ImportError> {
        let datasets = self.load_datasets()?;
        for (info, dataset) in &datasets {
            let info: &'a ObjectTypeInfo = *info;
            self.check_canceled()?;
            let phase = ImportPhase::ObjectType(info.name.clone());

            let skip_reason = if !type_is_processed(&self.settings, info) {
                Some("not selected")
            } else if self.hooks.phase_start(&phase) == HookDecision::Skip {
                Some("skipped by hook")
            } else {
                None
            };
            if let Some(reason) = skip_reason {
                let ids: Vec<i64> = self
                    .package_ids
                    .get(&info.name)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default();
                for id in ids {
                    self.mark_skipped(&info.name, Some(id));
                }
                self.report(
                    ProgressStatus::Info,
                    format!("Skipping {} ({reason})", info.name),
                );
                continue;
            }

            self.report(ProgressStatus::Info, format!("Importing {}", info.name));
            if self.settings.process_deletions {
                self.replay_deletions(info, dataset).await?;
            }

            for row in dataset.rows(&info.name) {
                self.check_canceled()?;
                self.import_top_level(info, dataset, row, false).await?;
            }

            self.run_post_process(info, dataset).await?;
            self.queue_physical_files(info, dataset);
            self.hooks.phase_finish(&phase);
        }
        Ok(())
    }

    async fn run_post_process(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
    ) -> Result<(), ImportError> {
        if self.post_process.is_empty() {
            return Ok(());
        }
        let phase = ImportPhase::PostProcess(info.name.clone());
        let entries = self.post_process.drain();
        if self.hooks.phase_start(&phase) == HookDecision::Skip {
            return Ok(());
        }
        self.report(
            ProgressStatus::Info,
            format!("Retrying {} postponed objects of {}", entries.len(), info.name),
        );

        let catalog = self.catalog;
        for entry in &entries {
            self.check_canceled()?;
            let Some(entry_info) = catalog.get(&entry.object_type) else {
                continue;
            };
            let outcome = self.retry_entry(entry_info, dataset, entry).await?;
            if !matches!(outcome, ObjectOutcome::Failed) {
                continue;
            }
            let code_name = entry_info
                .code_name_column
                .as_deref()
                .and_then(|column| entry.record.get_str(column))
                .map(str::to_string);
            self.failures.push(PostProcessFailure {
                object_type: entry_info.name.clone(),
                source_id: entry.record.get_i64(&entry_info.id_column),
                code_name,
                reason: entry.reason.to_string(),
            });
        }
        self.hooks.phase_finish(&phase);
        Ok(())
    }

    fn queue_physical_files(&mut self, info: &ObjectTypeInfo, dataset: &DataSet) {
        if !self.settings.copy_files || info.physical_files.is_empty() {
            return;
        }
        let Some(target_root) = self.settings.target_root.clone() else {
            return;
        };
        let imported_code_names: Vec<String> = dataset
            .rows(&info.name)
            .iter()
            .filter(|row| {
                row.get_i64(&info.id_column)
                    .is_some_and(|id| self.translations.contains(&info.name, id))
            })
            .filter_map(|row| {
                info.code_name_column
                    .as_deref()
                    .and_then(|column| row.get_str(column))
                    .map(str::to_string)
            })
            .collect();
        if self.translations.count_for(&info.name) == 0 {
            return;
        }

        let files_root = self.package_root.join(FILES_DIR).join(info.safe_name());
        let mut queued = Vec::new();
        for rule in &info.physical_files {
            let per_object = rule.package_path.contains("{code_name}")
                || rule.target_path.contains("{code_name}");
            let names: Vec<Option<&str>> = if per_object {
                imported_code_names.iter().map(|name| Some(name.as_str())).collect()
            } else {
                vec![None]
            };
            for name in names {
                let expand = |template: &str| match name {
                    Some(name) => template.replace("{code_name}", name),
                    None => template.to_string(),
                };
                let package_path = expand(&rule.package_path);
                let target_path = expand(&rule.target_path);
                if ensure_safe_relative_path(&package_path).is_err()
                    || ensure_safe_relative_path(&target_path).is_err()
                {
                    queued.push(Err(format!(
                        "Ignoring unsafe file rule {package_path} -> {target_path} of {}",
                        info.name
                    )));
                    continue;
                }
                queued.push(Ok(FileOperation {
                    source: files_root.join(&package_path),
                    destination: target_root.join(&target_path),
                    kind: rule.kind.into(),
                    mandatory: rule.mandatory,
                }));
            }
        }
        for item in queued {
            match item {
                Ok(operation) => self.files.add(operation),
                Err(message) => self.warn(message),
            }
        }
    }

    fn copy_files(&mut self) -> Result<(), ImportError> {
        if !self.settings.copy_files || self.files.is_empty() {
            return Ok(());
        }
        self.check_canceled()?;
        let phase = ImportPhase::Files;
        if self.hooks.phase_start(&phase) == HookDecision::Skip {
            return Ok(());
        }
        self.report(
            ProgressStatus::Info,
            format!("Copying {} file operations", self.files.len()),
        );
        let report = run_file_operations(&self.files, &self.settings)?;
        for warning in &report.warnings {
            self.warn(warning.clone());
        }
        self.file_report = Some(report);
        self.hooks.phase_finish(&phase);
        Ok(())
    }
}

async fn execute(
    run: &mut ImportRun<'_>,
    settings: &mut ImportSettings,
    running: &SystemVersion,
) -> Result<(), ImportError> {
    run.check_canceled()?;
    let phase = ImportPhase::Run;
    if run.hooks.phase_start(&phase) == HookDecision::Skip {
        run.report(ProgressStatus::Info, "Import skipped by hook");
        return Ok(());
    }

    let package = materialize_package(settings, running)?;
    if let Some(from) = &package.converted_from {
        run.report(
            ProgressStatus::Info,
            format!("Converted package from version {from}"),
        );
    }
    run.settings = settings.clone();
    run.package_root = package.root.clone();
    run.package_version = Some(package.version.to_string());
    run.converted_from = package.converted_from.clone();

    run.import_all().await?;
    run.copy_files()?;
    run.hooks.phase_finish(&phase);
    Ok(())
}

/// Imports the package named by `settings` and reports how the run ended.
///
/// Failures never escape as errors: they are folded into
/// [`RunOutcome::Failed`]. Cache invalidation, temporary file removal and the
/// final progress entry happen whatever the outcome.
pub async fn run_import(settings: &mut ImportSettings, ctx: &ImportContext<'_>) -> RunSummary {
    let started_at = now_rfc3339();
    let log = match ProgressLog::open(settings.progress_log_path.as_deref()) {
        Ok(log) => log,
        Err(err) => {
            tracing::warn!(
                target: "siteport",
                event = "progress_log_open_failed",
                path = ?settings.progress_log_path,
                error = %err,
            );
            ProgressLog::in_memory()
        }
    };

    let mut run = ImportRun::new(ctx, settings.clone(), log);
    run.report(
        ProgressStatus::Start,
        format!("Import started from {}", settings.source_path.display()),
    );

    let result = execute(&mut run, settings, &ctx.running_version).await;
    let outcome = match result {
        Ok(()) if run.log.has_warnings() => RunOutcome::CompletedWithWarnings,
        Ok(()) => RunOutcome::Completed,
        Err(ImportError::Canceled) => RunOutcome::Canceled,
        Err(err) => {
            run.report(ProgressStatus::Error, err.to_string());
            RunOutcome::Failed {
                reason: err.to_string(),
            }
        }
    };

    ctx.hooks.invalidate_caches(&run.touched);
    if let Err(err) = remove_temporary_files(settings) {
        run.warn(format!("Temporary files could not be removed: {err}"));
    }
    let finish = match &outcome {
        RunOutcome::Completed => "Import finished".to_string(),
        RunOutcome::CompletedWithWarnings => "Import finished with warnings".to_string(),
        RunOutcome::Canceled => "Import canceled".to_string(),
        RunOutcome::Failed { reason } => format!("Import failed: {reason}"),
    };
    run.report(ProgressStatus::Finish, finish);
    if let Err(err) = run.log.flush() {
        tracing::warn!(target: "siteport", event = "progress_log_flush_failed", error = %err);
    }

    tracing::info!(
        target: "siteport",
        event = "import_finished",
        outcome = ?outcome,
        imported = run.imported.len(),
        translations = run.translations.len(),
    );

    let warnings = run
        .log
        .entries()
        .iter()
        .filter(|entry| matches!(entry.status, ProgressStatus::Warning | ProgressStatus::Error))
        .map(|entry| entry.message.clone())
        .collect();

    RunSummary {
        outcome,
        started_at,
        finished_at: now_rfc3339(),
        package_version: run.package_version,
        converted_from: run.converted_from,
        types: run.counters,
        imported: run.imported,
        translations: run.translations.len(),
        warnings,
        post_process_failures: run.failures,
        files: run.file_report,
    }
}
