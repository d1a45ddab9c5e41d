//! Per-object import: column translation, existing-object matching, commit,
//! and the recursive pass over children, bindings and meta-files.

use std::collections::HashSet;
use std::fs;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

use super::engine::{ImportRun, ImportedObject};
use super::hooks::{HookDecision, ImportPhase};
use super::postprocess::{DeferReason, PostProcessEntry};
use super::process::process_type;
use super::progress::ProgressStatus;
use super::ImportError;
use crate::catalog::{BindingColumns, IncludeToParent, ObjectTypeInfo};
use crate::package::{DataSet, ExportTask, TaskType, FILES_DIR};
use crate::record::Record;
use crate::settings::ProcessObjectType;
use crate::store::LookupScope;

/// What happened to one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    Imported { id: i64, created: bool },
    /// Matched an existing object that was left as it is.
    Unchanged { id: i64 },
    Skipped,
    Deferred,
    Failed,
}

impl ObjectOutcome {
    pub fn target_id(&self) -> Option<i64> {
        match self {
            ObjectOutcome::Imported { id, .. } | ObjectOutcome::Unchanged { id } => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct ObjectMode {
    /// Second attempt from the post-process queue; never deferred again.
    pub(super) retry: bool,
    /// Row travels inside its owner's dataset and already carries the
    /// owner's target id.
    pub(super) nested: bool,
}

enum Translation {
    Ready(Record),
    Deferred(DeferReason),
    Failed,
}

enum Existing {
    Missing,
    Found(i64),
    Mismatch(String),
}

enum Prepared {
    Ready {
        record: Record,
        source_id: Option<i64>,
        existing: Option<i64>,
    },
    Done(ObjectOutcome),
}

fn describe(info: &ObjectTypeInfo, record: &Record) -> String {
    info.code_name_column
        .as_deref()
        .and_then(|column| record.get_str(column))
        .map(str::to_string)
        .or_else(|| info.guid_column.as_deref().and_then(|column| record.get_guid(column)))
        .or_else(|| record.get_i64(&info.id_column).map(|id| format!("#{id}")))
        .unwrap_or_else(|| "(unnamed)".to_string())
}

fn same_value(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Bool(flag), Value::Number(number)) | (Value::Number(number), Value::Bool(flag)) => {
            number.as_i64() == Some(i64::from(*flag))
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Whether writing `incoming` over `current` would change any stored column.
fn differs(info: &ObjectTypeInfo, current: &Record, incoming: &Record) -> bool {
    incoming.iter().any(|(column, value)| {
        if column == info.id_column || info.column(column).is_none() {
            return false;
        }
        let stored = current.get(column).filter(|stored| !stored.is_null());
        match (stored, value.is_null()) {
            (None, true) => false,
            (None, false) | (Some(_), true) => true,
            (Some(stored), false) => !same_value(stored, value),
        }
    })
}

impl<'a> ImportRun<'a> {
    /// Imports one top-level row according to its effective process type.
    pub(super) async fn import_top_level(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
        row: &Record,
        retry: bool,
    ) -> Result<ObjectOutcome, ImportError> {
        let code_name = info
            .code_name_column
            .as_deref()
            .and_then(|column| row.get_str(column));
        let mode = ObjectMode {
            retry,
            nested: false,
        };
        let outcome = match process_type(&self.settings, info, code_name) {
            ProcessObjectType::None | ProcessObjectType::Selected => ObjectOutcome::Skipped,
            ProcessObjectType::SiteBinding => self.bind_to_site(info, row).await?,
            ProcessObjectType::All => match self.parent_gate(info, row, retry) {
                Some(outcome) => outcome,
                None if info.is_binding => self.import_binding_row(info, row, mode).await?,
                None => self.import_object(info, dataset, row, mode).await?,
            },
        };
        if outcome == ObjectOutcome::Skipped {
            self.mark_skipped(&info.name, row.get_i64(&info.id_column));
        }
        self.count(&info.name, &outcome);
        Ok(outcome)
    }

    /// Rows whose parent ships in the same package wait until the parent is
    /// in, and follow it when it was skipped.
    fn parent_gate(
        &mut self,
        info: &ObjectTypeInfo,
        row: &Record,
        retry: bool,
    ) -> Option<ObjectOutcome> {
        let (Some(parent_type), Some(parent_column)) =
            (info.parent_type.as_deref(), info.parent_column.as_deref())
        else {
            return None;
        };
        let parent_id = row.get_i64(parent_column)?;
        if !self.in_package(parent_type, parent_id)
            || self.translations.contains(parent_type, parent_id)
        {
            return None;
        }
        if self.is_skipped(parent_type, parent_id) {
            return Some(ObjectOutcome::Skipped);
        }
        if retry {
            return None;
        }
        self.defer(
            info,
            row,
            DeferReason::ParentPending {
                parent_type: parent_type.to_string(),
                parent_id,
            },
            false,
        );
        Some(ObjectOutcome::Deferred)
    }

    fn defer(&mut self, info: &ObjectTypeInfo, row: &Record, reason: DeferReason, nested: bool) {
        self.report(
            ProgressStatus::Info,
            format!("Postponing {} {}: {reason}", info.name, describe(info, row)),
        );
        self.post_process.push(PostProcessEntry {
            object_type: info.name.clone(),
            record: row.clone(),
            reason,
            nested,
        });
    }

    /// Retries a deferred object once.
    pub(super) async fn retry_entry(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
        entry: &PostProcessEntry,
    ) -> Result<ObjectOutcome, ImportError> {
        if !entry.nested {
            return self.import_top_level(info, dataset, &entry.record, true).await;
        }
        let mode = ObjectMode {
            retry: true,
            nested: true,
        };
        let outcome = if info.is_binding {
            self.import_binding_row(info, &entry.record, mode).await?
        } else {
            self.import_object(info, dataset, &entry.record, mode).await?
        };
        self.count(&info.name, &outcome);
        Ok(outcome)
    }

    pub(super) async fn import_object(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
        row: &Record,
        mode: ObjectMode,
    ) -> Result<ObjectOutcome, ImportError> {
        match self.prepare(info, row, mode).await? {
            Prepared::Done(outcome) => Ok(outcome),
            Prepared::Ready {
                record,
                source_id,
                existing,
            } => self.commit(info, dataset, record, source_id, existing).await,
        }
    }

    async fn prepare(
        &mut self,
        info: &'a ObjectTypeInfo,
        row: &Record,
        mode: ObjectMode,
    ) -> Result<Prepared, ImportError> {
        let source_id = row.get_i64(&info.id_column);
        let mut record = match self.translate_columns(info, row, mode).await? {
            Translation::Ready(record) => record,
            Translation::Deferred(reason) => {
                self.defer(info, row, reason, mode.nested);
                return Ok(Prepared::Done(ObjectOutcome::Deferred));
            }
            Translation::Failed => return Ok(Prepared::Done(ObjectOutcome::Failed)),
        };
        record.remove(&info.id_column);

        let existing = match self.find_existing(info, &record).await? {
            Existing::Missing => None,
            Existing::Found(id) => Some(id),
            Existing::Mismatch(code_name) if mode.retry => {
                self.warn(format!(
                    "{} {code_name} was not imported: an object with the same code name and a different GUID already exists",
                    info.name
                ));
                return Ok(Prepared::Done(ObjectOutcome::Skipped));
            }
            Existing::Mismatch(code_name) => {
                self.defer(info, row, DeferReason::GuidMismatch { code_name }, mode.nested);
                return Ok(Prepared::Done(ObjectOutcome::Deferred));
            }
        };

        Ok(Prepared::Ready {
            record,
            source_id,
            existing,
        })
    }

    /// Column of a nested row that holds its owner's id.
    fn owner_column(&self, info: &'a ObjectTypeInfo) -> Option<&'a str> {
        let catalog = self.catalog;
        if catalog.is_metafile(info) {
            catalog.metafile().map(|meta| meta.object_id_column.as_str())
        } else {
            info.parent_column.as_deref()
        }
    }

    async fn translate_columns(
        &mut self,
        info: &'a ObjectTypeInfo,
        row: &Record,
        mode: ObjectMode,
    ) -> Result<Translation, ImportError> {
        let catalog = self.catalog;
        let mut record = row.clone();
        let site_id = self.settings.site_id;
        let site_column = info.site_column.as_deref();

        if let Some(column) = site_column {
            if record.get(column).is_some() {
                match site_id {
                    Some(site) => record.set(column, site),
                    None => record.set_null(column),
                }
            }
        }

        let owner = if mode.nested {
            self.owner_column(info)
        } else {
            None
        };

        for reference in info.all_references() {
            let column = reference.column.as_str();
            if Some(column) == owner || Some(column) == site_column {
                continue;
            }
            let Some(source_id) = record.get_i64(column) else {
                continue;
            };

            if catalog.site_type() == Some(reference.object_type.as_str()) {
                match site_id {
                    Some(site) => record.set(column, site),
                    None => record.set_null(column),
                }
                continue;
            }

            if let Some(target) = self.resolve_reference(&reference.object_type, source_id).await? {
                record.set(column, target);
                continue;
            }

            if catalog.user_type() == Some(reference.object_type.as_str()) {
                if let Some(admin) = self.settings.admin_user_id {
                    record.set(column, admin);
                    continue;
                }
            }

            let object = describe(info, row);
            if !reference.required {
                record.set_null(column);
                self.report(
                    ProgressStatus::Info,
                    format!(
                        "{} {object}: {column} cleared, {} {source_id} is not available",
                        info.name, reference.object_type
                    ),
                );
                continue;
            }

            if !mode.retry && self.policy.is_deferrable(&info.name, column) {
                return Ok(Translation::Deferred(DeferReason::UnresolvedReference {
                    column: column.to_string(),
                    target_type: reference.object_type.clone(),
                    source_id,
                }));
            }

            if mode.retry
                || !info.required_object
                || self.settings.skip_object_on_translation_error
            {
                self.warn(format!(
                    "{} {object} was not imported: {column} references {} {source_id}, which could not be translated",
                    info.name, reference.object_type
                ));
                return Ok(Translation::Failed);
            }

            return Err(ImportError::DependencyViolation {
                object_type: info.name.clone(),
                object,
                column: column.to_string(),
                target_type: reference.object_type.clone(),
                source_id,
            });
        }

        Ok(Translation::Ready(record))
    }

    /// Destination id of a source object: the run's translations first,
    /// then identities shipped with the package matched against the target.
    async fn resolve_reference(
        &mut self,
        object_type: &str,
        source_id: i64,
    ) -> Result<Option<i64>, ImportError> {
        if let Some(target) = self.translations.get(object_type, source_id) {
            return Ok(Some(target));
        }
        let Some(identity) = self
            .identities
            .get(&(object_type.to_string(), source_id))
            .cloned()
        else {
            return Ok(None);
        };
        let catalog = self.catalog;
        let Some(info) = catalog.get(object_type) else {
            return Ok(None);
        };

        let site = if identity.site_id.is_some() && info.is_site_scoped() {
            self.settings.site_id
        } else {
            None
        };
        let mut found = None;
        if let Some(guid) = identity.guid.as_deref() {
            found = self
                .store
                .find_by_guid(info, guid, LookupScope::site(site))
                .await?;
        }
        if found.is_none() {
            if let Some(code_name) = identity.code_name.as_deref() {
                found = self
                    .store
                    .find_by_code_name(info, code_name, LookupScope::site(site))
                    .await?;
            }
        }

        let target = found.and_then(|record| record.get_i64(&info.id_column));
        if let Some(target) = target {
            self.translations.insert(object_type, source_id, target);
        }
        Ok(target)
    }

    /// GUID match first, then code name inside the translated scope.
    async fn find_existing(
        &self,
        info: &ObjectTypeInfo,
        record: &Record,
    ) -> Result<Existing, ImportError> {
        let guid = info
            .guid_column
            .as_deref()
            .and_then(|column| record.get_guid(column));
        let scope = LookupScope::of(info, record);
        if let Some(guid) = guid.as_deref() {
            if let Some(found) = self.store.find_by_guid(info, guid, scope).await? {
                return Ok(found
                    .get_i64(&info.id_column)
                    .map_or(Existing::Missing, Existing::Found));
            }
        }

        let Some(code_name) = info
            .code_name_column
            .as_deref()
            .and_then(|column| record.get_str(column))
        else {
            return Ok(Existing::Missing);
        };
        let Some(found) = self
            .store
            .find_by_code_name(info, code_name, scope)
            .await?
        else {
            return Ok(Existing::Missing);
        };

        let found_guid = info
            .guid_column
            .as_deref()
            .and_then(|column| found.get_guid(column));
        match (guid, found_guid) {
            (Some(incoming), Some(stored)) if incoming != stored => {
                Ok(Existing::Mismatch(code_name.to_string()))
            }
            _ => Ok(found
                .get_i64(&info.id_column)
                .map_or(Existing::Missing, Existing::Found)),
        }
    }

    async fn commit(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
        mut record: Record,
        source_id: Option<i64>,
        existing: Option<i64>,
    ) -> Result<ObjectOutcome, ImportError> {
        if let (Some(id), true) = (existing, self.settings.import_only_new_objects) {
            return self.keep_existing(info, dataset, source_id, id).await;
        }

        let binary = self.load_binary(info, &mut record)?;

        if let Some(id) = existing {
            if let Some(current) = self.store.get(info, id).await? {
                let binary_unchanged = match binary.as_deref() {
                    None => true,
                    Some(bytes) => self.store.binary(info, id).await?.as_deref() == Some(bytes),
                };
                if binary_unchanged && !differs(info, &current, &record) {
                    return self.keep_existing(info, dataset, source_id, id).await;
                }
            }
        }

        let (id, created) = match existing {
            Some(id) => {
                self.store
                    .update(info, id, &record, binary.as_deref(), false)
                    .await?;
                (id, false)
            }
            None => (
                self.store
                    .insert(info, &record, binary.as_deref(), false)
                    .await?,
                true,
            ),
        };
        drop(binary);

        if let Some(source_id) = source_id {
            self.translations.insert(&info.name, source_id, id);
        }
        self.touched.insert(info.name.clone());

        if !created && info.versioned && self.settings.create_version {
            self.store.create_version(info, id).await?;
        }

        if !info.included_in_parent_sync {
            let site_id = info
                .site_column
                .as_deref()
                .and_then(|column| record.get_i64(column));
            self.record_imported(info, id, site_id, TaskType::Update)
                .await?;
        }

        tracing::debug!(
            target: "siteport",
            event = "object_committed",
            object_type = %info.name,
            object = %describe(info, &record),
            id,
            created,
        );

        if let Some(source_id) = source_id {
            self.import_nested(info, dataset, source_id, id, created)
                .await?;
        }
        Ok(ObjectOutcome::Imported { id, created })
    }

    /// Reuses an existing object as it is: its id still serves translation
    /// and its nested rows are still merged.
    async fn keep_existing(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
        source_id: Option<i64>,
        id: i64,
    ) -> Result<ObjectOutcome, ImportError> {
        if let Some(source_id) = source_id {
            self.translations.insert(&info.name, source_id, id);
            self.import_nested(info, dataset, source_id, id, false)
                .await?;
        }
        Ok(ObjectOutcome::Unchanged { id })
    }

    async fn record_imported(
        &mut self,
        info: &ObjectTypeInfo,
        id: i64,
        site_id: Option<i64>,
        task_type: TaskType,
    ) -> Result<(), ImportError> {
        let object = ImportedObject {
            object_type: info.name.clone(),
            object_id: id,
            site_id,
            task_type,
        };
        self.hooks.object_imported(&object);
        if self.settings.log_synchronization {
            self.store
                .log_sync_task(&info.name, id, site_id, task_type)
                .await?;
        }
        self.imported.push(object);
        Ok(())
    }

    /// Binary payloads are read from `files/<type>/<gg>/<guid>` right before
    /// the write; an inline base64 cell is the fallback.
    fn load_binary(
        &self,
        info: &ObjectTypeInfo,
        record: &mut Record,
    ) -> Result<Option<Vec<u8>>, ImportError> {
        let Some(column) = info.binary_column.as_deref() else {
            return Ok(None);
        };
        let inline = record.remove(column);

        let guid = info
            .guid_column
            .as_deref()
            .and_then(|column| record.get_guid(column));
        if let Some((prefix, guid)) = guid
            .as_deref()
            .and_then(|guid| guid.get(..2).map(|prefix| (prefix, guid)))
        {
            let path = self
                .package_root
                .join(FILES_DIR)
                .join(info.safe_name())
                .join(prefix)
                .join(guid);
            if path.is_file() {
                return fs::read(&path)
                    .map(Some)
                    .map_err(|source| ImportError::PackageFile {
                        path: path.display().to_string(),
                        source,
                    });
            }
        }

        match inline {
            Some(Value::String(text)) if !text.trim().is_empty() => STANDARD
                .decode(text.trim())
                .map(Some)
                .map_err(|err| ImportError::Binary {
                    object_type: info.name.clone(),
                    object: describe(info, record),
                    reason: err.to_string(),
                }),
            _ => Ok(None),
        }
    }

    async fn import_nested(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
        source_id: i64,
        target_id: i64,
        parent_is_new: bool,
    ) -> Result<(), ImportError> {
        let catalog = self.catalog;

        for child in catalog.children_of(&info.name) {
            let Some(parent_column) = child.parent_column.as_deref() else {
                continue;
            };
            let rows: Vec<Record> = dataset
                .rows_where(&child.name, parent_column, source_id)
                .map(|row| {
                    let mut row = row.clone();
                    row.set(parent_column, target_id);
                    row
                })
                .collect();
            let existing = if parent_is_new {
                Vec::new()
            } else {
                self.store.list_where(child, parent_column, target_id).await?
            };
            Box::pin(self.import_owned_rows(child, dataset, rows, existing, parent_is_new)).await?;
        }

        for binding in catalog.bindings_of(&info.name) {
            self.import_nested_bindings(
                binding,
                dataset,
                &info.name,
                source_id,
                target_id,
                parent_is_new,
            )
            .await?;
        }

        let Some(meta) = catalog.metafile() else {
            return Ok(());
        };
        let Some(meta_info) = catalog.get(&meta.object_type) else {
            return Ok(());
        };
        if meta_info.name == info.name {
            return Ok(());
        }
        let owned_by_this = |row: &Record| -> bool {
            row.get_str(&meta.object_type_column)
                .is_some_and(|owner| owner.eq_ignore_ascii_case(&info.name))
        };
        let rows: Vec<Record> = dataset
            .rows(&meta_info.name)
            .iter()
            .filter(|row| {
                owned_by_this(*row) && row.get_i64(&meta.object_id_column) == Some(source_id)
            })
            .map(|row| {
                let mut row = row.clone();
                row.set(meta.object_id_column.as_str(), target_id);
                row
            })
            .collect();
        let existing = if parent_is_new {
            Vec::new()
        } else {
            self.store
                .list_where(meta_info, &meta.object_id_column, target_id)
                .await?
                .into_iter()
                .filter(|row| owned_by_this(row))
                .collect()
        };
        Box::pin(self.import_owned_rows(meta_info, dataset, rows, existing, parent_is_new)).await
    }

    /// Merges the nested rows of one owner: drops stale rows for complete
    /// inclusion, then writes new rows in one batch when allowed and the
    /// rest one by one.
    async fn import_owned_rows(
        &mut self,
        child: &'a ObjectTypeInfo,
        dataset: &DataSet,
        rows: Vec<Record>,
        existing: Vec<Record>,
        parent_is_new: bool,
    ) -> Result<(), ImportError> {
        let only_new = self.settings.import_only_new_objects;
        if !only_new && !parent_is_new && child.include_to_parent == IncludeToParent::Complete {
            self.delete_stale(child, &rows, &existing).await?;
        }
        if rows.is_empty() {
            return Ok(());
        }

        let catalog = self.catalog;
        let carries_metafiles = catalog.metafile().is_some_and(|meta| {
            meta.object_type != child.name
                && dataset.rows(&meta.object_type).iter().any(|row| {
                    row.get_str(&meta.object_type_column)
                        .is_some_and(|owner| owner.eq_ignore_ascii_case(&child.name))
                })
        });
        let leaf = catalog.children_of(&child.name).next().is_none()
            && catalog.bindings_of(&child.name).next().is_none()
            && child.binary_column.is_none()
            && !carries_metafiles;
        let batch = self.settings.bulk_insert && leaf && (parent_is_new || only_new);

        let mode = ObjectMode {
            retry: false,
            nested: true,
        };
        let mut pending: Vec<(Option<i64>, Record)> = Vec::new();
        for row in &rows {
            self.check_canceled()?;
            let outcome = if batch {
                match self.prepare(child, row, mode).await? {
                    Prepared::Ready {
                        record,
                        source_id,
                        existing: None,
                    } => {
                        pending.push((source_id, record));
                        continue;
                    }
                    Prepared::Ready {
                        record,
                        source_id,
                        existing,
                    } => self.commit(child, dataset, record, source_id, existing).await?,
                    Prepared::Done(outcome) => outcome,
                }
            } else {
                self.import_object(child, dataset, row, mode).await?
            };
            self.count(&child.name, &outcome);
        }

        if !pending.is_empty() {
            self.bulk_commit(child, pending).await?;
        }
        Ok(())
    }

    async fn bulk_commit(
        &mut self,
        info: &ObjectTypeInfo,
        pending: Vec<(Option<i64>, Record)>,
    ) -> Result<(), ImportError> {
        let (sources, records): (Vec<Option<i64>>, Vec<Record>) = pending.into_iter().unzip();
        let ids = self.store.bulk_insert(info, &records).await?;
        self.touched.insert(info.name.clone());

        for ((source_id, record), id) in sources.into_iter().zip(&records).zip(ids) {
            if let Some(source_id) = source_id {
                self.translations.insert(&info.name, source_id, id);
            }
            if !info.included_in_parent_sync {
                let site_id = info
                    .site_column
                    .as_deref()
                    .and_then(|column| record.get_i64(column));
                self.record_imported(info, id, site_id, TaskType::Update)
                    .await?;
            }
            self.count(&info.name, &ObjectOutcome::Imported { id, created: true });
        }
        Ok(())
    }

    /// Deletes stored rows the package no longer lists, matched by GUID or
    /// code name. Rows without either identity are always replaced.
    async fn delete_stale(
        &mut self,
        info: &'a ObjectTypeInfo,
        incoming: &[Record],
        existing: &[Record],
    ) -> Result<(), ImportError> {
        let guid_column = info.guid_column.as_deref();
        let code_column = info.code_name_column.as_deref();
        let guids: HashSet<String> = incoming
            .iter()
            .filter_map(|row| guid_column.and_then(|column| row.get_guid(column)))
            .collect();
        let names: HashSet<String> = incoming
            .iter()
            .filter_map(|row| code_column.and_then(|column| row.get_str(column)))
            .map(str::to_ascii_lowercase)
            .collect();

        for row in existing {
            let kept = guid_column
                .and_then(|column| row.get_guid(column))
                .is_some_and(|guid| guids.contains(&guid))
                || code_column
                    .and_then(|column| row.get_str(column))
                    .is_some_and(|name| names.contains(&name.to_ascii_lowercase()));
            if kept {
                continue;
            }
            let Some(id) = row.get_i64(&info.id_column) else {
                continue;
            };
            self.delete_object_tree(info, id).await?;
            self.counter_mut(&info.name).deleted += 1;
        }
        Ok(())
    }

    async fn import_nested_bindings(
        &mut self,
        binding: &'a ObjectTypeInfo,
        dataset: &DataSet,
        parent_type: &str,
        source_id: i64,
        target_id: i64,
        parent_is_new: bool,
    ) -> Result<(), ImportError> {
        let Some(columns) = binding.binding_columns(parent_type) else {
            return Ok(());
        };
        let mode = ObjectMode {
            retry: false,
            nested: true,
        };

        let mut ready = Vec::new();
        let mut postponed = false;
        let rows: Vec<Record> = dataset
            .rows_where(&binding.name, &columns.parent, source_id)
            .map(|row| {
                let mut row = row.clone();
                row.set(columns.parent.as_str(), target_id);
                row
            })
            .collect();
        for row in &rows {
            self.check_canceled()?;
            match self.translate_columns(binding, row, mode).await? {
                Translation::Ready(mut record) => {
                    record.remove(&binding.id_column);
                    ready.push(record);
                }
                Translation::Deferred(reason) => {
                    self.defer(binding, row, reason, true);
                    self.count(&binding.name, &ObjectOutcome::Deferred);
                    postponed = true;
                }
                Translation::Failed => self.count(&binding.name, &ObjectOutcome::Failed),
            }
        }

        // A postponed row may still resolve to one of the stored bindings, so
        // the owner keeps all of them until the next import.
        let only_new = self.settings.import_only_new_objects;
        if postponed && !parent_is_new {
            tracing::debug!(
                target: "siteport",
                event = "stale_bindings_kept",
                object_type = %binding.name,
                owner = target_id,
            );
        }
        if !only_new
            && !parent_is_new
            && !postponed
            && binding.include_to_parent == IncludeToParent::Complete
        {
            let wanted: HashSet<i64> = ready
                .iter()
                .filter_map(|record| record.get_i64(&columns.other))
                .collect();
            for stored in self
                .store
                .list_where(binding, &columns.parent, target_id)
                .await?
            {
                if stored
                    .get_i64(&columns.other)
                    .is_some_and(|other| wanted.contains(&other))
                {
                    continue;
                }
                if let Some(id) = stored.get_i64(&binding.id_column) {
                    self.store.delete(binding, id).await?;
                    self.touched.insert(binding.name.clone());
                    self.counter_mut(&binding.name).deleted += 1;
                }
            }
        }

        if parent_is_new && self.settings.bulk_insert {
            let ids = self.store.bulk_insert(binding, &ready).await?;
            if !ids.is_empty() {
                self.touched.insert(binding.name.clone());
            }
            for id in ids {
                self.count(&binding.name, &ObjectOutcome::Imported { id, created: true });
            }
            return Ok(());
        }

        for record in ready {
            let outcome = self.insert_binding(binding, &columns, record).await?;
            self.count(&binding.name, &outcome);
        }
        Ok(())
    }

    /// A binding row on its own: top-level binding types and retries.
    async fn import_binding_row(
        &mut self,
        binding: &'a ObjectTypeInfo,
        row: &Record,
        mode: ObjectMode,
    ) -> Result<ObjectOutcome, ImportError> {
        let refs = binding.all_references();
        let parent_type = binding
            .parent_type
            .clone()
            .or_else(|| refs.first().map(|reference| reference.object_type.clone()));
        let Some(columns) = parent_type
            .as_deref()
            .and_then(|parent| binding.binding_columns(parent))
        else {
            self.warn(format!(
                "{} rows cannot be matched: binding columns are ambiguous",
                binding.name
            ));
            return Ok(ObjectOutcome::Skipped);
        };

        match self.translate_columns(binding, row, mode).await? {
            Translation::Ready(mut record) => {
                record.remove(&binding.id_column);
                self.insert_binding(binding, &columns, record).await
            }
            Translation::Deferred(reason) => {
                self.defer(binding, row, reason, mode.nested);
                Ok(ObjectOutcome::Deferred)
            }
            Translation::Failed => Ok(ObjectOutcome::Failed),
        }
    }

    async fn insert_binding(
        &mut self,
        binding: &ObjectTypeInfo,
        columns: &BindingColumns,
        record: Record,
    ) -> Result<ObjectOutcome, ImportError> {
        let (Some(parent_id), Some(other_id)) = (
            record.get_i64(&columns.parent),
            record.get_i64(&columns.other),
        ) else {
            return Ok(ObjectOutcome::Skipped);
        };
        if let Some(id) = self
            .store
            .find_binding(
                binding,
                (&columns.parent, parent_id),
                (&columns.other, other_id),
            )
            .await?
        {
            return Ok(ObjectOutcome::Unchanged { id });
        }
        let id = self.store.insert(binding, &record, None, false).await?;
        self.touched.insert(binding.name.clone());
        Ok(ObjectOutcome::Imported { id, created: true })
    }

    /// Attaches an existing global object to the target site.
    async fn bind_to_site(
        &mut self,
        info: &'a ObjectTypeInfo,
        row: &Record,
    ) -> Result<ObjectOutcome, ImportError> {
        let catalog = self.catalog;
        let Some(site_id) = self.settings.site_id else {
            return Ok(ObjectOutcome::Skipped);
        };
        let Some(binding) = info
            .site_binding_type
            .as_deref()
            .and_then(|name| catalog.get(name))
        else {
            return Ok(ObjectOutcome::Skipped);
        };
        let Some(columns) = binding.binding_columns(&info.name) else {
            self.warn(format!(
                "{} cannot be assigned to sites through {}",
                info.name, binding.name
            ));
            return Ok(ObjectOutcome::Skipped);
        };

        let id = match self.find_existing(info, row).await? {
            Existing::Found(id) => id,
            Existing::Missing | Existing::Mismatch(_) => {
                self.warn(format!(
                    "{} {} cannot be assigned to the site because it does not exist on the target",
                    info.name,
                    describe(info, row)
                ));
                return Ok(ObjectOutcome::Skipped);
            }
        };
        if let Some(source_id) = row.get_i64(&info.id_column) {
            self.translations.insert(&info.name, source_id, id);
        }

        if self
            .store
            .find_binding(binding, (&columns.parent, id), (&columns.other, site_id))
            .await?
            .is_some()
        {
            return Ok(ObjectOutcome::Unchanged { id });
        }
        let mut record = Record::new();
        record.set(columns.parent.as_str(), id);
        record.set(columns.other.as_str(), site_id);
        self.store.insert(binding, &record, None, false).await?;
        self.touched.insert(binding.name.clone());
        self.record_imported(info, id, Some(site_id), TaskType::AddToSite)
            .await?;
        Ok(ObjectOutcome::Imported { id, created: false })
    }

    /// Deletes an object with everything that hangs off it.
    pub(super) async fn delete_object_tree(
        &mut self,
        info: &'a ObjectTypeInfo,
        id: i64,
    ) -> Result<(), ImportError> {
        let catalog = self.catalog;
        for dependent in catalog
            .types()
            .iter()
            .filter(|candidate| candidate.parent_type.as_deref() == Some(info.name.as_str()))
        {
            if dependent.is_binding {
                if let Some(columns) = dependent.binding_columns(&info.name) {
                    self.store
                        .delete_where(dependent, &columns.parent, id)
                        .await?;
                }
                continue;
            }
            let Some(parent_column) = dependent.parent_column.as_deref() else {
                continue;
            };
            for row in self.store.list_where(dependent, parent_column, id).await? {
                if let Some(child_id) = row.get_i64(&dependent.id_column) {
                    Box::pin(self.delete_object_tree(dependent, child_id)).await?;
                }
            }
        }

        if let Some(meta) = catalog.metafile().filter(|meta| meta.object_type != info.name) {
            if let Some(meta_info) = catalog.get(&meta.object_type) {
                for row in self
                    .store
                    .list_where(meta_info, &meta.object_id_column, id)
                    .await?
                {
                    let owned = row
                        .get_str(&meta.object_type_column)
                        .is_some_and(|owner| owner.eq_ignore_ascii_case(&info.name));
                    if let (true, Some(meta_id)) = (owned, row.get_i64(&meta_info.id_column)) {
                        self.store.delete(meta_info, meta_id).await?;
                    }
                }
            }
        }

        self.store.delete(info, id).await?;
        self.touched.insert(info.name.clone());
        Ok(())
    }

    /// Replays delete and remove-from-site tasks shipped for the type.
    pub(super) async fn replay_deletions(
        &mut self,
        info: &'a ObjectTypeInfo,
        dataset: &DataSet,
    ) -> Result<(), ImportError> {
        let selected = self.settings.selection.tasks.get(&info.name).cloned();
        let tasks: Vec<ExportTask> = dataset
            .tasks_for(&info.name)
            .filter(|task| matches!(task.task_type, TaskType::Delete | TaskType::RemoveFromSite))
            .filter(|task| {
                selected
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&task.task_id))
            })
            .cloned()
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }

        let phase = ImportPhase::Deletions(info.name.clone());
        if self.hooks.phase_start(&phase) == HookDecision::Skip {
            return Ok(());
        }
        for task in &tasks {
            self.check_canceled()?;
            if let Err(err) = self.replay_task(info, task).await {
                if err.is_canceled() {
                    return Err(err);
                }
                let name = task
                    .code_name
                    .clone()
                    .or_else(|| task.guid.clone())
                    .unwrap_or_else(|| format!("task {}", task.task_id));
                self.warn(format!(
                    "{} {name} could not be deleted ({err}), please delete it manually",
                    info.name
                ));
            }
        }
        self.hooks.phase_finish(&phase);
        Ok(())
    }

    async fn replay_task(
        &mut self,
        info: &'a ObjectTypeInfo,
        task: &ExportTask,
    ) -> Result<(), ImportError> {
        let site = if info.is_site_scoped() {
            self.settings.site_id
        } else {
            None
        };
        let mut found = None;
        if let Some(guid) = task.guid.as_deref() {
            found = self
                .store
                .find_by_guid(info, guid, LookupScope::site(site))
                .await?;
        }
        if found.is_none() {
            if let Some(code_name) = task.code_name.as_deref() {
                found = self
                    .store
                    .find_by_code_name(info, code_name, LookupScope::site(site))
                    .await?;
            }
        }
        let Some(record) = found else {
            self.report(
                ProgressStatus::Info,
                format!(
                    "{} {} is not on the target, nothing to delete",
                    info.name,
                    task.code_name.as_deref().unwrap_or("(unnamed)")
                ),
            );
            return Ok(());
        };
        let Some(id) = record.get_i64(&info.id_column) else {
            return Ok(());
        };
        let site_id = info
            .site_column
            .as_deref()
            .and_then(|column| record.get_i64(column));

        match task.task_type {
            TaskType::Delete => {
                self.delete_object_tree(info, id).await?;
                self.counter_mut(&info.name).deleted += 1;
                self.record_imported(info, id, site_id, TaskType::Delete)
                    .await?;
            }
            TaskType::RemoveFromSite => {
                let catalog = self.catalog;
                let (Some(site), Some(binding)) = (
                    self.settings.site_id,
                    info.site_binding_type
                        .as_deref()
                        .and_then(|name| catalog.get(name)),
                ) else {
                    return Ok(());
                };
                let Some(columns) = binding.binding_columns(&info.name) else {
                    return Ok(());
                };
                if let Some(binding_id) = self
                    .store
                    .find_binding(binding, (&columns.parent, id), (&columns.other, site))
                    .await?
                {
                    self.store.delete(binding, binding_id).await?;
                    self.touched.insert(binding.name.clone());
                    self.record_imported(info, id, Some(site), TaskType::RemoveFromSite)
                        .await?;
                }
            }
            TaskType::Update | TaskType::AddToSite => {}
        }
        Ok(())
    }
}
