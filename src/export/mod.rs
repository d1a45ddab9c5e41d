//! Package writer side: reads selected objects from a store and lays them
//! out as a package the importer can consume.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fs2::available_space;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::catalog::{CatalogError, FileRuleKind, ObjectCatalog, ObjectTypeInfo};
use crate::import::files::ensure_safe_relative_path;
use crate::package::{
    file_sha256, write_dataset, write_manifest, DataSet, DataSetContent, ExportTask,
    ManifestFile, ObjectIdentity, PackageError, PackageManifest, CURRENT_FORMAT_VERSION,
    FILES_DIR, MANIFEST_FILE,
};
use crate::record::Record;
use crate::settings::{ObjectSelection, ProcessObjectType, ProjectType};
use crate::store::{SqliteStore, StoreError};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to build archive {path}: {reason}")]
    Zip { path: String, reason: String },
    #[error("not enough disk space for the package (need {required} bytes, {available} available)")]
    LowDisk { required: u64, available: u64 },
    #[error("unsafe file rule {0}")]
    UnsafePath(String),
}

impl ExportError {
    fn io(path: &Path, source: io::Error) -> Self {
        ExportError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

fn default_version() -> String {
    CURRENT_FORMAT_VERSION.to_string()
}

fn default_process_type() -> ProcessObjectType {
    ProcessObjectType::All
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Package folder, or the archive path when `zip` is set.
    pub target_path: PathBuf,
    #[serde(default)]
    pub zip: bool,
    #[serde(default)]
    pub selection: ObjectSelection,
    #[serde(default = "default_process_type")]
    pub default_process_type: ProcessObjectType,
    /// Limits site-scoped types to one site; global rows always travel.
    #[serde(default)]
    pub site_id: Option<i64>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub hotfix: u32,
    #[serde(default)]
    pub project_type: Option<ProjectType>,
    /// Root the physical file rules are read from.
    #[serde(default)]
    pub source_root: Option<PathBuf>,
    /// Deletions recorded on this system to replay on the target.
    #[serde(default)]
    pub tasks: Vec<ExportTask>,
}

impl ExportSettings {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            zip: false,
            selection: ObjectSelection::default(),
            default_process_type: ProcessObjectType::All,
            site_id: None,
            version: default_version(),
            hotfix: 0,
            project_type: None,
            source_root: None,
            tasks: Vec::new(),
        }
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read export settings {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parse export settings {}", path.display()))
    }

    fn exports(&self, info: &ObjectTypeInfo, record: &Record) -> bool {
        if self.selection.excluded_types.contains(&info.name) {
            return false;
        }
        if let (Some(site), Some(column)) = (self.site_id, info.site_column.as_deref()) {
            if record.get_i64(column).is_some_and(|row_site| row_site != site) {
                return false;
            }
        }
        match self.selection.objects.get(&info.name) {
            Some(selected) => info
                .code_name_column
                .as_deref()
                .and_then(|column| record.get_str(column))
                .is_some_and(|name| selected.iter().any(|s| s.eq_ignore_ascii_case(name))),
            None => matches!(self.default_process_type, ProcessObjectType::All),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub root: PathBuf,
    pub archive: Option<PathBuf>,
    pub objects: BTreeMap<String, usize>,
    pub binaries: usize,
    pub files: usize,
    pub tasks: usize,
}

/// Rows of one dataset file, in the order their types were first seen.
struct DataSetRows<'c> {
    order: Vec<&'c ObjectTypeInfo>,
    rows: HashMap<String, Vec<Record>>,
}

impl<'c> DataSetRows<'c> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            rows: HashMap::new(),
        }
    }

    fn push(&mut self, info: &'c ObjectTypeInfo, record: Record) {
        if !self.rows.contains_key(&info.name) {
            self.order.push(info);
        }
        self.rows.entry(info.name.clone()).or_default().push(record);
    }

    fn is_empty(&self) -> bool {
        self.rows.values().all(Vec::is_empty)
    }

    fn into_tables(mut self) -> Vec<(&'c ObjectTypeInfo, Vec<Record>)> {
        self.order
            .into_iter()
            .map(|info| {
                let rows = self.rows.remove(&info.name).unwrap_or_default();
                (info, rows)
            })
            .collect()
    }
}

struct Exporter<'c> {
    catalog: &'c ObjectCatalog,
    store: &'c SqliteStore,
    settings: &'c ExportSettings,
    root: PathBuf,
    binaries: usize,
}

impl<'c> Exporter<'c> {
    /// Adds a top-level row and everything nested under it.
    async fn collect(
        &mut self,
        info: &'c ObjectTypeInfo,
        record: Record,
        rows: &mut DataSetRows<'c>,
    ) -> Result<(), ExportError> {
        let Some(id) = record.get_i64(&info.id_column) else {
            return Ok(());
        };
        let record = self.attach_binary(info, id, record).await?;
        rows.push(info, record);

        let catalog = self.catalog;
        for child in catalog.children_of(&info.name) {
            let Some(parent_column) = child.parent_column.as_deref() else {
                continue;
            };
            for row in self.store.list_where(child, parent_column, id).await? {
                Box::pin(self.collect(child, row, rows)).await?;
            }
        }
        for binding in catalog.bindings_of(&info.name) {
            let Some(columns) = binding.binding_columns(&info.name) else {
                continue;
            };
            for row in self.store.list_where(binding, &columns.parent, id).await? {
                rows.push(binding, row);
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
                    if owned {
                        Box::pin(self.collect(meta_info, row, rows)).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes the binary payload under `files/`, or inline when the type has
    /// no GUID to key it by.
    async fn attach_binary(
        &mut self,
        info: &ObjectTypeInfo,
        id: i64,
        mut record: Record,
    ) -> Result<Record, ExportError> {
        let Some(column) = info.binary_column.as_deref() else {
            return Ok(record);
        };
        let Some(bytes) = self.store.binary(info, id).await? else {
            return Ok(record);
        };
        self.binaries += 1;

        let guid = info
            .guid_column
            .as_deref()
            .and_then(|guid_column| record.get_guid(guid_column));
        match guid.as_deref().and_then(|guid| guid.get(..2).map(|prefix| (prefix, guid))) {
            Some((prefix, guid)) => {
                let dir = self.root.join(FILES_DIR).join(info.safe_name()).join(prefix);
                fs::create_dir_all(&dir).map_err(|err| ExportError::io(&dir, err))?;
                let path = dir.join(guid);
                fs::write(&path, &bytes).map_err(|err| ExportError::io(&path, err))?;
            }
            None => record.set(column, STANDARD.encode(&bytes)),
        }
        Ok(record)
    }

    /// Identities of objects referenced by the rows but not shipped with them.
    async fn identities(
        &self,
        tables: &[(&'c ObjectTypeInfo, Vec<Record>)],
        shipped: &BTreeSet<(String, i64)>,
    ) -> Result<Vec<ObjectIdentity>, ExportError> {
        let catalog = self.catalog;
        let mut wanted: BTreeSet<(String, i64)> = BTreeSet::new();
        for (info, rows) in tables {
            for reference in info.all_references() {
                if catalog.site_type() == Some(reference.object_type.as_str()) {
                    continue;
                }
                for row in rows {
                    if let Some(id) = row.get_i64(&reference.column) {
                        let key = (reference.object_type.clone(), id);
                        if !shipped.contains(&key) {
                            wanted.insert(key);
                        }
                    }
                }
            }
        }

        let mut identities = Vec::new();
        for (object_type, id) in wanted {
            let Some(info) = catalog.get(&object_type) else {
                continue;
            };
            let Some(record) = self.store.get(info, id).await? else {
                continue;
            };
            identities.push(ObjectIdentity {
                object_type,
                object_id: id,
                code_name: info
                    .code_name_column
                    .as_deref()
                    .and_then(|column| record.get_str(column))
                    .map(str::to_string),
                guid: info
                    .guid_column
                    .as_deref()
                    .and_then(|column| record.get_guid(column)),
                site_id: info
                    .site_column
                    .as_deref()
                    .and_then(|column| record.get_i64(column)),
            });
        }
        Ok(identities)
    }

    fn copy_physical_files(
        &self,
        info: &ObjectTypeInfo,
        rows: &[Record],
    ) -> Result<usize, ExportError> {
        let Some(source_root) = self.settings.source_root.as_deref() else {
            return Ok(0);
        };
        let code_names: Vec<&str> = rows
            .iter()
            .filter_map(|row| {
                info.code_name_column
                    .as_deref()
                    .and_then(|column| row.get_str(column))
            })
            .collect();

        let mut copied = 0;
        let files_root = self.root.join(FILES_DIR).join(info.safe_name());
        for rule in &info.physical_files {
            let per_object = rule.package_path.contains("{code_name}")
                || rule.target_path.contains("{code_name}");
            let names: Vec<Option<&str>> = if per_object {
                code_names.iter().copied().map(Some).collect()
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
                for path in [&package_path, &target_path] {
                    ensure_safe_relative_path(path)
                        .map_err(|_| ExportError::UnsafePath(path.clone()))?;
                }
                let source = source_root.join(&target_path);
                let destination = files_root.join(&package_path);
                if !source.exists() {
                    tracing::warn!(
                        target: "siteport",
                        event = "export_file_missing",
                        object_type = %info.name,
                        path = %source.display(),
                    );
                    continue;
                }
                copied += match rule.kind {
                    FileRuleKind::Directory => copy_dir(&source, &destination)?,
                    FileRuleKind::File | FileRuleKind::Assembly => {
                        copy_file(&source, &destination)?;
                        1
                    }
                };
            }
        }
        Ok(copied)
    }
}

fn copy_file(source: &Path, destination: &Path) -> Result<(), ExportError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|err| ExportError::io(parent, err))?;
    }
    fs::copy(source, destination).map_err(|err| ExportError::io(destination, err))?;
    Ok(())
}

fn copy_dir(source: &Path, destination: &Path) -> Result<usize, ExportError> {
    let mut copied = 0;
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|err| ExportError::io(source, err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        copy_file(entry.path(), &destination.join(relative))?;
        copied += 1;
    }
    Ok(copied)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Hashes every file of the package except the manifest itself.
fn manifest_entries(root: &Path) -> Result<Vec<ManifestFile>, ExportError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| ExportError::io(root, err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = relative_key(root, entry.path()) else {
            continue;
        };
        if key == MANIFEST_FILE {
            continue;
        }
        let sha256 = file_sha256(entry.path()).map_err(|err| {
            ExportError::io(entry.path(), io::Error::new(io::ErrorKind::Other, err.to_string()))
        })?;
        files.push(ManifestFile { path: key, sha256 });
    }
    Ok(files)
}

fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

fn write_archive(staging: &Path, archive: &Path) -> Result<(), ExportError> {
    let zip_err = |err: zip::result::ZipError| ExportError::Zip {
        path: archive.display().to_string(),
        reason: err.to_string(),
    };
    let parent = archive
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| ExportError::io(parent, err))?;

    let required = dir_size(staging);
    let available = available_space(parent).map_err(|err| ExportError::io(parent, err))?;
    if available < required {
        return Err(ExportError::LowDisk {
            required,
            available,
        });
    }

    let file = File::create(archive).map_err(|err| ExportError::io(archive, err))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in WalkDir::new(staging).sort_by_file_name() {
        let entry = entry.map_err(|err| ExportError::io(staging, err.into()))?;
        let Some(key) = relative_key(staging, entry.path()) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{key}/"), options)
                .map_err(zip_err)?;
        } else if entry.file_type().is_file() {
            writer.start_file(key, options).map_err(zip_err)?;
            let mut source =
                File::open(entry.path()).map_err(|err| ExportError::io(entry.path(), err))?;
            io::copy(&mut source, &mut writer).map_err(|err| ExportError::io(archive, err))?;
        }
    }
    writer.finish().map_err(zip_err)?;
    Ok(())
}

/// Writes a package of the selected objects.
///
/// Each top-level type gets its own dataset file holding its rows, their
/// nested children, bindings and meta-files, the identities of referenced
/// objects left out of the package, and the type's deletion tasks.
pub async fn export_package(
    catalog: &ObjectCatalog,
    store: &SqliteStore,
    settings: &ExportSettings,
) -> Result<ExportSummary, ExportError> {
    let staging = if settings.zip {
        Some(
            tempfile::Builder::new()
                .prefix("siteport-export")
                .tempdir()
                .map_err(|err| ExportError::io(&std::env::temp_dir(), err))?,
        )
    } else {
        None
    };
    let root = match &staging {
        Some(dir) => dir.path().to_path_buf(),
        None => settings.target_path.clone(),
    };
    fs::create_dir_all(&root).map_err(|err| ExportError::io(&root, err))?;

    tracing::info!(
        target: "siteport",
        event = "export_started",
        target = %settings.target_path.display(),
        zip = settings.zip,
    );

    let mut exporter = Exporter {
        catalog,
        store,
        settings,
        root: root.clone(),
        binaries: 0,
    };

    let mut datasets: Vec<(&ObjectTypeInfo, Vec<(&ObjectTypeInfo, Vec<Record>)>)> = Vec::new();
    let mut shipped: BTreeSet<(String, i64)> = BTreeSet::new();
    for info in catalog.import_order()? {
        let mut rows = DataSetRows::new();
        for record in store.list(info).await? {
            if settings.exports(info, &record) {
                exporter.collect(info, record, &mut rows).await?;
            }
        }
        let has_tasks = settings.tasks.iter().any(|task| task.object_type == info.name);
        if rows.is_empty() && !has_tasks {
            continue;
        }
        let tables = rows.into_tables();
        for (table_info, records) in &tables {
            for record in records {
                if let Some(id) = record.get_i64(&table_info.id_column) {
                    shipped.insert((table_info.name.clone(), id));
                }
            }
        }
        datasets.push((info, tables));
    }

    let mut summary = ExportSummary {
        root: root.clone(),
        archive: None,
        objects: BTreeMap::new(),
        binaries: 0,
        files: 0,
        tasks: 0,
    };
    for (info, tables) in datasets {
        let identities = exporter.identities(&tables, &shipped).await?;
        let tasks: Vec<ExportTask> = settings
            .tasks
            .iter()
            .filter(|task| task.object_type == info.name)
            .cloned()
            .collect();
        summary.tasks += tasks.len();

        let top_rows: &[Record] = tables
            .iter()
            .find(|(table_info, _)| table_info.name == info.name)
            .map(|(_, rows)| rows.as_slice())
            .unwrap_or(&[]);
        summary.files += exporter.copy_physical_files(info, top_rows)?;
        for (table_info, rows) in &tables {
            *summary.objects.entry(table_info.name.clone()).or_default() += rows.len();
        }

        let content = DataSetContent {
            tables,
            tasks,
            identities,
        };
        write_dataset(
            &DataSet::path_for(&root, info),
            &settings.version,
            settings.hotfix,
            &content,
        )?;
    }
    summary.binaries = exporter.binaries;

    let mut manifest = PackageManifest::new(settings.version.clone(), settings.hotfix);
    manifest.project_type = settings.project_type;
    manifest.files = manifest_entries(&root)?;
    write_manifest(&root.join(MANIFEST_FILE), &manifest)?;

    if settings.zip {
        write_archive(&root, &settings.target_path)?;
        summary.archive = Some(settings.target_path.clone());
        summary.root = settings.target_path.clone();
    }

    tracing::info!(
        target: "siteport",
        event = "export_finished",
        target = %settings.target_path.display(),
        types = summary.objects.len(),
        binaries = summary.binaries,
        files = summary.files,
    );
    Ok(summary)
}
