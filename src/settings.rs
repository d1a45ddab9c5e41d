use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Effective action for one object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessObjectType {
    /// Skip the object entirely.
    None,
    /// Only attach an existing global object to the target site.
    SiteBinding,
    /// Resolve against the selection table.
    Selected,
    /// Full insert/update including children and bindings.
    #[default]
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    #[default]
    WebSite,
    WebApplication,
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectType::WebSite => f.write_str("web_site"),
            ProjectType::WebApplication => f.write_str("web_application"),
        }
    }
}

/// Version of the running system; packages newer than this are refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemVersion {
    pub version: Version,
    pub hotfix: u32,
}

impl SystemVersion {
    pub fn new(version: Version, hotfix: u32) -> Self {
        Self { version, hotfix }
    }

    /// Parses the short `major.minor` form used in package headers.
    pub fn parse(version: &str, hotfix: u32) -> Result<Self, semver::Error> {
        Ok(Self {
            version: parse_loose_version(version)?,
            hotfix,
        })
    }

    pub fn is_older_than(&self, other: &SystemVersion) -> bool {
        (&self.version, self.hotfix) < (&other.version, other.hotfix)
    }
}

impl fmt::Display for SystemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} hotfix {}", self.version.major, self.version.minor, self.hotfix)
    }
}

pub fn parse_loose_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let parts = trimmed.split('.').count();
    let padded = match parts {
        1 => format!("{trimmed}.0.0"),
        2 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
}

/// Which objects and delete tasks the caller picked.
///
/// A type missing from `objects` falls back to the settings-level default
/// process type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectSelection {
    #[serde(default)]
    pub objects: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, BTreeSet<i64>>,
    #[serde(default)]
    pub excluded_types: BTreeSet<String>,
}

impl ObjectSelection {
    pub fn select(&mut self, object_type: &str, code_name: &str) {
        self.objects
            .entry(object_type.to_string())
            .or_default()
            .insert(code_name.to_string());
    }

    pub fn select_task(&mut self, object_type: &str, task_id: i64) {
        self.tasks
            .entry(object_type.to_string())
            .or_default()
            .insert(task_id);
    }

    pub fn exclude(&mut self, object_type: &str) {
        self.excluded_types.insert(object_type.to_string());
    }
}

/// Shared flag raised by the caller to stop a running import.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn default_true() -> bool {
    true
}

fn default_code_extensions() -> Vec<String> {
    vec![".cs".to_string(), ".vb".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSettings {
    pub source_path: PathBuf,
    #[serde(default)]
    pub temporary_path: Option<PathBuf>,
    /// Root the file copy pass writes into.
    #[serde(default)]
    pub target_root: Option<PathBuf>,
    #[serde(default)]
    pub site_id: Option<i64>,
    #[serde(default)]
    pub admin_user_id: Option<i64>,
    #[serde(default)]
    pub selection: ObjectSelection,
    #[serde(default)]
    pub default_process_type: ProcessObjectType,
    #[serde(default = "default_true")]
    pub copy_files: bool,
    #[serde(default)]
    pub copy_code_files: bool,
    #[serde(default = "default_true")]
    pub copy_assemblies: bool,
    #[serde(default = "default_true")]
    pub bulk_insert: bool,
    #[serde(default = "default_true")]
    pub create_version: bool,
    #[serde(default)]
    pub log_synchronization: bool,
    #[serde(default)]
    pub import_only_new_objects: bool,
    #[serde(default = "default_true")]
    pub process_deletions: bool,
    #[serde(default)]
    pub skip_object_on_translation_error: bool,
    #[serde(default = "default_true")]
    pub delete_temporary_files: bool,
    #[serde(default)]
    pub project_type: ProjectType,
    #[serde(default = "default_code_extensions")]
    pub code_file_extensions: Vec<String>,
    #[serde(default)]
    pub progress_log_path: Option<PathBuf>,
    /// Set once the package has been materialized below `temporary_path`.
    #[serde(skip)]
    pub temporary_files_created: bool,
    #[serde(skip)]
    pub package_root: Option<PathBuf>,
    #[serde(skip)]
    pub package_project_type: Option<ProjectType>,
    #[serde(skip)]
    cancel: CancelHandle,
}

impl ImportSettings {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            temporary_path: None,
            target_root: None,
            site_id: None,
            admin_user_id: None,
            selection: ObjectSelection::default(),
            default_process_type: ProcessObjectType::All,
            copy_files: true,
            copy_code_files: false,
            copy_assemblies: true,
            bulk_insert: true,
            create_version: true,
            log_synchronization: false,
            import_only_new_objects: false,
            process_deletions: true,
            skip_object_on_translation_error: false,
            delete_temporary_files: true,
            project_type: ProjectType::WebSite,
            code_file_extensions: default_code_extensions(),
            progress_log_path: None,
            temporary_files_created: false,
            package_root: None,
            package_project_type: None,
            cancel: CancelHandle::default(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read import settings {}", path.display()))?;
        let settings: ImportSettings = serde_json::from_str(&text)
            .with_context(|| format!("parse import settings {}", path.display()))?;
        Ok(settings)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Folder that holds the per-run package trees.
    pub fn temporary_dir(&self) -> PathBuf {
        self.temporary_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("siteport"))
    }
}
