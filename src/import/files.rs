use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::catalog::FileRuleKind;
use crate::settings::{ImportSettings, ProjectType};

const APP_CODE: &str = "App_Code";
const OLD_APP_CODE: &str = "Old_App_Code";

#[derive(Debug, Error)]
pub enum FileCopyError {
    #[error("no write permission for mandatory target {path}")]
    PermissionDenied { path: String },
    #[error("failed to copy {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("file path escapes its root: {0}")]
    PathTraversal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationKind {
    File,
    Directory,
    Assembly,
}

impl From<FileRuleKind> for FileOperationKind {
    fn from(kind: FileRuleKind) -> Self {
        match kind {
            FileRuleKind::File => FileOperationKind::File,
            FileRuleKind::Directory => FileOperationKind::Directory,
            FileRuleKind::Assembly => FileOperationKind::Assembly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOperation {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: FileOperationKind,
    pub mandatory: bool,
}

/// Copy operations collected while objects are imported and flushed once
/// all object data is committed.
#[derive(Debug, Clone, Default)]
pub struct FileOperationCollection {
    operations: Vec<FileOperation>,
}

impl FileOperationCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an operation; an identical operation is only queued once.
    pub fn add(&mut self, operation: FileOperation) {
        if let Some(existing) = self
            .operations
            .iter_mut()
            .find(|op| op.source == operation.source && op.destination == operation.destination)
        {
            existing.mandatory |= operation.mandatory;
            return;
        }
        self.operations.push(operation);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileOperation> {
        self.operations.iter()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileCopyReport {
    pub copied: usize,
    pub unchanged: usize,
    pub skipped_code: usize,
    pub skipped_assemblies: usize,
    pub missing_sources: Vec<String>,
    pub permission_failures: Vec<String>,
    /// Destinations moved between `App_Code` and `Old_App_Code`.
    pub rerouted: Vec<String>,
    pub warnings: Vec<String>,
}

/// Rejects relative paths that are absolute or climb out of their root.
pub fn ensure_safe_relative_path(rel: &str) -> Result<(), FileCopyError> {
    let path = Path::new(rel);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(FileCopyError::PathTraversal(rel.to_string()));
    }
    Ok(())
}

fn is_code_file(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
}

/// Swaps the code folder when the package was built for the other project
/// model.
fn reroute(destination: &Path, package: ProjectType, target: ProjectType) -> PathBuf {
    let (from, to) = match (package, target) {
        (ProjectType::WebSite, ProjectType::WebApplication) => (APP_CODE, OLD_APP_CODE),
        (ProjectType::WebApplication, ProjectType::WebSite) => (OLD_APP_CODE, APP_CODE),
        _ => return destination.to_path_buf(),
    };
    destination
        .components()
        .map(|component| match component {
            Component::Normal(part) if part.eq_ignore_ascii_case(from) => {
                Component::Normal(to.as_ref())
            }
            other => other,
        })
        .collect()
}

/// Compares length first, then content.
pub fn files_identical(left: &Path, right: &Path) -> std::io::Result<bool> {
    let (Ok(left_meta), Ok(right_meta)) = (fs::metadata(left), fs::metadata(right)) else {
        return Ok(false);
    };
    if !right_meta.is_file() || left_meta.len() != right_meta.len() {
        return Ok(false);
    }
    let mut left = BufReader::new(File::open(left)?);
    let mut right = BufReader::new(File::open(right)?);
    let mut left_buf = [0_u8; 8192];
    let mut right_buf = [0_u8; 8192];
    loop {
        let read = left.read(&mut left_buf)?;
        if read == 0 {
            return Ok(true);
        }
        right.read_exact(&mut right_buf[..read])?;
        if left_buf[..read] != right_buf[..read] {
            return Ok(false);
        }
    }
}

fn probe_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    tempfile::Builder::new()
        .prefix(".siteport-probe")
        .tempfile_in(dir)
        .is_ok()
}

fn expand(
    operation: &FileOperation,
    destination: &Path,
) -> std::io::Result<Vec<(PathBuf, PathBuf)>> {
    match operation.kind {
        FileOperationKind::File | FileOperationKind::Assembly => {
            Ok(vec![(operation.source.clone(), destination.to_path_buf())])
        }
        FileOperationKind::Directory => {
            let mut pairs = Vec::new();
            for entry in WalkDir::new(&operation.source).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(&operation.source) {
                    pairs.push((entry.path().to_path_buf(), destination.join(relative)));
                }
            }
            Ok(pairs)
        }
    }
}

/// Flushes the queued operations.
///
/// Targets are probed for write access first. A failed probe is recorded and
/// reported in one aggregated warning; only a mandatory operation turns it
/// into an error.
pub fn run_file_operations(
    operations: &FileOperationCollection,
    settings: &ImportSettings,
) -> Result<FileCopyReport, FileCopyError> {
    let mut report = FileCopyReport::default();
    let mut probed: HashMap<PathBuf, bool> = HashMap::new();

    let mismatch = settings
        .package_project_type
        .filter(|package| *package != settings.project_type);

    for operation in operations.iter() {
        if operation.kind == FileOperationKind::Assembly && !settings.copy_assemblies {
            report.skipped_assemblies += 1;
            continue;
        }
        if !operation.source.exists() {
            report
                .missing_sources
                .push(operation.source.display().to_string());
            continue;
        }

        let destination = match mismatch {
            Some(package) => reroute(&operation.destination, package, settings.project_type),
            None => operation.destination.clone(),
        };
        if destination != operation.destination {
            report.rerouted.push(destination.display().to_string());
        }
        let pairs = expand(operation, &destination).map_err(|source| FileCopyError::Io {
            path: operation.source.display().to_string(),
            source,
        })?;

        for (source, target) in pairs {
            if is_code_file(&source, &settings.code_file_extensions) && !settings.copy_code_files {
                report.skipped_code += 1;
                continue;
            }
            let Some(dir) = target.parent().map(Path::to_path_buf) else {
                continue;
            };
            let writable = *probed
                .entry(dir.clone())
                .or_insert_with(|| probe_writable(&dir));
            if !writable {
                if operation.mandatory {
                    return Err(FileCopyError::PermissionDenied {
                        path: dir.display().to_string(),
                    });
                }
                let failed = dir.display().to_string();
                if !report.permission_failures.contains(&failed) {
                    report.permission_failures.push(failed);
                }
                continue;
            }

            let identical = files_identical(&source, &target).map_err(|err| FileCopyError::Io {
                path: target.display().to_string(),
                source: err,
            })?;
            if identical {
                report.unchanged += 1;
                continue;
            }
            match fs::copy(&source, &target) {
                Ok(_) => report.copied += 1,
                Err(err) if operation.mandatory => {
                    return Err(FileCopyError::Io {
                        path: target.display().to_string(),
                        source: err,
                    })
                }
                Err(err) => {
                    tracing::warn!(
                        target: "siteport",
                        event = "file_copy_failed",
                        path = %target.display(),
                        error = %err,
                    );
                    report.permission_failures.push(target.display().to_string());
                }
            }
        }
    }

    if let (Some(package), false) = (mismatch, report.rerouted.is_empty()) {
        report.warnings.push(format!(
            "The package was exported from a {package} project but the target is a {} project; code files were redirected between {APP_CODE} and {OLD_APP_CODE}. Review them before compiling: {}",
            settings.project_type,
            report.rerouted.join(", ")
        ));
    }
    if !report.permission_failures.is_empty() {
        report.warnings.push(format!(
            "Files could not be written to the following locations; copy them manually or grant write access and import again: {}",
            report.permission_failures.join(", ")
        ));
    }
    if !report.missing_sources.is_empty() {
        report.warnings.push(format!(
            "Package files not found: {}",
            report.missing_sources.join(", ")
        ));
    }

    tracing::info!(
        target: "siteport",
        event = "file_copy_finished",
        copied = report.copied,
        unchanged = report.unchanged,
        skipped_code = report.skipped_code,
        failed = report.permission_failures.len(),
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn op(source: PathBuf, destination: PathBuf, kind: FileOperationKind) -> FileOperation {
        FileOperation {
            source,
            destination,
            kind,
            mandatory: false,
        }
    }

    #[test]
    fn identical_files_are_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src.txt");
        let target = dir.path().join("out/dst.txt");
        fs::write(&source, b"same bytes").unwrap();

        let mut ops = FileOperationCollection::new();
        ops.add(op(source.clone(), target.clone(), FileOperationKind::File));
        let settings = ImportSettings::new(dir.path());

        let first = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(first.copied, 1);
        let second = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.unchanged, 1);
    }

    #[test]
    fn same_length_different_bytes_is_copied() {
        let dir = TempDir::new().unwrap();
        let left = dir.path().join("a");
        let right = dir.path().join("b");
        fs::write(&left, b"abcd").unwrap();
        fs::write(&right, b"abce").unwrap();
        assert!(!files_identical(&left, &right).unwrap());
        fs::write(&right, b"abcd").unwrap();
        assert!(files_identical(&left, &right).unwrap());
    }

    #[test]
    fn code_files_need_explicit_opt_in() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("pkg/App_Code");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("Helper.cs"), b"class Helper {}").unwrap();
        fs::write(source.join("readme.txt"), b"notes").unwrap();
        let target = dir.path().join("site/App_Code");

        let mut ops = FileOperationCollection::new();
        ops.add(op(source, target.clone(), FileOperationKind::Directory));
        let mut settings = ImportSettings::new(dir.path());

        let report = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(report.skipped_code, 1);
        assert_eq!(report.copied, 1);
        assert!(!target.join("Helper.cs").exists());

        settings.copy_code_files = true;
        let report = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(report.copied, 1);
        assert!(target.join("Helper.cs").exists());
    }

    #[test]
    fn project_mismatch_reroutes_app_code() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Helper.cs");
        fs::write(&source, b"class Helper {}").unwrap();
        let target = dir.path().join("site/App_Code/Helper.cs");

        let mut ops = FileOperationCollection::new();
        ops.add(op(source, target, FileOperationKind::File));
        let mut settings = ImportSettings::new(dir.path());
        settings.copy_code_files = true;
        settings.project_type = ProjectType::WebApplication;
        settings.package_project_type = Some(ProjectType::WebSite);

        let report = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("Old_App_Code/Helper.cs"));
        assert!(dir.path().join("site/Old_App_Code/Helper.cs").exists());
        assert!(!dir.path().join("site/App_Code").exists());
    }

    #[test]
    fn project_mismatch_is_quiet_without_code_folders() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("logo.png");
        fs::write(&source, b"png").unwrap();
        let target = dir.path().join("site/Media/logo.png");

        let mut ops = FileOperationCollection::new();
        ops.add(op(source, target.clone(), FileOperationKind::File));
        let mut settings = ImportSettings::new(dir.path());
        settings.project_type = ProjectType::WebApplication;
        settings.package_project_type = Some(ProjectType::WebSite);

        let report = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(report.copied, 1);
        assert!(report.rerouted.is_empty());
        assert!(report.warnings.is_empty());
        assert!(target.is_file());
    }

    #[test]
    fn assemblies_respect_toggle() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Lib.dll");
        fs::write(&source, b"MZ").unwrap();
        let mut ops = FileOperationCollection::new();
        ops.add(op(source, dir.path().join("bin/Lib.dll"), FileOperationKind::Assembly));
        let mut settings = ImportSettings::new(dir.path());
        settings.copy_assemblies = false;
        let report = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(report.skipped_assemblies, 1);
        assert_eq!(report.copied, 0);
    }

    #[test]
    fn duplicate_operations_are_collapsed() {
        let mut ops = FileOperationCollection::new();
        let a = op("a".into(), "b".into(), FileOperationKind::File);
        ops.add(a.clone());
        ops.add(FileOperation {
            mandatory: true,
            ..a
        });
        assert_eq!(ops.len(), 1);
        assert!(ops.iter().next().unwrap().mandatory);
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(ensure_safe_relative_path("files/a.txt").is_ok());
        assert!(ensure_safe_relative_path("../etc/passwd").is_err());
        assert!(ensure_safe_relative_path("/etc/passwd").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_targets_are_aggregated_or_fatal_when_mandatory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        // Root ignores directory permissions.
        if probe_writable(&locked) {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let source = dir.path().join("a.txt");
        fs::write(&source, b"x").unwrap();
        let mut ops = FileOperationCollection::new();
        ops.add(op(source.clone(), locked.join("a.txt"), FileOperationKind::File));
        let settings = ImportSettings::new(dir.path());
        let report = run_file_operations(&ops, &settings).unwrap();
        assert_eq!(report.permission_failures.len(), 1);
        assert!(report.warnings[0].contains("locked"));

        let mut mandatory = FileOperationCollection::new();
        mandatory.add(FileOperation {
            mandatory: true,
            ..op(source, locked.join("a.txt"), FileOperationKind::File)
        });
        let err = run_file_operations(&mandatory, &settings).unwrap_err();
        assert!(matches!(err, FileCopyError::PermissionDenied { .. }));

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
