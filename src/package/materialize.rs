use std::fs::{self, File};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::manifest::{file_sha256, read_version_attributes, PackageManifest, MANIFEST_FILE};
use super::{PackageError, CURRENT_FORMAT_VERSION, FILES_DIR, LEGACY_DATA_DIR, LEGACY_FILES_DIR};
use crate::settings::{ImportSettings, ProjectType, SystemVersion};

/// Header information of a materialized package.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub root: PathBuf,
    pub version: SystemVersion,
    pub project_type: Option<ProjectType>,
    pub converted_from: Option<String>,
}

/// Unpacks the settings' source into a fresh subfolder of the temporary
/// folder, checks its version and upgrades legacy layouts. Only that subfolder
/// is ever removed, so the temporary folder itself may hold unrelated files
/// and concurrent runs may share it.
///
/// Calling this again once `temporary_files_created` is set only re-reads the
/// header of the already materialized tree.
pub fn materialize_package(
    settings: &mut ImportSettings,
    running: &SystemVersion,
) -> Result<PackageInfo, PackageError> {
    if settings.temporary_files_created {
        if let Some(root) = settings.package_root.clone() {
            let (_, version, project_type) = read_header(&root)?;
            return Ok(PackageInfo {
                root,
                version,
                project_type,
                converted_from: None,
            });
        }
    }

    let source = settings.source_path.clone();
    let base = settings.temporary_dir();
    let target = unique_workdir(&base).map_err(|err| PackageError::Materialization {
        path: source.display().to_string(),
        source: Box::new(err),
    })?;

    tracing::info!(
        target: "siteport",
        event = "package_materialize_started",
        source = %source.display(),
        temp = %target.display(),
    );

    match prepare(&source, &target, running) {
        Ok(info) => {
            settings.temporary_files_created = true;
            settings.package_root = Some(info.root.clone());
            settings.package_project_type = info.project_type;
            tracing::info!(
                target: "siteport",
                event = "package_materialized",
                version = %info.version,
                converted_from = info.converted_from.as_deref().unwrap_or(""),
            );
            Ok(info)
        }
        Err(err) => {
            if target.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&target) {
                    tracing::warn!(
                        target: "siteport",
                        event = "package_cleanup_failed",
                        path = %target.display(),
                        error = %cleanup,
                    );
                }
            }
            Err(PackageError::Materialization {
                path: source.display().to_string(),
                source: Box::new(err),
            })
        }
    }
}

fn unique_workdir(base: &Path) -> Result<PathBuf, PackageError> {
    fs::create_dir_all(base).map_err(|err| PackageError::io(base, err))?;
    let dir = tempfile::Builder::new()
        .prefix("siteport-import-")
        .tempdir_in(base)
        .map_err(|err| PackageError::io(base, err))?;
    Ok(dir.into_path())
}

/// Deletes the materialized package tree when the settings ask for it.
pub fn remove_temporary_files(settings: &mut ImportSettings) -> Result<(), PackageError> {
    if !settings.temporary_files_created || !settings.delete_temporary_files {
        return Ok(());
    }
    if let Some(root) = settings.package_root.take() {
        if root.exists() {
            fs::remove_dir_all(&root).map_err(|err| PackageError::io(&root, err))?;
        }
    }
    settings.temporary_files_created = false;
    Ok(())
}

fn prepare(
    source: &Path,
    target: &Path,
    running: &SystemVersion,
) -> Result<PackageInfo, PackageError> {
    if source.is_file() && is_zip(source) {
        extract_zip(source, target)?;
    } else if source.is_dir() {
        copy_tree(source, target)?;
    } else {
        return Err(PackageError::SourceMissing(source.display().to_string()));
    }

    let (manifest, version, project_type) = read_header(target)?;
    if running.is_older_than(&version) {
        return Err(PackageError::VersionTooNew {
            package: version.to_string(),
            running: running.to_string(),
        });
    }

    let current = SystemVersion::parse(CURRENT_FORMAT_VERSION, 0).map_err(|err| {
        PackageError::InvalidVersion {
            value: CURRENT_FORMAT_VERSION.to_string(),
            reason: err.to_string(),
        }
    })?;
    let converted_from = if version.version < current.version {
        convert_legacy_layout(target, &version)?;
        Some(version.to_string())
    } else {
        None
    };

    if let Some(manifest) = manifest {
        verify_hashes(target, &manifest)?;
    }

    Ok(PackageInfo {
        root: target.to_path_buf(),
        version,
        project_type,
        converted_from,
    })
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

fn extract_zip(source: &Path, target: &Path) -> Result<(), PackageError> {
    let zip_err = |err: zip::result::ZipError| PackageError::Zip {
        path: source.display().to_string(),
        reason: err.to_string(),
    };
    let file = File::open(source).map_err(|err| PackageError::io(source, err))?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_err)?;

    let mut required = 0_u64;
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(zip_err)?;
        required = required.saturating_add(entry.size());
    }
    let available = fs2::available_space(target).map_err(|err| PackageError::io(target, err))?;
    if available < required {
        return Err(PackageError::InsufficientDisk {
            required,
            available,
        });
    }

    archive.extract(target).map_err(zip_err)
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), PackageError> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|err| PackageError::Io {
            path: source.display().to_string(),
            source: err.into(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|err| PackageError::io(&dest, err))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|err| PackageError::io(parent, err))?;
            }
            fs::copy(entry.path(), &dest).map_err(|err| PackageError::io(&dest, err))?;
        }
    }
    Ok(())
}

/// Finds the package version: `package.xml` first, otherwise the root element
/// of the first dataset file (legacy packages keep those under `Data/`).
fn read_header(
    root: &Path,
) -> Result<(Option<PackageManifest>, SystemVersion, Option<ProjectType>), PackageError> {
    let manifest_path = root.join(MANIFEST_FILE);
    if manifest_path.is_file() {
        let manifest = PackageManifest::load(&manifest_path)?;
        let version = manifest.system_version()?;
        let project_type = manifest.project_type;
        return Ok((Some(manifest), version, project_type));
    }

    for dir in [root.to_path_buf(), root.join(LEGACY_DATA_DIR)] {
        let Some(first) = first_xml_file(&dir)? else {
            continue;
        };
        let text = fs::read_to_string(&first).map_err(|err| PackageError::io(&first, err))?;
        let doc = roxmltree::Document::parse(&text).map_err(|err| PackageError::Xml {
            path: first.display().to_string(),
            reason: err.to_string(),
        })?;
        let (raw, hotfix) = read_version_attributes(&doc.root_element(), &first)?;
        let version =
            SystemVersion::parse(&raw, hotfix).map_err(|err| PackageError::InvalidVersion {
                value: raw.clone(),
                reason: err.to_string(),
            })?;
        return Ok((None, version, None));
    }

    Err(PackageError::HeaderMissing(root.display().to_string()))
}

fn first_xml_file(dir: &Path) -> Result<Option<PathBuf>, PackageError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|err| PackageError::io(dir, err))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Moves `Data/*.xml` to the package root and `Data/Files/` to `files/`.
fn convert_legacy_layout(root: &Path, from: &SystemVersion) -> Result<(), PackageError> {
    tracing::info!(
        target: "siteport",
        event = "package_conversion_started",
        from = %from,
        to = CURRENT_FORMAT_VERSION,
    );

    let data_dir = root.join(LEGACY_DATA_DIR);
    if data_dir.is_dir() {
        let legacy_files = data_dir.join(LEGACY_FILES_DIR);
        if legacy_files.is_dir() {
            let files_dir = root.join(FILES_DIR);
            if files_dir.exists() {
                copy_tree(&legacy_files, &files_dir)?;
                fs::remove_dir_all(&legacy_files)
                    .map_err(|err| PackageError::io(&legacy_files, err))?;
            } else {
                fs::rename(&legacy_files, &files_dir)
                    .map_err(|err| PackageError::io(&files_dir, err))?;
            }
        }

        for entry in fs::read_dir(&data_dir).map_err(|err| PackageError::io(&data_dir, err))? {
            let entry = entry.map_err(|err| PackageError::io(&data_dir, err))?;
            let path = entry.path();
            if path.is_file() {
                let dest = root.join(entry.file_name());
                fs::rename(&path, &dest).map_err(|err| PackageError::io(&dest, err))?;
            }
        }
        fs::remove_dir_all(&data_dir).map_err(|err| PackageError::io(&data_dir, err))?;
    }

    let manifest_path = root.join(MANIFEST_FILE);
    let mut manifest = if manifest_path.is_file() {
        PackageManifest::load(&manifest_path)?
    } else {
        PackageManifest::new(from.version.to_string(), from.hotfix)
    };
    // Hashes were computed over the legacy layout and no longer apply.
    manifest.files.clear();
    manifest.version = CURRENT_FORMAT_VERSION.to_string();
    super::writer::write_manifest(&manifest_path, &manifest)
}

fn verify_hashes(root: &Path, manifest: &PackageManifest) -> Result<(), PackageError> {
    for entry in &manifest.files {
        let path = root.join(&entry.path);
        if !path.is_file() {
            return Err(PackageError::SourceMissing(path.display().to_string()));
        }
        let actual = file_sha256(&path).map_err(|err| PackageError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
        })?;
        if actual != entry.sha256 {
            return Err(PackageError::HashMismatch {
                path: entry.path.clone(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
    }
    Ok(())
}
