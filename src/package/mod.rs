//! Package format: a folder or zip holding `package.xml`, one dataset file
//! per top-level object type, and a `files/` tree with binary payloads.

pub mod dataset;
pub mod manifest;
pub mod materialize;
pub mod writer;

use thiserror::Error;

pub use dataset::{DataSet, ExportTask, ObjectIdentity, TaskType};
pub use manifest::{file_sha256, ManifestFile, PackageManifest, MANIFEST_FILE};
pub use materialize::{materialize_package, remove_temporary_files, PackageInfo};
pub use writer::{write_dataset, write_manifest, DataSetContent};

/// First package format version using the flat layout.
pub const CURRENT_FORMAT_VERSION: &str = "12.0";
pub const FILES_DIR: &str = "files";
pub const LEGACY_DATA_DIR: &str = "Data";
pub const LEGACY_FILES_DIR: &str = "Files";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package source not found: {0}")]
    SourceMissing(String),
    #[error("package header not found in {0}")]
    HeaderMissing(String),
    #[error("invalid package version {value}: {reason}")]
    InvalidVersion { value: String, reason: String },
    #[error("package version {package} is newer than the running system {running}")]
    VersionTooNew { package: String, running: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed xml in {path}: {reason}")]
    Xml { path: String, reason: String },
    #[error("failed to write xml {path}: {reason}")]
    XmlWrite { path: String, reason: String },
    #[error("invalid value {value:?} for column {column} in {path}")]
    InvalidValue {
        path: String,
        column: String,
        value: String,
    },
    #[error("zip archive error in {path}: {reason}")]
    Zip { path: String, reason: String },
    #[error("package needs {required} bytes but only {available} are available")]
    InsufficientDisk { required: u64, available: u64 },
    #[error("package file hash mismatch at {path}: expected {expected}, found {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("failed to prepare package from {path}: {source}")]
    Materialization {
        path: String,
        #[source]
        source: Box<PackageError>,
    },
}

impl PackageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        PackageError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// The innermost error once context wrappers are peeled off.
    pub fn root_cause(&self) -> &PackageError {
        match self {
            PackageError::Materialization { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
