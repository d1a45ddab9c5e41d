pub mod engine;
pub mod files;
pub mod hooks;
mod object;
pub mod postprocess;
pub mod process;
pub mod progress;
pub mod report;
pub mod translation;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::package::PackageError;
use crate::store::StoreError;

pub use engine::{
    run_import, ImportContext, ImportedObject, RunOutcome, RunSummary, TypeCounters,
};
pub use files::{
    run_file_operations, FileCopyError, FileCopyReport, FileOperation, FileOperationCollection,
    FileOperationKind,
};
pub use hooks::{CacheInvalidator, HookDecision, Hooks, ImportHook, ImportPhase};
pub use object::ObjectOutcome;
pub use postprocess::{DeferReason, PostProcessEntry, PostProcessFailure, PostProcessList};
pub use process::process_type;
pub use progress::{ProgressEntry, ProgressLog, ProgressStatus};
pub use report::write_run_report;
pub use translation::{DeferralPolicy, TranslationTable};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import canceled")]
    Canceled,
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Files(#[from] FileCopyError),
    #[error(
        "{object_type} {object} requires {target_type} {source_id} via {column}, which is neither imported nor present on the target"
    )]
    DependencyViolation {
        object_type: String,
        object: String,
        column: String,
        target_type: String,
        source_id: i64,
    },
    #[error("failed to read package file {path}: {source}")]
    PackageFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid binary payload for {object_type} {object}: {reason}")]
    Binary {
        object_type: String,
        object: String,
        reason: String,
    },
}

impl ImportError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, ImportError::Canceled)
    }
}
