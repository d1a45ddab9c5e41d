//! Import and export of site object graphs through portable packages.
//!
//! A package is a directory or zip archive with one XML dataset per object
//! type, a `files/` tree of binaries and physical files, and a manifest. The
//! [`import`] engine replays a package into a [`store::SqliteStore`] while
//! translating package-local ids into target ids; [`export`] produces one.

pub mod catalog;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod package;
pub mod record;
pub mod settings;
pub mod store;

pub use catalog::{ObjectCatalog, ObjectTypeInfo};
pub use error::AppError;
pub use export::{export_package, ExportSettings, ExportSummary};
pub use import::{run_import, ImportContext, RunOutcome, RunSummary};
pub use record::Record;
pub use settings::{ImportSettings, SystemVersion};
pub use store::SqliteStore;

/// Installs the process-wide tracing subscriber.
pub fn init_logging() {
    logging::init();
}
