use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

use crate::catalog::CatalogError;
use crate::export::ExportError;
use crate::import::{FileCopyError, ImportError};
use crate::package::PackageError;
use crate::store::StoreError;

/// Error reported by the command line surface: a namespaced code, a
/// readable message, string context and an optional cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

impl From<PackageError> for AppError {
    fn from(error: PackageError) -> Self {
        let code = match error.root_cause() {
            PackageError::SourceMissing(_) => "PACKAGE/SOURCE_MISSING",
            PackageError::HeaderMissing(_) => "PACKAGE/HEADER_MISSING",
            PackageError::InvalidVersion { .. } => "PACKAGE/INVALID_VERSION",
            PackageError::VersionTooNew { .. } => "PACKAGE/VERSION_TOO_NEW",
            PackageError::Io { .. } => "PACKAGE/IO",
            PackageError::Xml { .. } => "PACKAGE/XML",
            PackageError::XmlWrite { .. } => "PACKAGE/XML_WRITE",
            PackageError::InvalidValue { .. } => "PACKAGE/INVALID_VALUE",
            PackageError::Zip { .. } => "PACKAGE/ZIP",
            PackageError::InsufficientDisk { .. } => "PACKAGE/LOW_DISK",
            PackageError::HashMismatch { .. } => "PACKAGE/HASH_MISMATCH",
            PackageError::Materialization { .. } => "PACKAGE/MATERIALIZE",
        };
        let mut app_error = AppError::new(code, error.to_string());
        if let PackageError::Materialization { path, .. } = &error {
            app_error = app_error.with_context("source", path.clone());
        }
        app_error
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Database(err) => AppError::from(err),
            StoreError::Duplicate {
                ref object_type,
                ref code_name,
            } => AppError::new("STORE/DUPLICATE", error.to_string())
                .with_context("object_type", object_type.clone())
                .with_context("code_name", code_name.clone()),
            StoreError::NotFound { ref object_type, id } => {
                AppError::new("STORE/NOT_FOUND", error.to_string())
                    .with_context("object_type", object_type.clone())
                    .with_context("id", id.to_string())
            }
            other => AppError::new("STORE/ERROR", other.to_string()),
        }
    }
}

impl From<CatalogError> for AppError {
    fn from(error: CatalogError) -> Self {
        AppError::new("CATALOG/INVALID", error.to_string())
    }
}

impl From<FileCopyError> for AppError {
    fn from(error: FileCopyError) -> Self {
        let code = match error {
            FileCopyError::PermissionDenied { .. } => "FILES/PERMISSION_DENIED",
            FileCopyError::PathTraversal(_) => "FILES/PATH_TRAVERSAL",
            FileCopyError::Io { .. } => "FILES/IO",
        };
        AppError::new(code, error.to_string())
    }
}

impl From<ImportError> for AppError {
    fn from(error: ImportError) -> Self {
        match error {
            ImportError::Canceled => AppError::new("IMPORT/CANCELED", "Import canceled"),
            ImportError::Package(err) => AppError::from(err),
            ImportError::Store(err) => AppError::from(err),
            ImportError::Catalog(err) => AppError::from(err),
            ImportError::Files(err) => AppError::from(err),
            ImportError::DependencyViolation {
                ref object_type,
                ref column,
                ..
            } => AppError::new("IMPORT/DEPENDENCY", error.to_string())
                .with_context("object_type", object_type.clone())
                .with_context("column", column.clone()),
            other => AppError::new("IMPORT/ERROR", other.to_string()),
        }
    }
}

impl From<ExportError> for AppError {
    fn from(error: ExportError) -> Self {
        match error {
            ExportError::Package(err) => AppError::from(err),
            ExportError::Store(err) => AppError::from(err),
            ExportError::Catalog(err) => AppError::from(err),
            ExportError::LowDisk { required, available } => {
                AppError::new("EXPORT/LOW_DISK", error.to_string())
                    .with_context("required_bytes", required.to_string())
                    .with_context("available_bytes", available.to_string())
            }
            other => AppError::new("EXPORT/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn builds_error_with_context() {
        let error = AppError::new("TEST/CODE", "Something went wrong")
            .with_context("object_type", "cms.role")
            .with_context("id", "1234");

        assert_eq!(error.code(), "TEST/CODE");
        assert_eq!(error.message(), "Something went wrong");
        assert_eq!(error.context().get("object_type"), Some(&"cms.role".to_string()));
        assert_eq!(error.context().get("id"), Some(&"1234".to_string()));
        assert!(error.cause().is_none());
    }

    #[test]
    fn dependency_violations_name_the_column() {
        let app_error = AppError::from(ImportError::DependencyViolation {
            object_type: "cms.form".into(),
            object: "contact".into(),
            column: "FormCategoryID".into(),
            target_type: "cms.formcategory".into(),
            source_id: 7,
        });
        assert_eq!(app_error.code(), "IMPORT/DEPENDENCY");
        assert_eq!(
            app_error.context().get("column"),
            Some(&"FormCategoryID".to_string())
        );
    }

    #[test]
    fn converts_anyhow_error_chain_into_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to save file")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), AppError::UNKNOWN_CODE);
        assert_eq!(app_error.message(), "failed to save file");

        let cause = app_error.cause().expect("io cause present");
        assert_eq!(cause.code(), AppError::UNKNOWN_CODE);
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn cancellation_has_its_own_code() {
        let app_error = AppError::from(ImportError::Canceled);
        assert_eq!(app_error.code(), "IMPORT/CANCELED");
    }

    #[test]
    fn wrapped_package_errors_report_the_root_cause() {
        let err = PackageError::Materialization {
            path: "/packages/site.zip".into(),
            source: Box::new(PackageError::VersionTooNew {
                package: "14.0 hotfix 0".into(),
                running: "13.0 hotfix 5".into(),
            }),
        };
        let app_error = AppError::from(ImportError::from(err));
        assert_eq!(app_error.code(), "PACKAGE/VERSION_TOO_NEW");
        assert_eq!(
            app_error.context().get("source"),
            Some(&"/packages/site.zip".to_string())
        );
    }

    #[test]
    fn into_anyhow_preserves_display() {
        let error = AppError::new("VALIDATION", "Missing field").with_context("field", "name");
        let anyhow_error: AnyhowError = error.clone().into();
        assert_eq!(anyhow_error.to_string(), error.to_string());
    }

    #[test]
    fn serde_json_errors_capture_position() {
        let err: SerdeJsonError =
            serde_json::from_str::<serde_json::Value>("{\"foo\": }").expect_err("invalid json");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
        assert!(app_error.context().contains_key("column"));
    }

    #[test]
    fn sqlx_row_not_found_translates_to_specific_code() {
        let err = SqlxError::RowNotFound;
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "SQLX/ROW_NOT_FOUND");
        assert_eq!(app_error.message(), "Record not found");
    }

    #[test]
    fn io_error_contains_raw_code_when_available() {
        let err = IoError::from_raw_os_error(2);
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(app_error.context().get("os_code"), Some(&"2".to_string()));
    }

    #[test]
    fn store_duplicates_carry_the_code_name() {
        let app_error = AppError::from(StoreError::Duplicate {
            object_type: "cms.role".into(),
            code_name: "Editors".into(),
        });
        assert_eq!(app_error.code(), "STORE/DUPLICATE");
        assert_eq!(app_error.context().get("code_name"), Some(&"Editors".to_string()));
        let json = serde_json::to_value(&app_error).expect("serialize app error");
        assert!(json.get("cause").is_none());
    }
}
