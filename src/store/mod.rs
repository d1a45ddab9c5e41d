//! SQLite-backed object store.
//!
//! One physical table per object type, shaped by the catalog. Rows travel
//! through SQLite's JSON functions so the store never needs compiled-in
//! knowledge of a type's columns.

mod sql;

use std::path::Path;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use crate::catalog::{ObjectCatalog, ObjectTypeInfo};
use crate::package::TaskType;
use crate::record::Record;

use sql::{
    create_table_sql, guid_index_sql, normalize_booleans, quote_ident, select_json_sql,
    update_sql, RowInserter,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode {object_type} row: {source}")]
    Encode {
        object_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {object_type} row: {source}")]
    Decode {
        object_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{object_type} with code name {code_name} already exists")]
    Duplicate {
        object_type: String,
        code_name: String,
    },
    #[error("{object_type} {id} not found")]
    NotFound { object_type: String, id: i64 },
    #[error("invalid database path {0}")]
    InvalidPath(String),
}

/// Where a code name must be unique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupScope {
    pub site_id: Option<i64>,
    pub parent_id: Option<i64>,
}

impl LookupScope {
    pub fn site(site_id: Option<i64>) -> Self {
        Self {
            site_id,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<i64>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Scope of an existing or incoming row.
    pub fn of(info: &ObjectTypeInfo, record: &Record) -> Self {
        Self {
            site_id: info.site_column.as_deref().and_then(|c| record.get_i64(c)),
            parent_id: info.parent_column.as_deref().and_then(|c| record.get_i64(c)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectVersion {
    pub version_id: i64,
    pub object_type: String,
    pub object_id: i64,
    pub data: Record,
    pub created_at: String,
}

/// A change recorded for downstream synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTask {
    pub task_id: i64,
    pub object_type: String,
    pub object_id: i64,
    pub site_id: Option<i64>,
    pub task_type: TaskType,
    pub created_at: String,
}

const SUPPORT_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS object_versions (
        version_id INTEGER PRIMARY KEY AUTOINCREMENT,
        object_type TEXT NOT NULL,
        object_id INTEGER NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sync_task (
        task_id INTEGER PRIMARY KEY AUTOINCREMENT,
        object_type TEXT NOT NULL,
        object_id INTEGER NOT NULL,
        site_id INTEGER,
        task_type TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
];

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    tracing::error!(
                        target: "siteport",
                        event = "store_dir_create_failed",
                        path = %parent.display(),
                        error = %err,
                    );
                    StoreError::InvalidPath(parent.display().to_string())
                })?;
            }
        }
        let raw = path
            .to_str()
            .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))?;
        let opts = SqliteConnectOptions::from_str(raw)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    sqlx::query("PRAGMA busy_timeout = 5000;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(opts)
            .await?;
        tracing::info!(target: "siteport", event = "store_opened", path = %path.display());
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates a table per catalog type plus the version and sync task tables.
    pub async fn ensure_schema(&self, catalog: &ObjectCatalog) -> Result<(), StoreError> {
        for statement in SUPPORT_SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        for info in catalog.types() {
            sqlx::query(&create_table_sql(info)).execute(&self.pool).await?;
            if let Some(index) = guid_index_sql(info) {
                sqlx::query(&index).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    fn decode_rows(info: &ObjectTypeInfo, rows: Vec<String>) -> Result<Vec<Record>, StoreError> {
        rows.into_iter()
            .map(|raw| {
                let mut record: Record =
                    serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
                        object_type: info.name.clone(),
                        source,
                    })?;
                normalize_booleans(info, &mut record);
                Ok(record)
            })
            .collect()
    }

    pub async fn get(&self, info: &ObjectTypeInfo, id: i64) -> Result<Option<Record>, StoreError> {
        let sql = select_json_sql(info, &format!("{} = ?1", quote_ident(&info.id_column)));
        let rows: Vec<String> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(Self::decode_rows(info, rows)?.into_iter().next())
    }

    pub async fn list(&self, info: &ObjectTypeInfo) -> Result<Vec<Record>, StoreError> {
        let sql = select_json_sql(info, "1 = 1");
        let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Self::decode_rows(info, rows)
    }

    /// Rows whose `column` equals `value`, in id order.
    pub async fn list_where(
        &self,
        info: &ObjectTypeInfo,
        column: &str,
        value: i64,
    ) -> Result<Vec<Record>, StoreError> {
        let sql = select_json_sql(info, &format!("{} = ?1", quote_ident(column)));
        let rows: Vec<String> = sqlx::query_scalar(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        Self::decode_rows(info, rows)
    }

    pub async fn count(&self, info: &ObjectTypeInfo) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&info.table));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// GUID lookup inside the same site and parent scope as code names, so a
    /// package imported into two sites yields two independent objects.
    pub async fn find_by_guid(
        &self,
        info: &ObjectTypeInfo,
        guid: &str,
        scope: LookupScope,
    ) -> Result<Option<Record>, StoreError> {
        let Some(column) = info.guid_column.as_deref() else {
            return Ok(None);
        };
        let mut filter = format!("lower({}) = ?1", quote_ident(column));
        let mut next = 2;
        if let Some(site) = info.site_column.as_deref() {
            filter.push_str(&format!(" AND {} IS ?{next}", quote_ident(site)));
            next += 1;
        }
        let parent = match (info.parent_column.as_deref(), scope.parent_id) {
            (Some(parent_column), Some(parent_id)) => {
                filter.push_str(&format!(" AND {} = ?{next}", quote_ident(parent_column)));
                Some(parent_id)
            }
            _ => None,
        };
        let sql = select_json_sql(info, &filter);

        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(guid.to_ascii_lowercase());
        if info.site_column.is_some() {
            query = query.bind(scope.site_id);
        }
        if let Some(parent_id) = parent {
            query = query.bind(parent_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(Self::decode_rows(info, rows)?.into_iter().next())
    }

    /// Code-name lookup inside the type's site and parent scope.
    pub async fn find_by_code_name(
        &self,
        info: &ObjectTypeInfo,
        code_name: &str,
        scope: LookupScope,
    ) -> Result<Option<Record>, StoreError> {
        let Some(column) = info.code_name_column.as_deref() else {
            return Ok(None);
        };
        let mut filter = format!("{} = ?1", quote_ident(column));
        let mut next = 2;
        if let Some(site) = info.site_column.as_deref() {
            filter.push_str(&format!(" AND {} IS ?{next}", quote_ident(site)));
            next += 1;
        }
        let parent = match (info.parent_column.as_deref(), scope.parent_id) {
            (Some(parent_column), Some(parent_id)) => {
                filter.push_str(&format!(" AND {} = ?{next}", quote_ident(parent_column)));
                Some(parent_id)
            }
            _ => None,
        };
        let sql = select_json_sql(info, &filter);

        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(code_name);
        if info.site_column.is_some() {
            query = query.bind(scope.site_id);
        }
        if let Some(parent_id) = parent {
            query = query.bind(parent_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(Self::decode_rows(info, rows)?.into_iter().next())
    }

    async fn check_unique(
        &self,
        info: &ObjectTypeInfo,
        record: &Record,
        own_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let Some(code_name) = info
            .code_name_column
            .as_deref()
            .and_then(|column| record.get_str(column))
        else {
            return Ok(());
        };
        if let Some(existing) = self
            .find_by_code_name(info, code_name, LookupScope::of(info, record))
            .await?
        {
            if existing.get_i64(&info.id_column) != own_id {
                return Err(StoreError::Duplicate {
                    object_type: info.name.clone(),
                    code_name: code_name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn encode(info: &ObjectTypeInfo, record: &Record) -> Result<String, StoreError> {
        serde_json::to_string(record).map_err(|source| StoreError::Encode {
            object_type: info.name.clone(),
            source,
        })
    }

    /// Inserts a row and returns its new id.
    pub async fn insert(
        &self,
        info: &ObjectTypeInfo,
        record: &Record,
        binary: Option<&[u8]>,
        check_unique: bool,
    ) -> Result<i64, StoreError> {
        if check_unique {
            self.check_unique(info, record, None).await?;
        }
        let inserter = RowInserter::prepare(info, record, binary.is_some());
        let payload = Self::encode(info, record)?;
        let mut query = sqlx::query(&inserter.sql);
        if inserter.uses_payload || binary.is_some() {
            query = query.bind(payload);
        }
        if let Some(bytes) = binary {
            query = query.bind(bytes);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update(
        &self,
        info: &ObjectTypeInfo,
        id: i64,
        record: &Record,
        binary: Option<&[u8]>,
        check_unique: bool,
    ) -> Result<(), StoreError> {
        if check_unique {
            self.check_unique(info, record, Some(id)).await?;
        }
        let Some(sql) = update_sql(info, record, binary.is_some()) else {
            return Ok(());
        };
        let payload = Self::encode(info, record)?;
        let mut query = sqlx::query(&sql).bind(payload).bind(id);
        if let Some(bytes) = binary {
            query = query.bind(bytes);
        }
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                object_type: info.name.clone(),
                id,
            });
        }
        Ok(())
    }

    pub async fn delete(&self, info: &ObjectTypeInfo, id: i64) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&info.table),
            quote_ident(&info.id_column)
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes every row whose `column` equals `value`.
    pub async fn delete_where(
        &self,
        info: &ObjectTypeInfo,
        column: &str,
        value: i64,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&info.table),
            quote_ident(column)
        );
        let result = sqlx::query(&sql).bind(value).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn binary(
        &self,
        info: &ObjectTypeInfo,
        id: i64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(column) = info.binary_column.as_deref() else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote_ident(column),
            quote_ident(&info.table),
            quote_ident(&info.id_column)
        );
        let value: Option<Option<Vec<u8>>> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.flatten())
    }

    /// Id of the binding row joining the two referenced objects, if any.
    pub async fn find_binding(
        &self,
        info: &ObjectTypeInfo,
        (left_column, left_id): (&str, i64),
        (right_column, right_id): (&str, i64),
    ) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2 LIMIT 1",
            quote_ident(&info.id_column),
            quote_ident(&info.table),
            quote_ident(left_column),
            quote_ident(right_column)
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(left_id)
            .bind(right_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Inserts rows in one transaction and returns their new ids in input
    /// order. Used when the target is known not to contain any of them.
    pub async fn bulk_insert(
        &self,
        info: &ObjectTypeInfo,
        rows: &[Record],
    ) -> Result<Vec<i64>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::with_capacity(rows.len());
        let mut tx: Transaction<'_, Sqlite> = self.pool.begin().await?;
        for row in rows {
            let inserter = RowInserter::prepare(info, row, false);
            let mut query = sqlx::query(&inserter.sql);
            if inserter.uses_payload {
                query = query.bind(Self::encode(info, row)?);
            }
            let result = query.execute(tx.as_mut()).await?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit().await?;
        tracing::debug!(
            target: "siteport",
            event = "store_bulk_insert",
            object_type = %info.name,
            rows = ids.len(),
        );
        Ok(ids)
    }

    /// Stores a snapshot of the object as it is now.
    pub async fn create_version(
        &self,
        info: &ObjectTypeInfo,
        id: i64,
    ) -> Result<i64, StoreError> {
        let record = self.get(info, id).await?.ok_or_else(|| StoreError::NotFound {
            object_type: info.name.clone(),
            id,
        })?;
        let data = Self::encode(info, &record)?;
        let result = sqlx::query(
            "INSERT INTO object_versions (object_type, object_id, data, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&info.name)
        .bind(id)
        .bind(data)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn versions(
        &self,
        object_type: &str,
        id: i64,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, i64, String, String)>(
            "SELECT version_id, object_type, object_id, data, created_at FROM object_versions
             WHERE object_type = ?1 AND object_id = ?2 ORDER BY version_id",
        )
        .bind(object_type)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(version_id, object_type, object_id, data, created_at)| {
                let data = serde_json::from_str(&data).map_err(|source| StoreError::Decode {
                    object_type: object_type.clone(),
                    source,
                })?;
                Ok(ObjectVersion {
                    version_id,
                    object_type,
                    object_id,
                    data,
                    created_at,
                })
            })
            .collect()
    }

    pub async fn log_sync_task(
        &self,
        object_type: &str,
        object_id: i64,
        site_id: Option<i64>,
        task_type: TaskType,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sync_task (object_type, object_id, site_id, task_type, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(object_type)
        .bind(object_id)
        .bind(site_id)
        .bind(task_type.as_str())
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn sync_tasks(&self) -> Result<Vec<SyncTask>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, i64, Option<i64>, String, String)>(
            "SELECT task_id, object_type, object_id, site_id, task_type, created_at FROM sync_task ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(task_id, object_type, object_id, site_id, task_type, created_at)| {
                Some(SyncTask {
                    task_id,
                    object_type,
                    object_id,
                    site_id,
                    task_type: TaskType::parse(&task_type)?,
                    created_at,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::{column, object_type};
    use crate::catalog::ColumnKind;
    use serde_json::json;

    async fn memory_store(catalog: &ObjectCatalog) -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:");
        let store = SqliteStore::new(pool);
        store.ensure_schema(catalog).await.unwrap();
        store
    }

    fn role_catalog() -> ObjectCatalog {
        let mut site = object_type("cms.site", "Site");
        site.code_name_column = Some("SiteName".into());
        let mut role = object_type("cms.role", "Role");
        role.columns.push(column("RoleSiteID", ColumnKind::Integer));
        role.columns.push(column("RoleIsDomain", ColumnKind::Boolean));
        role.columns.push(column("RoleIcon", ColumnKind::Binary));
        role.site_column = Some("RoleSiteID".into());
        role.binary_column = Some("RoleIcon".into());
        role.versioned = true;
        ObjectCatalog::new(vec![site, role]).unwrap()
    }

    fn role(name: &str, site: Option<i64>) -> Record {
        let mut record: Record = serde_json::from_value(json!({
            "RoleName": name,
            "RoleGUID": uuid::Uuid::new_v4().to_string(),
            "RoleIsDomain": true,
        }))
        .unwrap();
        match site {
            Some(site) => record.set("RoleSiteID", site),
            None => record.set_null("RoleSiteID"),
        }
        record
    }

    #[tokio::test]
    async fn insert_get_and_update_round_trip() {
        let catalog = role_catalog();
        let store = memory_store(&catalog).await;
        let info = catalog.get("cms.role").unwrap();

        let record = role("Editors", Some(1));
        let id = store.insert(info, &record, Some(b"icon"), true).await.unwrap();
        let loaded = store.get(info, id).await.unwrap().unwrap();
        assert_eq!(loaded.get_str("RoleName"), Some("Editors"));
        assert_eq!(loaded.get("RoleIsDomain"), Some(&json!(true)));
        assert!(!loaded.contains("RoleIcon"));
        assert_eq!(store.binary(info, id).await.unwrap(), Some(b"icon".to_vec()));

        let mut changed = loaded.clone();
        changed.set("RoleName", "Authors");
        store.update(info, id, &changed, None, true).await.unwrap();
        let reloaded = store.get(info, id).await.unwrap().unwrap();
        assert_eq!(reloaded.get_str("RoleName"), Some("Authors"));
        assert_eq!(store.binary(info, id).await.unwrap(), Some(b"icon".to_vec()));
    }

    #[tokio::test]
    async fn code_name_lookup_respects_site_scope() {
        let catalog = role_catalog();
        let store = memory_store(&catalog).await;
        let info = catalog.get("cms.role").unwrap();

        let global = store.insert(info, &role("Editors", None), None, true).await.unwrap();
        let site = store.insert(info, &role("Editors", Some(2)), None, true).await.unwrap();

        let found = store
            .find_by_code_name(info, "Editors", LookupScope::site(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get_i64("RoleID"), Some(global));
        let found = store
            .find_by_code_name(info, "Editors", LookupScope::site(Some(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get_i64("RoleID"), Some(site));
        assert!(store
            .find_by_code_name(info, "Editors", LookupScope::site(Some(3)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn uniqueness_check_can_be_disabled() {
        let catalog = role_catalog();
        let store = memory_store(&catalog).await;
        let info = catalog.get("cms.role").unwrap();

        store.insert(info, &role("Editors", Some(1)), None, true).await.unwrap();
        let err = store
            .insert(info, &role("Editors", Some(1)), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
        store
            .insert(info, &role("Editors", Some(1)), None, false)
            .await
            .unwrap();
        assert_eq!(store.count(info).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn guid_lookup_is_case_insensitive() {
        let catalog = role_catalog();
        let store = memory_store(&catalog).await;
        let info = catalog.get("cms.role").unwrap();
        let record = role("Editors", None);
        let guid = record.get_guid("RoleGUID").unwrap();
        let id = store.insert(info, &record, None, false).await.unwrap();

        let found = store
            .find_by_guid(info, &guid.to_ascii_uppercase(), LookupScope::site(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get_i64("RoleID"), Some(id));
    }

    #[tokio::test]
    async fn guid_lookup_stays_inside_the_site() {
        let catalog = role_catalog();
        let store = memory_store(&catalog).await;
        let info = catalog.get("cms.role").unwrap();
        let record = role("Editors", Some(1));
        let guid = record.get_guid("RoleGUID").unwrap();
        let id = store.insert(info, &record, None, false).await.unwrap();

        let found = store
            .find_by_guid(info, &guid, LookupScope::site(Some(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get_i64("RoleID"), Some(id));
        assert!(store
            .find_by_guid(info, &guid, LookupScope::site(Some(2)))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_by_guid(info, &guid, LookupScope::site(None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn versions_and_sync_tasks_are_recorded() {
        let catalog = role_catalog();
        let store = memory_store(&catalog).await;
        let info = catalog.get("cms.role").unwrap();
        let id = store.insert(info, &role("Editors", None), None, false).await.unwrap();

        store.create_version(info, id).await.unwrap();
        let versions = store.versions("cms.role", id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].data.get_str("RoleName"), Some("Editors"));

        store
            .log_sync_task("cms.role", id, None, TaskType::Update)
            .await
            .unwrap();
        let tasks = store.sync_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::Update);
    }
}
