#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use siteport_lib::catalog::{ObjectCatalog, ObjectTypeInfo};
use siteport_lib::package::{write_dataset, DataSetContent, ExportTask, ObjectIdentity};
use siteport_lib::record::Record;
use siteport_lib::settings::ImportSettings;
use siteport_lib::store::SqliteStore;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

pub const SITE_ID: i64 = 1;
pub const CONTACT_GUID: &str = "0c3a7a4e-5f3b-4c65-9d8e-3f1f5c2a9b10";
pub const SURVEY_GUID: &str = "1d4b8b5f-6a4c-4d76-8e9f-4a2a6d3b0c21";
pub const CATEGORY_GUID: &str = "2e5c9c6a-7b5d-4e87-9fa0-5b3b7e4c1d32";
pub const FIELD_NAME_GUID: &str = "3f6dad7b-8c6e-4f98-a0b1-6c4c8f5d2e43";
pub const FIELD_EMAIL_GUID: &str = "4a7ebe8c-9d7f-4a09-b1c2-7d5d9a6e3f54";
pub const FILE_GUID: &str = "5b8fcf9d-ae80-4b1a-82d3-8e6eab7f4a65";

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

fn object_type(value: Value) -> ObjectTypeInfo {
    serde_json::from_value(value).expect("object type fixture")
}

/// Sites, users, form categories, forms with their fields, resources bound
/// to sites, and media files carrying binaries.
pub fn catalog_types() -> Vec<ObjectTypeInfo> {
    vec![
        object_type(json!({
            "name": "cms.site",
            "table": "cms_site",
            "id_column": "SiteID",
            "code_name_column": "SiteName",
            "guid_column": "SiteGUID",
            "columns": [
                {"name": "SiteID", "kind": "integer"},
                {"name": "SiteName", "kind": "text"},
                {"name": "SiteGUID", "kind": "guid"}
            ]
        })),
        object_type(json!({
            "name": "cms.user",
            "table": "cms_user",
            "id_column": "UserID",
            "code_name_column": "UserName",
            "guid_column": "UserGUID",
            "columns": [
                {"name": "UserID", "kind": "integer"},
                {"name": "UserName", "kind": "text"},
                {"name": "UserGUID", "kind": "guid"}
            ]
        })),
        object_type(json!({
            "name": "cms.form",
            "table": "cms_form",
            "id_column": "FormID",
            "code_name_column": "FormName",
            "guid_column": "FormGUID",
            "site_column": "FormSiteID",
            "category_type": "cms.formcategory",
            "versioned": true,
            "columns": [
                {"name": "FormID", "kind": "integer"},
                {"name": "FormName", "kind": "text"},
                {"name": "FormGUID", "kind": "guid"},
                {"name": "FormDisplayName", "kind": "text"},
                {"name": "FormSiteID", "kind": "integer"},
                {"name": "FormCategoryID", "kind": "integer"},
                {"name": "FormOwnerID", "kind": "integer"},
                {"name": "FormNextFormID", "kind": "integer"}
            ],
            "references": [
                {"column": "FormCategoryID", "object_type": "cms.formcategory", "required": true},
                {"column": "FormOwnerID", "object_type": "cms.user"},
                {"column": "FormNextFormID", "object_type": "cms.form", "required": true}
            ],
            "deferrable_columns": ["FormNextFormID"],
            "physical_files": [
                {"package_path": "{code_name}", "target_path": "Forms/{code_name}", "kind": "directory"}
            ]
        })),
        object_type(json!({
            "name": "cms.formfield",
            "table": "cms_formfield",
            "id_column": "FieldID",
            "code_name_column": "FieldName",
            "guid_column": "FieldGUID",
            "parent_type": "cms.form",
            "parent_column": "FieldFormID",
            "include_to_parent": "complete",
            "included_in_parent_sync": true,
            "columns": [
                {"name": "FieldID", "kind": "integer"},
                {"name": "FieldName", "kind": "text"},
                {"name": "FieldGUID", "kind": "guid"},
                {"name": "FieldFormID", "kind": "integer"},
                {"name": "FieldCaption", "kind": "text"}
            ]
        })),
        object_type(json!({
            "name": "cms.formcategory",
            "table": "cms_formcategory",
            "id_column": "CategoryID",
            "code_name_column": "CategoryName",
            "guid_column": "CategoryGUID",
            "columns": [
                {"name": "CategoryID", "kind": "integer"},
                {"name": "CategoryName", "kind": "text"},
                {"name": "CategoryGUID", "kind": "guid"}
            ]
        })),
        object_type(json!({
            "name": "cms.resource",
            "table": "cms_resource",
            "id_column": "ResourceID",
            "code_name_column": "ResourceName",
            "guid_column": "ResourceGUID",
            "site_binding_type": "cms.resourcesite",
            "columns": [
                {"name": "ResourceID", "kind": "integer"},
                {"name": "ResourceName", "kind": "text"},
                {"name": "ResourceGUID", "kind": "guid"}
            ]
        })),
        object_type(json!({
            "name": "cms.resourcesite",
            "table": "cms_resourcesite",
            "id_column": "BindingID",
            "parent_type": "cms.resource",
            "parent_column": "ResourceID",
            "is_binding": true,
            "columns": [
                {"name": "BindingID", "kind": "integer"},
                {"name": "ResourceID", "kind": "integer"},
                {"name": "SiteID", "kind": "integer"}
            ],
            "references": [
                {"column": "SiteID", "object_type": "cms.site", "required": true}
            ]
        })),
        object_type(json!({
            "name": "media.file",
            "table": "media_file",
            "id_column": "FileID",
            "code_name_column": "FileName",
            "guid_column": "FileGUID",
            "binary_column": "FileBinary",
            "columns": [
                {"name": "FileID", "kind": "integer"},
                {"name": "FileName", "kind": "text"},
                {"name": "FileGUID", "kind": "guid"},
                {"name": "FileBinary", "kind": "binary"}
            ]
        })),
    ]
}

pub fn sample_catalog() -> ObjectCatalog {
    catalog_from(catalog_types())
}

/// Catalog over `types` with the sample site and user types designated.
pub fn catalog_from(types: Vec<ObjectTypeInfo>) -> ObjectCatalog {
    ObjectCatalog::new(types)
        .and_then(|catalog| catalog.with_site_type("cms.site"))
        .and_then(|catalog| catalog.with_user_type("cms.user"))
        .expect("sample catalog")
}

/// Sample types with one of them adjusted.
pub fn catalog_with(object_type: &str, adjust: impl FnOnce(&mut ObjectTypeInfo)) -> ObjectCatalog {
    let mut types = catalog_types();
    let info = types
        .iter_mut()
        .find(|info| info.name == object_type)
        .expect("known object type");
    adjust(info);
    catalog_from(types)
}

/// Links between forms, nested under the source form. The target column may
/// be resolved after the owning form type has been imported.
pub fn form_link_type() -> ObjectTypeInfo {
    object_type(json!({
        "name": "cms.formlink",
        "table": "cms_formlink",
        "id_column": "LinkID",
        "parent_type": "cms.form",
        "parent_column": "LinkFormID",
        "include_to_parent": "complete",
        "included_in_parent_sync": true,
        "is_binding": true,
        "columns": [
            {"name": "LinkID", "kind": "integer"},
            {"name": "LinkFormID", "kind": "integer"},
            {"name": "LinkTargetFormID", "kind": "integer"}
        ],
        "references": [
            {"column": "LinkTargetFormID", "object_type": "cms.form", "required": true}
        ],
        "deferrable_columns": ["LinkTargetFormID"]
    }))
}

pub fn survey_form(id: i64, category_id: i64) -> Value {
    json!({
        "FormID": id,
        "FormName": "survey",
        "FormGUID": SURVEY_GUID,
        "FormDisplayName": "Survey",
        "FormSiteID": 42,
        "FormCategoryID": category_id
    })
}

pub fn write_catalog(catalog: &ObjectCatalog, path: &Path) {
    let json = serde_json::to_string_pretty(catalog).unwrap();
    std::fs::write(path, json).unwrap();
}

pub fn record(value: Value) -> Record {
    serde_json::from_value(value).expect("record fixture")
}

/// Store with the catalog schema and the target site in place.
pub async fn sample_store(catalog: &ObjectCatalog) -> SqliteStore {
    let store = SqliteStore::new(temp_pool().await);
    store.ensure_schema(catalog).await.unwrap();
    let site = catalog.get("cms.site").unwrap();
    let id = store
        .insert(
            site,
            &record(json!({
                "SiteName": "corporate",
                "SiteGUID": "6c90d0ae-bf91-4c2b-93e4-9f7fbc805b76"
            })),
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(id, SITE_ID);
    store
}

pub fn import_settings(package: &Path, work: &Path) -> ImportSettings {
    let mut settings = ImportSettings::new(package);
    settings.temporary_path = Some(work.join("unpacked"));
    settings.site_id = Some(SITE_ID);
    settings
}

/// True once every per-run package tree below the work folder is gone.
pub fn unpacked_is_clean(work: &Path) -> bool {
    match std::fs::read_dir(work.join("unpacked")) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Writes package datasets, one file per top-level type.
pub struct PackageBuilder<'c> {
    catalog: &'c ObjectCatalog,
    root: PathBuf,
    version: String,
    datasets: BTreeMap<String, DataSetContent<'c>>,
}

impl<'c> PackageBuilder<'c> {
    pub fn new(catalog: &'c ObjectCatalog, root: &Path) -> Self {
        Self {
            catalog,
            root: root.to_path_buf(),
            version: "12.0".to_string(),
            datasets: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    fn dataset(&mut self, dataset: &str) -> &mut DataSetContent<'c> {
        self.datasets.entry(dataset.to_string()).or_default()
    }

    /// Adds rows of `object_type` to the dataset file of `dataset`.
    pub fn rows(mut self, dataset: &str, object_type: &str, rows: Vec<Value>) -> Self {
        let info = self.catalog.get(object_type).expect("known object type");
        let rows = rows.into_iter().map(record).collect();
        self.dataset(dataset).tables.push((info, rows));
        self
    }

    pub fn task(mut self, dataset: &str, task: ExportTask) -> Self {
        self.dataset(dataset).tasks.push(task);
        self
    }

    pub fn identity(mut self, dataset: &str, identity: ObjectIdentity) -> Self {
        self.dataset(dataset).identities.push(identity);
        self
    }

    pub fn file(self, relative: &str, contents: &[u8]) -> Self {
        let path = self.root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
        self
    }

    pub fn write(self) -> PathBuf {
        std::fs::create_dir_all(&self.root).unwrap();
        for (dataset, content) in &self.datasets {
            let info = self.catalog.get(dataset).expect("known dataset type");
            let path = siteport_lib::package::DataSet::path_for(&self.root, info);
            write_dataset(&path, &self.version, 0, content).unwrap();
        }
        self.root
    }
}

pub fn contact_form(id: i64, category_id: i64) -> Value {
    json!({
        "FormID": id,
        "FormName": "contact",
        "FormGUID": CONTACT_GUID,
        "FormDisplayName": "Contact us",
        "FormSiteID": 42,
        "FormCategoryID": category_id
    })
}

pub fn contact_fields(form_id: i64) -> Vec<Value> {
    vec![
        json!({
            "FieldID": 501,
            "FieldName": "name",
            "FieldGUID": FIELD_NAME_GUID,
            "FieldFormID": form_id,
            "FieldCaption": "Your name"
        }),
        json!({
            "FieldID": 502,
            "FieldName": "email",
            "FieldGUID": FIELD_EMAIL_GUID,
            "FieldFormID": form_id,
            "FieldCaption": "E-mail"
        }),
    ]
}

pub fn forms_category(id: i64) -> Value {
    json!({
        "CategoryID": id,
        "CategoryName": "feedback",
        "CategoryGUID": CATEGORY_GUID
    })
}

pub async fn single(store: &SqliteStore, catalog: &ObjectCatalog, object_type: &str) -> Record {
    let info = catalog.get(object_type).unwrap();
    let mut rows = store.list(info).await.unwrap();
    assert_eq!(rows.len(), 1, "expected exactly one {object_type}");
    rows.remove(0)
}

pub async fn count(store: &SqliteStore, catalog: &ObjectCatalog, object_type: &str) -> i64 {
    store.count(catalog.get(object_type).unwrap()).await.unwrap()
}
