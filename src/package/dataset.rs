use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::manifest::read_version_attributes;
use super::PackageError;
use crate::catalog::{safe_name, ColumnKind, ObjectCatalog, ObjectTypeInfo};
use crate::record::Record;

pub const EXPORT_TASK_ELEMENT: &str = "Export_Task";
pub const OBJECT_TRANSLATION_ELEMENT: &str = "ObjectTranslation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Update,
    Delete,
    AddToSite,
    RemoveFromSite,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Update => "update",
            TaskType::Delete => "delete",
            TaskType::AddToSite => "add_to_site",
            TaskType::RemoveFromSite => "remove_from_site",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "update" | "updateobject" => Some(TaskType::Update),
            "delete" | "deleteobject" => Some(TaskType::Delete),
            "add_to_site" | "addtosite" | "addobjecttosite" => Some(TaskType::AddToSite),
            "remove_from_site" | "removefromsite" | "removeobjectfromsite" => {
                Some(TaskType::RemoveFromSite)
            }
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change recorded on the source system and shipped with the package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTask {
    pub task_id: i64,
    pub object_type: String,
    pub task_type: TaskType,
    pub code_name: Option<String>,
    pub guid: Option<String>,
    pub site_id: Option<i64>,
}

/// Identity of a source object referenced by the package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub object_type: String,
    pub object_id: i64,
    pub code_name: Option<String>,
    pub guid: Option<String>,
    pub site_id: Option<i64>,
}

/// In-memory tables read from one dataset file.
#[derive(Debug, Clone, Default)]
pub struct DataSet {
    pub version: Option<String>,
    pub hotfix: Option<u32>,
    tables: BTreeMap<String, Vec<Record>>,
    pub tasks: Vec<ExportTask>,
    pub identities: Vec<ObjectIdentity>,
}

impl DataSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Path of the dataset file for a top-level type inside a package root.
    pub fn path_for(root: &Path, info: &ObjectTypeInfo) -> std::path::PathBuf {
        root.join(format!("{}.xml", info.safe_name()))
    }

    pub fn load(path: &Path, catalog: &ObjectCatalog) -> Result<Self, PackageError> {
        let text = fs::read_to_string(path).map_err(|err| PackageError::io(path, err))?;
        Self::parse(&text, path, catalog)
    }

    pub fn parse(text: &str, path: &Path, catalog: &ObjectCatalog) -> Result<Self, PackageError> {
        let doc = roxmltree::Document::parse(text).map_err(|err| PackageError::Xml {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let root = doc.root_element();
        let header = read_version_attributes(&root, path).ok();

        let by_safe_name: HashMap<String, &ObjectTypeInfo> = catalog
            .types()
            .iter()
            .map(|info| (info.safe_name(), info))
            .collect();

        let mut dataset = DataSet {
            version: header.as_ref().map(|(version, _)| version.clone()),
            hotfix: header.map(|(_, hotfix)| hotfix),
            ..DataSet::default()
        };

        for row in root.children().filter(|node| node.is_element()) {
            let element = row.tag_name().name();
            let cells: Vec<(&str, Option<&str>)> = row
                .children()
                .filter(|node| node.is_element())
                .map(|cell| (cell.tag_name().name(), cell.text()))
                .collect();

            match element {
                EXPORT_TASK_ELEMENT => {
                    if let Some(task) = parse_task(&cells) {
                        dataset.tasks.push(task);
                    } else {
                        tracing::warn!(
                            target: "siteport",
                            event = "package_task_ignored",
                            path = %path.display(),
                        );
                    }
                }
                OBJECT_TRANSLATION_ELEMENT => {
                    if let Some(identity) = parse_identity(&cells) {
                        dataset.identities.push(identity);
                    }
                }
                other => {
                    let Some(info) = by_safe_name.get(other) else {
                        tracing::debug!(
                            target: "siteport",
                            event = "package_table_ignored",
                            table = other,
                            path = %path.display(),
                        );
                        continue;
                    };
                    let record = parse_row(info, &cells, path)?;
                    dataset
                        .tables
                        .entry(info.name.clone())
                        .or_default()
                        .push(record);
                }
            }
        }

        Ok(dataset)
    }

    pub fn insert_rows(&mut self, object_type: &str, rows: Vec<Record>) {
        self.tables
            .entry(object_type.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, object_type: &str) -> &[Record] {
        self.tables
            .get(object_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Rows of `object_type` whose `column` equals `value`.
    pub fn rows_where<'a>(
        &'a self,
        object_type: &str,
        column: &'a str,
        value: i64,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        self.rows(object_type)
            .iter()
            .filter(move |row| row.get_i64(column) == Some(value))
    }

    pub fn tasks_for<'a>(
        &'a self,
        object_type: &'a str,
    ) -> impl Iterator<Item = &'a ExportTask> + 'a {
        self.tasks
            .iter()
            .filter(move |task| task.object_type == object_type)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(Vec::is_empty) && self.tasks.is_empty()
    }
}

fn cell<'a>(cells: &[(&str, Option<&'a str>)], name: &str) -> Option<&'a str> {
    cells
        .iter()
        .find(|(column, _)| column.eq_ignore_ascii_case(name))
        .and_then(|(_, text)| *text)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn parse_task(cells: &[(&str, Option<&str>)]) -> Option<ExportTask> {
    Some(ExportTask {
        task_id: cell(cells, "TaskID")?.parse().ok()?,
        object_type: cell(cells, "TaskObjectType")?.to_string(),
        task_type: TaskType::parse(cell(cells, "TaskType")?)?,
        code_name: cell(cells, "TaskObjectCodeName").map(str::to_string),
        guid: cell(cells, "TaskObjectGUID").map(str::to_ascii_lowercase),
        site_id: cell(cells, "TaskSiteID").and_then(|raw| raw.parse().ok()),
    })
}

fn parse_identity(cells: &[(&str, Option<&str>)]) -> Option<ObjectIdentity> {
    Some(ObjectIdentity {
        object_type: cell(cells, "ObjectType")?.to_string(),
        object_id: cell(cells, "ObjectID")?.parse().ok()?,
        code_name: cell(cells, "CodeName").map(str::to_string),
        guid: cell(cells, "GUID").map(str::to_ascii_lowercase),
        site_id: cell(cells, "SiteID").and_then(|raw| raw.parse().ok()),
    })
}

fn parse_row(
    info: &ObjectTypeInfo,
    cells: &[(&str, Option<&str>)],
    path: &Path,
) -> Result<Record, PackageError> {
    let mut record = Record::new();
    for (column, text) in cells {
        let kind = info.column(column).map(|c| c.kind).unwrap_or(ColumnKind::Text);
        let value = parse_cell(kind, text.unwrap_or("")).ok_or_else(|| {
            PackageError::InvalidValue {
                path: path.display().to_string(),
                column: format!("{}.{}", info.name, column),
                value: text.unwrap_or("").to_string(),
            }
        })?;
        record.set(*column, value);
    }
    Ok(record)
}

/// Converts a cell's text into a JSON value of the column's kind.
pub(crate) fn parse_cell(kind: ColumnKind, raw: &str) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return Some(match kind {
            ColumnKind::Text => Value::String(String::new()),
            _ => Value::Null,
        });
    }
    match kind {
        ColumnKind::Integer => text.parse::<i64>().ok().map(Value::from),
        ColumnKind::Float => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        ColumnKind::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        ColumnKind::Guid => uuid::Uuid::parse_str(text)
            .ok()
            .map(|guid| Value::String(guid.to_string())),
        ColumnKind::Text => Some(Value::String(raw.to_string())),
        ColumnKind::DateTime | ColumnKind::Binary => Some(Value::String(text.to_string())),
    }
}

/// Element name used for rows of an object type.
pub fn row_element(object_type: &str) -> String {
    safe_name(object_type)
}
