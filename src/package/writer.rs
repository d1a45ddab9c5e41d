use std::fs;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;

use super::dataset::{
    row_element, ExportTask, ObjectIdentity, EXPORT_TASK_ELEMENT, OBJECT_TRANSLATION_ELEMENT,
};
use super::manifest::PackageManifest;
use super::PackageError;
use crate::catalog::ObjectTypeInfo;
use crate::record::Record;

/// Everything written into one dataset file.
#[derive(Debug, Default)]
pub struct DataSetContent<'a> {
    pub tables: Vec<(&'a ObjectTypeInfo, Vec<Record>)>,
    pub tasks: Vec<ExportTask>,
    pub identities: Vec<ObjectIdentity>,
}

struct XmlOut<'p> {
    writer: Writer<Vec<u8>>,
    path: &'p Path,
}

impl<'p> XmlOut<'p> {
    fn new(path: &'p Path) -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
            path,
        }
    }

    fn emit(&mut self, event: Event<'_>) -> Result<(), PackageError> {
        self.writer
            .write_event(event)
            .map_err(|err| PackageError::XmlWrite {
                path: self.path.display().to_string(),
                reason: err.to_string(),
            })
    }

    fn declaration(&mut self) -> Result<(), PackageError> {
        self.emit(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<(), PackageError> {
        self.emit(Event::Start(BytesStart::new(name)))?;
        self.emit(Event::Text(BytesText::new(text)))?;
        self.emit(Event::End(BytesEnd::new(name)))
    }

    fn optional_element(&mut self, name: &str, text: Option<String>) -> Result<(), PackageError> {
        match text {
            Some(text) => self.text_element(name, &text),
            None => Ok(()),
        }
    }

    fn finish(self) -> Result<(), PackageError> {
        let bytes = self.writer.into_inner();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| PackageError::io(parent, err))?;
        }
        fs::write(self.path, bytes).map_err(|err| PackageError::io(self.path, err))
    }
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

pub fn write_dataset(
    path: &Path,
    version: &str,
    hotfix: u32,
    content: &DataSetContent<'_>,
) -> Result<(), PackageError> {
    let mut out = XmlOut::new(path);
    out.declaration()?;

    let hotfix_text = hotfix.to_string();
    let mut root = BytesStart::new("NewDataSet");
    root.push_attribute(("version", version));
    root.push_attribute(("hotfix", hotfix_text.as_str()));
    out.emit(Event::Start(root))?;

    for (info, rows) in &content.tables {
        let element = row_element(&info.name);
        for row in rows {
            out.emit(Event::Start(BytesStart::new(element.as_str())))?;
            for (column, value) in row.iter() {
                out.optional_element(column, cell_text(value))?;
            }
            out.emit(Event::End(BytesEnd::new(element.as_str())))?;
        }
    }

    for task in &content.tasks {
        out.emit(Event::Start(BytesStart::new(EXPORT_TASK_ELEMENT)))?;
        out.text_element("TaskID", &task.task_id.to_string())?;
        out.text_element("TaskObjectType", &task.object_type)?;
        out.text_element("TaskType", task.task_type.as_str())?;
        out.optional_element("TaskObjectCodeName", task.code_name.clone())?;
        out.optional_element("TaskObjectGUID", task.guid.clone())?;
        out.optional_element("TaskSiteID", task.site_id.map(|id| id.to_string()))?;
        out.emit(Event::End(BytesEnd::new(EXPORT_TASK_ELEMENT)))?;
    }

    for identity in &content.identities {
        out.emit(Event::Start(BytesStart::new(OBJECT_TRANSLATION_ELEMENT)))?;
        out.text_element("ObjectType", &identity.object_type)?;
        out.text_element("ObjectID", &identity.object_id.to_string())?;
        out.optional_element("CodeName", identity.code_name.clone())?;
        out.optional_element("GUID", identity.guid.clone())?;
        out.optional_element("SiteID", identity.site_id.map(|id| id.to_string()))?;
        out.emit(Event::End(BytesEnd::new(OBJECT_TRANSLATION_ELEMENT)))?;
    }

    out.emit(Event::End(BytesEnd::new("NewDataSet")))?;
    out.finish()
}

pub fn write_manifest(path: &Path, manifest: &PackageManifest) -> Result<(), PackageError> {
    let mut out = XmlOut::new(path);
    out.declaration()?;

    let hotfix_text = manifest.hotfix.to_string();
    let project_text = manifest.project_type.map(|project| project.to_string());
    let mut root = BytesStart::new("Package");
    root.push_attribute(("version", manifest.version.as_str()));
    root.push_attribute(("hotfix", hotfix_text.as_str()));
    if let Some(project) = project_text.as_deref() {
        root.push_attribute(("projectType", project));
    }
    if let Some(created) = manifest.created_at.as_deref() {
        root.push_attribute(("created", created));
    }

    if manifest.files.is_empty() {
        out.emit(Event::Empty(root))?;
    } else {
        out.emit(Event::Start(root))?;
        for file in &manifest.files {
            let mut element = BytesStart::new("File");
            element.push_attribute(("path", file.path.as_str()));
            element.push_attribute(("sha256", file.sha256.as_str()));
            out.emit(Event::Empty(element))?;
        }
        out.emit(Event::End(BytesEnd::new("Package")))?;
    }
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::object_type;
    use crate::catalog::ObjectCatalog;
    use crate::package::dataset::{DataSet, TaskType};
    use crate::settings::ProjectType;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn written_dataset_reads_back() {
        let tmp = TempDir::new().unwrap();
        let catalog = ObjectCatalog::new(vec![object_type("cms.role", "Role")]).unwrap();
        let info = catalog.get("cms.role").unwrap();
        let row: Record = serde_json::from_value(json!({
            "RoleID": 3,
            "RoleName": "R&D <team>",
            "RoleGUID": null,
        }))
        .unwrap();
        let content = DataSetContent {
            tables: vec![(info, vec![row])],
            tasks: vec![ExportTask {
                task_id: 1,
                object_type: "cms.role".into(),
                task_type: TaskType::Delete,
                code_name: Some("Gone".into()),
                guid: None,
                site_id: None,
            }],
            identities: Vec::new(),
        };
        let path = tmp.path().join("cms_role.xml");
        write_dataset(&path, "13.0", 2, &content).unwrap();

        let dataset = DataSet::load(&path, &catalog).unwrap();
        assert_eq!(dataset.hotfix, Some(2));
        let rows = dataset.rows("cms.role");
        assert_eq!(rows[0].get_str("RoleName"), Some("R&D <team>"));
        assert!(!rows[0].contains("RoleGUID"));
        assert_eq!(dataset.tasks[0].code_name.as_deref(), Some("Gone"));
    }

    #[test]
    fn manifest_reads_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("package.xml");
        let mut manifest = PackageManifest::new("13.0", 4);
        manifest.project_type = Some(ProjectType::WebApplication);
        write_manifest(&path, &manifest).unwrap();
        let loaded = PackageManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
    }
}
