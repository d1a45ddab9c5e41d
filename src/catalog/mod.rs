//! Object-type metadata.
//!
//! The catalog is supplied by the host system and treated as read-only input.
//! It names every object type the engine may touch, which columns carry
//! identity (id, code name, GUID, site, parent), which columns reference other
//! object types, and how nested types travel inside their parent's dataset.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Table and column names are spliced into SQL, so they must be plain
/// identifiers.
static SQL_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("sql identifier pattern to compile")
});

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("object type {0} is declared more than once")]
    DuplicateType(String),
    #[error("object type {owner} refers to unknown object type {missing}")]
    UnknownType { owner: String, missing: String },
    #[error("object type {0} declares a parent type without a parent column")]
    MissingParentColumn(String),
    #[error("binding type {0} must declare exactly two references")]
    InvalidBinding(String),
    #[error("category cycle detected at object type {0}")]
    CategoryCycle(String),
    #[error("category type {category} of {owner} must be a top-level type")]
    NestedCategory { owner: String, category: String },
    #[error("object type {owner} declares column {column} that is not in its column list")]
    UnknownColumn { owner: String, column: String },
    #[error("object type {owner} uses {name:?}, which is not a valid table or column name")]
    InvalidIdentifier { owner: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Float,
    Text,
    Boolean,
    Guid,
    DateTime,
    Binary,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
            ColumnKind::Float => "REAL",
            ColumnKind::Text | ColumnKind::Guid | ColumnKind::DateTime => "TEXT",
            ColumnKind::Binary => "BLOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub kind: ColumnKind,
}

/// How a nested type travels with its parent.
///
/// `Complete` means the parent's dataset carries every child row, so rows
/// missing from the package are stale. `Incremental` only ever adds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeToParent {
    #[default]
    None,
    Complete,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub column: String,
    pub object_type: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRuleKind {
    File,
    #[default]
    Directory,
    Assembly,
}

/// A physical file or folder shipped under `files/<safe_type>/<package_path>`
/// and copied to `<target_root>/<target_path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalFileRule {
    pub package_path: String,
    pub target_path: String,
    #[serde(default)]
    pub kind: FileRuleKind,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTypeInfo {
    pub name: String,
    pub table: String,
    pub id_column: String,
    #[serde(default)]
    pub code_name_column: Option<String>,
    #[serde(default)]
    pub guid_column: Option<String>,
    #[serde(default)]
    pub site_column: Option<String>,
    #[serde(default)]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub parent_column: Option<String>,
    #[serde(default)]
    pub category_type: Option<String>,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub references: Vec<ReferenceInfo>,
    #[serde(default)]
    pub is_binding: bool,
    #[serde(default)]
    pub include_to_parent: IncludeToParent,
    #[serde(default)]
    pub site_binding_type: Option<String>,
    #[serde(default)]
    pub versioned: bool,
    #[serde(default)]
    pub required_object: bool,
    /// Nested objects shipped inside the parent's own synchronization payload.
    #[serde(default)]
    pub included_in_parent_sync: bool,
    #[serde(default)]
    pub binary_column: Option<String>,
    #[serde(default)]
    pub physical_files: Vec<PhysicalFileRule>,
    /// Reference columns whose translation failure defers the object.
    #[serde(default)]
    pub deferrable_columns: Vec<String>,
}

impl ObjectTypeInfo {
    /// File and element name used for this type inside a package.
    pub fn safe_name(&self) -> String {
        safe_name(&self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn is_site_scoped(&self) -> bool {
        self.site_column.is_some()
    }

    /// Declared references plus the implied parent reference.
    pub fn all_references(&self) -> Vec<ReferenceInfo> {
        let mut refs = self.references.clone();
        if let (Some(parent_type), Some(parent_column)) = (&self.parent_type, &self.parent_column) {
            if !refs.iter().any(|r| &r.column == parent_column) {
                refs.push(ReferenceInfo {
                    column: parent_column.clone(),
                    object_type: parent_type.clone(),
                    required: true,
                });
            }
        }
        refs
    }

    /// Resolves which column of a binding type points at `parent_type`.
    /// When both columns reference the same type the declared parent column
    /// wins.
    pub fn binding_columns(&self, parent_type: &str) -> Option<BindingColumns> {
        let refs = self.all_references();
        let [first, second] = refs.as_slice() else {
            return None;
        };
        let parent_is_first = match (
            first.object_type == parent_type,
            second.object_type == parent_type,
        ) {
            (true, true) => self.parent_column.as_deref() != Some(second.column.as_str()),
            (true, false) => true,
            (false, true) => false,
            (false, false) => return None,
        };
        let (parent, other) = if parent_is_first {
            (first, second)
        } else {
            (second, first)
        };
        Some(BindingColumns {
            parent: parent.column.clone(),
            other: other.column.clone(),
            other_type: other.object_type.clone(),
        })
    }

    /// Columns that are persisted through JSON (everything except the binary payload).
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns
            .iter()
            .filter(move |column| Some(&column.name) != self.binary_column.as_ref())
    }
}

/// Column pair of a binding type seen from one of its two sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingColumns {
    pub parent: String,
    pub other: String,
    pub other_type: String,
}

pub fn safe_name(object_type: &str) -> String {
    object_type.replace('.', "_")
}

/// Where meta-file rows store the owner of the attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFileInfo {
    pub object_type: String,
    pub object_type_column: String,
    pub object_id_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectCatalog {
    types: Vec<ObjectTypeInfo>,
    #[serde(default)]
    site_type: Option<String>,
    #[serde(default)]
    user_type: Option<String>,
    #[serde(default)]
    metafile: Option<MetaFileInfo>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ObjectCatalog {
    pub fn new(types: Vec<ObjectTypeInfo>) -> Result<Self, CatalogError> {
        let mut catalog = Self {
            types,
            site_type: None,
            user_type: None,
            metafile: None,
            index: HashMap::new(),
        };
        catalog.rebuild()?;
        Ok(catalog)
    }

    pub fn with_site_type(mut self, name: impl Into<String>) -> Result<Self, CatalogError> {
        self.site_type = Some(name.into());
        self.rebuild()?;
        Ok(self)
    }

    pub fn with_user_type(mut self, name: impl Into<String>) -> Result<Self, CatalogError> {
        self.user_type = Some(name.into());
        self.rebuild()?;
        Ok(self)
    }

    pub fn with_metafile(mut self, info: MetaFileInfo) -> Result<Self, CatalogError> {
        self.metafile = Some(info);
        self.rebuild()?;
        Ok(self)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut catalog: ObjectCatalog =
            serde_json::from_str(&text).map_err(|source| CatalogError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        catalog.rebuild()?;
        Ok(catalog)
    }

    fn rebuild(&mut self) -> Result<(), CatalogError> {
        self.index.clear();
        for (position, info) in self.types.iter().enumerate() {
            if self.index.insert(info.name.clone(), position).is_some() {
                return Err(CatalogError::DuplicateType(info.name.clone()));
            }
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let known = |owner: &str, name: &str| -> Result<(), CatalogError> {
            if self.index.contains_key(name) {
                Ok(())
            } else {
                Err(CatalogError::UnknownType {
                    owner: owner.to_string(),
                    missing: name.to_string(),
                })
            }
        };

        for designated in [&self.site_type, &self.user_type].into_iter().flatten() {
            known("catalog", designated)?;
        }
        if let Some(metafile) = &self.metafile {
            known("catalog", &metafile.object_type)?;
        }

        for info in &self.types {
            let identifiers =
                std::iter::once(&info.table).chain(info.columns.iter().map(|c| &c.name));
            for name in identifiers {
                if !SQL_IDENTIFIER.is_match(name) {
                    return Err(CatalogError::InvalidIdentifier {
                        owner: info.name.clone(),
                        name: name.clone(),
                    });
                }
            }

            let mut declared: Vec<&String> = vec![&info.id_column];
            declared.extend(info.code_name_column.iter());
            declared.extend(info.guid_column.iter());
            declared.extend(info.site_column.iter());
            declared.extend(info.parent_column.iter());
            declared.extend(info.binary_column.iter());
            declared.extend(info.references.iter().map(|r| &r.column));
            for column in declared {
                if info.column(column).is_none() {
                    return Err(CatalogError::UnknownColumn {
                        owner: info.name.clone(),
                        column: column.clone(),
                    });
                }
            }

            if let Some(parent) = &info.parent_type {
                known(&info.name, parent)?;
                if info.parent_column.is_none() {
                    return Err(CatalogError::MissingParentColumn(info.name.clone()));
                }
            }
            if let Some(binding) = &info.site_binding_type {
                known(&info.name, binding)?;
            }
            for reference in &info.references {
                known(&info.name, &reference.object_type)?;
            }
            if info.is_binding && info.all_references().len() != 2 {
                return Err(CatalogError::InvalidBinding(info.name.clone()));
            }
            if let Some(category) = &info.category_type {
                known(&info.name, category)?;
                let category_info = &self.types[self.index[category]];
                if !self.is_top_level(category_info) {
                    return Err(CatalogError::NestedCategory {
                        owner: info.name.clone(),
                        category: category.clone(),
                    });
                }
            }
        }

        self.import_order().map(|_| ())
    }

    pub fn get(&self, name: &str) -> Option<&ObjectTypeInfo> {
        self.index.get(name).map(|position| &self.types[*position])
    }

    pub fn types(&self) -> &[ObjectTypeInfo] {
        &self.types
    }

    pub fn site_type(&self) -> Option<&str> {
        self.site_type.as_deref()
    }

    pub fn user_type(&self) -> Option<&str> {
        self.user_type.as_deref()
    }

    pub fn metafile(&self) -> Option<&MetaFileInfo> {
        self.metafile.as_ref()
    }

    pub fn is_metafile(&self, info: &ObjectTypeInfo) -> bool {
        self.metafile
            .as_ref()
            .is_some_and(|meta| meta.object_type == info.name)
    }

    /// Types that travel inside their parent's dataset.
    pub fn is_nested(&self, info: &ObjectTypeInfo) -> bool {
        (info.parent_type.is_some() && info.include_to_parent != IncludeToParent::None)
            || self.is_metafile(info)
    }

    pub fn is_top_level(&self, info: &ObjectTypeInfo) -> bool {
        !self.is_nested(info)
    }

    pub fn children_of<'a>(
        &'a self,
        parent: &'a str,
    ) -> impl Iterator<Item = &'a ObjectTypeInfo> + 'a {
        self.types.iter().filter(move |info| {
            !info.is_binding
                && info.parent_type.as_deref() == Some(parent)
                && info.include_to_parent != IncludeToParent::None
        })
    }

    pub fn bindings_of<'a>(
        &'a self,
        parent: &'a str,
    ) -> impl Iterator<Item = &'a ObjectTypeInfo> + 'a {
        self.types.iter().filter(move |info| {
            info.is_binding
                && info.parent_type.as_deref() == Some(parent)
                && info.include_to_parent != IncludeToParent::None
        })
    }

    /// Every type whose rows may appear in the dataset file of `root`.
    pub fn dataset_members(&self, root: &str) -> Vec<&ObjectTypeInfo> {
        let mut members = Vec::new();
        let mut pending = vec![root.to_string()];
        let mut seen = HashSet::new();
        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(info) = self.get(&name) else {
                continue;
            };
            members.push(info);
            for child in self.children_of(&info.name) {
                pending.push(child.name.clone());
            }
            for binding in self.bindings_of(&info.name) {
                pending.push(binding.name.clone());
            }
        }
        if let Some(meta) = self.metafile.as_ref().and_then(|m| self.get(&m.object_type)) {
            if !members.iter().any(|m| m.name == meta.name) {
                members.push(meta);
            }
        }
        members
    }

    /// Top-level types in import order: catalog order, except that category
    /// types are pulled in front of their owners, recursively.
    pub fn import_order(&self) -> Result<Vec<&ObjectTypeInfo>, CatalogError> {
        let mut ordered = Vec::new();
        let mut placed = BTreeSet::new();
        for info in self.types.iter().filter(|info| self.is_top_level(info)) {
            let mut visiting = BTreeSet::new();
            self.place_with_categories(info, &mut ordered, &mut placed, &mut visiting)?;
        }
        Ok(ordered)
    }

    fn place_with_categories<'a>(
        &'a self,
        info: &'a ObjectTypeInfo,
        ordered: &mut Vec<&'a ObjectTypeInfo>,
        placed: &mut BTreeSet<String>,
        visiting: &mut BTreeSet<String>,
    ) -> Result<(), CatalogError> {
        if placed.contains(&info.name) {
            return Ok(());
        }
        if !visiting.insert(info.name.clone()) {
            return Err(CatalogError::CategoryCycle(info.name.clone()));
        }
        if let Some(category) = info.category_type.as_deref() {
            // Self-categorised types (tree-shaped categories) need no reordering.
            if category != info.name {
                if let Some(category_info) = self.get(category) {
                    self.place_with_categories(category_info, ordered, placed, visiting)?;
                }
            }
        }
        visiting.remove(&info.name);
        placed.insert(info.name.clone());
        ordered.push(info);
        Ok(())
    }
}
