use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::catalog::ObjectCatalog;

/// Run-scoped map from (object type, source id) to the id committed on the
/// target. An entry exists only once its object has been written.
#[derive(Debug, Clone, Default)]
pub struct TranslationTable {
    entries: HashMap<(String, i64), i64>,
}

impl TranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a translation and returns the previous target id, if any.
    pub fn insert(&mut self, object_type: &str, source_id: i64, target_id: i64) -> Option<i64> {
        self.entries
            .insert((object_type.to_string(), source_id), target_id)
    }

    pub fn get(&self, object_type: &str, source_id: i64) -> Option<i64> {
        self.entries
            .get(&(object_type.to_string(), source_id))
            .copied()
    }

    pub fn contains(&self, object_type: &str, source_id: i64) -> bool {
        self.get(object_type, source_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_for(&self, object_type: &str) -> usize {
        self.entries
            .keys()
            .filter(|(kind, _)| kind == object_type)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64, i64)> {
        self.entries
            .iter()
            .map(|((kind, source), target)| (kind.as_str(), *source, *target))
    }
}

/// Reference columns whose translation failure sends the object to the
/// post-process queue instead of failing it.
#[derive(Debug, Clone, Default)]
pub struct DeferralPolicy {
    columns: BTreeMap<String, BTreeSet<String>>,
}

impl DeferralPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the table from each type's declared `deferrable_columns`.
    pub fn from_catalog(catalog: &ObjectCatalog) -> Self {
        let mut policy = Self::default();
        for info in catalog.types() {
            for column in &info.deferrable_columns {
                policy.allow(&info.name, column);
            }
        }
        policy
    }

    pub fn allow(&mut self, object_type: &str, column: &str) -> &mut Self {
        self.columns
            .entry(object_type.to_string())
            .or_default()
            .insert(column.to_string());
        self
    }

    pub fn forbid(&mut self, object_type: &str, column: &str) -> &mut Self {
        if let Some(columns) = self.columns.get_mut(object_type) {
            columns.remove(column);
        }
        self
    }

    pub fn is_deferrable(&self, object_type: &str, column: &str) -> bool {
        self.columns
            .get(object_type)
            .is_some_and(|columns| columns.contains(column))
    }
}
