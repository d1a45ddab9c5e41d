use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::record::Record;

/// Why an object was put aside for the second pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferReason {
    /// A reference column points at an object not committed yet.
    UnresolvedReference {
        column: String,
        target_type: String,
        source_id: i64,
    },
    /// The parent row is in the package but has not been imported yet.
    ParentPending { parent_type: String, parent_id: i64 },
    /// An existing object matched by code name carries a different GUID.
    GuidMismatch { code_name: String },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::UnresolvedReference {
                column,
                target_type,
                source_id,
            } => write!(f, "{column} references {target_type} {source_id} which is not imported"),
            DeferReason::ParentPending {
                parent_type,
                parent_id,
            } => write!(f, "parent {parent_type} {parent_id} is not imported yet"),
            DeferReason::GuidMismatch { code_name } => write!(
                f,
                "an existing object named {code_name} has a different GUID"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostProcessEntry {
    pub object_type: String,
    pub record: Record,
    pub reason: DeferReason,
    /// Set for rows that travel inside a parent's dataset.
    pub nested: bool,
}

/// FIFO of deferred objects; every entry is retried once.
#[derive(Debug, Default)]
pub struct PostProcessList {
    entries: VecDeque<PostProcessEntry>,
}

impl PostProcessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: PostProcessEntry) {
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the queue, returning entries in the order they were deferred.
    pub fn drain(&mut self) -> Vec<PostProcessEntry> {
        self.entries.drain(..).collect()
    }
}

/// An object that still failed after its retry.
#[derive(Debug, Clone, Serialize)]
pub struct PostProcessFailure {
    pub object_type: String,
    pub source_id: Option<i64>,
    pub code_name: Option<String>,
    pub reason: String,
}

impl fmt::Display for PostProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code_name, self.source_id) {
            (Some(code_name), _) => write!(f, "{} {code_name}: {}", self.object_type, self.reason),
            (None, Some(id)) => write!(f, "{} #{id}: {}", self.object_type, self.reason),
            (None, None) => write!(f, "{}: {}", self.object_type, self.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> PostProcessEntry {
        let mut record = Record::new();
        record.set("Name", name);
        PostProcessEntry {
            object_type: "demo.a".into(),
            record,
            reason: DeferReason::GuidMismatch {
                code_name: name.into(),
            },
            nested: false,
        }
    }

    #[test]
    fn drain_preserves_queue_order() {
        let mut list = PostProcessList::new();
        list.push(entry("first"));
        list.push(entry("second"));
        let drained = list.drain();
        assert!(list.is_empty());
        let names: Vec<_> = drained
            .iter()
            .map(|e| e.record.get_str("Name").unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn reasons_render_readably() {
        let reason = DeferReason::UnresolvedReference {
            column: "ClassInheritsFromID".into(),
            target_type: "cms.class".into(),
            source_id: 7,
        };
        assert_eq!(
            reason.to_string(),
            "ClassInheritsFromID references cms.class 7 which is not imported"
        );
    }
}
