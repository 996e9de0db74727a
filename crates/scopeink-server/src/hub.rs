//! Document maps shared by every connection.

use dashmap::DashMap;
use scopeink_core::docstore::{DocChange, DocPath, DocWrite};
use scopeink_core::error::{SyncError, SyncResult};
use scopeink_core::ids::{OpId, ProjectId};
use scopeink_core::recent::RecentSet;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;
/// `(op_id, path)` pairs remembered per project for deduplication.
const DEDUP_CAPACITY: usize = 16_384;

/// Documents of one project.
struct ProjectDocs {
    docs: BTreeMap<String, Value>,
    /// Recently applied `(op_id, path)` pairs. Replays of these are no-ops.
    applied: RecentSet<(OpId, String)>,
}

impl ProjectDocs {
    fn new(dedup_capacity: usize) -> Self {
        Self {
            docs: BTreeMap::new(),
            applied: RecentSet::new(dedup_capacity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Duplicate,
}

pub struct DocumentHub {
    projects: DashMap<ProjectId, ProjectDocs>,
    /// Every applied write, for all projects. Connections filter by prefix.
    tx: broadcast::Sender<DocChange>,
    dedup_capacity: usize,
}

impl DocumentHub {
    pub fn new() -> Self {
        Self::with_dedup_capacity(DEDUP_CAPACITY)
    }

    /// A hub that remembers at most `capacity` applied writes per project.
    pub fn with_dedup_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            projects: DashMap::new(),
            tx,
            dedup_capacity: capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.tx.subscribe()
    }

    /// Apply a write and broadcast it. Duplicates are not broadcast.
    pub fn apply(&self, write: DocWrite) -> SyncResult<WriteOutcome> {
        let path = DocPath::parse(&write.path)?;
        {
            let mut project = self
                .projects
                .entry(path.project)
                .or_insert_with(|| ProjectDocs::new(self.dedup_capacity));
            if let Some(op_id) = write.op_id {
                if !project.applied.insert((op_id, write.path.clone())) {
                    return Ok(WriteOutcome::Duplicate);
                }
            }
            match &write.value {
                Some(value) => {
                    project.docs.insert(write.path.clone(), value.clone());
                }
                None => {
                    project.docs.remove(&write.path);
                }
            }
        }
        // No receivers just means nobody is listening.
        let _ = self.tx.send(DocChange::from(write));
        Ok(WriteOutcome::Applied)
    }

    /// Current documents under `prefix`.
    pub fn snapshot(&self, prefix: &str) -> SyncResult<Vec<DocChange>> {
        let project = project_of(prefix)?;
        let Some(docs) = self.projects.get(&project) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .docs
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, value)| DocChange {
                path: path.clone(),
                value: Some(value.clone()),
                op_id: None,
            })
            .collect())
    }

    pub fn document_count(&self, project: &ProjectId) -> usize {
        self.projects.get(project).map_or(0, |p| p.docs.len())
    }
}

impl Default for DocumentHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Project named by a subscription prefix such as `projects/p/shapes/`.
fn project_of(prefix: &str) -> SyncResult<ProjectId> {
    let mut parts = prefix.split('/');
    match (parts.next(), parts.next()) {
        (Some("projects"), Some(project)) if !project.is_empty() => Ok(ProjectId::new(project)),
        _ => Err(SyncError::InvalidPath(prefix.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &str, value: Option<Value>, op_id: Option<OpId>) -> DocWrite {
        DocWrite {
            path: path.to_string(),
            value,
            op_id,
        }
    }

    #[test]
    fn test_duplicate_op_is_applied_once() {
        let hub = DocumentHub::new();
        let mut rx = hub.subscribe();
        let op = Some(OpId::new());
        let path = "projects/p/shapes/s1";

        assert_eq!(
            hub.apply(write(path, Some(json!({"x": 1})), op)).unwrap(),
            WriteOutcome::Applied
        );
        assert_eq!(
            hub.apply(write(path, Some(json!({"x": 1})), op)).unwrap(),
            WriteOutcome::Duplicate
        );

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dedup_memory_is_bounded() {
        let hub = DocumentHub::with_dedup_capacity(2);
        let first = Some(OpId::new());
        hub.apply(write("projects/p/shapes/s1", Some(json!(1)), first)).unwrap();
        for n in 0..5 {
            let path = format!("projects/p/shapes/t{}", n);
            hub.apply(write(&path, Some(json!(n)), Some(OpId::new()))).unwrap();
        }
        assert_eq!(hub.projects.get(&ProjectId::new("p")).unwrap().applied.len(), 2);

        // Recent ops are still caught.
        let recent = Some(OpId::new());
        hub.apply(write("projects/p/shapes/s2", Some(json!(2)), recent)).unwrap();
        assert_eq!(
            hub.apply(write("projects/p/shapes/s2", Some(json!(2)), recent)).unwrap(),
            WriteOutcome::Duplicate
        );
    }

    #[test]
    fn test_same_op_on_two_paths_applies_both() {
        let hub = DocumentHub::new();
        let op = Some(OpId::new());
        hub.apply(write("projects/p/layers/a", Some(json!(1)), op)).unwrap();
        hub.apply(write("projects/p/layers/b", Some(json!(2)), op)).unwrap();
        assert_eq!(hub.document_count(&ProjectId::new("p")), 2);
    }

    #[test]
    fn test_snapshot_filters_by_prefix() {
        let hub = DocumentHub::new();
        hub.apply(write("projects/p/shapes/s1", Some(json!(1)), None)).unwrap();
        hub.apply(write("projects/p/locks/s1", Some(json!(2)), None)).unwrap();
        hub.apply(write("projects/q/shapes/s2", Some(json!(3)), None)).unwrap();

        let snapshot = hub.snapshot("projects/p/shapes/").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].path, "projects/p/shapes/s1");
        assert!(hub.snapshot("projects/empty/shapes/").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_document() {
        let hub = DocumentHub::new();
        hub.apply(write("projects/p/shapes/s1", Some(json!(1)), None)).unwrap();
        hub.apply(write("projects/p/shapes/s1", None, Some(OpId::new()))).unwrap();
        assert!(hub.snapshot("projects/p/shapes/").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let hub = DocumentHub::new();
        assert!(hub.apply(write("nope/p/shapes/s1", Some(json!(1)), None)).is_err());
        assert!(hub.apply(write("projects/p/widgets/s1", Some(json!(1)), None)).is_err());
        assert!(hub.snapshot("elsewhere/").is_err());
    }
}
