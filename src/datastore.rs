// Datastore access seam.
//
// `datastore::Datastore` is an out-of-scope collaborator: the real backing
// store, its module layout, and its own locking all live outside this crate.
// What the subscription engine needs from it is narrow: read a subtree, and
// run a closure under a single write lock that spans the update/change
// phases and ends with either commit or rollback. Modeling that as a closure
// rather than an explicit lock/unlock pair keeps the write-lock span
// exception-safe without unsafe code, following the RAII-guard idiom the
// datastore's own `transaction` modules use for their lock manager.

use parking_lot::RwLock;

use crate::common::{xpath_to_pointer, ChangeDiff, ChangeOp, DataTree};
use crate::error::{EngineError, EngineResult};

pub trait Datastore: Send + Sync {
    fn read_subtree(&self, path: &str) -> EngineResult<DataTree>;

    /// Runs `f` with exclusive write access to the datastore. The
    /// implementation is responsible for releasing the lock when `f`
    /// returns, regardless of outcome — callers (the change multiplexer)
    /// rely on this to run update/change callbacks and then commit or
    /// roll back without ever holding the lock across a panic boundary.
    fn with_write_lock(
        &self,
        f: &mut dyn FnMut(&dyn WriteLockedDatastore) -> EngineResult<()>,
    ) -> EngineResult<()>;
}

pub trait WriteLockedDatastore {
    fn read_subtree(&self, path: &str) -> EngineResult<DataTree>;

    /// Applies a proposed diff to the in-progress write transaction without
    /// making it visible to readers yet.
    fn apply(&self, diff: &ChangeDiff) -> EngineResult<()>;

    /// Makes the applied diff visible to readers and releases the write
    /// lock. Called once, after every subscriber's `change` phase succeeds.
    fn commit(&self) -> EngineResult<()>;

    /// Discards the applied diff. Called when any subscriber's `change`
    /// phase fails or the transaction times out.
    fn rollback(&self) -> EngineResult<()>;
}

/// A single in-memory JSON tree guarded by one `RwLock`, standing in for a
/// real datastore's module store. Good enough to drive the engine's own
/// tests end to end: readers take the shared lock, a write transaction
/// clones the tree on entry and swaps it back in on commit.
pub struct InMemoryDatastore {
    committed: RwLock<DataTree>,
}

impl InMemoryDatastore {
    pub fn new(initial: DataTree) -> Self {
        Self {
            committed: RwLock::new(initial),
        }
    }
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new(DataTree::Object(serde_json::Map::new()))
    }
}

impl Datastore for InMemoryDatastore {
    fn read_subtree(&self, path: &str) -> EngineResult<DataTree> {
        let tree = self.committed.read();
        let pointer = xpath_to_pointer(path);
        tree.pointer(&pointer)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(path.to_string()))
    }

    fn with_write_lock(
        &self,
        f: &mut dyn FnMut(&dyn WriteLockedDatastore) -> EngineResult<()>,
    ) -> EngineResult<()> {
        let mut guard = self.committed.write();
        let working = InMemoryWriteTxn {
            working: RwLock::new(guard.clone()),
        };
        let result = f(&working);
        if result.is_ok() {
            *guard = working.working.into_inner();
        }
        result
    }
}

struct InMemoryWriteTxn {
    working: RwLock<DataTree>,
}

impl WriteLockedDatastore for InMemoryWriteTxn {
    fn read_subtree(&self, path: &str) -> EngineResult<DataTree> {
        let tree = self.working.read();
        let pointer = xpath_to_pointer(path);
        tree.pointer(&pointer)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(path.to_string()))
    }

    fn apply(&self, diff: &ChangeDiff) -> EngineResult<()> {
        let mut tree = self.working.write();
        for op in diff {
            apply_op(&mut tree, op)?;
        }
        Ok(())
    }

    fn commit(&self) -> EngineResult<()> {
        Ok(())
    }

    fn rollback(&self) -> EngineResult<()> {
        Ok(())
    }
}

fn apply_op(tree: &mut DataTree, op: &ChangeOp) -> EngineResult<()> {
    match op {
        ChangeOp::Create { path, value, .. } | ChangeOp::Modify { path, new_value: value, .. } => {
            set_pointer(tree, &xpath_to_pointer(path), value.clone())
        }
        ChangeOp::Delete { path, .. } => {
            delete_pointer(tree, &xpath_to_pointer(path));
            Ok(())
        }
    }
}

fn set_pointer(tree: &mut DataTree, pointer: &str, value: DataTree) -> EngineResult<()> {
    let segments: Vec<&str> = pointer.split('/').filter(|s| !s.is_empty()).collect();
    let mut cursor = tree;
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !cursor.is_object() {
            *cursor = DataTree::Object(serde_json::Map::new());
        }
        cursor = cursor
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert_with(|| DataTree::Object(serde_json::Map::new()));
    }
    if let Some(last) = segments.last() {
        if !cursor.is_object() {
            *cursor = DataTree::Object(serde_json::Map::new());
        }
        cursor.as_object_mut().unwrap().insert(last.to_string(), value);
        Ok(())
    } else {
        *tree = value;
        Ok(())
    }
}

fn delete_pointer(tree: &mut DataTree, pointer: &str) {
    let segments: Vec<&str> = pointer.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return;
    }
    let mut cursor = tree;
    for segment in &segments[..segments.len() - 1] {
        match cursor.get_mut(segment) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(obj) = cursor.as_object_mut() {
        obj.remove(segments[segments.len() - 1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataOrigin;
    use serde_json::json;

    #[test]
    fn write_txn_commits_on_success() {
        let ds = InMemoryDatastore::default();
        ds.with_write_lock(&mut |txn| {
            txn.apply(&vec![ChangeOp::Create {
                path: "/m:x/v".to_string(),
                value: json!(42),
                origin: DataOrigin::Push,
            }])
        })
        .unwrap();
        assert_eq!(ds.read_subtree("/m:x/v").unwrap(), json!(42));
    }

    #[test]
    fn write_txn_discards_on_failure() {
        let ds = InMemoryDatastore::default();
        let result = ds.with_write_lock(&mut |txn| {
            txn.apply(&vec![ChangeOp::Create {
                path: "/m:x/v".to_string(),
                value: json!(1),
                origin: DataOrigin::Push,
            }])?;
            Err(EngineError::OperationFailed("subscriber aborted".to_string()))
        });
        assert!(result.is_err());
        assert!(ds.read_subtree("/m:x/v").is_err());
    }

    #[test]
    fn delete_removes_leaf() {
        let ds = InMemoryDatastore::default();
        ds.with_write_lock(&mut |txn| {
            txn.apply(&vec![ChangeOp::Create {
                path: "/m:x/v".to_string(),
                value: json!(1),
                origin: DataOrigin::Push,
            }])
        })
        .unwrap();
        ds.with_write_lock(&mut |txn| {
            txn.apply(&vec![ChangeOp::Delete {
                path: "/m:x/v".to_string(),
                old_value: json!(1),
                origin: DataOrigin::Push,
            }])
        })
        .unwrap();
        assert!(ds.read_subtree("/m:x/v").is_err());
    }
}
