// Shared identifiers and value types used across the subscription engine.
//
// Mirrors the shape of a typical datastore's `common` module: plain newtype
// identifiers, a handful of size limits, and the tree-shaped value type
// moved between the datastore and providers/callbacks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// Size limits
// ============================================================================

/// Default bounded capacity for a single subscription group's pending event
/// records. Publishing to a full group fails with `NoSpace` rather than
/// evicting an older, still-pending record.
pub const DEFAULT_GROUP_QUEUE_CAPACITY: usize = 4096;

/// Default retention window for a module's NotificationLog.
pub const DEFAULT_NOTIFICATION_RETENTION_SECS: u64 = 24 * 60 * 60;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $name {
            pub fn next(counter: &AtomicU64) -> Self {
                $name(counter.fetch_add(1, Ordering::Relaxed))
            }
        }
    };
}

id_newtype!(GroupId);
id_newtype!(SubscriptionId);
id_newtype!(TransactionId);
id_newtype!(SessionId);

/// Event ids are monotonically increasing *per group*, so unlike the other
/// identifiers they are minted from a counter owned by the group's queue, not
/// a process-wide one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide counters for the identifiers minted centrally by the
/// registry (group/subscription) and change multiplexer (transaction).
#[derive(Debug, Default)]
pub struct IdCounters {
    pub groups: AtomicU64,
    pub subscriptions: AtomicU64,
    pub transactions: AtomicU64,
}

// ============================================================================
// Data tree value
// ============================================================================

/// A subtree of configuration/operational data. The schema context is an
/// external collaborator; internally the engine treats a subtree as an
/// opaque, structurally comparable JSON-shaped value and defers all typed
/// validation to `schema::SchemaContext`.
pub type DataTree = serde_json::Value;

// ============================================================================
// Change diff
// ============================================================================

/// Whether a change originated from a push write or from reading through a
/// pull operational-data provider. Only push-origin ops are ever proposed
/// through the change multiplexer's fan-out; a pull read against operational
/// data never produces a `ChangeOp` that reaches a change subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataOrigin {
    Push,
    Pull,
}

/// One edit against a schema node, as carried by a `ChangeTransaction`'s
/// proposed diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChangeOp {
    Create { path: String, value: DataTree, origin: DataOrigin },
    Modify { path: String, old_value: DataTree, new_value: DataTree, origin: DataOrigin },
    Delete { path: String, old_value: DataTree, origin: DataOrigin },
}

impl ChangeOp {
    pub fn path(&self) -> &str {
        match self {
            ChangeOp::Create { path, .. } => path,
            ChangeOp::Modify { path, .. } => path,
            ChangeOp::Delete { path, .. } => path,
        }
    }

    pub fn origin(&self) -> DataOrigin {
        match self {
            ChangeOp::Create { origin, .. } => *origin,
            ChangeOp::Modify { origin, .. } => *origin,
            ChangeOp::Delete { origin, .. } => *origin,
        }
    }
}

pub type ChangeDiff = Vec<ChangeOp>;

/// Converts a slash-separated, module-prefixed xpath (`/m:x/list[k='a']`)
/// into a JSON pointer (`/x/list[k='a']`) by dropping module prefixes and
/// keeping any instance predicate attached to its segment name. Shared by
/// `datastore` and `operational`, which both need to address a `DataTree` by
/// the same textual paths subscriptions filter on — dropping the predicate
/// here would collapse distinct list instances onto the same pointer.
pub fn xpath_to_pointer(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| segment.split(':').last().unwrap_or(segment))
        .map(|name| format!("/{name}"))
        .collect()
}
