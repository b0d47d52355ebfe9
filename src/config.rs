// Engine configuration.
//
// A plain typed struct with a `Default` impl, in the same shape as the
// datastore's own top-level `Config`/`DatabaseConfig` types: no external
// config-file crate, just fields a caller can override before constructing
// the engine.

use std::time::Duration;

use crate::common::{DEFAULT_GROUP_QUEUE_CAPACITY, DEFAULT_NOTIFICATION_RETENTION_SECS};

/// Not (de)serialized: this crate has no external config-file layer, a
/// caller builds one in code and overrides fields from `Default::default()`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied to an event record when the caller does not supply
    /// one explicitly.
    pub default_event_deadline: Duration,

    /// Bounded capacity of pending event records per subscription group.
    pub group_queue_capacity: usize,

    /// Timeout for the two-phase-commit `update`/`change` phases when a
    /// transaction carries no explicit deadline.
    pub default_phase_timeout: Duration,

    /// Retention window for a module's NotificationLog.
    pub notification_retention: Duration,

    /// Directory under which NotificationLog files are persisted.
    pub notification_log_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_event_deadline: Duration::from_secs(5),
            group_queue_capacity: DEFAULT_GROUP_QUEUE_CAPACITY,
            default_phase_timeout: Duration::from_secs(5),
            notification_retention: Duration::from_secs(DEFAULT_NOTIFICATION_RETENTION_SECS),
            notification_log_dir: "./notif-log".to_string(),
        }
    }
}
