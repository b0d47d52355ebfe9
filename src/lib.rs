// Subscription engine for a YANG-driven configuration and operational
// datastore: one module per concern, a `Result`/error re-export, and a
// small `Config`-like struct — here an `Engine` facade that owns and wires
// together the registry, the three dispatchers, and the notification
// broker.

pub mod change;
pub mod common;
pub mod config;
pub mod datastore;
pub mod error;
pub mod event_store;
pub mod notification;
pub mod operational;
pub mod registry;
pub mod rpc;
pub mod schema;
pub mod xpath;

pub use config::EngineConfig;
pub use error::{CallbackVerdict, EngineError, EngineResult};

use std::sync::Arc;

use crate::change::ChangeMultiplexer;
use crate::common::IdCounters;
use crate::datastore::Datastore;
use crate::event_store::EventRecordStore;
use crate::notification::NotificationBroker;
use crate::operational::OperationalComposer;
use crate::registry::Registry;
use crate::rpc::RpcDispatcher;
use crate::schema::SchemaContext;

/// Owns every dispatch component and wires them to one shared
/// `Registry`/`EventRecordStore`/`IdCounters`. A caller builds one `Engine`
/// per datastore instance and reaches each component through its accessor;
/// nothing here hides the components behind a facade method, since each one
/// has its own multi-argument call shape already (`propose`, `invoke`,
/// `publish`, `read`).
pub struct Engine {
    pub registry: Arc<Registry>,
    pub event_store: Arc<EventRecordStore>,
    pub change: ChangeMultiplexer,
    pub rpc: RpcDispatcher,
    pub notification: NotificationBroker,
    pub operational: OperationalComposer,
    counters: Arc<IdCounters>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig, datastore: Arc<dyn Datastore>, schema: Arc<dyn SchemaContext>) -> Self {
        let counters = Arc::new(IdCounters::default());
        let event_store = Arc::new(EventRecordStore::new());
        let registry = Arc::new(Registry::new(counters.clone(), event_store.clone(), config.clone()));
        let change = ChangeMultiplexer::new(registry.clone(), datastore, counters.clone(), config.default_phase_timeout);
        let rpc = RpcDispatcher::with_default_deadline(registry.clone(), config.default_event_deadline);
        let notification = NotificationBroker::new(registry.clone(), config.notification_log_dir.clone(), config.notification_retention);
        let operational = OperationalComposer::new(registry.clone(), schema);
        Self {
            registry,
            event_store,
            change,
            rpc,
            notification,
            operational,
            counters,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn counters(&self) -> &Arc<IdCounters> {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ChangeOp, DataOrigin, SessionId};
    use crate::datastore::InMemoryDatastore;
    use crate::registry::{CallbackKind, SubscriptionKind};
    use crate::schema::PermissiveSchemaContext;
    use serde_json::json;

    fn new_engine() -> Engine {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::default());
        let schema: Arc<dyn SchemaContext> = Arc::new(PermissiveSchemaContext);
        Engine::new(EngineConfig::default(), datastore, schema)
    }

    #[test]
    fn engine_wires_change_multiplexer_end_to_end() {
        let engine = new_engine();
        let group = engine.registry.create_group(None).id;
        engine
            .registry
            .subscribe(
                group,
                1,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(|_args| CallbackVerdict::Ok)),
            )
            .unwrap();
        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = engine.change.propose(group, SessionId(1), diff, None).unwrap();
        assert!(matches!(outcome, crate::change::ChangeOutcome::Committed));
    }

    #[test]
    fn engine_wires_operational_composer_end_to_end() {
        let engine = new_engine();
        let group = engine.registry.create_group(None).id;
        engine
            .registry
            .subscribe(
                group,
                1,
                "/m:c/leaf",
                SubscriptionKind::Operational,
                CallbackKind::Operational(Box::new(|_args| Ok(json!(7)))),
            )
            .unwrap();
        let result = engine.operational.read(group, SessionId(1), "/m:c", "m").unwrap();
        assert_eq!(result["leaf"], json!(7));
    }
}
