// Subscription Registry & Pump.
//
// Holds every live subscription, grouped the way the datastore's own
// `streams/subscriber.rs` groups consumers into a `ConsumerGroup`: each
// `SubscriptionGroup` owns a bounded event queue (via `event_store`) and a
// `Pump` that either runs its own background worker (engine-managed) or is
// driven by the caller's own loop (`process_events`, caller-managed). The
// worker/shutdown-flag shape mirrors
// `EventSubscriber::spawn_commit_task`/`spawn_heartbeat_task`.
//
// This module intentionally knows nothing about `ChangeTransaction`,
// `Notification`, or the operational composer's types — every callback
// signature here is expressed in terms of the plain types in `common` and
// `xpath` so that `change`/`rpc`/`notification`/`operational` can each
// depend on `registry` without a cycle back. Those four components reach the
// same `EventRecordStore` the registry owns through `Registry::event_store`,
// so every callback they invoke is dispatched through the publish/claim/
// update cycle rather than called directly off the stored closure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::common::{ChangeDiff, DataTree, EventId, GroupId, IdCounters, SessionId, SubscriptionId, TransactionId};
use crate::config::EngineConfig;
use crate::error::{CallbackVerdict, EngineError, EngineResult};
use crate::event_store::{EventPhase, EventPipe, EventRecord, EventRecordStore};
use crate::xpath::CompiledXPath;

// ============================================================================
// Callback contract
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    /// Synthetic phase delivered once at subscribe time, presenting the
    /// current running datastore under a subscriber's path as a stream of
    /// creates.
    Enabled,
    Update,
    Change,
    Done,
    Abort,
}

pub struct ChangeCallbackArgs<'a> {
    pub transaction: TransactionId,
    pub phase: ChangePhase,
    pub diff: &'a ChangeDiff,
    pub session: SessionId,
}

impl<'a> ChangeCallbackArgs<'a> {
    /// Opens a restartable iterator over this phase's diff, optionally
    /// narrowed to nodes under `filter`. Callbacks are free to re-walk the
    /// diff more than once per phase via `ChangeIterator::restart`.
    pub fn iter_changes(&self, filter: Option<&'a CompiledXPath>) -> ChangeIterator<'a> {
        ChangeIterator::new(self.diff, filter)
    }
}

/// RPC/action callback arguments. `output` is the single shared buffer every
/// matching subscriber writes through; later subscribers see whatever the
/// previous one left there and may overwrite it wholesale or in part, and
/// the buffer left behind by the last (primary) invocation is authoritative.
/// `request_id` identifies this dispatch attempt in the event store and is
/// stable across shelve-retries of the same invocation.
pub struct RpcCallbackArgs<'a> {
    pub session: SessionId,
    pub request_id: EventId,
    pub xpath: &'a str,
    pub input: &'a DataTree,
    pub output: &'a mut DataTree,
    pub is_primary: bool,
}

/// Notification callback arguments.
pub struct NotificationCallbackArgs<'a> {
    pub session: SessionId,
    pub request_id: EventId,
    pub notif_type: &'a str,
    pub xpath: &'a str,
    pub data: &'a DataTree,
    pub timestamp_ms: i64,
}

/// Operational-provider callback arguments, returning a subtree under
/// `instance_xpath`.
pub struct OperationalCallbackArgs<'a> {
    pub session: SessionId,
    pub request_id: EventId,
    pub module: &'a str,
    /// The concrete, instance-addressed xpath this invocation covers (the
    /// specific parent instance context for a list-nested provider).
    pub instance_xpath: &'a str,
    /// The original read request's xpath, for providers that want to narrow
    /// their own response further than their subscribed path requires.
    pub request_xpath: &'a str,
}

pub enum CallbackKind {
    Change(Box<dyn Fn(ChangeCallbackArgs<'_>) -> CallbackVerdict + Send + Sync>),
    Rpc(Box<dyn Fn(RpcCallbackArgs<'_>) -> CallbackVerdict + Send + Sync>),
    Notification(Box<dyn Fn(NotificationCallbackArgs<'_>) + Send + Sync>),
    Operational(Box<dyn Fn(OperationalCallbackArgs<'_>) -> EngineResult<DataTree> + Send + Sync>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Change,
    Rpc,
    Notification,
    Operational,
}

/// Per-subscription flag set. All five are independent bits; a subscription
/// may set any combination that makes sense for its kind (the phase-request
/// flags and `done_only`/`passive` only have meaning for `Change`
/// subscriptions, but nothing stops e.g. an `Rpc` subscription from carrying
/// `no_thread`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionFlags {
    /// Change subscription also wants to see the `update` phase: update only
    /// fans out to subscribers that asked for it.
    pub update_phase_requested: bool,

    /// Change subscription wants a synthetic `enabled`+`done` transaction
    /// presenting the current running datastore as creates, delivered once
    /// at subscribe time.
    pub enabled_phase_requested: bool,

    /// Requests that its callback run inline on the thread driving the
    /// dispatch (pump worker or multiplexer/dispatcher caller) rather than
    /// being handed to a separate executor. Every callback in this crate is
    /// already invoked synchronously on the dispatching thread, so this flag
    /// is honored by construction; it is still carried on the subscription
    /// so callers can introspect it.
    pub no_thread: bool,

    /// Change subscription is excluded from the `update` and `change` fan-out
    /// entirely and is only invoked at `done`/`abort`, purely as a
    /// notification — its verdict is never consulted and can't fail or abort
    /// the transaction.
    pub done_only: bool,

    /// Change subscription that "only observes": invoked in every phase it
    /// is otherwise eligible for, but a `Fail`/`Shelve`-timeout verdict from
    /// it is logged and never counted against the transaction — it cannot
    /// trigger an abort and is not itself sent `abort`.
    pub passive: bool,
}

pub struct Subscription {
    pub id: SubscriptionId,
    pub group: GroupId,
    pub priority: i32,
    pub xpath: CompiledXPath,
    pub kind: SubscriptionKind,
    pub callback: CallbackKind,
    pub flags: SubscriptionFlags,
    /// Notification-only: set when a stop-time has elapsed or the
    /// subscriber otherwise asked to be torn down; excluded from dispatch
    /// like an unsubscribed subscription without requiring the registry
    /// write lock unsubscribe takes.
    pub retired: RwLock<bool>,
}

impl Subscription {
    pub fn is_retired(&self) -> bool {
        *self.retired.read()
    }

    pub fn retire(&self) {
        *self.retired.write() = true;
    }
}

// ============================================================================
// Group stats
// ============================================================================

/// Running counters for a subscription group, in the same spirit as
/// `TwoPhaseCommitStats`/`StreamMetrics`: cheap atomics a caller can sample
/// for observability without taking any lock.
#[derive(Debug, Default)]
pub struct GroupStats {
    pub events_published: AtomicU64,
    pub events_completed: AtomicU64,
    pub events_failed: AtomicU64,
    pub events_timed_out: AtomicU64,
    pub events_shelved: AtomicU64,
}

impl GroupStats {
    pub fn snapshot(&self) -> GroupStatsSnapshot {
        GroupStatsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_completed: self.events_completed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_timed_out: self.events_timed_out.load(Ordering::Relaxed),
            events_shelved: self.events_shelved.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStatsSnapshot {
    pub events_published: u64,
    pub events_completed: u64,
    pub events_failed: u64,
    pub events_timed_out: u64,
    pub events_shelved: u64,
}

pub struct SubscriptionGroup {
    pub id: GroupId,
    pub subscriptions: RwLock<Vec<Arc<Subscription>>>,
    pub pipe: Arc<EventPipe>,
    pub stats: GroupStats,
    /// Held for the duration of a single dispatch (one event's
    /// publish/claim/invoke/update cycle) by `Pump::dispatch`/`dispatch_once`
    /// and by `Registry::unsubscribe`. Spec §5's lock order names this group
    /// lock explicitly: it is what makes unsubscribe block until an in-flight
    /// callback on the group returns, rather than racing it.
    pub dispatch_lock: Arc<Mutex<()>>,
    pub pump: Arc<Pump>,
}

// ============================================================================
// Change iterator
// ============================================================================

/// Restartable, optionally XPath-filtered walk over a proposed diff.
pub struct ChangeIterator<'a> {
    diff: &'a ChangeDiff,
    filter: Option<&'a CompiledXPath>,
    pos: usize,
}

impl<'a> ChangeIterator<'a> {
    pub fn new(diff: &'a ChangeDiff, filter: Option<&'a CompiledXPath>) -> Self {
        Self { diff, filter, pos: 0 }
    }

    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl<'a> Iterator for ChangeIterator<'a> {
    type Item = &'a crate::common::ChangeOp;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.diff.len() {
            let op = &self.diff[self.pos];
            self.pos += 1;
            let matches = self
                .filter
                .map(|f| f.matches_changed_path(op.path()))
                .unwrap_or(true);
            if matches {
                return Some(op);
            }
        }
        None
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry {
    groups: DashMap<GroupId, Arc<SubscriptionGroup>>,
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,
    counters: Arc<IdCounters>,
    event_store: Arc<EventRecordStore>,
    config: EngineConfig,
}

impl Registry {
    pub fn new(counters: Arc<IdCounters>, event_store: Arc<EventRecordStore>, config: EngineConfig) -> Self {
        Self {
            groups: DashMap::new(),
            subscriptions: DashMap::new(),
            counters,
            event_store,
            config,
        }
    }

    /// The shared event store backing every group's queue. Dispatch
    /// components (`change`, `rpc`, `notification`, `operational`) reach it
    /// through here rather than owning their own handle, so the registry
    /// stays the single source of truth for which store a group's records
    /// live in.
    pub fn event_store(&self) -> &Arc<EventRecordStore> {
        &self.event_store
    }

    pub fn create_group(&self, queue_capacity: Option<usize>) -> Arc<SubscriptionGroup> {
        let id = GroupId::next(&self.counters.groups);
        let capacity = queue_capacity.unwrap_or(self.config.group_queue_capacity);
        let pipe = self.event_store.register_group(id, capacity);
        let dispatch_lock = Arc::new(Mutex::new(()));
        let pump = Arc::new(Pump::new(id, pipe.clone(), self.event_store.clone(), dispatch_lock.clone()));
        let group = Arc::new(SubscriptionGroup {
            id,
            subscriptions: RwLock::new(Vec::new()),
            pipe,
            stats: GroupStats::default(),
            dispatch_lock,
            pump,
        });
        self.groups.insert(id, group.clone());
        group
    }

    pub fn group(&self, id: GroupId) -> EngineResult<Arc<SubscriptionGroup>> {
        self.groups.get(&id).map(|g| g.clone()).ok_or(EngineError::UnknownGroup(id))
    }

    /// The `Pump` driving dispatch for `group`. Every one of `change`,
    /// `rpc`, `notification`, and `operational` reaches its group's queue
    /// through this rather than going around it to `event_store()` directly,
    /// so a claimed/invoked event always passes through the same
    /// lock-held `claim_pending`/update cycle `process_events` uses.
    pub fn pump(&self, group: GroupId) -> EngineResult<Arc<Pump>> {
        Ok(self.group(group)?.pump.clone())
    }

    pub fn subscribe(
        &self,
        group: GroupId,
        priority: i32,
        xpath: &str,
        kind: SubscriptionKind,
        callback: CallbackKind,
    ) -> EngineResult<SubscriptionId> {
        self.subscribe_with_flags(group, priority, xpath, kind, callback, SubscriptionFlags::default())
    }

    pub fn subscribe_with_flags(
        &self,
        group: GroupId,
        priority: i32,
        xpath: &str,
        kind: SubscriptionKind,
        callback: CallbackKind,
        flags: SubscriptionFlags,
    ) -> EngineResult<SubscriptionId> {
        let group_handle = self.group(group)?;
        let id = SubscriptionId::next(&self.counters.subscriptions);
        let subscription = Arc::new(Subscription {
            id,
            group,
            priority,
            xpath: CompiledXPath::compile(xpath),
            kind,
            callback,
            flags,
            retired: RwLock::new(false),
        });
        group_handle.subscriptions.write().push(subscription.clone());
        self.subscriptions.insert(id, subscription);
        tracing::debug!(subscription = %id, group = %group, ?kind, "subscription registered");
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> EngineResult<()> {
        let (_, subscription) = self
            .subscriptions
            .remove(&id)
            .ok_or(EngineError::UnknownSubscription(id))?;
        // Unsubscribing while a callback on this subscription is executing
        // must block until that callback returns. `dispatch_lock` is held by
        // `Pump::dispatch`/`dispatch_once` for the whole publish/claim/
        // invoke/update cycle of a single event, so acquiring it here blocks
        // until any in-flight callback for this group has settled before the
        // subscription list is mutated.
        if let Some(group) = self.groups.get(&subscription.group) {
            let _dispatch_guard = group.dispatch_lock.lock();
            group.subscriptions.write().retain(|s| s.id != id);
        }
        tracing::debug!(subscription = %id, "subscription removed");
        Ok(())
    }

    pub fn subscription(&self, id: SubscriptionId) -> EngineResult<Arc<Subscription>> {
        self.subscriptions.get(&id).map(|s| s.clone()).ok_or(EngineError::UnknownSubscription(id))
    }

    fn subscriptions_of_kind(&self, group: GroupId, kind: SubscriptionKind) -> EngineResult<Vec<Arc<Subscription>>> {
        let group_handle = self.group(group)?;
        Ok(group_handle
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.kind == kind && !s.is_retired())
            .cloned()
            .collect())
    }

    /// Priority-descending order with an ascending-id tiebreak. Used by the
    /// change multiplexer's update/change phase fan-out, where the highest
    /// priority subscriber runs first, and by notification fan-out.
    pub fn subscriptions_desc(&self, group: GroupId, kind: SubscriptionKind) -> EngineResult<Vec<Arc<Subscription>>> {
        let mut subs = self.subscriptions_of_kind(group, kind)?;
        subs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(subs)
    }

}

// ============================================================================
// Pump
// ============================================================================

/// Drives event delivery for a single group. `start` gives the engine its
/// own worker thread (a tokio task blocking on the group's pipe);
/// `process_events` lets a caller drive the same queue from its own loop
/// without ever spawning a task. A group uses exactly one of the two for its
/// lifetime — mixing them would let two readers race over the same pending
/// queue.
pub struct Pump {
    group: GroupId,
    pipe: Arc<EventPipe>,
    event_store: Arc<EventRecordStore>,
    dispatch_lock: Arc<Mutex<()>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl Pump {
    pub fn new(group: GroupId, pipe: Arc<EventPipe>, event_store: Arc<EventRecordStore>, dispatch_lock: Arc<Mutex<()>>) -> Self {
        Self {
            group,
            pipe,
            event_store,
            dispatch_lock,
            handle: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publishes one event for `subscription` and drives it through the
    /// claim/invoke/update cycle, holding this group's dispatch lock for the
    /// duration so a concurrent `Registry::unsubscribe` on this group blocks
    /// until the callback settles. This is the entry point `change`, `rpc`,
    /// `notification`, and `operational` call instead of reaching into
    /// `EventRecordStore` directly.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<F>(
        &self,
        subscription: SubscriptionId,
        session: SessionId,
        phase: EventPhase,
        payload: DataTree,
        deadline: Instant,
        invoke: F,
    ) -> EngineResult<CallbackVerdict>
    where
        F: FnMut(EventId) -> CallbackVerdict,
    {
        let _guard = self.dispatch_lock.lock();
        self.event_store.dispatch(self.group, subscription, session, phase, payload, deadline, invoke)
    }

    /// Single-claim, best-effort variant of `dispatch` — see
    /// `EventRecordStore::dispatch_once`.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_once<F>(
        &self,
        subscription: SubscriptionId,
        session: SessionId,
        phase: EventPhase,
        payload: DataTree,
        deadline: Instant,
        invoke: F,
    ) -> EngineResult<CallbackVerdict>
    where
        F: FnOnce(EventId) -> CallbackVerdict,
    {
        let _guard = self.dispatch_lock.lock();
        self.event_store.dispatch_once(self.group, subscription, session, phase, payload, deadline, invoke)
    }

    /// Engine-managed event loop: spawns a background task that blocks on
    /// the group's pipe and invokes `dispatch` for each claimed record until
    /// `stop` is called.
    pub fn start<F>(&self, dispatch: F)
    where
        F: Fn(EventRecord) + Send + Sync + 'static,
    {
        let group = self.group;
        let pipe = self.pipe.clone();
        let event_store = self.event_store.clone();
        let dispatch_lock = self.dispatch_lock.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            while !shutdown.load(Ordering::SeqCst) {
                pipe.wait_ready().await;
                let _guard = dispatch_lock.lock();
                while let Ok(Some(record)) = event_store.claim_pending(group) {
                    dispatch(record);
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Caller-managed event loop: synchronously drains whatever is
    /// currently pending, invoking `dispatch` for each record. Returns the
    /// number of records processed and the earliest deadline still pending
    /// afterward, so a caller's poll loop knows how long it can safely sleep
    /// before the next record might time out.
    pub fn process_events<F>(&self, mut dispatch: F) -> EngineResult<(usize, Option<Instant>)>
    where
        F: FnMut(EventRecord),
    {
        let _guard = self.dispatch_lock.lock();
        let mut count = 0;
        while let Some(record) = self.event_store.claim_pending(self.group)? {
            dispatch(record);
            count += 1;
        }
        let next_deadline = self.event_store.next_deadline(self.group)?;
        Ok((count, next_deadline))
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop();
    }
}
