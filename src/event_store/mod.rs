// Event Record Store.
//
// A bounded, shared store of pending/claimed/terminal event records, keyed
// by (group, event id), with a readable "pipe" handle a pump can block on.
// Grounded on the datastore's `streams/subscriber.rs` consumer machinery
// (`ConsumedEvent`, offset-commit bookkeeping, the `AtomicBool` shutdown
// flag + `tokio::spawn` background task pattern) and on `common::bounded_map`
// for the idea of a capacity-bounded map — but not its LRU eviction
// semantics. A full group rejects new events with `no-space` rather than
// silently evicting an older one, so this store never evicts; `reap_terminal`
// is the only way space is freed, and it only removes records that have
// already reached a terminal state.
//
// `dispatch`/`dispatch_once` are the one way every other component in this
// crate is meant to invoke a subscription's callback: they publish an event,
// claim it back off the same queue, invoke the caller-supplied closure, and
// write the resulting verdict back onto the record before resolving. This
// keeps every callback invocation routed through the publish/claim/update
// state machine instead of calling a subscription's stored closure directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::common::{DataTree, EventId, GroupId, SessionId, SubscriptionId};
use crate::error::{CallbackVerdict, EngineError, EngineResult};

/// The phase taxonomy spec.md §3 assigns to an `EventRecord`: which kind of
/// dispatch produced this event and, for change events, which step of the
/// two-phase sequence it belongs to. Tells an external consumer draining a
/// group's pipe which callback shape (`change` / `rpc` / `notification` /
/// `operational`) to invoke for a claimed record without having to consult
/// anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Update,
    Change,
    Done,
    Abort,
    Enabled,
    Rpc,
    NotifRealtime,
    NotifReplay,
    NotifReplayComplete,
    NotifStop,
    OperRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Pending,
    Claimed,
    Done,
    Failed,
    TimedOut,
}

impl EventState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventState::Done | EventState::Failed | EventState::TimedOut)
    }
}

/// The outcome a dispatched callback left on its event record, once settled.
#[derive(Debug, Clone)]
pub enum EventVerdict {
    Ok(DataTree),
    Fail(EngineError),
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub group: GroupId,
    pub id: EventId,
    pub subscription: SubscriptionId,
    /// The session that originated this dispatch, for attributing errors and
    /// for callbacks (e.g. `notif-replay`) that need to know who is asking.
    pub session: SessionId,
    pub phase: EventPhase,
    pub payload: DataTree,
    pub deadline: Instant,
    pub state: EventState,
    pub verdict: Option<EventVerdict>,
}

/// Level-triggered readiness handle for a group's pending events. A pump
/// blocks on `wait_ready`; `is_ready` backs the caller-managed polling model
/// where the caller checks readiness itself instead of awaiting.
pub struct EventPipe {
    pending: AtomicUsize,
    notify: Notify,
}

impl EventPipe {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn mark_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn mark_drained(&self) {
        self.pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(1))
        })
        .ok();
    }

    pub fn is_ready(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub async fn wait_ready(&self) {
        while !self.is_ready() {
            self.notify.notified().await;
        }
    }
}

struct GroupQueue {
    capacity: usize,
    counter: AtomicUsize,
    records: DashMap<EventId, EventRecord>,
    order: Mutex<VecDeque<EventId>>,
    pipe: Arc<EventPipe>,
}

impl GroupQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            counter: AtomicUsize::new(0),
            records: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            pipe: Arc::new(EventPipe::new()),
        }
    }

    fn pending_count(&self) -> usize {
        self.order.lock().len()
    }
}

/// Shared store of event records across all subscription groups.
#[derive(Default)]
pub struct EventRecordStore {
    groups: DashMap<GroupId, Arc<GroupQueue>>,
}

impl EventRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a group with the given bounded capacity, returning the
    /// handle a pump should watch for readiness. Idempotent: re-registering
    /// an existing group returns its existing pipe unchanged.
    pub fn register_group(&self, group: GroupId, capacity: usize) -> Arc<EventPipe> {
        self.groups
            .entry(group)
            .or_insert_with(|| Arc::new(GroupQueue::new(capacity)))
            .pipe
            .clone()
    }

    pub fn unregister_group(&self, group: GroupId) {
        self.groups.remove(&group);
    }

    fn queue(&self, group: GroupId) -> EngineResult<Arc<GroupQueue>> {
        self.groups
            .get(&group)
            .map(|q| q.clone())
            .ok_or(EngineError::UnknownGroup(group))
    }

    /// Publishes a new event to a group's pending queue. Fails with
    /// `NoSpace` once the group's pending-record count reaches its bounded
    /// capacity.
    pub fn publish(
        &self,
        group: GroupId,
        subscription: SubscriptionId,
        session: SessionId,
        phase: EventPhase,
        payload: DataTree,
        deadline: Instant,
    ) -> EngineResult<EventId> {
        let queue = self.queue(group)?;
        if queue.pending_count() >= queue.capacity {
            return Err(EngineError::NoSpace { group });
        }
        let id = EventId(queue.counter.fetch_add(1, Ordering::SeqCst) as u64);
        queue.records.insert(
            id,
            EventRecord {
                group,
                id,
                subscription,
                session,
                phase,
                payload,
                deadline,
                state: EventState::Pending,
                verdict: None,
            },
        );
        queue.order.lock().push_back(id);
        queue.pipe.mark_pending();
        Ok(id)
    }

    /// Claims the oldest still-pending event for a group whose deadline has
    /// not yet passed, marking it `Claimed`. A record popped past its
    /// deadline is transitioned straight to `TimedOut` and skipped rather
    /// than handed back as if it were still eligible for dispatch. Returns
    /// `None` once nothing eligible remains pending.
    pub fn claim_pending(&self, group: GroupId) -> EngineResult<Option<EventRecord>> {
        let queue = self.queue(group)?;
        loop {
            let id = {
                let mut order = queue.order.lock();
                match order.pop_front() {
                    Some(id) => id,
                    None => return Ok(None),
                }
            };
            queue.pipe.mark_drained();
            let mut entry = queue
                .records
                .get_mut(&id)
                .ok_or(EngineError::UnknownEvent { group, event: id })?;
            if entry.deadline <= Instant::now() {
                entry.state = EventState::TimedOut;
                continue;
            }
            entry.state = EventState::Claimed;
            return Ok(Some(entry.clone()));
        }
    }

    /// Updates a claimed event's state and, for a settled dispatch, the
    /// verdict it resolved with. Re-queuing to `Pending` (the shelve path)
    /// preserves the record's original deadline and appends it to the back
    /// of the pending order.
    pub fn update(&self, group: GroupId, id: EventId, state: EventState, verdict: Option<EventVerdict>) -> EngineResult<()> {
        let queue = self.queue(group)?;
        {
            let mut entry = queue
                .records
                .get_mut(&id)
                .ok_or(EngineError::UnknownEvent { group, event: id })?;
            entry.state = state;
            if verdict.is_some() {
                entry.verdict = verdict;
            }
        }
        if state == EventState::Pending {
            queue.order.lock().push_back(id);
            queue.pipe.mark_pending();
        }
        Ok(())
    }

    /// Reads back a single record by id, regardless of its current state.
    pub fn record(&self, group: GroupId, id: EventId) -> EngineResult<EventRecord> {
        let queue = self.queue(group)?;
        queue
            .records
            .get(&id)
            .map(|e| e.clone())
            .ok_or(EngineError::UnknownEvent { group, event: id })
    }

    /// The earliest deadline among this group's non-terminal records, if
    /// any — what a caller-managed consumer should sleep until before
    /// polling again.
    pub fn next_deadline(&self, group: GroupId) -> EngineResult<Option<Instant>> {
        let queue = self.queue(group)?;
        Ok(queue.records.iter().filter(|e| !e.state.is_terminal()).map(|e| e.deadline).min())
    }

    /// Removes every record in a terminal state, returning their ids. This
    /// is the only way capacity is reclaimed.
    pub fn reap_terminal(&self, group: GroupId) -> EngineResult<Vec<EventId>> {
        let queue = self.queue(group)?;
        let mut reaped = Vec::new();
        queue.records.retain(|id, record| {
            if record.state.is_terminal() {
                reaped.push(*id);
                false
            } else {
                true
            }
        });
        Ok(reaped)
    }

    /// Transitions any `Pending`/`Claimed` record past its deadline to
    /// `TimedOut`, removing it from the pending order if still queued.
    pub fn reap_expired(&self, group: GroupId, now: Instant) -> EngineResult<Vec<EventId>> {
        let queue = self.queue(group)?;
        let mut expired = Vec::new();
        for mut entry in queue.records.iter_mut() {
            if !entry.state.is_terminal() && entry.deadline <= now {
                entry.state = EventState::TimedOut;
                expired.push(*entry.key());
            }
        }
        if !expired.is_empty() {
            let mut order = queue.order.lock();
            order.retain(|id| !expired.contains(id));
        }
        Ok(expired)
    }

    /// Publishes one event for `subscription` and drives it through the
    /// claim/invoke/update cycle until `invoke` settles on `Ok`/`Fail`, or
    /// the record's deadline passes while it keeps shelving. `invoke` is
    /// given the freshly minted event id (usable by the caller as a
    /// `request-id`) and must return the callback's verdict for this
    /// attempt; a `Shelve` re-queues the same record and calls `invoke`
    /// again on the next claim.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<F>(
        &self,
        group: GroupId,
        subscription: SubscriptionId,
        session: SessionId,
        phase: EventPhase,
        payload: DataTree,
        deadline: Instant,
        mut invoke: F,
    ) -> EngineResult<CallbackVerdict>
    where
        F: FnMut(EventId) -> CallbackVerdict,
    {
        let id = self.publish(group, subscription, session, phase, payload, deadline)?;
        loop {
            match self.claim_pending(group)? {
                Some(record) if record.id == id => {
                    let verdict = invoke(id);
                    match verdict {
                        CallbackVerdict::Ok => {
                            self.update(group, id, EventState::Done, Some(EventVerdict::Ok(DataTree::Null)))?;
                            return Ok(CallbackVerdict::Ok);
                        }
                        CallbackVerdict::Fail(e) => {
                            self.update(group, id, EventState::Failed, Some(EventVerdict::Fail(e.clone())))?;
                            return Ok(CallbackVerdict::Fail(e));
                        }
                        CallbackVerdict::Shelve => {
                            self.update(group, id, EventState::Pending, None)?;
                            continue;
                        }
                    }
                }
                // Some other record was at the front of this group's queue;
                // that record's own dispatcher is responsible for it, so put
                // it back and keep looking for ours.
                Some(other) => {
                    self.update(other.group, other.id, EventState::Pending, None)?;
                    continue;
                }
                None => {
                    let record = self.record(group, id)?;
                    return match record.state {
                        EventState::TimedOut => Err(EngineError::Timeout(format!("event {id} timed out"))),
                        _ => Err(EngineError::Internal(format!("event {id} left the queue without settling"))),
                    };
                }
            }
        }
    }

    /// Single-claim, best-effort variant of `dispatch`: no shelve retry. A
    /// `Shelve` verdict is accepted as-is (the caller decides how to treat
    /// it) and the record is still marked `Done` so it does not linger
    /// pending. Used for best-effort phases (`done`/`abort`) and for
    /// notification/operational invocations that do not retry on shelve.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_once<F>(
        &self,
        group: GroupId,
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
        let id = self.publish(group, subscription, session, phase, payload, deadline)?;
        match self.claim_pending(group)? {
            Some(record) if record.id == id => {
                let verdict = invoke(id);
                match &verdict {
                    CallbackVerdict::Ok | CallbackVerdict::Shelve => {
                        self.update(group, id, EventState::Done, Some(EventVerdict::Ok(DataTree::Null)))?;
                    }
                    CallbackVerdict::Fail(e) => {
                        self.update(group, id, EventState::Failed, Some(EventVerdict::Fail(e.clone())))?;
                    }
                }
                Ok(verdict)
            }
            Some(other) => {
                self.update(other.group, other.id, EventState::Pending, None)?;
                Ok(CallbackVerdict::Fail(EngineError::Internal(format!("event {id} was not at the head of its own queue"))))
            }
            None => {
                let record = self.record(group, id)?;
                match record.state {
                    EventState::TimedOut => Ok(CallbackVerdict::Fail(EngineError::Timeout(format!("event {id} timed out")))),
                    _ => Ok(CallbackVerdict::Ok),
                }
            }
        }
    }
}
