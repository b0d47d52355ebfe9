// Change Multiplexer.
//
// Runs the update -> change -> done/abort two-phase-commit sequence over a
// proposed diff, fanning out to every `Change` subscriber of a group in
// priority-descending order (ties by ascending subscription id). Grounded on
// `transaction/two_phase_commit.rs`'s `TwoPhaseCommitCoordinator` (the
// prepare/commit/abort phase split and its stats) and `transaction/timeout.rs`'s
// `TimeoutManager` for the phase deadline. Unlike the coordinator's
// runtime deadlock detector, this engine avoids the problem by construction:
// the `change` phase callbacks run while the datastore's single write lock
// is held for the whole phase (via `Datastore::with_write_lock`), so there
// is only ever one writer and nothing to deadlock against.
//
// Every phase invocation is routed through the group's `EventRecordStore`
// rather than calling a subscriber's stored closure directly: `propose`
// publishes one event per subscriber per phase and claims it straight back,
// so the callback still runs synchronously on this thread, but the
// publish/claim/update bookkeeping the store provides (deadlines, shelve
// re-queueing, a durable verdict) is always exercised on the real dispatch
// path rather than bypassed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{ChangeDiff, DataOrigin, GroupId, IdCounters, SessionId, TransactionId};
use crate::datastore::Datastore;
use crate::error::{CallbackVerdict, EngineError, EngineResult};
use crate::event_store::EventPhase;
use crate::registry::{CallbackKind, ChangeCallbackArgs, ChangePhase, Pump, Registry, Subscription, SubscriptionKind};

/// Maps the change multiplexer's own phase enum (the one callbacks see) onto
/// the event record's phase tag, which a consumer draining a group's pipe
/// needs in order to tell change events apart from rpc/notification/
/// operational ones without any other context.
fn event_phase(phase: ChangePhase) -> EventPhase {
    match phase {
        ChangePhase::Enabled => EventPhase::Enabled,
        ChangePhase::Update => EventPhase::Update,
        ChangePhase::Change => EventPhase::Change,
        ChangePhase::Done => EventPhase::Done,
        ChangePhase::Abort => EventPhase::Abort,
    }
}

pub struct ChangeTransaction {
    pub id: TransactionId,
    pub session: SessionId,
    pub diff: ChangeDiff,
}

#[derive(Debug)]
pub enum ChangeOutcome {
    Committed,
    Aborted { reason: EngineError },
}

pub struct ChangeMultiplexer {
    registry: Arc<Registry>,
    datastore: Arc<dyn Datastore>,
    counters: Arc<IdCounters>,
    default_phase_timeout: Duration,
}

/// Result of driving one subscriber through one phase, once shelving has
/// been resolved one way or the other: shelve re-queues with the same
/// deadline until the deadline elapses, at which point it is a `timed-out`
/// failure.
enum PhaseResult {
    Ok,
    Fail(EngineError),
}

/// Publishes one event for `sub`'s phase invocation and drives it through
/// the event store's claim/invoke/update cycle until the callback settles
/// on `Ok`/`Fail` or its deadline elapses while shelving.
fn invoke_with_shelve(
    pump: &Pump,
    sub: &Subscription,
    txn: TransactionId,
    session: SessionId,
    diff: &ChangeDiff,
    phase: ChangePhase,
    deadline: Instant,
) -> PhaseResult {
    let CallbackKind::Change(cb) = &sub.callback else {
        return PhaseResult::Ok;
    };
    let payload = serde_json::to_value(diff).unwrap_or(crate::common::DataTree::Null);
    let result = pump.dispatch(sub.id, session, event_phase(phase), payload, deadline, |_event_id| {
        cb(ChangeCallbackArgs { transaction: txn, phase, diff, session })
    });
    match result {
        Ok(CallbackVerdict::Ok) => PhaseResult::Ok,
        Ok(CallbackVerdict::Fail(e)) => PhaseResult::Fail(e),
        Ok(CallbackVerdict::Shelve) => {
            PhaseResult::Fail(EngineError::Internal("dispatch resolved with an unexpected shelve verdict".to_string()))
        }
        Err(e) => {
            tracing::warn!(subscription = %sub.id, transaction = %txn, ?phase, error = %e, "phase dispatch did not settle");
            PhaseResult::Fail(e)
        }
    }
}

/// Best-effort invocation for `done`/`abort`: no shelve retry, and `abort`
/// itself must never fail the transaction further, since the transaction
/// has already settled.
fn invoke_best_effort(pump: &Pump, sub: &Subscription, txn: TransactionId, session: SessionId, diff: &ChangeDiff, phase: ChangePhase) {
    let CallbackKind::Change(cb) = &sub.callback else {
        return;
    };
    let payload = serde_json::to_value(diff).unwrap_or(crate::common::DataTree::Null);
    let result = pump.dispatch_once(sub.id, session, event_phase(phase), payload, Instant::now() + Duration::from_secs(5), |_event_id| {
        cb(ChangeCallbackArgs { transaction: txn, phase, diff, session })
    });
    match result {
        Ok(CallbackVerdict::Fail(e)) => {
            tracing::warn!(subscription = %sub.id, transaction = %txn, ?phase, error = %e, "best-effort phase callback failed");
        }
        Ok(CallbackVerdict::Shelve) => {
            tracing::warn!(subscription = %sub.id, transaction = %txn, ?phase, "shelve ignored on best-effort phase");
        }
        Ok(CallbackVerdict::Ok) => {}
        Err(e) => {
            tracing::warn!(subscription = %sub.id, transaction = %txn, ?phase, error = %e, "best-effort phase dispatch failed");
        }
    }
}

impl ChangeMultiplexer {
    pub fn new(registry: Arc<Registry>, datastore: Arc<dyn Datastore>, counters: Arc<IdCounters>, default_phase_timeout: Duration) -> Self {
        Self { registry, datastore, counters, default_phase_timeout }
    }

    /// Proposes `diff` against `group`'s subscribers. `phase_timeout`
    /// overrides the engine default for this transaction only.
    pub fn propose(
        &self,
        group: GroupId,
        session: SessionId,
        diff: ChangeDiff,
        phase_timeout: Option<Duration>,
    ) -> EngineResult<ChangeOutcome> {
        let txn_id = TransactionId::next(&self.counters.transactions);
        let pump = self.registry.pump(group)?;
        let subscribers = self.registry.subscriptions_desc(group, SubscriptionKind::Change)?;
        let matching: Vec<Arc<Subscription>> = subscribers
            .into_iter()
            .filter(|s| {
                diff.iter()
                    .any(|op| op.origin() == DataOrigin::Push && s.xpath.matches_changed_path(op.path()))
            })
            .collect();
        let deadline = Instant::now() + phase_timeout.unwrap_or(self.default_phase_timeout);
        tracing::debug!(transaction = %txn_id, subscribers = matching.len(), "starting two-phase commit");

        // Phase 1: update. Only subscribers that requested it, and never
        // subscribers marked done_only (they see only done/abort) — update-
        // phase failures abort immediately, since no subscriber has observed
        // a commit yet and so no `abort` is sent for this phase.
        let mut update_seen: Vec<Arc<Subscription>> = Vec::new();
        for sub in matching.iter().filter(|s| s.flags.update_phase_requested && !s.flags.done_only) {
            match invoke_with_shelve(&pump, sub, txn_id, session, &diff, ChangePhase::Update, deadline) {
                PhaseResult::Ok => update_seen.push(sub.clone()),
                PhaseResult::Fail(e) => {
                    if sub.flags.passive {
                        tracing::warn!(subscription = %sub.id, transaction = %txn_id, error = %e, "passive subscriber failed update phase, ignoring");
                        continue;
                    }
                    tracing::warn!(transaction = %txn_id, error = %e, "update phase failed before any commit was observed");
                    return Ok(ChangeOutcome::Aborted { reason: e });
                }
            }
        }
        drop(update_seen);

        // Phase 2: change, under the datastore's single write lock spanning
        // change through done/abort.
        let change_participants: Vec<Arc<Subscription>> =
            matching.iter().filter(|s| !s.flags.done_only).cloned().collect();
        let mut change_succeeded: Vec<Arc<Subscription>> = Vec::new();
        let diff_ref = &diff;
        let change_result = self.datastore.with_write_lock(&mut |txn| {
            txn.apply(diff_ref)?;
            for sub in change_participants.iter() {
                match invoke_with_shelve(&pump, sub, txn_id, session, diff_ref, ChangePhase::Change, deadline) {
                    PhaseResult::Ok => change_succeeded.push(sub.clone()),
                    PhaseResult::Fail(e) => {
                        if sub.flags.passive {
                            tracing::warn!(subscription = %sub.id, transaction = %txn_id, error = %e, "passive subscriber failed change phase, ignoring");
                            continue;
                        }
                        return Err(e);
                    }
                }
            }
            Ok(())
        });

        match change_result {
            Ok(()) => {
                tracing::info!(transaction = %txn_id, "transaction committed");
                for sub in matching.iter() {
                    invoke_best_effort(&pump, sub, txn_id, session, &diff, ChangePhase::Done);
                }
                Ok(ChangeOutcome::Committed)
            }
            Err(reason) => {
                tracing::warn!(transaction = %txn_id, error = %reason, "change phase failed, aborting");
                self.abort(group, &change_succeeded, txn_id, session, &diff, reason)
            }
        }
    }

    /// Presents the current running datastore as a synthetic creates-only
    /// diff and fans it out as a single `enabled` phase, followed by `done`,
    /// to exactly the one subscription that just requested it. Invariant:
    /// applying the returned diff to an empty tree reproduces the current
    /// datastore.
    pub fn synthesize_enabled(&self, sub: &Subscription, session: SessionId, running_root: crate::common::DataTree) -> EngineResult<()> {
        if !sub.flags.enabled_phase_requested {
            return Ok(());
        }
        let txn_id = TransactionId::next(&self.counters.transactions);
        let diff = flatten_to_creates(&running_root, sub.xpath.raw.as_str());
        let CallbackKind::Change(_) = &sub.callback else {
            return Ok(());
        };
        let pump = self.registry.pump(sub.group)?;
        let deadline = Instant::now() + self.default_phase_timeout;
        let verdict = invoke_with_shelve(&pump, sub, txn_id, session, &diff, ChangePhase::Enabled, deadline);
        if matches!(verdict, PhaseResult::Ok) {
            invoke_best_effort(&pump, sub, txn_id, session, &diff, ChangePhase::Done);
        }
        Ok(())
    }

    /// Notifies every subscriber that already succeeded `change`, in
    /// reverse (ascending-priority) order, that the transaction is aborting.
    /// Passive subscribers recorded as "succeeded" were never really
    /// load-bearing, but they still observe the abort like any other prior
    /// participant.
    fn abort(
        &self,
        group: GroupId,
        invoked: &[Arc<Subscription>],
        txn_id: TransactionId,
        session: SessionId,
        diff: &ChangeDiff,
        reason: EngineError,
    ) -> EngineResult<ChangeOutcome> {
        let pump = self.registry.pump(group)?;
        for sub in invoked.iter().rev() {
            invoke_best_effort(&pump, sub, txn_id, session, diff, ChangePhase::Abort);
        }
        Ok(ChangeOutcome::Aborted { reason })
    }
}

/// Round-trip helper: walks a JSON tree and emits one `Create` per
/// leaf/subtree found under `root_path`, used to build the synthetic
/// `enabled` diff. A real datastore would walk its own schema-typed tree;
/// this textual stand-in treats every object key as one more path segment.
fn flatten_to_creates(tree: &crate::common::DataTree, root_path: &str) -> ChangeDiff {
    use crate::common::ChangeOp;
    let mut ops = Vec::new();
    fn walk(value: &crate::common::DataTree, path: String, ops: &mut ChangeDiff) {
        match value {
            serde_json::Value::Object(map) if !map.is_empty() => {
                for (k, v) in map {
                    walk(v, format!("{path}/{k}"), ops);
                }
            }
            _ => ops.push(ChangeOp::Create { path, value: value.clone(), origin: DataOrigin::Push }),
        }
    }
    walk(tree, root_path.to_string(), &mut ops);
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ChangeOp;
    use crate::datastore::InMemoryDatastore;
    use crate::event_store::EventRecordStore;
    use crate::registry::SubscriptionFlags;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<Registry>, Arc<dyn Datastore>, ChangeMultiplexer, GroupId) {
        let event_store = Arc::new(EventRecordStore::new());
        let registry = Arc::new(Registry::new(Arc::new(IdCounters::default()), event_store, crate::config::EngineConfig::default()));
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::default());
        let counters = Arc::new(IdCounters::default());
        let mux = ChangeMultiplexer::new(registry.clone(), datastore.clone(), counters, Duration::from_secs(5));
        let group = registry.create_group(None).id;
        (registry, datastore, mux, group)
    }

    #[test]
    fn commits_when_every_subscriber_agrees() {
        let (registry, datastore, mux, group) = setup();
        registry
            .subscribe(
                group,
                10,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(|_args| CallbackVerdict::Ok)),
            )
            .unwrap();
        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = mux.propose(group, SessionId(1), diff, None).unwrap();
        assert!(matches!(outcome, ChangeOutcome::Committed));
        assert_eq!(datastore.read_subtree("/m:x/v").unwrap(), json!(1));
    }

    #[test]
    fn scenario_two_phase_abort() {
        // A (priority 10) ok, B (priority 5) fail on change. A receives
        // abort, B does not, datastore unchanged.
        let (registry, datastore, mux, group) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_a = log.clone();
        registry
            .subscribe(
                group,
                10,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(move |args| {
                    log_a.lock().push((10, args.phase));
                    CallbackVerdict::Ok
                })),
            )
            .unwrap();

        let log_b = log.clone();
        registry
            .subscribe(
                group,
                5,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(move |args| {
                    log_b.lock().push((5, args.phase));
                    if args.phase == ChangePhase::Change {
                        CallbackVerdict::Fail(EngineError::Validation("rejected".to_string()))
                    } else {
                        CallbackVerdict::Ok
                    }
                })),
            )
            .unwrap();

        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = mux.propose(group, SessionId(1), diff, None).unwrap();
        assert!(matches!(outcome, ChangeOutcome::Aborted { .. }));
        assert!(datastore.read_subtree("/m:x/v").is_err());

        let entries = log.lock();
        let abort_phases: Vec<_> = entries.iter().filter(|(_, p)| *p == ChangePhase::Abort).collect();
        assert_eq!(abort_phases.len(), 1);
        assert_eq!(abort_phases[0].0, 10);
    }

    #[test]
    fn scenario_shelve_then_success() {
        // Single subscriber shelves twice then succeeds; exactly three
        // invocations observed, commit still succeeds.
        let (registry, datastore, mux, group) = setup();
        let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let invocations_clone = invocations.clone();
        registry
            .subscribe(
                group,
                1,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(move |args| {
                    if args.phase != ChangePhase::Change {
                        return CallbackVerdict::Ok;
                    }
                    let n = invocations_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        CallbackVerdict::Shelve
                    } else {
                        CallbackVerdict::Ok
                    }
                })),
            )
            .unwrap();
        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = mux.propose(group, SessionId(1), diff, Some(Duration::from_secs(2))).unwrap();
        assert!(matches!(outcome, ChangeOutcome::Committed));
        assert_eq!(datastore.read_subtree("/m:x/v").unwrap(), json!(1));
        assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn phase_timeout_aborts_before_invoking_remaining_subscribers() {
        let (registry, _datastore, mux, group) = setup();
        registry
            .subscribe(
                group,
                10,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(|_args| CallbackVerdict::Shelve)),
            )
            .unwrap();
        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = mux.propose(group, SessionId(1), diff, Some(Duration::from_millis(1))).unwrap();
        match outcome {
            ChangeOutcome::Aborted { reason } => assert!(matches!(reason, EngineError::Timeout(_))),
            ChangeOutcome::Committed => panic!("expected timeout abort"),
        }
    }

    #[test]
    fn done_only_subscriber_skips_update_and_change() {
        let (registry, _datastore, mux, group) = setup();
        let phases_seen = Arc::new(Mutex::new(Vec::new()));
        let phases_clone = phases_seen.clone();
        registry
            .subscribe_with_flags(
                group,
                1,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(move |args| {
                    phases_clone.lock().push(args.phase);
                    CallbackVerdict::Ok
                })),
                SubscriptionFlags { done_only: true, ..Default::default() },
            )
            .unwrap();
        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        mux.propose(group, SessionId(1), diff, None).unwrap();
        assert_eq!(*phases_seen.lock(), vec![ChangePhase::Done]);
    }

    #[test]
    fn passive_subscriber_failure_does_not_abort() {
        let (registry, datastore, mux, group) = setup();
        registry
            .subscribe_with_flags(
                group,
                1,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(|_args| CallbackVerdict::Fail(EngineError::Internal("boom".into())))),
                SubscriptionFlags { passive: true, ..Default::default() },
            )
            .unwrap();
        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = mux.propose(group, SessionId(1), diff, None).unwrap();
        assert!(matches!(outcome, ChangeOutcome::Committed));
        assert_eq!(datastore.read_subtree("/m:x/v").unwrap(), json!(1));
    }

    #[test]
    fn passive_subscriber_failure_excluded_from_abort_fanout() {
        // P (passive, priority 10) fails change first and must never be
        // recorded as "succeeded"; B (priority 5) also fails change and
        // triggers the abort. P must not receive an abort callback despite
        // having failed, since passive subscribers are excluded from the
        // abort fan-out entirely.
        let (registry, datastore, mux, group) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_p = log.clone();
        registry
            .subscribe_with_flags(
                group,
                10,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(move |args| {
                    log_p.lock().push(("P", args.phase));
                    if args.phase == ChangePhase::Change {
                        CallbackVerdict::Fail(EngineError::Internal("passive boom".to_string()))
                    } else {
                        CallbackVerdict::Ok
                    }
                })),
                SubscriptionFlags { passive: true, ..Default::default() },
            )
            .unwrap();

        let log_b = log.clone();
        registry
            .subscribe(
                group,
                5,
                "/m:x",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(move |args| {
                    log_b.lock().push(("B", args.phase));
                    if args.phase == ChangePhase::Change {
                        CallbackVerdict::Fail(EngineError::Validation("rejected".to_string()))
                    } else {
                        CallbackVerdict::Ok
                    }
                })),
            )
            .unwrap();

        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = mux.propose(group, SessionId(1), diff, None).unwrap();
        assert!(matches!(outcome, ChangeOutcome::Aborted { .. }));
        assert!(datastore.read_subtree("/m:x/v").is_err());

        let entries = log.lock();
        let p_aborts = entries.iter().filter(|(name, phase)| *name == "P" && *phase == ChangePhase::Abort).count();
        assert_eq!(p_aborts, 0, "passive subscriber must never receive abort, even though it failed change");
    }

    #[test]
    fn non_matching_subscriber_not_invoked() {
        let (registry, _datastore, mux, group) = setup();
        registry
            .subscribe(
                group,
                1,
                "/m:other",
                SubscriptionKind::Change,
                CallbackKind::Change(Box::new(|_args| panic!("must not be invoked"))),
            )
            .unwrap();
        let diff = vec![ChangeOp::Create { path: "/m:x/v".to_string(), value: json!(1), origin: DataOrigin::Push }];
        let outcome = mux.propose(group, SessionId(1), diff, None).unwrap();
        assert!(matches!(outcome, ChangeOutcome::Committed));
    }
}
