// RPC / Action Dispatcher.
//
// Invokes a group's `Rpc` subscribers whose XPath matches the invocation in
// priority-descending order, ending with the lowest-priority subscriber —
// the "primary" — running last and owning the final output. Grounded on the
// same `TwoPhaseCommitCoordinator` participant fan-out shape as `change`,
// reused here for a single pass with no update/done phases but the same
// reverse-order abort-on-failure unwind. Shelve uses the identical
// deadline-retry loop as the change multiplexer, both driven through the
// group's `EventRecordStore` instead of calling a callback directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{DataTree, GroupId, SessionId};
use crate::error::{CallbackVerdict, EngineError, EngineResult};
use crate::event_store::EventPhase;
use crate::registry::{CallbackKind, Pump, Registry, RpcCallbackArgs, Subscription, SubscriptionKind};

pub struct RpcDispatcher {
    registry: Arc<Registry>,
    default_deadline: Duration,
}

enum StepResult {
    Ok,
    Fail(EngineError),
}

fn invoke_with_shelve(
    pump: &Pump,
    sub: &Subscription,
    session: SessionId,
    xpath: &str,
    input: &DataTree,
    output: &mut DataTree,
    is_primary: bool,
    deadline: Instant,
) -> StepResult {
    let CallbackKind::Rpc(cb) = &sub.callback else {
        return StepResult::Ok;
    };
    let result = pump.dispatch(sub.id, session, EventPhase::Rpc, input.clone(), deadline, |event_id| {
        cb(RpcCallbackArgs { session, request_id: event_id, xpath, input, output, is_primary })
    });
    match result {
        Ok(CallbackVerdict::Ok) => StepResult::Ok,
        Ok(CallbackVerdict::Fail(e)) => StepResult::Fail(e),
        Ok(CallbackVerdict::Shelve) => {
            StepResult::Fail(EngineError::Internal("dispatch resolved with an unexpected shelve verdict".to_string()))
        }
        Err(e) => StepResult::Fail(e),
    }
}

impl RpcDispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry, default_deadline: Duration::from_secs(5) }
    }

    pub fn with_default_deadline(registry: Arc<Registry>, default_deadline: Duration) -> Self {
        Self { registry, default_deadline }
    }

    /// Invokes every `Rpc` subscriber of `group` whose filter matches
    /// `xpath`, in descending-priority order, feeding each one the same
    /// input and a shared output buffer. The subscriber with the lowest
    /// priority value is the primary handler: it runs last and its
    /// (successful) output is the one the caller receives.
    ///
    /// Failure policy: if any non-primary callback fails, every
    /// already-invoked callback is sent `abort` in reverse (ascending
    /// priority) order and the invocation fails; the primary is never sent
    /// `abort`. If the primary itself fails, the callbacks that ran before
    /// it are aborted the same way.
    pub fn invoke(&self, group: GroupId, session: SessionId, xpath: &str, input: &DataTree) -> EngineResult<DataTree> {
        self.invoke_with_deadline(group, session, xpath, input, self.default_deadline)
    }

    pub fn invoke_with_deadline(
        &self,
        group: GroupId,
        session: SessionId,
        xpath: &str,
        input: &DataTree,
        timeout: Duration,
    ) -> EngineResult<DataTree> {
        let pump = self.registry.pump(group)?;
        let all = self.registry.subscriptions_desc(group, SubscriptionKind::Rpc)?;
        let subscribers: Vec<Arc<Subscription>> = all.into_iter().filter(|s| s.xpath.matches_changed_path(xpath)).collect();
        if subscribers.is_empty() {
            return Err(EngineError::NoMatchingSubscriber);
        }
        let deadline = Instant::now() + timeout;
        let mut output = DataTree::Null;
        let mut invoked: Vec<Arc<Subscription>> = Vec::new();

        for (idx, sub) in subscribers.iter().enumerate() {
            let is_primary = idx == subscribers.len() - 1;
            match invoke_with_shelve(&pump, sub, session, xpath, input, &mut output, is_primary, deadline) {
                StepResult::Ok => invoked.push(sub.clone()),
                StepResult::Fail(e) => {
                    tracing::warn!(subscription = %sub.id, is_primary, error = %e, "rpc callback failed");
                    self.abort(&pump, &invoked, session, xpath, input);
                    return Err(e);
                }
            }
        }
        Ok(output)
    }

    /// Sends `abort` to every already-succeeded callback in reverse order.
    /// There is no dedicated abort payload in the RPC callback signature;
    /// the event-phase carried to the callback on unwind is simply not
    /// `ok`-able again, so this engine signals it by re-invoking with a
    /// `Null` input/output pair and ignoring the result — the callback's own
    /// bookkeeping (if any) is expected to key off `is_primary`/ordering,
    /// not a distinct abort flag, matching how the change multiplexer's
    /// `ChangePhase::Abort` is just another phase value on the same
    /// callback shape.
    fn abort(&self, pump: &Pump, invoked: &[Arc<Subscription>], session: SessionId, xpath: &str, input: &DataTree) {
        for sub in invoked.iter().rev() {
            if let CallbackKind::Rpc(cb) = &sub.callback {
                let mut discard = DataTree::Null;
                let deadline = Instant::now() + Duration::from_secs(5);
                let _ = pump.dispatch_once(sub.id, session, EventPhase::Rpc, input.clone(), deadline, |event_id| {
                    cb(RpcCallbackArgs { session, request_id: event_id, xpath, input, output: &mut discard, is_primary: false })
                });
                tracing::debug!(subscription = %sub.id, "rpc participant aborted");
            }
        }
    }
}
