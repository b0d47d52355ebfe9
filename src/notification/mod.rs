// Notification Broker & Log.
//
// `NotificationLog` is an append-only, length-prefixed, crc32c-checksummed
// file per module, grounded on the checksum discipline in
// `transaction/wal.rs` (simplified here to the plain `crc32c` crate rather
// than the WAL's hand-rolled SIMD-accelerated implementation — this engine
// has no throughput requirement that justifies the hardware-intrinsics
// path). `NotificationBroker` fans a published notification out to every
// matching realtime subscriber and, for a subscriber that asked to replay
// from a past point in time, first walks the log and delivers matching
// historical records before the subscriber is considered live: replay, then
// realtime, then an explicit "replay complete" signal, then an optional
// stop-time tear-down.
//
// Every callback invocation below goes through the subscription's group
// `EventRecordStore` via `dispatch_once` rather than calling the stored
// closure directly, so a notification delivery is still recorded as a
// publish/claim/update cycle like every other dispatch path in this crate.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::{DataTree, GroupId, SessionId, SubscriptionId};
use crate::error::{CallbackVerdict, EngineError, EngineResult};
use crate::event_store::EventPhase;
use crate::registry::{CallbackKind, NotificationCallbackArgs, Registry, SubscriptionKind};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub xpath: String,
    pub payload: DataTree,
    pub timestamp_ms: i64,
}

pub struct NotificationLog {
    path: PathBuf,
}

impl NotificationLog {
    pub fn open(dir: &Path, module: &str) -> EngineResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self { path: dir.join(format!("{module}.notiflog")) })
    }

    /// Appends one frame: `[len: u32 LE][crc32c: u32 LE][json payload]`.
    pub fn append(&self, record: &NotificationRecord) -> EngineResult<()> {
        let payload = serde_json::to_vec(record)?;
        let checksum = crc32c::crc32c(&payload);
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&checksum.to_le_bytes())?;
        file.write_all(&payload)?;
        Ok(())
    }

    /// Reads every frame with `timestamp_ms >= since_ms`, verifying each
    /// frame's checksum. A truncated trailing frame (fewer bytes than its
    /// length prefix promises — e.g. a crash mid-append) is treated as the
    /// end of the log rather than an error, matching the WAL's tolerance for
    /// a torn last record; a checksum mismatch on an otherwise complete
    /// frame fails the whole replay, since later frames cannot be trusted to
    /// still be correctly aligned.
    pub fn replay(&self, since_ms: i64) -> EngineResult<Vec<NotificationRecord>> {
        let mut file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut crc_buf = [0u8; 4];
            if file.read_exact(&mut crc_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let expected_crc = u32::from_le_bytes(crc_buf);
            let mut payload = vec![0u8; len];
            if file.read_exact(&mut payload).is_err() {
                break;
            }
            if crc32c::crc32c(&payload) != expected_crc {
                return Err(EngineError::Internal("notification log checksum mismatch".to_string()));
            }
            let record: NotificationRecord = serde_json::from_slice(&payload)?;
            if record.timestamp_ms >= since_ms {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Drops every entry older than `cutoff_ms`, rewriting the file with
    /// only the surviving frames.
    pub fn purge_older_than(&self, cutoff_ms: i64) -> EngineResult<usize> {
        let kept = self.replay(cutoff_ms)?;
        let tmp_path = self.path.with_extension("notiflog.tmp");
        {
            let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            for record in &kept {
                let payload = serde_json::to_vec(record)?;
                let checksum = crc32c::crc32c(&payload);
                file.write_all(&(payload.len() as u32).to_le_bytes())?;
                file.write_all(&checksum.to_le_bytes())?;
                file.write_all(&payload)?;
            }
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(kept.len())
    }
}

/// Per-subscription replay/stop-time bookkeeping the broker needs beyond
/// what `registry::Subscription` stores generically.
struct NotificationState {
    module: String,
    stop_time_ms: Option<i64>,
    /// `true` once this subscription has finished its historical replay (or
    /// never requested one) and is receiving `publish` calls directly.
    live: RwLock<bool>,
}

pub struct NotificationBroker {
    registry: Arc<Registry>,
    logs: DashMap<String, Arc<NotificationLog>>,
    log_dir: PathBuf,
    /// Retention window applied by `enforce_retention`; defaults from
    /// `EngineConfig::notification_retention`.
    retention: Duration,
    /// Modules for which replay is enabled; only notifications on these
    /// modules are persisted to a `NotificationLog`.
    replay_enabled_modules: DashMap<String, ()>,
    subscriptions: DashMap<SubscriptionId, NotificationState>,
}

impl NotificationBroker {
    pub fn new(registry: Arc<Registry>, log_dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            registry,
            logs: DashMap::new(),
            log_dir: log_dir.into(),
            retention,
            replay_enabled_modules: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Purges every module log this broker has opened of entries older than
    /// the configured retention window, measured back from `now_ms`. A
    /// caller (the embedding process) is expected to invoke this
    /// periodically; the engine itself never calls it on a timer, since it
    /// has no background clock of its own.
    pub fn enforce_retention(&self, now_ms: i64) -> EngineResult<()> {
        let cutoff_ms = now_ms.saturating_sub(self.retention.as_millis() as i64);
        for entry in self.logs.iter() {
            entry.value().purge_older_than(cutoff_ms)?;
        }
        Ok(())
    }

    pub fn enable_replay(&self, module: &str) {
        self.replay_enabled_modules.insert(module.to_string(), ());
    }

    fn log_for(&self, module: &str) -> EngineResult<Arc<NotificationLog>> {
        if let Some(log) = self.logs.get(module) {
            return Ok(log.clone());
        }
        let log = Arc::new(NotificationLog::open(&self.log_dir, module)?);
        self.logs.insert(module.to_string(), log.clone());
        Ok(log)
    }

    /// Dispatches one notification callback invocation through the
    /// subscription's group `Pump`, so even a direct-delivery call (replay,
    /// stop-time teardown, realtime fan-out) is recorded as a publish/claim/
    /// update cycle like every other dispatch path in this crate. The
    /// notification callback contract has no verdict of its own, so a
    /// successful invocation always settles `Ok`; only a failure to dispatch
    /// at all (e.g. the group's queue is full) produces an `Err`, which the
    /// caller decides how to treat — best-effort for realtime delivery,
    /// fatal for replay.
    fn dispatch(&self, sub: &crate::registry::Subscription, cb: &(dyn Fn(NotificationCallbackArgs<'_>) + Send + Sync), args: NotificationArgsTemplate<'_>) -> EngineResult<()> {
        let pump = self.registry.pump(sub.group)?;
        let payload = args.data.clone();
        let deadline = Instant::now() + DISPATCH_TIMEOUT;
        let phase = match args.notif_type {
            "notif-replay" => EventPhase::NotifReplay,
            "notif-replay-complete" => EventPhase::NotifReplayComplete,
            "notif-stop" => EventPhase::NotifStop,
            _ => EventPhase::NotifRealtime,
        };
        pump.dispatch_once(sub.id, args.session, phase, payload, deadline, |event_id| {
            cb(NotificationCallbackArgs {
                session: args.session,
                request_id: event_id,
                notif_type: args.notif_type,
                xpath: args.xpath,
                data: args.data,
                timestamp_ms: args.timestamp_ms,
            });
            CallbackVerdict::Ok
        })?;
        Ok(())
    }

    /// Registers a notification subscription's replay/stop-time state. Must
    /// be called once right after `Registry::subscribe` for any
    /// `Notification` subscription that wants replay or a stop-time; a
    /// subscription with neither is implicitly always "live".
    pub fn register_subscription(&self, subscription: SubscriptionId, module: &str, stop_time_ms: Option<i64>, start_time_ms: Option<i64>) -> EngineResult<()> {
        self.subscriptions.insert(
            subscription,
            NotificationState {
                module: module.to_string(),
                stop_time_ms,
                live: RwLock::new(start_time_ms.is_none()),
            },
        );
        if start_time_ms.is_none() {
            return Ok(());
        }
        self.replay_then_live(subscription, start_time_ms.unwrap())?;
        Ok(())
    }

    /// Persists the notification to `module`'s log (iff replay is enabled
    /// for it), then delivers it to every matching realtime `Notification`
    /// subscriber of `group` that has already completed its replay (or
    /// never requested one). Also retires any subscriber whose stop-time
    /// has now been reached, after delivering this notification.
    pub fn publish(&self, module: &str, group: GroupId, session: SessionId, xpath: &str, payload: DataTree, timestamp_ms: i64) -> EngineResult<()> {
        let record = NotificationRecord { xpath: xpath.to_string(), payload, timestamp_ms };
        if self.replay_enabled_modules.contains_key(module) {
            self.log_for(module)?.append(&record)?;
        }
        self.dispatch_realtime(group, session, &record)
    }

    fn dispatch_realtime(&self, group: GroupId, session: SessionId, record: &NotificationRecord) -> EngineResult<()> {
        for sub in self.registry.subscriptions_desc(group, SubscriptionKind::Notification)? {
            if !sub.xpath.matches_changed_path(&record.xpath) {
                continue;
            }
            if let Some(state) = self.subscriptions.get(&sub.id) {
                if !*state.live.read() {
                    continue;
                }
                if let Some(stop_ms) = state.stop_time_ms {
                    if record.timestamp_ms >= stop_ms {
                        if let CallbackKind::Notification(cb) = &sub.callback {
                            if let Err(e) = self.dispatch(
                                &sub,
                                cb.as_ref(),
                                NotificationArgsTemplate {
                                    session,
                                    notif_type: "notif-stop",
                                    xpath: &record.xpath,
                                    data: &DataTree::Null,
                                    timestamp_ms: record.timestamp_ms,
                                },
                            ) {
                                tracing::warn!(subscription = %sub.id, error = %e, "notif-stop dispatch failed");
                            }
                        }
                        sub.retire();
                        self.registry.unsubscribe(sub.id).ok();
                        continue;
                    }
                }
            }
            if let CallbackKind::Notification(cb) = &sub.callback {
                // Realtime delivery is best-effort: a subscriber whose queue
                // is full loses this notification rather than blocking or
                // failing the publisher.
                if let Err(e) = self.dispatch(
                    &sub,
                    cb.as_ref(),
                    NotificationArgsTemplate {
                        session,
                        notif_type: "notif-realtime",
                        xpath: &record.xpath,
                        data: &record.payload,
                        timestamp_ms: record.timestamp_ms,
                    },
                ) {
                    tracing::warn!(subscription = %sub.id, error = %e, "realtime notification dispatch failed");
                }
            }
        }
        Ok(())
    }

    /// Delivers every logged record at or after `since_ms` that matches the
    /// subscription's filter, in log order (`notif-replay`), then a
    /// `notif-replay-complete` sentinel, then marks the subscription live so
    /// the realtime path in `dispatch_realtime` starts reaching it.
    ///
    /// Replay entries are never lost mid-stream: a record is only counted in
    /// `delivered` once its dispatch has actually succeeded, and a failed
    /// dispatch aborts the whole replay immediately (propagated via `?`)
    /// rather than skipping ahead to the next record. The subscription is
    /// only marked live, and the caller only sees `notif-replay-complete`,
    /// once every matching record up to `since_ms` has been delivered.
    pub fn replay_then_live(&self, subscription: SubscriptionId, since_ms: i64) -> EngineResult<usize> {
        let sub = self.registry.subscription(subscription)?;
        let CallbackKind::Notification(cb) = &sub.callback else {
            return Err(EngineError::InvalidArgument("subscription is not a notification subscriber".to_string()));
        };
        let module = self
            .subscriptions
            .get(&subscription)
            .map(|s| s.module.clone())
            .ok_or_else(|| EngineError::InvalidArgument("subscription has no registered replay state".to_string()))?;
        let log = self.log_for(&module)?;
        let mut delivered = 0;
        for record in log.replay(since_ms)? {
            if sub.xpath.matches_changed_path(&record.xpath) {
                self.dispatch(
                    &sub,
                    cb.as_ref(),
                    NotificationArgsTemplate {
                        session: SessionId(0),
                        notif_type: "notif-replay",
                        xpath: &record.xpath,
                        data: &record.payload,
                        timestamp_ms: record.timestamp_ms,
                    },
                )?;
                delivered += 1;
            }
        }
        self.dispatch(
            &sub,
            cb.as_ref(),
            NotificationArgsTemplate {
                session: SessionId(0),
                notif_type: "notif-replay-complete",
                xpath: "",
                data: &DataTree::Null,
                timestamp_ms: since_ms,
            },
        )?;
        if let Some(state) = self.subscriptions.get(&subscription) {
            *state.live.write() = true;
        }
        Ok(delivered)
    }
}

/// Plain bundle of a notification callback's arguments, built before the
/// event id is known so `dispatch` can hand it off to `EventRecordStore`
/// first and only fill in `request_id` once the id is minted.
struct NotificationArgsTemplate<'a> {
    session: SessionId,
    notif_type: &'a str,
    xpath: &'a str,
    data: &'a DataTree,
    timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IdCounters;
    use crate::config::EngineConfig;
    use crate::event_store::EventRecordStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::tempdir;

    fn setup() -> (Arc<Registry>, NotificationBroker, GroupId, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let event_store = Arc::new(EventRecordStore::new());
        let registry = Arc::new(Registry::new(Arc::new(IdCounters::default()), event_store, EngineConfig::default()));
        let broker = NotificationBroker::new(registry.clone(), dir.path(), Duration::from_secs(3600));
        broker.enable_replay("m");
        let group = registry.create_group(None).id;
        (registry, broker, group, dir)
    }

    #[test]
    fn log_round_trips_and_filters_by_timestamp() {
        let dir = tempdir().unwrap();
        let log = NotificationLog::open(dir.path(), "m").unwrap();
        log.append(&NotificationRecord { xpath: "/m:e1".to_string(), payload: json!(1), timestamp_ms: 100 }).unwrap();
        log.append(&NotificationRecord { xpath: "/m:e2".to_string(), payload: json!(2), timestamp_ms: 200 }).unwrap();

        let all = log.replay(0).unwrap();
        assert_eq!(all.len(), 2);
        let recent = log.replay(150).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].xpath, "/m:e2");
    }

    #[test]
    fn enforce_retention_purges_through_broker() {
        let (_registry, broker, group, _dir) = setup();
        broker.publish("m", group, SessionId(1), "/m:e", json!(1), 100).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(2), 5_000).unwrap();
        // retention is 3600s = 3_600_000ms; cutoff at now=3_700_100 keeps
        // only the second entry.
        broker.enforce_retention(3_700_100).unwrap();
        assert_eq!(broker.log_for("m").unwrap().replay(0).unwrap().len(), 1);
    }

    #[test]
    fn purge_drops_old_entries() {
        let dir = tempdir().unwrap();
        let log = NotificationLog::open(dir.path(), "m").unwrap();
        log.append(&NotificationRecord { xpath: "/m:e1".to_string(), payload: json!(1), timestamp_ms: 100 }).unwrap();
        log.append(&NotificationRecord { xpath: "/m:e2".to_string(), payload: json!(2), timestamp_ms: 200 }).unwrap();
        let kept = log.purge_older_than(150).unwrap();
        assert_eq!(kept, 1);
        assert_eq!(log.replay(0).unwrap().len(), 1);
    }

    #[test]
    fn realtime_dispatch_reaches_matching_subscriber() {
        let (registry, broker, group, _dir) = setup();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let sub_id = registry
            .subscribe(
                group,
                1,
                "/m:e",
                SubscriptionKind::Notification,
                CallbackKind::Notification(Box::new(move |args| {
                    received_clone.lock().push((args.notif_type.to_string(), args.xpath.to_string(), args.data.clone(), args.timestamp_ms));
                })),
            )
            .unwrap();
        broker.register_subscription(sub_id, "m", None, None).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!({"v": 1}), 1).unwrap();
        let log = received.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "notif-realtime");
    }

    #[test]
    fn scenario_replay_then_real_time() {
        // log holds t=1,2,3; subscriber starts at start-time=0; real-time
        // notification at t=4.
        let (registry, broker, group, _dir) = setup();
        broker.publish("m", group, SessionId(1), "/m:e", json!(1), 1).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(2), 2).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(3), 3).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let sub_id = registry
            .subscribe(
                group,
                1,
                "/m:e",
                SubscriptionKind::Notification,
                CallbackKind::Notification(Box::new(move |args| {
                    received_clone.lock().push((args.notif_type.to_string(), args.timestamp_ms));
                })),
            )
            .unwrap();
        broker.register_subscription(sub_id, "m", None, Some(0)).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(4), 4).unwrap();

        let log = received.lock();
        assert_eq!(
            log.as_slice(),
            &[
                ("notif-replay".to_string(), 1),
                ("notif-replay".to_string(), 2),
                ("notif-replay".to_string(), 3),
                ("notif-replay-complete".to_string(), 0),
                ("notif-realtime".to_string(), 4),
            ]
        );
    }

    #[test]
    fn replay_halts_and_does_not_mark_live_on_dispatch_failure() {
        // Group queue holds only one slot; fill it with an unrelated pending
        // event so the first replay dispatch has nowhere to publish into and
        // fails with `no-space`. Both logged records (t=1, t=2) would
        // otherwise match, but the failure must abort the replay immediately
        // rather than skipping to the second record or marking the
        // subscriber live.
        let dir = tempdir().unwrap();
        let event_store = Arc::new(EventRecordStore::new());
        let registry = Arc::new(Registry::new(Arc::new(IdCounters::default()), event_store, EngineConfig::default()));
        let broker = NotificationBroker::new(registry.clone(), dir.path(), Duration::from_secs(3600));
        broker.enable_replay("m");
        let group = registry.create_group(Some(1)).id;

        broker.publish("m", group, SessionId(1), "/m:e", json!(1), 1).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(2), 2).unwrap();

        let sub_id = registry
            .subscribe(
                group,
                1,
                "/m:e",
                SubscriptionKind::Notification,
                CallbackKind::Notification(Box::new(|_args| {})),
            )
            .unwrap();
        broker.subscriptions.insert(
            sub_id,
            NotificationState { module: "m".to_string(), stop_time_ms: None, live: RwLock::new(false) },
        );

        registry
            .event_store()
            .publish(group, SubscriptionId(999), SessionId(0), EventPhase::Rpc, DataTree::Null, Instant::now() + Duration::from_secs(5))
            .unwrap();

        let err = broker.replay_then_live(sub_id, 0).unwrap_err();
        assert!(matches!(err, EngineError::NoSpace { .. }));
        assert!(!*broker.subscriptions.get(&sub_id).unwrap().live.read());
    }

    #[test]
    fn stop_time_emits_notif_stop_and_unsubscribes() {
        let (registry, broker, group, _dir) = setup();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let sub_id = registry
            .subscribe(
                group,
                1,
                "/m:e",
                SubscriptionKind::Notification,
                CallbackKind::Notification(Box::new(move |args| {
                    received_clone.lock().push(args.notif_type.to_string());
                })),
            )
            .unwrap();
        broker.register_subscription(sub_id, "m", Some(5), None).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(1), 1).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(2), 10).unwrap();
        broker.publish("m", group, SessionId(1), "/m:e", json!(3), 20).unwrap();

        let log = received.lock();
        assert_eq!(log.as_slice(), &["notif-realtime".to_string(), "notif-stop".to_string()]);
        assert!(registry.subscription(sub_id).is_err());
    }
}
