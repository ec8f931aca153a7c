use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alarm::model::{
    Alarm, AlarmSettings, SoundType, ValidationError, format_time, parse_date, parse_time,
    resolve_local_datetime,
};
use crate::clock::Clock;
use crate::notify::{Broadcaster, Notifier};

/// Inbound messages understood by the scheduler thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "SET_ALARM")]
    SetAlarm(SetAlarm),
    #[serde(rename = "CANCEL_ALARM")]
    CancelAlarm { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAlarm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub time: String,
    pub date: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_type: Option<SoundType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<bool>,
}

impl SetAlarm {
    pub fn from_alarm(alarm: &Alarm) -> Self {
        Self {
            id: Some(alarm.id.to_string()),
            time: format_time(alarm.time),
            date: alarm.date.format("%Y-%m-%d").to_string(),
            description: alarm.description.clone(),
            sound_type: Some(alarm.sound_type),
            sound_url: alarm.sound_url().map(str::to_string),
            repeat: Some(alarm.repeat),
        }
    }

    pub fn key(&self) -> TimerKey {
        match &self.id {
            Some(id) => TimerKey::new(id.clone()),
            None => TimerKey::new(format!("{}-{}-{}", self.date, self.time, self.description)),
        }
    }

    pub fn target(&self) -> Result<DateTime<Local>, SchedulerError> {
        let date = parse_date(&self.date)?;
        let time = parse_time(&self.time)?;
        resolve_local_datetime(&Local, date.and_time(time))
            .ok_or_else(|| SchedulerError::NonexistentLocalTime(format!("{} {}", self.date, self.time)))
    }

    pub fn into_request(self) -> Result<ArmRequest, SchedulerError> {
        let target = self.target()?;
        let key = self.key();
        Ok(ArmRequest {
            key,
            target,
            repeat: self.repeat.unwrap_or(false),
            event: AlarmTriggered {
                id: self.id,
                description: self.description,
                time: self.time,
                date: self.date,
                sound_type: self.sound_type,
                sound_url: self.sound_url,
            },
        })
    }
}

/// Outbound message broadcast to every foreground context when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "ALARM_TRIGGERED", rename_all = "camelCase")]
pub struct AlarmTriggered {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub description: String,
    pub time: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_type: Option<SoundType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TimerKey(String);

impl TimerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidSchedule(#[from] ValidationError),
    #[error("no local instant exists for {0}")]
    NonexistentLocalTime(String),
    #[error("alarm scheduler is not running")]
    Unavailable,
    #[error("alarm scheduler did not acknowledge within {0:?}")]
    AckTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ArmRequest {
    pub key: TimerKey,
    pub target: DateTime<Local>,
    pub repeat: bool,
    pub event: AlarmTriggered,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ArmOutcome {
    Armed,
    Replaced,
    DroppedPast,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimerStatus {
    Idle,
    Armed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTimer {
    pub key: TimerKey,
    pub deadline: DateTime<Local>,
    pub repeat: bool,
    pub description: String,
}

#[derive(Debug, Clone)]
struct ArmedTimer {
    deadline: DateTime<Local>,
    repeat: bool,
    event: AlarmTriggered,
}

/// Pending one-shot timers keyed by [`TimerKey`]. At most one timer exists per
/// key; every method takes `now` explicitly.
#[derive(Debug)]
pub struct TimerTable {
    timers: HashMap<TimerKey, ArmedTimer>,
    repeat_interval: chrono::Duration,
}

impl TimerTable {
    pub fn new(repeat_interval: chrono::Duration) -> Self {
        Self {
            timers: HashMap::new(),
            repeat_interval: repeat_interval.max(chrono::Duration::milliseconds(1)),
        }
    }

    pub fn arm(&mut self, request: ArmRequest, now: DateTime<Local>) -> ArmOutcome {
        if request.target <= now {
            return ArmOutcome::DroppedPast;
        }
        let timer = ArmedTimer {
            deadline: request.target,
            repeat: request.repeat,
            event: request.event,
        };
        match self.timers.insert(request.key, timer) {
            Some(_) => ArmOutcome::Replaced,
            None => ArmOutcome::Armed,
        }
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.timers.remove(key).is_some()
    }

    pub fn status(&self, key: &TimerKey) -> TimerStatus {
        if self.timers.contains_key(key) {
            TimerStatus::Armed
        } else {
            TimerStatus::Idle
        }
    }

    pub fn next_deadline(&self) -> Option<DateTime<Local>> {
        self.timers.values().map(|timer| timer.deadline).min()
    }

    /// Emits every timer whose deadline has passed, earliest first. Repeating
    /// timers stay armed at their next future slot; the rest go idle.
    pub fn fire_due(&mut self, now: DateTime<Local>) -> Vec<AlarmTriggered> {
        let mut due = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(key, timer)| (timer.deadline, key.clone()))
            .collect::<Vec<_>>();
        due.sort_by(|a, b| a.0.cmp(&b.0));

        let mut fired = Vec::with_capacity(due.len());
        for (deadline, key) in due {
            let Some(timer) = self.timers.get_mut(&key) else {
                continue;
            };
            fired.push(timer.event.clone());
            if timer.repeat {
                timer.deadline = next_repeat_deadline(deadline, now, self.repeat_interval);
            } else {
                self.timers.remove(&key);
            }
        }
        fired
    }

    pub fn pending(&self) -> Vec<PendingTimer> {
        let mut pending = self
            .timers
            .iter()
            .map(|(key, timer)| PendingTimer {
                key: key.clone(),
                deadline: timer.deadline,
                repeat: timer.repeat,
                description: timer.event.description.clone(),
            })
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        pending
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

pub(crate) fn next_repeat_deadline(
    deadline: DateTime<Local>,
    now: DateTime<Local>,
    interval: chrono::Duration,
) -> DateTime<Local> {
    let interval_ms = interval.num_milliseconds().max(1);
    let late_ms = (now - deadline).num_milliseconds().max(0);
    let steps = late_ms / interval_ms + 1;
    deadline + chrono::Duration::milliseconds(interval_ms.saturating_mul(steps))
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub repeat_interval: chrono::Duration,
    pub max_poll: Duration,
    pub ack_timeout: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &AlarmSettings) -> Self {
        Self {
            repeat_interval: settings.repeat_interval(),
            ..Self::default()
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            repeat_interval: chrono::Duration::minutes(10),
            max_poll: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(2),
        }
    }
}

enum SchedulerCommand {
    Arm(ArmRequest),
    Cancel { key: TimerKey, ack: Sender<bool> },
    Pending(Sender<Vec<PendingTimer>>),
    Shutdown,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<SchedulerCommand>,
    ack_timeout: Duration,
}

impl SchedulerHandle {
    /// Fire-and-forget: a target already in the past is dropped by the worker
    /// without any signal back to the caller.
    pub fn set_alarm(&self, message: SetAlarm) -> Result<(), SchedulerError> {
        let request = message.into_request()?;
        self.arm(request)
    }

    pub fn arm(&self, request: ArmRequest) -> Result<(), SchedulerError> {
        self.tx
            .send(SchedulerCommand::Arm(request))
            .map_err(|_| SchedulerError::Unavailable)
    }

    /// Removes the timer for `key` and waits for the worker to confirm.
    /// Returns whether a timer was pending.
    pub fn cancel(&self, key: &TimerKey) -> Result<bool, SchedulerError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(SchedulerCommand::Cancel {
                key: key.clone(),
                ack: ack_tx,
            })
            .map_err(|_| SchedulerError::Unavailable)?;
        self.await_reply(&ack_rx)
    }

    pub fn pending(&self) -> Result<Vec<PendingTimer>, SchedulerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(SchedulerCommand::Pending(reply_tx))
            .map_err(|_| SchedulerError::Unavailable)?;
        self.await_reply(&reply_rx)
    }

    fn await_reply<T>(&self, rx: &Receiver<T>) -> Result<T, SchedulerError> {
        rx.recv_timeout(self.ack_timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SchedulerError::AckTimeout(self.ack_timeout),
            RecvTimeoutError::Disconnected => SchedulerError::Unavailable,
        })
    }
}

pub struct AlarmScheduler {
    handle: SchedulerHandle,
    join: Option<JoinHandle<()>>,
}

impl AlarmScheduler {
    pub fn start(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded();
        let worker = Worker {
            table: TimerTable::new(config.repeat_interval),
            clock,
            notifier,
            broadcaster,
            max_poll: config.max_poll,
        };
        let join = thread::Builder::new()
            .name("alarm-scheduler".to_string())
            .spawn(move || worker.run(rx))
            .context("failed to spawn alarm scheduler thread")?;

        Ok(Self {
            handle: SchedulerHandle {
                tx,
                ack_timeout: config.ack_timeout,
            },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stops the worker and waits for it. Pending timers are discarded.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.tx.send(SchedulerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    table: TimerTable,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    broadcaster: Arc<Broadcaster>,
    max_poll: Duration,
}

impl Worker {
    fn run(mut self, rx: Receiver<SchedulerCommand>) {
        debug!("alarm scheduler started");
        loop {
            let now = self.clock.now();
            for event in self.table.fire_due(now) {
                self.deliver(&event, now);
            }

            let wait = self
                .table
                .next_deadline()
                .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(self.max_poll)
                .min(self.max_poll);

            match rx.recv_timeout(wait) {
                Ok(SchedulerCommand::Arm(request)) => self.arm(request),
                Ok(SchedulerCommand::Cancel { key, ack }) => {
                    let removed = self.table.cancel(&key);
                    debug!("cancel '{key}': removed={removed}");
                    let _ = ack.send(removed);
                }
                Ok(SchedulerCommand::Pending(reply)) => {
                    let _ = reply.send(self.table.pending());
                }
                Ok(SchedulerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        debug!("alarm scheduler stopped with {} pending timer(s)", self.table.len());
    }

    fn arm(&mut self, request: ArmRequest) {
        let key = request.key.clone();
        let target = request.target;
        match self.table.arm(request, self.clock.now()) {
            ArmOutcome::Armed => info!("armed '{key}' for {target}"),
            ArmOutcome::Replaced => info!("re-armed '{key}' for {target}"),
            ArmOutcome::DroppedPast => debug!("dropped '{key}': {target} is in the past"),
        }
    }

    fn deliver(&self, event: &AlarmTriggered, now: DateTime<Local>) {
        info!("alarm '{}' fired ({} {})", event.description, event.date, event.time);
        if let Err(err) = self.notifier.notify(event) {
            warn!("system notification for '{}' not shown: {err}", event.description);
        }
        self.broadcaster.broadcast(event, now);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::NotifyError;

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2030, 1, 1, hour, minute, 0)
            .single()
            .expect("valid local time")
    }

    fn wake_up(repeat: bool) -> SetAlarm {
        SetAlarm {
            id: None,
            time: "07:00".to_string(),
            date: "2030-01-01".to_string(),
            description: "Wake up".to_string(),
            sound_type: Some(SoundType::Normal),
            sound_url: None,
            repeat: Some(repeat),
        }
    }

    fn request(message: SetAlarm) -> ArmRequest {
        message.into_request().expect("valid request")
    }

    #[test]
    fn past_target_arms_nothing() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        let outcome = table.arm(request(wake_up(false)), at(7, 30));
        assert_eq!(outcome, ArmOutcome::DroppedPast);
        assert!(table.is_empty());
        assert!(table.fire_due(at(23, 0)).is_empty());
    }

    #[test]
    fn target_equal_to_now_is_dropped() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        assert_eq!(
            table.arm(request(wake_up(false)), at(7, 0)),
            ArmOutcome::DroppedPast
        );
    }

    #[test]
    fn same_key_keeps_single_pending_timer() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        assert_eq!(table.arm(request(wake_up(false)), at(6, 0)), ArmOutcome::Armed);
        assert_eq!(
            table.arm(request(wake_up(false)), at(6, 1)),
            ArmOutcome::Replaced
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.fire_due(at(7, 0)).len(), 1);
    }

    #[test]
    fn one_shot_alarm_fires_exactly_once() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        table.arm(request(wake_up(false)), at(6, 0));
        let key = wake_up(false).key();
        assert_eq!(table.status(&key), TimerStatus::Armed);

        assert!(table.fire_due(at(6, 59)).is_empty());
        let fired = table.fire_due(at(7, 0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].description, "Wake up");
        assert_eq!(fired[0].time, "07:00");
        assert_eq!(fired[0].date, "2030-01-01");

        assert_eq!(table.status(&key), TimerStatus::Idle);
        assert!(table.fire_due(at(23, 59)).is_empty());
    }

    #[test]
    fn repeating_alarm_fires_again_after_interval() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        table.arm(request(wake_up(true)), at(6, 0));

        assert_eq!(table.fire_due(at(7, 0)).len(), 1);
        assert_eq!(table.next_deadline(), Some(at(7, 10)));
        assert!(table.fire_due(at(7, 9)).is_empty());
        assert_eq!(table.fire_due(at(7, 10)).len(), 1);
        assert_eq!(table.next_deadline(), Some(at(7, 20)));
    }

    #[test]
    fn late_repeat_skips_to_next_future_slot() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        table.arm(request(wake_up(true)), at(6, 0));

        assert_eq!(table.fire_due(at(7, 35)).len(), 1);
        assert_eq!(table.next_deadline(), Some(at(7, 40)));
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        table.arm(request(wake_up(true)), at(6, 0));
        let key = wake_up(true).key();
        assert!(table.cancel(&key));
        assert!(!table.cancel(&key));
        assert!(table.fire_due(at(8, 0)).is_empty());
    }

    #[test]
    fn key_prefers_id_over_composite() {
        assert_eq!(wake_up(false).key().as_str(), "2030-01-01-07:00-Wake up");
        let mut with_id = wake_up(false);
        with_id.id = Some("abc".to_string());
        assert_eq!(with_id.key().as_str(), "abc");
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let mut table = TimerTable::new(chrono::Duration::minutes(10));
        let mut later = wake_up(false);
        later.time = "07:05".to_string();
        later.description = "Second".to_string();
        table.arm(request(later), at(6, 0));
        table.arm(request(wake_up(false)), at(6, 0));

        let fired = table.fire_due(at(8, 0));
        let names = fired.iter().map(|e| e.description.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Wake up", "Second"]);
    }

    #[test]
    fn worker_message_decodes_set_alarm() {
        let json = r#"{"type":"SET_ALARM","time":"07:00","date":"2030-01-01","description":"Wake up","soundType":"deep","repeat":true}"#;
        let message: WorkerMessage = serde_json::from_str(json).expect("decode");
        match message {
            WorkerMessage::SetAlarm(set) => {
                assert_eq!(set.sound_type, Some(SoundType::Deep));
                assert_eq!(set.repeat, Some(true));
                assert_eq!(set.sound_url, None);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn invalid_date_is_rejected_before_arming() {
        let mut message = wake_up(false);
        message.date = "tomorrow".to_string();
        assert!(matches!(
            message.into_request(),
            Err(SchedulerError::InvalidSchedule(ValidationError::InvalidDate(_)))
        ));
    }

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: &AlarmTriggered) -> Result<(), NotifyError> {
            self.seen
                .lock()
                .expect("lock")
                .push(event.description.clone());
            Ok(())
        }
    }

    fn start_worker(
        clock: Arc<ManualClock>,
    ) -> (AlarmScheduler, Arc<RecordingNotifier>, Arc<Broadcaster>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let broadcaster = Arc::new(Broadcaster::new(16));
        let config = SchedulerConfig {
            max_poll: Duration::from_millis(5),
            ..SchedulerConfig::default()
        };
        let scheduler =
            AlarmScheduler::start(config, clock, notifier.clone(), broadcaster.clone())
                .expect("scheduler starts");
        (scheduler, notifier, broadcaster)
    }

    #[test]
    fn worker_fires_and_broadcasts_when_clock_reaches_target() {
        let clock = Arc::new(ManualClock::new(at(6, 0)));
        let (scheduler, notifier, broadcaster) = start_worker(clock.clone());
        let events = broadcaster.subscribe();
        let handle = scheduler.handle();

        handle.set_alarm(wake_up(false)).expect("sent");
        assert_eq!(handle.pending().expect("pending").len(), 1);
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());

        clock.set(at(7, 0));
        let event = events
            .recv_timeout(Duration::from_secs(2))
            .expect("alarm fired");
        assert_eq!(event.description, "Wake up");
        assert_eq!(notifier.seen.lock().expect("lock").len(), 1);

        clock.set(at(12, 0));
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(handle.pending().expect("pending").is_empty());
        assert_eq!(broadcaster.events().latest(), 1);
    }

    #[test]
    fn worker_ignores_past_requests() {
        let clock = Arc::new(ManualClock::new(at(8, 0)));
        let (scheduler, _notifier, broadcaster) = start_worker(clock);
        let handle = scheduler.handle();

        handle.set_alarm(wake_up(false)).expect("sent");
        assert!(handle.pending().expect("pending").is_empty());
        assert_eq!(broadcaster.events().latest(), 0);
    }

    #[test]
    fn worker_acknowledges_cancellation() {
        let clock = Arc::new(ManualClock::new(at(6, 0)));
        let (scheduler, _notifier, broadcaster) = start_worker(clock.clone());
        let handle = scheduler.handle();

        handle.set_alarm(wake_up(true)).expect("sent");
        let key = wake_up(true).key();
        assert!(handle.cancel(&key).expect("ack"));
        assert!(!handle.cancel(&key).expect("ack"));

        clock.set(at(9, 0));
        assert!(handle.pending().expect("pending").is_empty());
        assert_eq!(broadcaster.events().latest(), 0);
    }

    #[test]
    fn handle_reports_unavailable_after_shutdown() {
        let clock = Arc::new(ManualClock::new(at(6, 0)));
        let (scheduler, _notifier, _broadcaster) = start_worker(clock);
        let handle = scheduler.handle();
        drop(scheduler);

        assert!(matches!(
            handle.set_alarm(wake_up(false)),
            Err(SchedulerError::Unavailable)
        ));
    }
}
