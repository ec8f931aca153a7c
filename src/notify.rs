use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::alarm::scheduler::AlarmTriggered;
use crate::clock::Clock;

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification permission denied")]
    PermissionDenied,
    #[error("notification platform failed: {0}")]
    Platform(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotification {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub require_interaction: bool,
}

pub trait NotificationPlatform: Send + Sync {
    fn request_permission(&self) -> Permission;
    fn show(&self, notification: &SystemNotification) -> Result<(), NotifyError>;
}

/// Headless platform: notifications become log records at info level.
#[derive(Debug, Clone, Copy)]
pub struct LogPlatform {
    enabled: bool,
}

impl LogPlatform {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl NotificationPlatform for LogPlatform {
    fn request_permission(&self) -> Permission {
        if self.enabled {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }

    fn show(&self, notification: &SystemNotification) -> Result<(), NotifyError> {
        info!(
            "notification [{}] {}: {}{}",
            notification.tag,
            notification.title,
            notification.body,
            if notification.require_interaction {
                " (requires interaction)"
            } else {
                ""
            }
        );
        Ok(())
    }
}

/// Native desktop notifications through the session's notification server.
/// Alarms stay on screen until dismissed.
#[cfg(feature = "desktop-notifications")]
#[derive(Debug, Clone, Copy)]
pub struct DesktopPlatform {
    enabled: bool,
}

#[cfg(feature = "desktop-notifications")]
impl DesktopPlatform {
    pub const APP_NAME: &'static str = "alarmclock";

    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[cfg(feature = "desktop-notifications")]
impl NotificationPlatform for DesktopPlatform {
    fn request_permission(&self) -> Permission {
        if self.enabled {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }

    fn show(&self, notification: &SystemNotification) -> Result<(), NotifyError> {
        let mut native = notify_rust::Notification::new();
        native
            .appname(Self::APP_NAME)
            .summary(&notification.title)
            .body(&notification.body);
        if notification.require_interaction {
            native.timeout(notify_rust::Timeout::Never);
            #[cfg(all(unix, not(target_os = "macos")))]
            native
                .urgency(notify_rust::Urgency::Critical)
                .hint(notify_rust::Hint::Resident(true));
        }
        native
            .show()
            .map(|_| ())
            .map_err(|err| NotifyError::Platform(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutput {
    Log,
    Desktop,
}

/// Builds the notification platform for `output`. With `enabled` false every
/// backend answers the permission request with [`Permission::Denied`].
pub fn open_platform(output: NotificationOutput, enabled: bool) -> Arc<dyn NotificationPlatform> {
    match output {
        NotificationOutput::Log => Arc::new(LogPlatform::new(enabled)),
        NotificationOutput::Desktop => open_desktop_platform(enabled),
    }
}

#[cfg(feature = "desktop-notifications")]
fn open_desktop_platform(enabled: bool) -> Arc<dyn NotificationPlatform> {
    Arc::new(DesktopPlatform::new(enabled))
}

#[cfg(not(feature = "desktop-notifications"))]
fn open_desktop_platform(enabled: bool) -> Arc<dyn NotificationPlatform> {
    log::warn!("built without the `desktop-notifications` feature; logging notifications instead");
    Arc::new(LogPlatform::new(enabled))
}

/// The platform is asked at most once; later calls reuse the first answer.
#[derive(Debug, Default)]
pub struct PermissionGate {
    decision: OnceLock<Permission>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, platform: &dyn NotificationPlatform) -> Permission {
        *self.decision.get_or_init(|| platform.request_permission())
    }

    pub fn current(&self) -> Option<Permission> {
        self.decision.get().copied()
    }

    pub fn is_granted(&self) -> bool {
        self.current() == Some(Permission::Granted)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &AlarmTriggered) -> Result<(), NotifyError>;
}

pub struct SystemNotifier {
    platform: Arc<dyn NotificationPlatform>,
    permission: Arc<PermissionGate>,
    clock: Arc<dyn Clock>,
}

impl SystemNotifier {
    pub fn new(
        platform: Arc<dyn NotificationPlatform>,
        permission: Arc<PermissionGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            platform,
            permission,
            clock,
        }
    }
}

impl Notifier for SystemNotifier {
    fn notify(&self, event: &AlarmTriggered) -> Result<(), NotifyError> {
        if !self.permission.is_granted() {
            return Err(NotifyError::PermissionDenied);
        }
        self.platform.show(&SystemNotification {
            title: "Alarm".to_string(),
            body: event.description.clone(),
            tag: format!("alarm-{}", self.clock.now().timestamp_millis()),
            require_interaction: true,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub triggered_at: DateTime<Local>,
    #[serde(flatten)]
    pub event: AlarmTriggered,
}

#[derive(Debug)]
struct EventLogInner {
    next_seq: u64,
    entries: VecDeque<EventRecord>,
}

/// Bounded, sequenced record of fired alarms. Polling clients read it with
/// [`EventLog::since`]; it doubles as the alarm history.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    inner: Mutex<EventLogInner>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(EventLogInner {
                next_seq: 1,
                entries: VecDeque::new(),
            }),
        }
    }

    pub fn append(&self, event: AlarmTriggered, triggered_at: DateTime<Local>) -> u64 {
        let mut inner = lock(&self.inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        if inner.entries.len() == self.capacity {
            let _ = inner.entries.pop_front();
        }
        inner.entries.push_back(EventRecord {
            seq,
            triggered_at,
            event,
        });
        seq
    }

    pub fn since(&self, seq: u64) -> Vec<EventRecord> {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|record| record.seq > seq)
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<EventRecord> {
        lock(&self.inner).entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> u64 {
        lock(&self.inner).next_seq - 1
    }

    pub fn clear(&self) -> usize {
        let mut inner = lock(&self.inner);
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

#[derive(Debug, Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Sender<AlarmTriggered>>>,
    log: EventLog,
}

impl Broadcaster {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            log: EventLog::new(log_capacity),
        }
    }

    pub fn subscribe(&self) -> Receiver<AlarmTriggered> {
        let (tx, rx) = unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Fans the event out to every live subscriber and records it. Returns the
    /// number of subscribers that accepted it; dropped receivers are pruned.
    pub fn broadcast(&self, event: &AlarmTriggered, at: DateTime<Local>) -> usize {
        let seq = self.log.append(event.clone(), at);
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            "broadcast event #{seq} '{}' to {} subscriber(s)",
            event.description,
            subscribers.len()
        );
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn events(&self) -> &EventLog {
        &self.log
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::alarm::model::SoundType;
    use crate::clock::{ManualClock, SystemClock};

    fn triggered(description: &str) -> AlarmTriggered {
        AlarmTriggered {
            id: None,
            description: description.to_string(),
            time: "07:00".to_string(),
            date: "2030-01-01".to_string(),
            sound_type: Some(SoundType::Normal),
            sound_url: None,
        }
    }

    struct CountingPlatform {
        answer: Permission,
        asked: AtomicUsize,
        shown: AtomicUsize,
        tags: Mutex<Vec<String>>,
    }

    fn counting(answer: Permission) -> CountingPlatform {
        CountingPlatform {
            answer,
            asked: AtomicUsize::new(0),
            shown: AtomicUsize::new(0),
            tags: Mutex::new(Vec::new()),
        }
    }

    impl NotificationPlatform for CountingPlatform {
        fn request_permission(&self) -> Permission {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }

        fn show(&self, notification: &SystemNotification) -> Result<(), NotifyError> {
            assert!(notification.require_interaction);
            self.shown.fetch_add(1, Ordering::SeqCst);
            lock(&self.tags).push(notification.tag.clone());
            Ok(())
        }
    }

    #[test]
    fn permission_is_requested_once() {
        let platform = counting(Permission::Granted);
        let gate = PermissionGate::new();
        assert_eq!(gate.current(), None);
        assert_eq!(gate.request(&platform), Permission::Granted);
        assert_eq!(gate.request(&platform), Permission::Granted);
        assert_eq!(platform.asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifier_refuses_without_permission() {
        let platform = Arc::new(counting(Permission::Denied));
        let gate = Arc::new(PermissionGate::new());
        gate.request(platform.as_ref());
        let notifier = SystemNotifier::new(platform.clone(), gate, Arc::new(SystemClock));

        let err = notifier
            .notify(&triggered("Wake up"))
            .expect_err("denied permission");
        assert!(matches!(err, NotifyError::PermissionDenied));
        assert_eq!(platform.shown.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn notifier_shows_persistent_notification_when_granted() {
        let platform = Arc::new(counting(Permission::Granted));
        let gate = Arc::new(PermissionGate::new());
        gate.request(platform.as_ref());
        let notifier = SystemNotifier::new(platform.clone(), gate, Arc::new(SystemClock));

        notifier.notify(&triggered("Wake up")).expect("shown");
        assert_eq!(platform.shown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notification_tag_follows_injected_clock() {
        let platform = Arc::new(counting(Permission::Granted));
        let gate = Arc::new(PermissionGate::new());
        gate.request(platform.as_ref());
        let start = Local
            .with_ymd_and_hms(2030, 1, 1, 7, 0, 0)
            .single()
            .expect("valid local time");
        let clock = Arc::new(ManualClock::new(start));
        let notifier = SystemNotifier::new(platform.clone(), gate, clock.clone());

        notifier.notify(&triggered("Wake up")).expect("shown");
        clock.advance(chrono::Duration::seconds(5));
        notifier.notify(&triggered("Wake up")).expect("shown");

        let later = start + chrono::Duration::seconds(5);
        assert_eq!(
            *lock(&platform.tags),
            vec![
                format!("alarm-{}", start.timestamp_millis()),
                format!("alarm-{}", later.timestamp_millis()),
            ]
        );
    }

    #[test]
    fn log_output_follows_notification_switch() {
        let on = open_platform(NotificationOutput::Log, true);
        let off = open_platform(NotificationOutput::Log, false);
        assert_eq!(on.request_permission(), Permission::Granted);
        assert_eq!(off.request_permission(), Permission::Denied);
    }

    #[cfg(not(feature = "desktop-notifications"))]
    #[test]
    fn desktop_output_falls_back_to_log_without_feature() {
        let platform = open_platform(NotificationOutput::Desktop, true);
        assert_eq!(platform.request_permission(), Permission::Granted);
        let notification = SystemNotification {
            title: "Alarm".to_string(),
            body: "Wake up".to_string(),
            tag: "alarm-1".to_string(),
            require_interaction: true,
        };
        platform.show(&notification).expect("logged");
    }

    #[cfg(feature = "desktop-notifications")]
    #[test]
    fn desktop_output_honours_notification_switch() {
        let platform = open_platform(NotificationOutput::Desktop, false);
        assert_eq!(platform.request_permission(), Permission::Denied);
    }

    #[test]
    fn broadcast_reaches_subscribers_and_prunes_dropped_ones() {
        let broadcaster = Broadcaster::new(8);
        let kept = broadcaster.subscribe();
        let dropped = broadcaster.subscribe();
        drop(dropped);

        let delivered = broadcaster.broadcast(&triggered("Wake up"), Local::now());
        assert_eq!(delivered, 1);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(kept.try_recv().expect("event").description, "Wake up");
    }

    #[test]
    fn event_log_is_bounded_and_sequenced() {
        let log = EventLog::new(2);
        let now = Local::now();
        assert_eq!(log.latest(), 0);
        log.append(triggered("a"), now);
        log.append(triggered("b"), now);
        log.append(triggered("c"), now);

        assert_eq!(log.latest(), 3);
        let names = log
            .entries()
            .into_iter()
            .map(|record| record.event.description)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(log.since(2).len(), 1);
        assert_eq!(log.since(3).len(), 0);

        assert_eq!(log.clear(), 2);
        assert!(log.entries().is_empty());
        assert_eq!(log.latest(), 3);
    }

    #[test]
    fn event_record_serializes_worker_message_shape() {
        let log = EventLog::new(4);
        log.append(triggered("Wake up"), Local::now());
        let value = serde_json::to_value(&log.entries()[0]).expect("encode");
        assert_eq!(value["type"], "ALARM_TRIGGERED");
        assert_eq!(value["seq"], 1);
        assert_eq!(value["description"], "Wake up");
        assert_eq!(value["soundType"], "normal");
    }
}
