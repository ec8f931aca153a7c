use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(Uuid);

impl AlarmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(input: &str) -> Option<Self> {
        Uuid::parse_str(input.trim()).ok().map(Self)
    }
}

impl Default for AlarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundType {
    #[default]
    Normal,
    Deep,
    Custom,
}

impl SoundType {
    pub fn as_str(self) -> &'static str {
        match self {
            SoundType::Normal => "normal",
            SoundType::Deep => "deep",
            SoundType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    // Records written before ids existed get one on first load.
    #[serde(default = "AlarmId::new")]
    pub id: AlarmId,
    pub description: String,
    pub date: NaiveDate,
    #[serde(with = "wall_clock")]
    pub time: NaiveTime,
    #[serde(default)]
    pub sound_type: SoundType,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Alarm {
    pub fn local_datetime(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    pub fn target_instant(&self) -> Option<DateTime<Local>> {
        resolve_local_datetime(&Local, self.local_datetime())
    }

    pub fn composite_key(&self) -> String {
        composite_key(self.date, self.time, &self.description)
    }

    /// The sound identifier the cue should use, only present for custom sounds.
    pub fn sound_url(&self) -> Option<&str> {
        match self.sound_type {
            SoundType::Custom => self.sound.as_deref(),
            _ => None,
        }
    }
}

/// Raw form values as submitted by a client. Every field defaults so that a
/// missing field surfaces as a [`ValidationError`] instead of a decode error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlarmDraft {
    pub description: String,
    pub date: String,
    pub time: String,
    pub sound_type: SoundType,
    pub sound: Option<String>,
    pub repeat: bool,
    pub active: Option<bool>,
}

impl AlarmDraft {
    pub fn into_alarm(self, id: AlarmId) -> Result<Alarm, ValidationError> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(ValidationError::MissingField("description"));
        }
        if self.date.trim().is_empty() {
            return Err(ValidationError::MissingField("date"));
        }
        if self.time.trim().is_empty() {
            return Err(ValidationError::MissingField("time"));
        }
        let date = parse_date(&self.date)?;
        let time = parse_time(&self.time)?;

        let sound = match self.sound_type {
            SoundType::Custom => self
                .sound
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            _ => None,
        };

        Ok(Alarm {
            id,
            description: description.to_string(),
            date,
            time,
            sound_type: self.sound_type,
            sound,
            repeat: self.repeat,
            active: self.active.unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmSettings {
    #[serde(default = "default_repeat_interval_ms")]
    pub repeat_interval_ms: u64,
    #[serde(default = "default_snooze_ms")]
    pub snooze_ms: u64,
    #[serde(default = "default_cue_duration_ms")]
    pub cue_duration_ms: u64,
    #[serde(default = "default_toast_duration_ms")]
    pub toast_duration_ms: u64,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            repeat_interval_ms: default_repeat_interval_ms(),
            snooze_ms: default_snooze_ms(),
            cue_duration_ms: default_cue_duration_ms(),
            toast_duration_ms: default_toast_duration_ms(),
        }
    }
}

impl AlarmSettings {
    pub fn repeat_interval(&self) -> chrono::Duration {
        clamp_ms_to_duration(self.repeat_interval_ms.max(1))
    }

    pub fn snooze(&self) -> chrono::Duration {
        clamp_ms_to_duration(self.snooze_ms.max(1))
    }

    pub fn cue_duration(&self) -> Duration {
        Duration::from_millis(self.cue_duration_ms)
    }

    pub fn toast_duration(&self) -> Duration {
        Duration::from_millis(self.toast_duration_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlarmStoreFile {
    pub version: u32,
    pub settings: AlarmSettings,
    pub alarms: Vec<Alarm>,
    /// Set when the input was the bare-array layout or carried records
    /// without ids; the file on disk no longer matches what was parsed.
    pub migrated: bool,
}

pub fn load_store_file(path: &Path) -> Result<AlarmStoreFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read alarm store {}", path.display()))?;
    parse_store_text(&content)
}

pub fn parse_store_text(content: &str) -> Result<AlarmStoreFile> {
    let value = serde_json::from_str::<Value>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    let records = match &value {
        Value::Array(records) => Some(records),
        other => other.get("alarms").and_then(Value::as_array),
    };
    let missing_ids = records.is_some_and(|records| {
        records
            .iter()
            .any(|record| record.get("id").is_none_or(Value::is_null))
    });
    let migrated = value.is_array() || missing_ids;

    // A bare array is the layout the first iterations of the service wrote.
    let raw = if value.is_array() {
        StoreFileRaw {
            version: STORE_VERSION,
            settings: AlarmSettings::default(),
            alarms: serde_json::from_value(value)
                .map_err(|err| anyhow::anyhow!("invalid alarm record: {err}"))?,
        }
    } else {
        serde_json::from_value::<StoreFileRaw>(value)
            .map_err(|err| anyhow::anyhow!("invalid alarm store: {err}"))?
    };

    if raw.version != STORE_VERSION {
        bail!(
            "unsupported alarm store version {}; expected version {STORE_VERSION}",
            raw.version
        );
    }

    let mut ids = HashSet::new();
    let mut alarms = Vec::with_capacity(raw.alarms.len());
    for mut alarm in raw.alarms {
        if !ids.insert(alarm.id) {
            bail!("duplicate alarm id found: {}", alarm.id);
        }
        if alarm.description.trim().is_empty() {
            bail!("alarm '{}' has an empty description", alarm.id);
        }
        if alarm.sound_type != SoundType::Custom {
            alarm.sound = None;
        }
        alarms.push(alarm);
    }

    Ok(AlarmStoreFile {
        version: raw.version,
        settings: raw.settings,
        alarms,
        migrated,
    })
}

pub fn save_store_file(path: &Path, alarms: &[Alarm], settings: &AlarmSettings) -> Result<()> {
    let payload = json!({
        "version": STORE_VERSION,
        "settings": settings,
        "alarms": alarms,
    });
    let text = serde_json::to_string_pretty(&payload)?;

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    fs::write(&staging, format!("{text}\n"))
        .with_context(|| format!("unable to write alarm store {}", path.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("unable to replace alarm store {}", path.display()))?;
    Ok(())
}

pub fn parse_date(input: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(input.to_string()))
}

pub fn parse_time(input: &str) -> Result<NaiveTime, ValidationError> {
    let trimmed = input.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| ValidationError::InvalidTime(input.to_string()))
}

pub fn format_time(time: NaiveTime) -> String {
    if time.second() == 0 && time.nanosecond() == 0 {
        time.format("%H:%M").to_string()
    } else {
        time.format("%H:%M:%S").to_string()
    }
}

pub fn composite_key(date: NaiveDate, time: NaiveTime, description: &str) -> String {
    format!("{}-{}-{}", date.format("%Y-%m-%d"), format_time(time), description)
}

pub(crate) fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

pub(crate) fn clamp_ms_to_duration(ms: u64) -> chrono::Duration {
    let ms_i64 = i64::try_from(ms).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(ms_i64)
}

#[derive(Debug, Deserialize)]
struct StoreFileRaw {
    version: u32,
    #[serde(default)]
    settings: AlarmSettings,
    #[serde(default)]
    alarms: Vec<Alarm>,
}

fn default_active() -> bool {
    true
}

fn default_repeat_interval_ms() -> u64 {
    10 * 60 * 1_000
}

fn default_snooze_ms() -> u64 {
    10 * 60 * 1_000
}

fn default_cue_duration_ms() -> u64 {
    10_000
}

fn default_toast_duration_ms() -> u64 {
    5_000
}

mod wall_clock {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_time(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono_tz::America::New_York;
    use tempfile::tempdir;

    use super::*;

    fn wake_up_draft() -> AlarmDraft {
        AlarmDraft {
            description: "Wake up".to_string(),
            date: "2030-01-01".to_string(),
            time: "07:00".to_string(),
            ..AlarmDraft::default()
        }
    }

    #[test]
    fn parses_versioned_store() {
        let json = r#"
{
  "version": 1,
  "settings": {
    "repeat_interval_ms": 7200000
  },
  "alarms": [
    {
      "id": "6f1c1f43-46a4-4c41-9d0c-2bb0fbf1a2a1",
      "description": "Wake up",
      "date": "2030-01-01",
      "time": "07:00",
      "soundType": "deep",
      "repeat": true
    }
  ]
}
"#;

        let store = parse_store_text(json).expect("valid store");
        assert_eq!(store.version, 1);
        assert_eq!(store.settings.repeat_interval_ms, 7_200_000);
        assert_eq!(store.settings.snooze_ms, 600_000);
        assert!(!store.migrated);
        assert_eq!(store.alarms.len(), 1);
        let alarm = &store.alarms[0];
        assert_eq!(alarm.sound_type, SoundType::Deep);
        assert!(alarm.repeat);
        assert!(alarm.active);
        assert_eq!(alarm.time, NaiveTime::from_hms_opt(7, 0, 0).expect("time"));
    }

    #[test]
    fn bare_array_store_gets_ids_assigned() {
        let json = r#"[
            {"description": "Old", "date": "2030-05-01", "time": "08:15", "soundType": "normal", "sound": null, "repeat": false}
        ]"#;
        let store = parse_store_text(json).expect("legacy layout");
        assert!(store.migrated);
        assert_eq!(store.alarms.len(), 1);
        assert_eq!(store.alarms[0].description, "Old");
        assert_eq!(store.settings, AlarmSettings::default());
    }

    #[test]
    fn rejects_unknown_version() {
        let err = parse_store_text(r#"{"version": 7, "alarms": []}"#)
            .expect_err("version 7 should fail");
        assert!(err.to_string().contains("unsupported alarm store version"));
    }

    #[test]
    fn rejects_malformed_json_with_position() {
        let err = parse_store_text("{ nope").expect_err("malformed");
        assert!(err.to_string().contains("invalid JSON at line 1"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    {"id": "6f1c1f43-46a4-4c41-9d0c-2bb0fbf1a2a1", "description": "a", "date": "2030-01-01", "time": "07:00"},
    {"id": "6f1c1f43-46a4-4c41-9d0c-2bb0fbf1a2a1", "description": "b", "date": "2030-01-01", "time": "08:00"}
  ]
}
"#;
        let err = parse_store_text(json).expect_err("duplicate ids should fail");
        assert!(err.to_string().contains("duplicate alarm id"));
    }

    #[test]
    fn saved_store_reloads_identical_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("alarms.json");
        let mut custom = wake_up_draft();
        custom.sound_type = SoundType::Custom;
        custom.sound = Some("rooster.mp3".to_string());
        custom.time = "06:45:30".to_string();
        let alarms = vec![
            wake_up_draft().into_alarm(AlarmId::new()).expect("valid"),
            custom.into_alarm(AlarmId::new()).expect("valid"),
        ];
        let settings = AlarmSettings {
            repeat_interval_ms: 120_000,
            ..AlarmSettings::default()
        };

        save_store_file(&path, &alarms, &settings).expect("save");
        let reloaded = load_store_file(&path).expect("load");
        assert_eq!(reloaded.alarms, alarms);
        assert_eq!(reloaded.settings, settings);
    }

    #[test]
    fn draft_requires_description_date_and_time() {
        let mut draft = wake_up_draft();
        draft.description = "   ".to_string();
        assert_eq!(
            draft.into_alarm(AlarmId::new()),
            Err(ValidationError::MissingField("description"))
        );

        let mut draft = wake_up_draft();
        draft.date.clear();
        assert_eq!(
            draft.into_alarm(AlarmId::new()),
            Err(ValidationError::MissingField("date"))
        );

        let mut draft = wake_up_draft();
        draft.time.clear();
        assert_eq!(
            draft.into_alarm(AlarmId::new()),
            Err(ValidationError::MissingField("time"))
        );
    }

    #[test]
    fn draft_rejects_unparsable_values() {
        let mut draft = wake_up_draft();
        draft.date = "01/02/2030".to_string();
        assert!(matches!(
            draft.into_alarm(AlarmId::new()),
            Err(ValidationError::InvalidDate(_))
        ));

        let mut draft = wake_up_draft();
        draft.time = "25:00".to_string();
        assert!(matches!(
            draft.into_alarm(AlarmId::new()),
            Err(ValidationError::InvalidTime(_))
        ));
    }

    #[test]
    fn sound_is_kept_only_for_custom_alarms() {
        let mut draft = wake_up_draft();
        draft.sound = Some("rooster.mp3".to_string());
        let alarm = draft.into_alarm(AlarmId::new()).expect("valid");
        assert_eq!(alarm.sound, None);

        let mut draft = wake_up_draft();
        draft.sound_type = SoundType::Custom;
        draft.sound = Some(String::new());
        let alarm = draft.into_alarm(AlarmId::new()).expect("valid");
        assert_eq!(alarm.sound, None);
        assert_eq!(alarm.sound_url(), None);
    }

    #[test]
    fn draft_deserializes_with_missing_fields() {
        let draft: AlarmDraft =
            serde_json::from_str(r#"{"date": "2030-01-01", "time": "07:00"}"#).expect("decode");
        assert_eq!(
            draft.into_alarm(AlarmId::new()),
            Err(ValidationError::MissingField("description"))
        );
    }

    #[test]
    fn wire_format_uses_camel_case_and_short_time() {
        let alarm = wake_up_draft().into_alarm(AlarmId::new()).expect("valid");
        let value = serde_json::to_value(&alarm).expect("encode");
        assert_eq!(value["time"], "07:00");
        assert_eq!(value["date"], "2030-01-01");
        assert_eq!(value["soundType"], "normal");
        assert_eq!(value["active"], true);
    }

    #[test]
    fn composite_key_joins_date_time_and_description() {
        let alarm = wake_up_draft().into_alarm(AlarmId::new()).expect("valid");
        assert_eq!(alarm.composite_key(), "2030-01-01-07:00-Wake up");
    }

    #[test]
    fn spring_forward_gap_has_no_instant() {
        let naive = NaiveDate::from_ymd_opt(2026, 3, 8)
            .expect("date")
            .and_hms_opt(2, 30, 0)
            .expect("time");
        assert!(resolve_local_datetime(&New_York, naive).is_none());
    }

    #[test]
    fn fall_back_overlap_chooses_first_instance() {
        let naive = NaiveDate::from_ymd_opt(2026, 11, 1)
            .expect("date")
            .and_hms_opt(1, 30, 0)
            .expect("time");
        let expected = match New_York.from_local_datetime(&naive) {
            LocalResult::Ambiguous(first, _second) => first,
            _ => panic!("expected ambiguous local time"),
        };
        assert_eq!(resolve_local_datetime(&New_York, naive), Some(expected));
    }
}
