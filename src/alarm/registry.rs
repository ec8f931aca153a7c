use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::alarm::model::{
    Alarm, AlarmDraft, AlarmId, AlarmSettings, ValidationError, format_time,
};
use crate::alarm::scheduler::{
    SchedulerError, SchedulerHandle, SetAlarm, TimerKey, next_repeat_deadline,
};
use crate::alarm::store::{AlarmStore, OutOfRange};
use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no alarm with id {0}")]
    NotFound(AlarmId),
    #[error("invalid alarm index {index}; {len} alarm(s) stored")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("alarm {0} is switched off")]
    Inactive(AlarmId),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("alarm store failure: {0:#}")]
    Store(anyhow::Error),
}

impl From<OutOfRange> for RegistryError {
    fn from(OutOfRange { index, len }: OutOfRange) -> Self {
        RegistryError::IndexOutOfRange { index, len }
    }
}

/// Owns the persisted alarm sequence and keeps the scheduler in step with it.
pub struct AlarmRegistry {
    store: AlarmStore,
    settings: AlarmSettings,
    scheduler: SchedulerHandle,
    clock: Arc<dyn Clock>,
}

impl AlarmRegistry {
    pub fn new(store: AlarmStore, scheduler: SchedulerHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings: store.settings(),
            store,
            scheduler,
            clock,
        }
    }

    /// Replaces the stored settings for this run without writing them back.
    pub fn with_settings(mut self, settings: AlarmSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn list(&self) -> Vec<Alarm> {
        self.store.list()
    }

    pub fn settings(&self) -> &AlarmSettings {
        &self.settings
    }

    pub fn submit_alarm(&self, draft: AlarmDraft) -> Result<Alarm, RegistryError> {
        let alarm = draft.into_alarm(AlarmId::new())?;
        self.store
            .insert(alarm.clone())
            .map_err(RegistryError::Store)?;
        info!(
            "added alarm '{}' for {} {}",
            alarm.description,
            alarm.date,
            format_time(alarm.time)
        );
        if alarm.active {
            self.schedule(&alarm);
        }
        Ok(alarm)
    }

    pub fn delete_alarm(&self, id: AlarmId) -> Result<Alarm, RegistryError> {
        let removed = self
            .store
            .remove(id)
            .map_err(RegistryError::Store)?
            .ok_or(RegistryError::NotFound(id))?;
        self.unschedule(&removed);
        Ok(removed)
    }

    pub fn delete_at(&self, position: usize) -> Result<Alarm, RegistryError> {
        let removed = self
            .store
            .remove_at(position)
            .map_err(RegistryError::Store)??;
        self.unschedule(&removed);
        Ok(removed)
    }

    /// Flips `active`. Disabling cancels the pending timer; enabling arms it
    /// again at its next moment (see [`AlarmRegistry::restore_schedule`]).
    pub fn toggle_alarm(&self, id: AlarmId) -> Result<Alarm, RegistryError> {
        let toggled = self
            .store
            .update(id, |alarm| alarm.active = !alarm.active)
            .map_err(RegistryError::Store)?
            .ok_or(RegistryError::NotFound(id))?;
        self.apply_toggle(&toggled);
        Ok(toggled)
    }

    pub fn toggle_at(&self, position: usize) -> Result<Alarm, RegistryError> {
        let toggled = self
            .store
            .update_at(position, |alarm| alarm.active = !alarm.active)
            .map_err(RegistryError::Store)??;
        self.apply_toggle(&toggled);
        Ok(toggled)
    }

    /// Re-arms the alarm's timer at now plus the configured snooze interval.
    /// Switched-off alarms cannot be snoozed.
    pub fn snooze(&self, id: AlarmId) -> Result<DateTime<Local>, RegistryError> {
        let alarm = self.store.get(id).ok_or(RegistryError::NotFound(id))?;
        if !alarm.active {
            return Err(RegistryError::Inactive(id));
        }
        let target = self.clock.now() + self.settings.snooze();
        let mut request = SetAlarm::from_alarm(&alarm).into_request()?;
        request.target = target;
        self.scheduler.arm(request)?;
        info!("snoozed '{}' until {target}", alarm.description);
        Ok(target)
    }

    /// Drops every alarm whose moment has passed, along with its timer.
    pub fn clear_past(&self) -> Result<Vec<Alarm>, RegistryError> {
        let now = self.clock.now();
        let removed = self
            .store
            .retain(|alarm| alarm.target_instant().is_some_and(|target| target > now))
            .map_err(RegistryError::Store)?;
        for alarm in &removed {
            self.unschedule(alarm);
        }
        Ok(removed)
    }

    /// Arms every active alarm from the store. Repeating alarms whose first
    /// moment has passed resume at their next repeat slot.
    pub fn restore_schedule(&self) -> usize {
        let mut armed = 0;
        for alarm in self.store.list().iter().filter(|alarm| alarm.active) {
            match self.arm_next(alarm) {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(SchedulerError::Unavailable) => {
                    error!("scheduler stopped while restoring '{}'", alarm.description);
                    break;
                }
                Err(err) => warn!("skipping stored alarm '{}': {err}", alarm.description),
            }
        }
        info!("restored {armed} pending alarm(s)");
        armed
    }

    /// Arms `alarm` at its stored moment, or, for a repeating alarm whose
    /// moment has passed, at the next repeat slot after now. Returns false
    /// when a one-shot alarm already lies in the past.
    fn arm_next(&self, alarm: &Alarm) -> Result<bool, SchedulerError> {
        let mut request = SetAlarm::from_alarm(alarm).into_request()?;
        let now = self.clock.now();
        if request.target <= now {
            if !alarm.repeat {
                return Ok(false);
            }
            request.target =
                next_repeat_deadline(request.target, now, self.settings.repeat_interval());
        }
        self.scheduler.arm(request)?;
        Ok(true)
    }

    fn apply_toggle(&self, alarm: &Alarm) {
        if alarm.active {
            self.schedule(alarm);
        } else {
            self.unschedule(alarm);
        }
    }

    fn schedule(&self, alarm: &Alarm) {
        match self.arm_next(alarm) {
            Ok(true) => {}
            Ok(false) => debug!("'{}' lies in the past; not armed", alarm.description),
            Err(err) => error!("unable to schedule '{}': {err}", alarm.description),
        }
    }

    fn unschedule(&self, alarm: &Alarm) {
        let key = TimerKey::new(alarm.id.to_string());
        match self.scheduler.cancel(&key) {
            Ok(cancelled) => debug!("timer for '{}' cancelled={cancelled}", alarm.description),
            Err(err) => warn!("timer for '{}' may still fire: {err}", alarm.description),
        }
    }
}

pub fn render(alarms: &[Alarm]) -> String {
    if alarms.is_empty() {
        return "No alarms set.\n".to_string();
    }

    let mut out = String::new();
    for (index, alarm) in alarms.iter().enumerate() {
        let _ = writeln!(
            out,
            "[{index}] {}{}",
            alarm.description,
            if alarm.active { "" } else { " (off)" }
        );
        let mut sound = alarm.sound_type.as_str().to_string();
        if let Some(name) = alarm.sound_url() {
            sound.push_str(" - ");
            sound.push_str(name);
        }
        let _ = writeln!(
            out,
            "    {} at {} | sound: {sound}{}",
            alarm.date.format("%Y-%m-%d"),
            format_time(alarm.time),
            if alarm.repeat { " | repeats" } else { "" }
        );
        let _ = writeln!(out, "    id: {}", alarm.id);
    }
    out
}
