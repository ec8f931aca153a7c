use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use log::info;
use thiserror::Error;

use crate::alarm::model::{
    Alarm, AlarmId, AlarmSettings, load_store_file, save_store_file,
};

/// A positional operation named a slot past the end of the sequence.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[error("position {index} is out of range; {len} alarm(s) stored")]
pub struct OutOfRange {
    pub index: usize,
    pub len: usize,
}

#[derive(Debug)]
struct StoreState {
    settings: AlarmSettings,
    alarms: Vec<Alarm>,
}

/// File-backed alarm store. Every mutation runs under one lock and is written
/// to disk before it becomes visible, so a failed write leaves the previous
/// sequence in place.
#[derive(Debug)]
pub struct AlarmStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl AlarmStore {
    pub fn open(path: &Path) -> Result<Self> {
        let (settings, alarms, migrated) = if path.exists() {
            let file = load_store_file(path)?;
            (file.settings, file.alarms, file.migrated)
        } else {
            let settings = AlarmSettings::default();
            save_store_file(path, &[], &settings)?;
            info!("created empty alarm store at {}", path.display());
            (settings, Vec::new(), false)
        };

        let store = Self {
            path: path.to_path_buf(),
            state: Mutex::new(StoreState { settings, alarms }),
        };
        // Ids assigned at load time must reach disk to stay stable.
        if migrated {
            store.persist(&store.lock())?;
            info!("migrated alarm store {} to version 1", path.display());
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> AlarmSettings {
        self.lock().settings.clone()
    }

    pub fn list(&self) -> Vec<Alarm> {
        self.lock().alarms.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().alarms.is_empty()
    }

    pub fn get(&self, id: AlarmId) -> Option<Alarm> {
        self.lock().alarms.iter().find(|alarm| alarm.id == id).cloned()
    }

    pub fn insert(&self, alarm: Alarm) -> Result<()> {
        self.mutate(|alarms| {
            alarms.push(alarm);
        })
    }

    pub fn remove(&self, id: AlarmId) -> Result<Option<Alarm>> {
        self.mutate(|alarms| {
            let position = alarms.iter().position(|alarm| alarm.id == id)?;
            Some(alarms.remove(position))
        })
    }

    /// Removes the record at `position`. The bounds check runs under the same
    /// lock as the removal.
    pub fn remove_at(&self, position: usize) -> Result<Result<Alarm, OutOfRange>> {
        self.mutate(|alarms| {
            let len = alarms.len();
            if position < len {
                Ok(alarms.remove(position))
            } else {
                Err(OutOfRange { index: position, len })
            }
        })
    }

    pub fn update<F>(&self, id: AlarmId, change: F) -> Result<Option<Alarm>>
    where
        F: FnOnce(&mut Alarm),
    {
        self.mutate(|alarms| {
            let alarm = alarms.iter_mut().find(|alarm| alarm.id == id)?;
            change(alarm);
            Some(alarm.clone())
        })
    }

    pub fn update_at<F>(&self, position: usize, change: F) -> Result<Result<Alarm, OutOfRange>>
    where
        F: FnOnce(&mut Alarm),
    {
        self.mutate(|alarms| {
            let len = alarms.len();
            match alarms.get_mut(position) {
                Some(alarm) => {
                    change(alarm);
                    Ok(alarm.clone())
                }
                None => Err(OutOfRange { index: position, len }),
            }
        })
    }

    /// Keeps alarms for which `keep` returns true and hands back the rest.
    pub fn retain<F>(&self, mut keep: F) -> Result<Vec<Alarm>>
    where
        F: FnMut(&Alarm) -> bool,
    {
        self.mutate(|alarms| {
            let (kept, removed): (Vec<Alarm>, Vec<Alarm>) =
                alarms.drain(..).partition(|alarm| keep(alarm));
            *alarms = kept;
            removed
        })
    }

    fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Alarm>) -> T,
    {
        let mut guard = self.lock();
        let mut next = guard.alarms.clone();
        let result = change(&mut next);
        save_store_file(&self.path, &next, &guard.settings)?;
        guard.alarms = next;
        Ok(result)
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        save_store_file(&self.path, &state.alarms, &state.settings)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
