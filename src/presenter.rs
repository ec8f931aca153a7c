use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use crate::alarm::model::{AlarmSettings, SoundType};
use crate::alarm::scheduler::AlarmTriggered;
use crate::audio::{AudioEngine, AudioSink, Cue, LogSink};
use crate::clock::Clock;
use crate::notify::{NotificationPlatform, Permission, PermissionGate};
use crate::sounds::SoundLibrary;

pub const PERMISSION_HINT: &str = "Please enable notifications to receive alarm alerts";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AudioOutput {
    Log,
    Rodio,
}

#[derive(Debug, Clone)]
pub struct PresenterConfig {
    pub audio_output: AudioOutput,
    pub cue_duration: Duration,
    pub toast_duration: Duration,
}

impl PresenterConfig {
    pub fn from_settings(settings: &AlarmSettings, audio_output: AudioOutput) -> Self {
        Self {
            audio_output,
            cue_duration: settings.cue_duration(),
            toast_duration: settings.toast_duration(),
        }
    }
}

#[derive(Debug, Clone)]
struct Banner {
    message: String,
    hide_at: DateTime<Local>,
}

/// Single transient banner. A new message replaces the current one and
/// restarts its timer.
#[derive(Debug)]
pub struct Toast {
    duration: chrono::Duration,
    banner: Mutex<Option<Banner>>,
}

impl Toast {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration: chrono::Duration::from_std(duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            banner: Mutex::new(None),
        }
    }

    pub fn show(&self, message: &str, now: DateTime<Local>) {
        let mut banner = self.banner.lock().unwrap_or_else(PoisonError::into_inner);
        *banner = Some(Banner {
            message: message.to_string(),
            hide_at: now + self.duration,
        });
    }

    pub fn visible(&self, now: DateTime<Local>) -> Option<String> {
        let banner = self.banner.lock().unwrap_or_else(PoisonError::into_inner);
        banner
            .as_ref()
            .filter(|banner| now < banner.hide_at)
            .map(|banner| banner.message.clone())
    }
}

type SinkFactory = Box<dyn Fn() -> Box<dyn AudioSink> + Send + Sync>;

/// Foreground side of an alarm: the audible cue and the toast banner. The
/// audio engine is only opened on the first cue.
pub struct Presenter {
    audio: OnceLock<AudioEngine>,
    open_sink: SinkFactory,
    cue_duration: Duration,
    toast: Toast,
    sounds: SoundLibrary,
    platform: Arc<dyn NotificationPlatform>,
    permission: Arc<PermissionGate>,
    clock: Arc<dyn Clock>,
}

impl Presenter {
    pub fn new(
        config: PresenterConfig,
        sounds: SoundLibrary,
        platform: Arc<dyn NotificationPlatform>,
        permission: Arc<PermissionGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let output = config.audio_output;
        Self {
            audio: OnceLock::new(),
            open_sink: Box::new(move || open_sink(output)),
            cue_duration: config.cue_duration,
            toast: Toast::new(config.toast_duration),
            sounds,
            platform,
            permission,
            clock,
        }
    }

    pub fn with_sink_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn AudioSink> + Send + Sync + 'static,
    {
        self.open_sink = Box::new(factory);
        self
    }

    pub fn request_permission(&self) -> Permission {
        let permission = self.permission.request(self.platform.as_ref());
        if permission == Permission::Denied {
            self.show_toast(PERMISSION_HINT);
        }
        permission
    }

    pub fn play_cue(&self, sound_type: SoundType, sound_url: Option<&str>) -> Result<Cue> {
        let engine = self.engine();
        let asset = sound_url.and_then(|url| self.sounds.resolve(url));
        if sound_type == SoundType::Custom && asset.is_none() {
            debug!("custom sound {sound_url:?} unavailable; using default tone");
        }
        let cue = engine.cue_for(sound_type, asset.as_deref());
        engine.play(&cue)?;
        Ok(cue)
    }

    pub fn show_toast(&self, message: &str) {
        info!("toast: {message}");
        self.toast.show(message, self.clock.now());
    }

    pub fn visible_toast(&self) -> Option<String> {
        self.toast.visible(self.clock.now())
    }

    pub fn audio_ready(&self) -> bool {
        self.audio.get().is_some()
    }

    pub fn present(&self, event: &AlarmTriggered) {
        let sound_type = event.sound_type.unwrap_or_default();
        if let Err(err) = self.play_cue(sound_type, event.sound_url.as_deref()) {
            warn!("cue for '{}' failed: {err:#}", event.description);
        }
        self.show_toast(&format!("Alarm: {}", event.description));
        if !self.permission.is_granted() {
            debug!("no system notification for '{}'; toast only", event.description);
        }
    }

    fn engine(&self) -> &AudioEngine {
        self.audio
            .get_or_init(|| AudioEngine::new((self.open_sink)(), self.cue_duration))
    }
}

/// Runs the presenter against a broadcaster subscription until the sending
/// side goes away.
pub fn spawn_presenter(
    presenter: Arc<Presenter>,
    events: Receiver<AlarmTriggered>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("alarm-presenter".to_string())
        .spawn(move || {
            for event in events {
                presenter.present(&event);
            }
        })
        .context("failed to spawn presenter thread")
}

fn open_sink(output: AudioOutput) -> Box<dyn AudioSink> {
    match output {
        AudioOutput::Log => Box::new(LogSink),
        AudioOutput::Rodio => open_rodio_sink(),
    }
}

#[cfg(feature = "playback")]
fn open_rodio_sink() -> Box<dyn AudioSink> {
    match crate::audio::RodioSink::open() {
        Ok(sink) => Box::new(sink),
        Err(err) => {
            warn!("audio output unavailable, logging cues instead: {err:#}");
            Box::new(LogSink)
        }
    }
}

#[cfg(not(feature = "playback"))]
fn open_rodio_sink() -> Box<dyn AudioSink> {
    warn!("built without the `playback` feature; logging cues instead");
    Box::new(LogSink)
}
