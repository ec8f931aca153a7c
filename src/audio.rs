use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::info;

use crate::alarm::model::SoundType;

pub const NORMAL_TONE_HZ: f32 = 800.0;
pub const DEEP_TONE_HZ: f32 = 200.0;
pub const CUE_GAIN: f32 = 0.5;
pub const SAMPLE_RATE: u32 = 44_100;

/// What the audio output is asked to play for one alarm.
#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    Tone {
        frequency_hz: f32,
        gain: f32,
        duration: Duration,
    },
    /// A sound file, looped until `duration` runs out.
    Asset { path: PathBuf, duration: Duration },
}

impl Cue {
    pub fn tone(sound_type: SoundType, duration: Duration) -> Self {
        let frequency_hz = match sound_type {
            SoundType::Deep => DEEP_TONE_HZ,
            SoundType::Normal | SoundType::Custom => NORMAL_TONE_HZ,
        };
        Cue::Tone {
            frequency_hz,
            gain: CUE_GAIN,
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Cue::Tone { duration, .. } | Cue::Asset { duration, .. } => *duration,
        }
    }
}

pub trait AudioSink: Send + Sync {
    fn play(&self, cue: &Cue) -> Result<()>;
}

/// Output for hosts without a sound device.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AudioSink for LogSink {
    fn play(&self, cue: &Cue) -> Result<()> {
        match cue {
            Cue::Tone {
                frequency_hz,
                gain,
                duration,
            } => info!("cue: {frequency_hz} Hz tone at gain {gain} for {duration:?}"),
            Cue::Asset { path, duration } => {
                info!("cue: looping {} for {duration:?}", path.display())
            }
        }
        Ok(())
    }
}

pub struct AudioEngine {
    sink: Box<dyn AudioSink>,
    cue_duration: Duration,
}

impl AudioEngine {
    pub fn new(sink: Box<dyn AudioSink>, cue_duration: Duration) -> Self {
        Self { sink, cue_duration }
    }

    /// Custom alarms play their asset when it exists; everything else, and a
    /// custom alarm whose file is gone, gets the synthesized tone.
    pub fn cue_for(&self, sound_type: SoundType, asset: Option<&Path>) -> Cue {
        match (sound_type, asset) {
            (SoundType::Custom, Some(path)) if path.is_file() => Cue::Asset {
                path: path.to_path_buf(),
                duration: self.cue_duration,
            },
            _ => Cue::tone(sound_type, self.cue_duration),
        }
    }

    pub fn play(&self, cue: &Cue) -> Result<()> {
        self.sink.play(cue)
    }
}

pub fn render_tone(frequency_hz: f32, gain: f32, duration: Duration, sample_rate: u32) -> Vec<i16> {
    let frames = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
    let amplitude = f32::from(i16::MAX) * gain.clamp(0.0, 1.0);
    (0..frames)
        .map(|frame| {
            let t = frame as f32 / sample_rate as f32;
            (amplitude * (TAU * frequency_hz * t).sin()) as i16
        })
        .collect()
}

pub fn write_tone_wav(path: &Path, frequency_hz: f32, gain: f32, duration: Duration) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for sample in render_tone(frequency_hz, gain, duration, SAMPLE_RATE) {
        writer.write_sample(sample)?;
    }
    writer
        .finalize()
        .with_context(|| format!("failed to finish {}", path.display()))?;
    Ok(())
}

#[cfg(feature = "playback")]
pub use playback::RodioSink;

#[cfg(feature = "playback")]
mod playback {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;
    use std::thread;

    use anyhow::{Result, anyhow};
    use crossbeam_channel::{Sender, bounded, unbounded};
    use log::{error, warn};
    use rodio::source::{SineWave, Source};
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};

    use super::{AudioSink, Cue};

    /// Plays cues on the default output device. The stream lives on its own
    /// thread; a new cue stops the one before it.
    pub struct RodioSink {
        tx: Sender<Cue>,
    }

    impl RodioSink {
        pub fn open() -> Result<Self> {
            let (tx, rx) = unbounded::<Cue>();
            let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
            thread::Builder::new()
                .name("audio-output".to_string())
                .spawn(move || {
                    let (_stream, handle) = match OutputStream::try_default() {
                        Ok(pair) => {
                            let _ = ready_tx.send(Ok(()));
                            pair
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err.to_string()));
                            return;
                        }
                    };
                    let mut current: Option<Sink> = None;
                    for cue in rx {
                        match start_cue(&handle, &cue) {
                            Ok(sink) => {
                                if let Some(previous) = current.replace(sink) {
                                    previous.stop();
                                }
                            }
                            Err(err) => error!("failed to play cue: {err:#}"),
                        }
                    }
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self { tx }),
                Ok(Err(message)) => Err(anyhow!("no audio output device: {message}")),
                Err(_) => Err(anyhow!("audio thread exited during startup")),
            }
        }
    }

    impl AudioSink for RodioSink {
        fn play(&self, cue: &Cue) -> Result<()> {
            self.tx
                .send(cue.clone())
                .map_err(|_| anyhow!("audio thread stopped"))
        }
    }

    fn start_cue(handle: &OutputStreamHandle, cue: &Cue) -> Result<Sink> {
        let sink = Sink::try_new(handle)?;
        match cue {
            Cue::Tone {
                frequency_hz,
                gain,
                duration,
            } => sink.append(
                SineWave::new(*frequency_hz)
                    .take_duration(*duration)
                    .amplify(*gain),
            ),
            Cue::Asset { path, duration } => match open_asset(path) {
                Ok(source) => sink.append(source.repeat_infinite().take_duration(*duration)),
                Err(err) => {
                    warn!("{err:#}; falling back to tone");
                    sink.append(
                        SineWave::new(super::NORMAL_TONE_HZ)
                            .take_duration(*duration)
                            .amplify(super::CUE_GAIN),
                    );
                }
            },
        }
        Ok(sink)
    }

    fn open_asset(path: &Path) -> Result<Decoder<BufReader<File>>> {
        let file = File::open(path)
            .map_err(|err| anyhow!("cannot open {}: {err}", path.display()))?;
        Decoder::new(BufReader::new(file))
            .map_err(|err| anyhow!("cannot decode {}: {err}", path.display()))
    }
}
