use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::info;

use alarmclock::alarm::registry::{AlarmRegistry, render};
use alarmclock::alarm::scheduler::{AlarmScheduler, SchedulerConfig};
use alarmclock::alarm::store::AlarmStore;
use alarmclock::api::{ApiServer, ApiServerConfig, ApiState};
use alarmclock::clock::{Clock, SystemClock};
use alarmclock::notify::{
    Broadcaster, DEFAULT_EVENT_LOG_CAPACITY, NotificationOutput, PermissionGate, SystemNotifier,
    open_platform,
};
use alarmclock::presenter::{AudioOutput, Presenter, PresenterConfig, spawn_presenter};
use alarmclock::sounds::SoundLibrary;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliAudioOutput {
    Log,
    Rodio,
}

impl From<CliAudioOutput> for AudioOutput {
    fn from(value: CliAudioOutput) -> Self {
        match value {
            CliAudioOutput::Log => AudioOutput::Log,
            CliAudioOutput::Rodio => AudioOutput::Rodio,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliNotificationOutput {
    Log,
    Desktop,
}

impl From<CliNotificationOutput> for NotificationOutput {
    fn from(value: CliNotificationOutput) -> Self {
        match value {
            CliNotificationOutput::Log => NotificationOutput::Log,
            CliNotificationOutput::Desktop => NotificationOutput::Desktop,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "alarmclock",
    version,
    about = "Self-hosted alarm clock with an HTTP API"
)]
struct Cli {
    #[arg(long, default_value = "alarms.json")]
    store: PathBuf,

    #[arg(long, default_value = "sounds")]
    sounds_dir: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    api_bind: String,

    #[arg(long, env = "PORT", default_value_t = 10_000)]
    api_port: u16,

    #[arg(long, default_value_t = false)]
    mdns_enabled: bool,

    #[arg(long, default_value = "alarmclock")]
    mdns_instance: String,

    /// When false, alarms are announced by toast only.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    notifications: bool,

    /// `desktop` needs the `desktop-notifications` feature.
    #[arg(long, value_enum, default_value_t = CliNotificationOutput::Log)]
    notification_output: CliNotificationOutput,

    #[arg(long, value_enum, default_value_t = CliAudioOutput::Log)]
    audio_output: CliAudioOutput,

    /// Overrides the stored repeat interval.
    #[arg(long)]
    repeat_interval_ms: Option<u64>,

    /// Print the stored alarms and exit.
    #[arg(long)]
    list: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    if cli.repeat_interval_ms == Some(0) {
        bail!("--repeat-interval-ms must be greater than zero");
    }

    let store = AlarmStore::open(&cli.store)
        .with_context(|| format!("failed to load {}", cli.store.display()))?;
    if cli.list {
        print!("{}", render(&store.list()));
        return Ok(());
    }

    let mut settings = store.settings();
    if let Some(interval) = cli.repeat_interval_ms {
        settings.repeat_interval_ms = interval;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let platform = open_platform(cli.notification_output.into(), cli.notifications);
    let permission = Arc::new(PermissionGate::new());
    let broadcaster = Arc::new(Broadcaster::new(DEFAULT_EVENT_LOG_CAPACITY));
    let sounds = SoundLibrary::open(&cli.sounds_dir)?;
    sounds
        .ensure_default_sound()
        .context("failed to create the default sound")?;

    let presenter = Arc::new(Presenter::new(
        PresenterConfig::from_settings(&settings, cli.audio_output.into()),
        sounds.clone(),
        Arc::clone(&platform),
        Arc::clone(&permission),
        Arc::clone(&clock),
    ));
    presenter.request_permission();
    let _presenter_join = spawn_presenter(Arc::clone(&presenter), broadcaster.subscribe())?;

    let scheduler = AlarmScheduler::start(
        SchedulerConfig::from_settings(&settings),
        Arc::clone(&clock),
        Arc::new(SystemNotifier::new(
            platform,
            permission,
            Arc::clone(&clock),
        )),
        Arc::clone(&broadcaster),
    )?;
    let registry = AlarmRegistry::new(store, scheduler.handle(), Arc::clone(&clock))
        .with_settings(settings);
    registry.restore_schedule();

    let state = Arc::new(ApiState {
        registry,
        scheduler: scheduler.handle(),
        broadcaster,
        sounds,
    });
    let api_server = ApiServer::start(
        ApiServerConfig {
            bind_addr: cli.api_bind.clone(),
            port: cli.api_port,
            mdns_enabled: cli.mdns_enabled,
            mdns_instance: cli.mdns_instance,
        },
        state,
    )
    .with_context(|| {
        format!(
            "failed to start local API at {}:{}",
            cli.api_bind, cli.api_port
        )
    })?;

    info!("alarm clock running; store {}", cli.store.display());
    api_server.wait();
    scheduler.shutdown();
    Ok(())
}
