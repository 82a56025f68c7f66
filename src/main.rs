use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use soundtrigger::audio::capture::list_devices;
use soundtrigger::audio::clip::{load_wav, save_wav};
use soundtrigger::dispatch::{ActionExecutor, CommandLauncher, LaunchCommand, LogExecutor};
use soundtrigger::events::EngineEvent;
use soundtrigger::history::{FireRecord, HistoryStore};
use soundtrigger::persistence::ProfileFile;
use soundtrigger::state_machine::ListenState;
use soundtrigger::{Engine, EngineConfig, ProfileId, ProfileSettings};

#[derive(Parser)]
#[command(name = "soundtrigger")]
#[command(about = "Launch a program when a recorded reference sound recurs")]
struct Cli {
    /// Engine configuration (JSON). Defaults apply when absent.
    #[arg(long, env = "SOUNDTRIGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Profile file (JSON)
    #[arg(long, env = "SOUNDTRIGGER_PROFILES", default_value = "soundtrigger-profiles.json")]
    profiles: PathBuf,

    /// Fire history database (SQLite)
    #[arg(long, env = "SOUNDTRIGGER_HISTORY", default_value = "soundtrigger-history.db")]
    history: PathBuf,

    /// Input device name, overriding the config
    #[arg(long)]
    device: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a profile from a WAV clip
    Train {
        #[arg(long)]
        name: String,
        #[arg(long)]
        wav: PathBuf,
        #[command(flatten)]
        settings: SettingsArgs,
        #[command(flatten)]
        action: ActionArgs,
    },
    /// Record a clip from the microphone and train a profile from it
    Record {
        #[arg(long)]
        name: String,
        /// Also keep the recording as a WAV file
        #[arg(long)]
        save: Option<PathBuf>,
        #[command(flatten)]
        settings: SettingsArgs,
        #[command(flatten)]
        action: ActionArgs,
    },
    /// List profiles with their state and settings
    List,
    /// Delete a profile (name or id)
    Remove { profile: String },
    Enable { profile: String },
    Disable { profile: String },
    /// Change the gates of an existing profile
    Tune {
        profile: String,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Score a clip against every profile without firing
    Probe {
        #[arg(long)]
        wav: PathBuf,
    },
    /// Run a clip through the detection pipeline; actions are only logged
    Simulate {
        #[arg(long)]
        wav: PathBuf,
    },
    /// Listen on the microphone until Ctrl+C
    Listen {
        /// Log fires instead of launching commands
        #[arg(long)]
        dry_run: bool,
    },
    /// List input devices
    Devices,
    /// Show recent fires
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Delete entries older than this many days first
        #[arg(long)]
        cleanup_days: Option<u32>,
    },
}

#[derive(Args, Default)]
struct SettingsArgs {
    /// Normalized DTW distance below which a window matches (typically 50-500)
    #[arg(long)]
    threshold: Option<f32>,
    /// Minimum normalized RMS of the window
    #[arg(long)]
    min_volume: Option<f32>,
    /// Seconds between fires of the same profile
    #[arg(long)]
    cooldown: Option<f32>,
}

impl SettingsArgs {
    fn apply(&self, mut settings: ProfileSettings) -> ProfileSettings {
        if let Some(t) = self.threshold {
            settings.distance_threshold = t;
        }
        if let Some(v) = self.min_volume {
            settings.min_volume = v;
        }
        if let Some(c) = self.cooldown {
            settings.cooldown_secs = c;
        }
        settings
    }
}

#[derive(Args)]
struct ActionArgs {
    /// Program launched when the profile fires
    #[arg(long)]
    command: Option<String>,
    /// Arguments passed to the program
    #[arg(last = true)]
    args: Vec<String>,
}

impl ActionArgs {
    fn launch_command(&self) -> Option<LaunchCommand> {
        self.command
            .as_ref()
            .map(|program| LaunchCommand::new(program.clone()).with_args(self.args.clone()))
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("soundtrigger=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Engine plus the launcher bound to it, loaded from the profile file.
struct App {
    engine: Engine,
    launcher: Arc<CommandLauncher>,
    profiles: PathBuf,
}

impl App {
    fn open(cli: &Cli, dry_run: bool) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => EngineConfig::load_from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if cli.device.is_some() {
            config.input_device = cli.device.clone();
        }

        let launcher = Arc::new(CommandLauncher::new());
        let executor: Arc<dyn ActionExecutor> = if dry_run {
            Arc::new(LogExecutor)
        } else {
            Arc::clone(&launcher) as Arc<dyn ActionExecutor>
        };
        let engine = Engine::new(config, executor).context("creating engine")?;

        let loaded = ProfileFile::load(&cli.profiles)
            .with_context(|| format!("loading profiles {}", cli.profiles.display()))?
            .apply(engine.store(), &launcher)?;
        info!(count = loaded, "profiles restored");

        Ok(Self {
            engine,
            launcher,
            profiles: cli.profiles.clone(),
        })
    }

    fn save(&self) -> Result<()> {
        ProfileFile::capture(self.engine.store(), &self.launcher)
            .save(&self.profiles)
            .with_context(|| format!("saving profiles {}", self.profiles.display()))
    }

    /// Accepts a profile id or a name.
    fn resolve(&self, key: &str) -> Result<ProfileId> {
        if let Ok(id) = ProfileId::from_str(key) {
            if self.engine.store().get(id).is_some() {
                return Ok(id);
            }
        }
        self.engine
            .store()
            .find_by_name(key)
            .ok_or_else(|| anyhow!("no profile named {key:?}"))
    }

    fn train(&self, name: &str, samples: &[f32], settings: &SettingsArgs, action: &ActionArgs) -> Result<ProfileId> {
        if self.engine.store().find_by_name(name).is_some() {
            bail!("a profile named {name:?} already exists");
        }
        let settings = settings.apply(self.engine.config().profile_defaults.clone());
        let id = self.engine.train_with(name, samples, settings)?;
        if let Some(command) = action.launch_command() {
            self.launcher.bind(id, command);
        }
        self.save()?;
        println!("trained {name} ({id})");
        Ok(id)
    }
}

fn print_profiles(app: &App) {
    let profiles = app.engine.store().list();
    if profiles.is_empty() {
        println!("no profiles");
        return;
    }
    for (profile, state) in profiles {
        let s = profile.settings();
        let duration = profile
            .reference()
            .map(|r| format!("{:.2}s", r.duration_secs()))
            .unwrap_or_else(|| "-".into());
        let action = app
            .launcher
            .command_for(profile.id())
            .map(|c| std::iter::once(c.program).chain(c.args).collect::<Vec<_>>().join(" "))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<16} {:<9} ref={:<6} threshold={:.2} min_volume={:.3} cooldown={:.1}s  {}",
            profile.id(),
            profile.name(),
            state.to_string(),
            duration,
            s.distance_threshold,
            s.min_volume,
            s.cooldown_secs,
            action
        );
    }
}

fn load_clip(app: &App, path: &Path) -> Result<Vec<f32>> {
    load_wav(path, app.engine.config().sample_rate).with_context(|| format!("loading {}", path.display()))
}

async fn listen(app: &App, history_path: &Path) -> Result<()> {
    let history = HistoryStore::open(history_path).map_err(|e| anyhow!(e))?;
    let mut events = app.engine.subscribe();
    let mut state = app.engine.watch_state();

    app.engine.start_microphone()?;
    let session = app.engine.session_generation();
    println!("listening (session {session}); Ctrl+C to stop");

    let recorder = {
        let history = Arc::clone(&history);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::TriggerFired(event)) => {
                        println!(">>> {} (distance {:.3})", event.name, event.distance);
                        history.record(FireRecord::from_event(&event, session));
                    }
                    Ok(EngineEvent::DispatchFailed { profile, error }) => {
                        eprintln!("action for {profile} failed: {error}");
                    }
                    Ok(EngineEvent::DeviceFailed(e)) => {
                        eprintln!("capture device failed: {e}");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "event subscriber lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for Ctrl+C")?;
            println!("stopping");
        }
        _ = state.wait_for(|s| *s == ListenState::Idle) => {
            eprintln!("listening stopped");
        }
    }

    app.engine.stop_listening();
    recorder.abort();
    history.close().await;

    let snapshot = app.engine.metrics().snapshot();
    info!(
        metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "session_metrics"
    );
    for (stage, s) in &snapshot.stages {
        println!(
            "{stage:<14} n={:<6} mean={:.0}us p50={:.0}us p95={:.0}us max={:.0}us",
            s.samples, s.mean_us, s.p50_us, s.p95_us, s.max_us
        );
    }
    for (counter, value) in &snapshot.counters {
        println!("{counter:<18} {value}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Command::Devices => {
            let devices = list_devices()?;
            if devices.is_empty() {
                println!("no input devices");
            }
            for name in devices {
                println!("{name}");
            }
        }
        Command::History { limit, cleanup_days } => {
            let history = HistoryStore::open(&cli.history).map_err(|e| anyhow!(e))?;
            if let Some(days) = cleanup_days {
                let removed = history.prune(*days).map_err(|e| anyhow!(e))?;
                println!("removed {removed} entries");
            }
            for tally in history.tallies().map_err(|e| anyhow!(e))? {
                println!("{:<16} fires={:<5} last={}", tally.profile_name, tally.fires, tally.last_fire);
            }
            for record in history.recent(*limit).map_err(|e| anyhow!(e))? {
                println!(
                    "{}  {:<16} distance={:.3} session={}",
                    record.created_at, record.profile_name, record.distance, record.session
                );
            }
            history.close().await;
        }
        Command::Train { name, wav, settings, action } => {
            let app = App::open(&cli, false)?;
            let samples = load_clip(&app, wav)?;
            app.train(name, &samples, settings, action)?;
        }
        Command::Record { name, save, settings, action } => {
            let app = App::open(&cli, false)?;
            for n in (1..=3).rev() {
                println!("recording in {n}...");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            println!("recording {:.1}s", app.engine.config().record_secs);
            let samples = app.engine.record()?;
            if let Some(path) = save {
                save_wav(path, &samples, app.engine.config().sample_rate)
                    .with_context(|| format!("saving {}", path.display()))?;
            }
            app.train(name, &samples, settings, action)?;
        }
        Command::List => {
            let app = App::open(&cli, false)?;
            print_profiles(&app);
        }
        Command::Remove { profile } => {
            let app = App::open(&cli, false)?;
            let id = app.resolve(profile)?;
            let removed = app.engine.remove(id)?;
            app.launcher.unbind(id);
            app.save()?;
            println!("removed {}", removed.name());
        }
        Command::Enable { profile } | Command::Disable { profile } => {
            let enabled = matches!(cli.command, Command::Enable { .. });
            let app = App::open(&cli, false)?;
            let id = app.resolve(profile)?;
            let state = app.engine.set_enabled(id, enabled)?;
            app.save()?;
            println!("{profile}: {state}");
        }
        Command::Tune { profile, settings } => {
            let app = App::open(&cli, false)?;
            let id = app.resolve(profile)?;
            let current = app
                .engine
                .store()
                .get(id)
                .ok_or_else(|| anyhow!("profile {id} disappeared"))?;
            app.engine
                .update_settings(id, settings.apply(current.settings().clone()))?;
            app.save()?;
            print_profiles(&app);
        }
        Command::Probe { wav } => {
            let app = App::open(&cli, true)?;
            let samples = load_clip(&app, wav)?;
            let results = app.engine.probe(&samples);
            if results.is_empty() {
                println!("no trained profiles");
            }
            for r in results {
                println!(
                    "{:<16} {:<9} distance={:.3}/{:.2} volume={:.4}/{:.4} {}",
                    r.name,
                    r.state.to_string(),
                    r.distance,
                    r.distance_threshold,
                    r.volume,
                    r.min_volume,
                    if r.would_fire { "MATCH" } else { "-" }
                );
            }
        }
        Command::Simulate { wav } => {
            let app = App::open(&cli, true)?;
            let samples = load_clip(&app, wav)?;
            let report = app.engine.replay(&samples)?;
            println!(
                "{} chunks, {} cycles, {} fires",
                report.chunks,
                report.cycles,
                report.events.len()
            );
            for event in report.events {
                println!("  {} distance={:.3}", event.name, event.distance);
            }
        }
        Command::Listen { dry_run } => {
            let app = App::open(&cli, *dry_run)?;
            listen(&app, &cli.history).await?;
        }
    }
    Ok(())
}
