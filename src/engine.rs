//! Engine: owns the template store, arbiter, listening state, dispatcher and
//! notification hub, and runs at most one listening session at a time.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::arbiter::{ProbeResult, TriggerArbiter};
use crate::audio::capture::{record_chunks, AudioSource, ClipSource, DeviceError, MicCapture, OpenSource};
use crate::audio::{self, ReplayReport, SessionContext, SessionHandle};
use crate::cancellation::SessionGeneration;
use crate::config::{ConfigError, EngineConfig};
use crate::dispatch::{ActionExecutor, Dispatcher};
use crate::events::{EngineEvent, EventHub};
use crate::features::FeatureExtractor;
use crate::matcher::{DtwMatcher, Matcher};
use crate::metrics::MetricsRegistry;
use crate::profile::{train_profile, Profile, ProfileError, ProfileId, ProfileSettings, TrainError};
use crate::state_machine::{ListenState, ListenStateMachine, ProfileState};
use crate::store::TemplateStore;

#[derive(Debug, Clone, PartialEq)]
pub enum StartError {
    AlreadyListening,
    NoReadyProfiles,
    Device(DeviceError),
    Spawn(String),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AlreadyListening => write!(f, "already listening"),
            StartError::NoReadyProfiles => {
                write!(f, "no enabled, trained profile; train or enable one first")
            }
            StartError::Device(e) => write!(f, "could not open capture device: {e}"),
            StartError::Spawn(msg) => write!(f, "could not start session: {msg}"),
        }
    }
}

impl std::error::Error for StartError {}

impl From<DeviceError> for StartError {
    fn from(e: DeviceError) -> Self {
        StartError::Device(e)
    }
}

#[derive(Debug)]
pub enum EngineError {
    Config(ConfigError),
    Spawn(std::io::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Config(e) => write!(f, "{e}"),
            EngineError::Spawn(e) => write!(f, "failed to spawn dispatcher: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e)
    }
}

pub struct Engine {
    config: EngineConfig,
    extractor: Arc<FeatureExtractor>,
    store: Arc<TemplateStore>,
    arbiter: Arc<TriggerArbiter>,
    state: Arc<ListenStateMachine>,
    sessions: SessionGeneration,
    session: Mutex<Option<SessionHandle>>,
    dispatcher: Arc<Dispatcher>,
    events: EventHub,
    metrics: Arc<MetricsRegistry>,
}

impl Engine {
    /// Engine using approximate DTW with the configured radius.
    pub fn new(config: EngineConfig, executor: Arc<dyn ActionExecutor>) -> Result<Self, EngineError> {
        let matcher = Arc::new(DtwMatcher::fast(config.fastdtw_radius));
        Self::with_matcher(config, executor, matcher)
    }

    pub fn with_matcher(
        config: EngineConfig,
        executor: Arc<dyn ActionExecutor>,
        matcher: Arc<dyn Matcher>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let events = EventHub::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let extractor = Arc::new(FeatureExtractor::from_config(&config));
        let store = Arc::new(TemplateStore::new(events.clone()));
        let arbiter = Arc::new(TriggerArbiter::new(
            Arc::clone(&store),
            Arc::clone(&extractor),
            matcher,
            Arc::clone(&metrics),
        ));
        let dispatcher = Arc::new(
            Dispatcher::spawn(
                executor,
                config.dispatch_spacing(),
                events.clone(),
                Arc::clone(&metrics),
            )
            .map_err(EngineError::Spawn)?,
        );

        info!(
            sample_rate = config.sample_rate,
            chunk_size = config.chunk_size,
            window_chunks = config.window_capacity(),
            radius = config.fastdtw_radius,
            "engine_created"
        );

        Ok(Self {
            config,
            extractor,
            store,
            arbiter,
            state: Arc::new(ListenStateMachine::new()),
            sessions: SessionGeneration::new(),
            session: Mutex::new(None),
            dispatcher,
            events,
            metrics,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    pub fn extractor(&self) -> &Arc<FeatureExtractor> {
        &self.extractor
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn register(&self, name: &str) -> Result<ProfileId, ProfileError> {
        self.store
            .register(name, self.config.profile_defaults.clone())
    }

    /// Train a new profile with the configured default settings.
    pub fn train(&self, name: &str, samples: &[f32]) -> Result<ProfileId, TrainError> {
        self.train_with(name, samples, self.config.profile_defaults.clone())
    }

    pub fn train_with(
        &self,
        name: &str,
        samples: &[f32],
        settings: ProfileSettings,
    ) -> Result<ProfileId, TrainError> {
        let profile = train_profile(
            name,
            samples,
            settings,
            &self.extractor,
            self.config.min_training_secs,
        )?;
        Ok(self.store.insert(profile)?)
    }

    /// Replace the reference of an existing profile.
    pub fn retrain(&self, id: ProfileId, samples: &[f32]) -> Result<(), TrainError> {
        self.store
            .train(id, samples, &self.extractor, self.config.min_training_secs)
    }

    pub fn insert(&self, profile: Profile) -> Result<ProfileId, ProfileError> {
        self.store.insert(profile)
    }

    pub fn remove(&self, id: ProfileId) -> Result<Profile, ProfileError> {
        self.store.remove(id)
    }

    pub fn set_enabled(&self, id: ProfileId, enabled: bool) -> Result<ProfileState, ProfileError> {
        self.store.set_enabled(id, enabled)
    }

    pub fn update_settings(&self, id: ProfileId, settings: ProfileSettings) -> Result<(), ProfileError> {
        self.store.update_settings(id, settings)
    }

    /// Start a session on a source opened by `open` on the capture thread.
    pub fn start_listening(&self, open: OpenSource) -> Result<(), StartError> {
        let mut session = self.session.lock();
        if self.state.is_listening() {
            return Err(StartError::AlreadyListening);
        }
        // A session that ended on a device failure is still parked here.
        if let Some(mut stale) = session.take() {
            stale.stop();
        }
        if !self.store.has_ready() {
            warn!("start rejected: no ready profiles");
            return Err(StartError::NoReadyProfiles);
        }

        let guard = self.sessions.cancel_and_advance();
        self.state
            .transition(ListenState::Listening)
            .map_err(|_| StartError::AlreadyListening)?;
        self.events
            .publish(EngineEvent::ListenStateChanged(ListenState::Listening));

        let ctx = SessionContext {
            arbiter: Arc::clone(&self.arbiter),
            dispatcher: Arc::clone(&self.dispatcher),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            metrics: Arc::clone(&self.metrics),
            guard: guard.clone(),
            window_capacity: self.config.window_capacity(),
        };
        match audio::spawn_session(open, ctx) {
            Ok(handle) => {
                *session = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "session start failed");
                guard.cancel();
                if self.state.force_idle() == ListenState::Listening {
                    self.events
                        .publish(EngineEvent::ListenStateChanged(ListenState::Idle));
                }
                Err(e)
            }
        }
    }

    /// Start a session on the configured microphone.
    pub fn start_microphone(&self) -> Result<(), StartError> {
        let rate = self.config.sample_rate;
        let chunk = self.config.chunk_size;
        let device = self.config.input_device.clone();
        self.start_listening(Box::new(move || {
            MicCapture::open(rate, chunk, device.as_deref())
                .map(|mic| Box::new(mic) as Box<dyn AudioSource>)
        }))
    }

    /// Stop the current session and wait for its threads. Returns whether a
    /// session was listening. Cooldowns and profile states are kept.
    pub fn stop_listening(&self) -> bool {
        let mut session = self.session.lock();
        self.sessions.cancel_all();
        if let Some(mut handle) = session.take() {
            handle.stop();
        }
        let was_listening = self.state.force_idle() == ListenState::Listening;
        if was_listening {
            self.events
                .publish(EngineEvent::ListenStateChanged(ListenState::Idle));
        }
        was_listening
    }

    pub fn is_listening(&self) -> bool {
        self.state.is_listening()
    }

    pub fn listen_state(&self) -> ListenState {
        self.state.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Generation of the most recently started session.
    pub fn session_generation(&self) -> u64 {
        self.sessions.current_generation()
    }

    /// Score a clip against every trained profile with exact DTW. Cooldowns
    /// are ignored and nothing is fired.
    pub fn probe(&self, samples: &[f32]) -> Vec<ProbeResult> {
        self.arbiter.probe(samples, &DtwMatcher::exact())
    }

    /// Run a clip through the detection pipeline synchronously. Fires are
    /// committed, published and dispatched as in a live session.
    pub fn replay(&self, samples: &[f32]) -> Result<ReplayReport, DeviceError> {
        let mut source = ClipSource::new(samples.to_vec(), self.config.chunk_size, self.config.sample_rate);
        let report = audio::replay(
            &mut source,
            self.config.window_capacity(),
            &self.arbiter,
            Instant::now(),
        )?;
        for event in &report.events {
            self.events.publish(EngineEvent::TriggerFired(event.clone()));
            self.dispatcher.submit(event.clone());
        }
        Ok(report)
    }

    /// Record `record_secs` of microphone audio on the calling thread.
    pub fn record(&self) -> Result<Vec<f32>, DeviceError> {
        let mut mic = MicCapture::open(
            self.config.sample_rate,
            self.config.chunk_size,
            self.config.input_device.as_deref(),
        )?;
        let samples = record_chunks(&mut mic, self.config.record_chunks())?;
        info!(samples = samples.len(), "recording finished");
        Ok(samples)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LogExecutor;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default(), Arc::new(LogExecutor)).unwrap()
    }

    fn tone(secs: f32) -> Vec<f32> {
        let len = (secs * 16_000.0) as usize;
        (0..len).map(|n| ((n as f32) * 0.1).sin() * 0.5).collect()
    }

    #[test]
    fn start_requires_ready_profile() {
        let engine = engine();
        let open: OpenSource = Box::new(|| {
            Ok(Box::new(ClipSource::new(vec![0.0f32; 16_000], 1024, 16_000)) as Box<dyn AudioSource>)
        });
        assert_eq!(engine.start_listening(open), Err(StartError::NoReadyProfiles));
        assert_eq!(engine.listen_state(), ListenState::Idle);
    }

    #[test]
    fn device_open_failure_leaves_engine_idle() {
        let engine = engine();
        engine.train("tone", &tone(1.0)).unwrap();
        let open: OpenSource = Box::new(|| Err(DeviceError::NoDevice));
        assert_eq!(
            engine.start_listening(open),
            Err(StartError::Device(DeviceError::NoDevice))
        );
        assert!(!engine.is_listening());
    }

    #[test]
    fn second_start_is_rejected_and_stop_returns_idle() {
        let engine = engine();
        engine.train("tone", &tone(1.0)).unwrap();
        let open = || -> OpenSource {
            Box::new(|| {
                Ok(Box::new(ClipSource::new(vec![0.0f32; 1_024], 1_024, 16_000).paced().hold_open())
                    as Box<dyn AudioSource>)
            })
        };
        engine.start_listening(open()).unwrap();
        assert!(engine.is_listening());
        assert_eq!(engine.start_listening(open()), Err(StartError::AlreadyListening));
        assert!(engine.stop_listening());
        assert!(!engine.is_listening());
        assert!(!engine.stop_listening());
        // listening again after a stop starts a new generation
        engine.start_listening(open()).unwrap();
        assert_eq!(engine.session_generation(), 2);
        engine.stop_listening();
    }

    #[test]
    fn train_rejects_short_clip() {
        let engine = engine();
        assert!(matches!(
            engine.train("short", &tone(0.1)),
            Err(TrainError::TooShort { .. })
        ));
        assert!(engine.store().is_empty());
    }

    #[test]
    fn probe_reports_self_match() {
        let engine = engine();
        let clip = tone(1.0);
        let id = engine.train("tone", &clip).unwrap();
        let results = engine.probe(&clip);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].profile, id);
        assert!(results[0].would_fire);
    }
}
