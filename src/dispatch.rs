//! Action dispatch: fired events go over an unbounded crossbeam channel to a
//! dedicated OS thread that spaces launches and hands them to an executor.
//! Capture and evaluation never wait on it; failures surface as notifications.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::arbiter::TriggerEvent;
use crate::events::{EngineEvent, EventHub};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::profile::ProfileId;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    NoAction(ProfileId),
    EmptyCommand(ProfileId),
    Spawn { program: String, error: String },
    Executor(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::NoAction(id) => write!(f, "no action configured for profile {id}"),
            DispatchError::EmptyCommand(id) => write!(f, "empty launch command for profile {id}"),
            DispatchError::Spawn { program, error } => {
                write!(f, "failed to launch {program}: {error}")
            }
            DispatchError::Executor(msg) => write!(f, "action failed: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Performs the action bound to a fired profile. Must not wait for the
/// action to complete.
pub trait ActionExecutor: Send + Sync {
    fn execute(&self, event: &TriggerEvent) -> Result<(), DispatchError>;
}

/// External program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Launches the command bound to each profile as a detached child process.
#[derive(Default)]
pub struct CommandLauncher {
    commands: RwLock<HashMap<ProfileId, LaunchCommand>>,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, profile: ProfileId, command: LaunchCommand) {
        self.commands.write().insert(profile, command);
    }

    pub fn unbind(&self, profile: ProfileId) -> Option<LaunchCommand> {
        self.commands.write().remove(&profile)
    }

    pub fn command_for(&self, profile: ProfileId) -> Option<LaunchCommand> {
        self.commands.read().get(&profile).cloned()
    }
}

impl ActionExecutor for CommandLauncher {
    fn execute(&self, event: &TriggerEvent) -> Result<(), DispatchError> {
        let command = self
            .command_for(event.profile)
            .ok_or(DispatchError::NoAction(event.profile))?;
        if command.program.trim().is_empty() {
            return Err(DispatchError::EmptyCommand(event.profile));
        }

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| DispatchError::Spawn {
                program: command.program.clone(),
                error: e.to_string(),
            })?;
        info!(
            profile = %event.profile,
            program = %command.program,
            pid = child.id(),
            "action_launched"
        );

        let program = command.program;
        let reaper = std::thread::Builder::new()
            .name("action-reaper".into())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(program = %program, %status, "action_exited"),
                Err(e) => warn!(program = %program, error = %e, "action_wait_failed"),
            });
        if let Err(e) = reaper {
            warn!(error = %e, "failed to spawn reaper thread");
        }
        Ok(())
    }
}

/// Logs fires instead of acting on them.
pub struct LogExecutor;

impl ActionExecutor for LogExecutor {
    fn execute(&self, event: &TriggerEvent) -> Result<(), DispatchError> {
        info!(
            profile = %event.profile,
            name = %event.name,
            distance = event.distance,
            "action_skipped_dry_run"
        );
        Ok(())
    }
}

struct DispatchTask {
    event: TriggerEvent,
    enqueued_at: Instant,
}

/// Owns the dispatch thread. Dropping it drains the queue and joins the thread.
pub struct Dispatcher {
    tx: Mutex<Option<cb::Sender<DispatchTask>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn spawn(
        executor: Arc<dyn ActionExecutor>,
        spacing: Duration,
        events: EventHub,
        metrics: Arc<MetricsRegistry>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = cb::unbounded::<DispatchTask>();
        let handle = std::thread::Builder::new()
            .name("action-dispatch".into())
            .spawn(move || run_dispatch_loop(rx, executor, spacing, events, metrics))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue an event (never blocks). Returns false after shutdown.
    pub fn submit(&self, event: TriggerEvent) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(DispatchTask {
                    event,
                    enqueued_at: Instant::now(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Close the queue, let pending events run, and join the thread.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("dispatch thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_dispatch_loop(
    rx: cb::Receiver<DispatchTask>,
    executor: Arc<dyn ActionExecutor>,
    spacing: Duration,
    events: EventHub,
    metrics: Arc<MetricsRegistry>,
) {
    let mut last_launch: Option<Instant> = None;
    loop {
        match rx.recv() {
            Ok(task) => {
                if let Some(prev) = last_launch {
                    let since = prev.elapsed();
                    if since < spacing {
                        std::thread::sleep(spacing - since);
                    }
                }
                let wait_us = task.enqueued_at.elapsed().as_micros() as f64;
                metrics.record(metric_names::DISPATCH_WAIT, wait_us);

                if let Err(e) = executor.execute(&task.event) {
                    warn!(profile = %task.event.profile, error = %e, "dispatch_failed");
                    metrics.incr(metric_names::DISPATCH_FAILURES);
                    events.publish(EngineEvent::DispatchFailed {
                        profile: task.event.profile,
                        error: e.to_string(),
                    });
                }
                last_launch = Some(Instant::now());
            }
            Err(cb::RecvError) => {
                info!("dispatch channel closed, exiting loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        calls: Mutex<Vec<Instant>>,
        fail_first: bool,
    }

    impl ActionExecutor for Recorder {
        fn execute(&self, _event: &TriggerEvent) -> Result<(), DispatchError> {
            let mut calls = self.calls.lock();
            calls.push(Instant::now());
            if self.fail_first && calls.len() == 1 {
                return Err(DispatchError::Executor("first launch fails".into()));
            }
            Ok(())
        }
    }

    fn event(profile: ProfileId) -> TriggerEvent {
        TriggerEvent {
            profile,
            name: "test".into(),
            timestamp: Instant::now(),
            distance: 0.5,
        }
    }

    #[test]
    fn bursts_are_spaced() {
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            fail_first: false,
        });
        let spacing = Duration::from_millis(40);
        let dispatcher = Dispatcher::spawn(
            recorder.clone(),
            spacing,
            EventHub::new(),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let id = ProfileId::new();
        for _ in 0..3 {
            assert!(dispatcher.submit(event(id)));
        }
        dispatcher.shutdown();
        assert!(!dispatcher.submit(event(id)));

        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= spacing);
        }
    }

    #[test]
    fn executor_failure_is_reported_and_loop_survives() {
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            fail_first: true,
        });
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher =
            Dispatcher::spawn(recorder.clone(), Duration::ZERO, hub, Arc::clone(&metrics)).unwrap();
        let id = ProfileId::new();
        dispatcher.submit(event(id));
        dispatcher.submit(event(id));
        dispatcher.shutdown();

        assert_eq!(recorder.calls.lock().len(), 2);
        assert_eq!(metrics.counter(metric_names::DISPATCH_FAILURES), 1);
        match rx.try_recv() {
            Ok(EngineEvent::DispatchFailed { profile, .. }) => assert_eq!(profile, id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn launcher_validates_commands() {
        let launcher = CommandLauncher::new();
        let id = ProfileId::new();
        assert_eq!(launcher.execute(&event(id)), Err(DispatchError::NoAction(id)));
        launcher.bind(id, LaunchCommand::new("  "));
        assert_eq!(launcher.execute(&event(id)), Err(DispatchError::EmptyCommand(id)));
        launcher.bind(id, LaunchCommand::new("/nonexistent/soundtrigger-action"));
        assert!(matches!(
            launcher.execute(&event(id)),
            Err(DispatchError::Spawn { .. })
        ));
    }
}
