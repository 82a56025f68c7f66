//! Listening session pipeline.
//! Capture thread: source → sliding window → snapshot into a single-slot channel.
//! Evaluation thread: snapshot → arbiter → notifications + dispatcher.
//! Capture never waits on evaluation; a stale snapshot is replaced by the newest.

pub mod capture;
pub mod clip;
pub mod volume;
pub mod window;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use tracing::{debug, error, info, warn};

use crate::arbiter::{TriggerArbiter, TriggerEvent};
use crate::cancellation::SessionGuard;
use crate::dispatch::Dispatcher;
use crate::engine::StartError;
use crate::events::{EngineEvent, EventHub};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::state_machine::{ListenState, ListenStateMachine};

use capture::{AudioSource, DeviceError, OpenSource};
use window::{SlidingWindow, WindowSnapshot};

/// Everything a session's threads share with the engine.
pub struct SessionContext {
    pub arbiter: Arc<TriggerArbiter>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: EventHub,
    pub state: Arc<ListenStateMachine>,
    pub metrics: Arc<MetricsRegistry>,
    pub guard: SessionGuard,
    pub window_capacity: usize,
}

/// Keeps a listening session alive. Stopping cancels the session token and
/// joins both threads.
pub struct SessionHandle {
    guard: SessionGuard,
    capture: Option<JoinHandle<()>>,
    evaluation: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn generation(&self) -> u64 {
        self.guard.id()
    }

    /// Both threads have exited (stopped, or the device failed).
    pub fn is_finished(&self) -> bool {
        self.capture.as_ref().map_or(true, JoinHandle::is_finished)
            && self.evaluation.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn stop(&mut self) {
        self.guard.cancel();
        for (name, handle) in [("capture", self.capture.take()), ("evaluation", self.evaluation.take())] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!(thread = name, "session thread panicked");
                }
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the source on a new capture thread and start evaluating. Returns once
/// the source is open, or with the device error if opening failed.
pub fn spawn_session(open: OpenSource, ctx: SessionContext) -> Result<SessionHandle, StartError> {
    let (open_tx, open_rx) = cb::bounded::<Result<(), DeviceError>>(1);
    let (snap_tx, snap_rx) = cb::bounded::<WindowSnapshot>(1);

    let capture = {
        let drain_rx = snap_rx.clone();
        let guard = ctx.guard.clone();
        let events = ctx.events.clone();
        let state = Arc::clone(&ctx.state);
        let metrics = Arc::clone(&ctx.metrics);
        let capacity = ctx.window_capacity;
        std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let source = match open() {
                    Ok(source) => {
                        let _ = open_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                run_capture_loop(source, capacity, snap_tx, drain_rx, guard, events, state, metrics);
            })
            .map_err(|e| StartError::Spawn(format!("failed to spawn capture thread: {e}")))?
    };

    match open_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = capture.join();
            return Err(StartError::Device(e));
        }
        Err(_) => {
            let _ = capture.join();
            return Err(StartError::Spawn("capture thread exited before opening".into()));
        }
    }

    let evaluation = {
        let guard = ctx.guard.clone();
        let arbiter = Arc::clone(&ctx.arbiter);
        let dispatcher = Arc::clone(&ctx.dispatcher);
        let events = ctx.events.clone();
        let metrics = Arc::clone(&ctx.metrics);
        std::thread::Builder::new()
            .name("trigger-evaluation".into())
            .spawn(move || run_evaluation_loop(snap_rx, arbiter, dispatcher, events, guard, metrics))
    };
    let evaluation = match evaluation {
        Ok(handle) => handle,
        Err(e) => {
            ctx.guard.cancel();
            let _ = capture.join();
            return Err(StartError::Spawn(format!("failed to spawn evaluation thread: {e}")));
        }
    };

    info!(generation = ctx.guard.id(), capacity = ctx.window_capacity, "session_started");
    Ok(SessionHandle {
        guard: ctx.guard,
        capture: Some(capture),
        evaluation: Some(evaluation),
    })
}

/// Put `snapshot` in the single slot, discarding an unconsumed older one.
fn publish_latest(
    tx: &cb::Sender<WindowSnapshot>,
    drain_rx: &cb::Receiver<WindowSnapshot>,
    snapshot: WindowSnapshot,
    metrics: &MetricsRegistry,
) {
    match tx.try_send(snapshot) {
        Ok(()) => {}
        Err(cb::TrySendError::Full(snapshot)) => {
            if let Ok(stale) = drain_rx.try_recv() {
                metrics.incr(metric_names::CYCLES_SKIPPED);
                debug!(sequence = stale.sequence(), "cycle_skipped");
            }
            if let Err(e) = tx.try_send(snapshot) {
                debug!(error = %e, "snapshot_publish_failed");
            }
        }
        Err(cb::TrySendError::Disconnected(_)) => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn run_capture_loop(
    mut source: Box<dyn AudioSource>,
    capacity: usize,
    tx: cb::Sender<WindowSnapshot>,
    drain_rx: cb::Receiver<WindowSnapshot>,
    guard: SessionGuard,
    events: EventHub,
    state: Arc<ListenStateMachine>,
    metrics: Arc<MetricsRegistry>,
) {
    let mut window = SlidingWindow::new(capacity, source.sample_rate());
    info!(
        sample_rate = source.sample_rate(),
        chunk_size = source.chunk_size(),
        capacity,
        "capture loop started"
    );

    while guard.should_continue() {
        match source.read_chunk() {
            Ok(chunk) => {
                window.append(chunk);
                if window.is_full() {
                    publish_latest(&tx, &drain_rx, window.snapshot(), &metrics);
                }
            }
            Err(e) => {
                if guard.should_continue() {
                    error!(error = %e, "capture_device_failed");
                    events.publish(EngineEvent::DeviceFailed(e));
                    guard.cancel();
                    if guard.is_current() && state.force_idle() == ListenState::Listening {
                        events.publish(EngineEvent::ListenStateChanged(ListenState::Idle));
                    }
                }
                break;
            }
        }
    }

    source.close();
    info!("capture loop stopped");
}

fn run_evaluation_loop(
    rx: cb::Receiver<WindowSnapshot>,
    arbiter: Arc<TriggerArbiter>,
    dispatcher: Arc<Dispatcher>,
    events: EventHub,
    guard: SessionGuard,
    metrics: Arc<MetricsRegistry>,
) {
    // Wake periodically so a stop is noticed even when capture stalls.
    let poll = Duration::from_millis(100);
    loop {
        let snapshot = match rx.recv_timeout(poll) {
            Ok(snapshot) => snapshot,
            Err(cb::RecvTimeoutError::Timeout) => {
                if guard.should_continue() {
                    continue;
                }
                break;
            }
            Err(cb::RecvTimeoutError::Disconnected) => break,
        };
        if !guard.should_continue() {
            metrics.incr(metric_names::CYCLES_ABANDONED);
            break;
        }

        let outcome =
            arbiter.evaluate_guarded(&snapshot, snapshot.captured_at(), || guard.should_continue());
        for event in outcome.events {
            events.publish(EngineEvent::TriggerFired(event.clone()));
            if !dispatcher.submit(event) {
                warn!("dispatcher closed, fire not dispatched");
            }
        }
    }
    info!("evaluation loop stopped");
}

/// Summary of a synchronous replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub events: Vec<TriggerEvent>,
    pub chunks: usize,
    pub cycles: usize,
}

/// Drive a source to its end on the calling thread, evaluating every full
/// window. Time is virtual: each snapshot is stamped `start + audio consumed`,
/// so cooldowns follow the audio timeline rather than wall time.
pub fn replay(
    source: &mut dyn AudioSource,
    capacity: usize,
    arbiter: &TriggerArbiter,
    start: Instant,
) -> Result<ReplayReport, DeviceError> {
    let rate = source.sample_rate().max(1) as f64;
    let mut window = SlidingWindow::new(capacity, source.sample_rate());
    let mut report = ReplayReport::default();
    let mut consumed = 0usize;

    loop {
        match source.read_chunk() {
            Ok(chunk) => {
                consumed += chunk.len();
                report.chunks += 1;
                window.append(chunk);
                if window.is_full() {
                    let now = start + Duration::from_secs_f64(consumed as f64 / rate);
                    let outcome = arbiter.evaluate(&window.snapshot_at(now), now);
                    report.cycles += 1;
                    report.events.extend(outcome.events);
                }
            }
            Err(DeviceError::Exhausted) | Err(DeviceError::Closed) => break,
            Err(e) => {
                source.close();
                return Err(e);
            }
        }
    }
    source.close();
    debug!(chunks = report.chunks, cycles = report.cycles, fires = report.events.len(), "replay_finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::AudioChunk;

    fn snapshots(count: usize) -> Vec<WindowSnapshot> {
        let mut window = SlidingWindow::new(1, 16_000);
        (0..count)
            .map(|i| {
                window.append(AudioChunk::new(vec![i as f32 * 0.1; 256]));
                window.snapshot()
            })
            .collect()
    }

    #[test]
    fn newest_snapshot_replaces_unconsumed_one() {
        let metrics = MetricsRegistry::new();
        let (tx, rx) = cb::bounded(1);
        let mut snaps = snapshots(2).into_iter();

        publish_latest(&tx, &rx, snaps.next().unwrap(), &metrics);
        publish_latest(&tx, &rx, snaps.next().unwrap(), &metrics);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.sequence(), 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.counter(metric_names::CYCLES_SKIPPED), 1);
    }

    #[test]
    fn consumed_snapshot_is_not_counted_as_skipped() {
        let metrics = MetricsRegistry::new();
        let (tx, rx) = cb::bounded(1);
        for snap in snapshots(3) {
            publish_latest(&tx, &rx, snap, &metrics);
            assert!(rx.try_recv().is_ok());
        }
        assert_eq!(metrics.counter(metric_names::CYCLES_SKIPPED), 0);
    }
}
