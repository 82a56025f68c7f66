//! Per-cycle trigger arbitration: volume gate, cooldown gate, shared feature
//! extraction, matching, and a two-phase commit of fires against the store.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::audio::volume::normalized_rms;
use crate::audio::window::WindowSnapshot;
use crate::features::{FeatureExtractor, FeatureMatrix};
use crate::matcher::Matcher;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::profile::{cooldown_permits, ProfileId};
use crate::state_machine::ProfileState;
use crate::store::TemplateStore;

/// A committed fire.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub profile: ProfileId,
    pub name: String,
    pub timestamp: Instant,
    pub distance: f32,
}

/// What happened during one evaluation cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub volume: f32,
    pub events: Vec<TriggerEvent>,
    /// Profiles for which the matcher ran.
    pub matched: usize,
    pub below_volume: usize,
    pub in_cooldown: usize,
    /// The session ended before the commit phase; nothing was recorded.
    pub abandoned: bool,
}

/// Offline evaluation of one profile against an arbitrary clip.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub profile: ProfileId,
    pub name: String,
    pub state: ProfileState,
    pub volume: f32,
    pub distance: f32,
    pub distance_threshold: f32,
    pub min_volume: f32,
    /// Volume and distance both pass. Cooldown is ignored.
    pub would_fire: bool,
}

pub struct TriggerArbiter {
    store: Arc<TemplateStore>,
    extractor: Arc<FeatureExtractor>,
    matcher: Arc<dyn Matcher>,
    metrics: Arc<MetricsRegistry>,
}

impl TriggerArbiter {
    pub fn new(
        store: Arc<TemplateStore>,
        extractor: Arc<FeatureExtractor>,
        matcher: Arc<dyn Matcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            extractor,
            matcher,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    /// Run one cycle on a full-window snapshot at time `now`.
    pub fn evaluate(&self, snapshot: &WindowSnapshot, now: Instant) -> CycleOutcome {
        self.evaluate_guarded(snapshot, now, || true)
    }

    /// Like [`evaluate`](Self::evaluate); the cycle is abandoned when
    /// `should_continue` returns false right before the commit phase.
    pub fn evaluate_guarded(
        &self,
        snapshot: &WindowSnapshot,
        now: Instant,
        should_continue: impl Fn() -> bool,
    ) -> CycleOutcome {
        let cycle = self.metrics.span(metric_names::CYCLE);
        let mut outcome = CycleOutcome {
            volume: normalized_rms(snapshot.samples()),
            ..CycleOutcome::default()
        };

        let mut live: Option<FeatureMatrix> = None;
        let mut hits = Vec::new();
        for candidate in self.store.candidates() {
            if outcome.volume < candidate.min_volume {
                outcome.below_volume += 1;
                debug!(
                    profile = %candidate.id,
                    volume = outcome.volume,
                    min_volume = candidate.min_volume,
                    "below_volume"
                );
                continue;
            }
            if !cooldown_permits(candidate.last_fire, candidate.cooldown, now) {
                outcome.in_cooldown += 1;
                debug!(profile = %candidate.id, "in_cooldown");
                continue;
            }

            let features: &FeatureMatrix = live.get_or_insert_with(|| {
                let span = self.metrics.span(metric_names::EXTRACT);
                let m = self.extractor.extract(snapshot.samples());
                span.finish();
                m
            });

            let span = self.metrics.span(metric_names::MATCH);
            let distance = match catch_unwind(AssertUnwindSafe(|| {
                self.matcher.distance(features, &candidate.reference)
            })) {
                Ok(d) if d.is_finite() => d,
                Ok(_) => f32::INFINITY,
                Err(_) => {
                    error!(profile = %candidate.id, "matcher_panicked");
                    self.metrics.incr(metric_names::MATCH_PANICS);
                    self.store.mark_error(candidate.id);
                    f32::INFINITY
                }
            };
            span.finish();
            outcome.matched += 1;

            debug!(
                profile = %candidate.id,
                distance,
                threshold = candidate.distance_threshold,
                "profile_matched"
            );
            if distance < candidate.distance_threshold {
                hits.push((candidate, distance));
            }
        }

        if !should_continue() {
            outcome.abandoned = true;
            self.metrics.incr(metric_names::CYCLES_ABANDONED);
            debug!(sequence = snapshot.sequence(), "cycle_abandoned");
            cycle.finish();
            return outcome;
        }

        for (candidate, distance) in hits {
            if !self.store.commit_fire(candidate.id, now) {
                debug!(profile = %candidate.id, "fire_rejected_at_commit");
                continue;
            }
            info!(
                profile = %candidate.id,
                name = %candidate.name,
                distance,
                volume = outcome.volume,
                "trigger_fired"
            );
            self.metrics.incr(metric_names::TRIGGERS_FIRED);
            outcome.events.push(TriggerEvent {
                profile: candidate.id,
                name: candidate.name,
                timestamp: now,
                distance,
            });
        }

        self.metrics.incr(metric_names::CYCLES_EVALUATED);
        cycle.finish();
        outcome
    }

    /// Score a clip against every trained profile with `matcher`, ignoring
    /// cooldown and without recording fires.
    pub fn probe(&self, samples: &[f32], matcher: &dyn Matcher) -> Vec<ProbeResult> {
        let volume = normalized_rms(samples);
        let live = self.extractor.extract(samples);
        self.store
            .list()
            .into_iter()
            .filter_map(|(profile, state)| {
                let reference = profile.reference()?;
                let settings = profile.settings();
                let distance = match matcher.distance(&live, reference.features()) {
                    d if d.is_finite() => d,
                    _ => f32::INFINITY,
                };
                Some(ProbeResult {
                    profile: profile.id(),
                    name: profile.name().to_string(),
                    state,
                    volume,
                    distance,
                    distance_threshold: settings.distance_threshold,
                    min_volume: settings.min_volume,
                    would_fire: volume >= settings.min_volume
                        && distance < settings.distance_threshold,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::matcher::DtwMatcher;
    use crate::profile::ProfileSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn burst(len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| {
                let env = (-(n as f32) / 2_000.0).exp();
                ((n as f32) * 0.21).sin() * env * 0.8
            })
            .collect()
    }

    fn setup(matcher: Arc<dyn Matcher>) -> (TriggerArbiter, Arc<TemplateStore>, Arc<FeatureExtractor>) {
        let store = Arc::new(TemplateStore::new(EventHub::new()));
        let fx = Arc::new(FeatureExtractor::new(16_000));
        let arb = TriggerArbiter::new(
            Arc::clone(&store),
            Arc::clone(&fx),
            matcher,
            Arc::new(MetricsRegistry::new()),
        );
        (arb, store, fx)
    }

    struct PanickingMatcher;

    impl Matcher for PanickingMatcher {
        fn distance(&self, _: &FeatureMatrix, _: &FeatureMatrix) -> f32 {
            panic!("boom")
        }
    }

    struct CountingMatcher(AtomicUsize);

    impl Matcher for CountingMatcher {
        fn distance(&self, _: &FeatureMatrix, _: &FeatureMatrix) -> f32 {
            self.0.fetch_add(1, Ordering::SeqCst);
            0.0
        }
    }

    #[test]
    fn identical_window_fires_once_then_cools_down() {
        let (arb, store, fx) = setup(Arc::new(DtwMatcher::default()));
        let clip = burst(16_000);
        let id = store.register("burst", ProfileSettings::default()).unwrap();
        store.train(id, &clip, &fx, 0.3).unwrap();

        let t0 = Instant::now();
        let snap = WindowSnapshot::from_samples(clip.clone(), 16_000, t0);
        let first = arb.evaluate(&snap, t0);
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].profile, id);
        assert!(first.events[0].distance < 1e-3);

        let again = arb.evaluate(&snap, t0 + Duration::from_millis(300));
        assert!(again.events.is_empty());
        assert_eq!(again.in_cooldown, 1);

        let later = arb.evaluate(&snap, t0 + Duration::from_secs(2));
        assert_eq!(later.events.len(), 1);
    }

    #[test]
    fn volume_gate_skips_matcher() {
        let counting = Arc::new(CountingMatcher(AtomicUsize::new(0)));
        let (arb, store, fx) = setup(counting.clone());
        let id = store.register("burst", ProfileSettings::default()).unwrap();
        store.train(id, &burst(16_000), &fx, 0.3).unwrap();

        let quiet: Vec<f32> = vec![0.001; 16_000];
        let snap = WindowSnapshot::from_samples(quiet, 16_000, Instant::now());
        let outcome = arb.evaluate(&snap, Instant::now());
        assert_eq!(outcome.below_volume, 1);
        assert_eq!(outcome.matched, 0);
        assert_eq!(counting.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_matcher_isolated_to_profile() {
        let (arb, store, fx) = setup(Arc::new(PanickingMatcher));
        let id = store.register("burst", ProfileSettings::default()).unwrap();
        store.train(id, &burst(16_000), &fx, 0.3).unwrap();
        let snap = WindowSnapshot::from_samples(burst(16_000), 16_000, Instant::now());
        let outcome = arb.evaluate(&snap, Instant::now());
        assert!(outcome.events.is_empty());
        assert_eq!(store.state(id), Some(ProfileState::Error));
    }

    #[test]
    fn abandoned_cycle_commits_nothing() {
        let (arb, store, fx) = setup(Arc::new(DtwMatcher::default()));
        let clip = burst(16_000);
        let id = store.register("burst", ProfileSettings::default()).unwrap();
        store.train(id, &clip, &fx, 0.3).unwrap();
        let t0 = Instant::now();
        let snap = WindowSnapshot::from_samples(clip, 16_000, t0);
        let outcome = arb.evaluate_guarded(&snap, t0, || false);
        assert!(outcome.abandoned);
        assert!(outcome.events.is_empty());
        let profile = store.get(id).unwrap();
        assert_eq!(profile.last_fire(), None);
        assert_eq!(profile.fire_count(), 0);
    }

    #[test]
    fn probe_ignores_cooldown() {
        let (arb, store, fx) = setup(Arc::new(DtwMatcher::default()));
        let clip = burst(16_000);
        let id = store.register("burst", ProfileSettings::default()).unwrap();
        store.train(id, &clip, &fx, 0.3).unwrap();
        store.commit_fire(id, Instant::now());
        let results = arb.probe(&clip, &DtwMatcher::exact());
        assert_eq!(results.len(), 1);
        assert!(results[0].would_fire);
        assert_eq!(results[0].distance, 0.0);
        assert_eq!(store.get(id).unwrap().fire_count(), 1);
    }
}
