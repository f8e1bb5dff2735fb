//! State Engine
//!
//! `PetState` is the plain data plus the delta arithmetic; `PetEngine` owns one
//! behind a mutex and is the only way the running service mutates it.
//! Mood is never stored: it is re-derived from health on every read.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::classifier::{
    self, clamp_severity, GoodBehaviorPolicy, ThreatAssessment, ThreatPolicy, EVOLVE_LABEL,
};
use super::store::StateStore;

pub const MAX_HEALTH: u8 = 100;
pub const MAX_STAGE: u8 = 5;
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Points at which the pet reaches stage 2, 3, 4 and 5.
const STAGE_POINTS: [u64; 4] = [100, 250, 500, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Concerned,
    Sick,
    Critical,
    Dead,
}

impl Mood {
    pub fn from_health(health: u8) -> Self {
        match health {
            75.. => Mood::Happy,
            50..=74 => Mood::Concerned,
            25..=49 => Mood::Sick,
            1..=24 => Mood::Critical,
            0 => Mood::Dead,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Concerned => "concerned",
            Mood::Sick => "sick",
            Mood::Critical => "critical",
            Mood::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Event,
    Threat,
    GoodBehavior,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub label: String,
    pub delta: i32,
    pub health: u8,
}

/// Immutable copy of everything a client may see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetSnapshot {
    pub health: u8,
    pub mood: Mood,
    pub last_event: Option<String>,
    pub evolution_stage: u8,
    pub points: u64,
    pub good_behavior_streak: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreatOutcome {
    pub snapshot: PetSnapshot,
    pub severity: u8,
    /// `false` when the report fell below the ignore threshold.
    pub applied: bool,
    pub delta: i32,
    pub should_alert: bool,
}

fn default_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn stage_for_points(points: u64) -> u8 {
    1 + STAGE_POINTS.iter().filter(|&&t| points >= t).count() as u8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PetState {
    health: u8,
    last_event: Option<String>,
    evolution_stage: u8,
    points: u64,
    good_behavior_streak: u64,
    history: VecDeque<HistoryEntry>,
    #[serde(skip, default = "default_capacity")]
    history_capacity: usize,
}

impl Default for PetState {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl PetState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            health: MAX_HEALTH,
            last_event: None,
            evolution_stage: 1,
            points: 0,
            good_behavior_streak: 0,
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn health(&self) -> u8 {
        self.health
    }

    pub fn mood(&self) -> Mood {
        Mood::from_health(self.health)
    }

    pub fn snapshot(&self) -> PetSnapshot {
        PetSnapshot {
            health: self.health,
            mood: self.mood(),
            last_event: self.last_event.clone(),
            evolution_stage: self.evolution_stage,
            points: self.points,
            good_behavior_streak: self.good_behavior_streak,
        }
    }

    /// Most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn set_history_capacity(&mut self, capacity: usize) {
        self.history_capacity = capacity.max(1);
        self.trim_history();
    }

    /// Pulls health and stage back into range, e.g. after loading from disk.
    pub(crate) fn normalize(&mut self) {
        self.health = self.health.min(MAX_HEALTH);
        self.evolution_stage = self.evolution_stage.clamp(1, MAX_STAGE);
    }

    /// Applies a labelled event. Unknown labels are recorded with a zero delta.
    pub fn apply_event(&mut self, label: &str) -> PetSnapshot {
        let delta = classifier::classify_label(label);
        if !classifier::is_known_label(label) {
            debug!(label, "unknown event label, recording without effect");
        }
        let applied = self.adjust_health(delta);
        if delta > 0 {
            self.award_points(delta as u64);
        }
        if label == EVOLVE_LABEL {
            self.evolution_stage = (self.evolution_stage + 1).min(MAX_STAGE);
        }
        self.last_event = Some(label.to_string());
        self.record(EventKind::Event, label, applied);
        self.snapshot()
    }

    pub fn apply_threat(
        &mut self,
        severity: i64,
        threat_type: &str,
        policy: &ThreatPolicy,
    ) -> ThreatOutcome {
        let severity = clamp_severity(severity);
        match policy.assess(severity) {
            ThreatAssessment::Ignored => ThreatOutcome {
                snapshot: self.snapshot(),
                severity,
                applied: false,
                delta: 0,
                should_alert: false,
            },
            ThreatAssessment::Penalty(delta) => {
                let applied = self.adjust_health(delta);
                self.last_event = Some(threat_type.to_string());
                self.record(EventKind::Threat, threat_type, applied);
                ThreatOutcome {
                    snapshot: self.snapshot(),
                    severity,
                    applied: true,
                    delta: applied,
                    should_alert: policy.should_alert(severity),
                }
            }
        }
    }

    pub fn apply_good_behavior(
        &mut self,
        seconds_safe: u64,
        policy: &GoodBehaviorPolicy,
    ) -> PetSnapshot {
        let credit = policy.credit(seconds_safe);
        let applied = self.adjust_health(credit.health);
        self.award_points(credit.points);
        self.good_behavior_streak = self.good_behavior_streak.saturating_add(1);
        self.last_event = Some("good_behavior".to_string());
        self.record(EventKind::GoodBehavior, "good_behavior", applied);
        self.snapshot()
    }

    /// Back to a freshly hatched pet. History is cleared.
    pub fn reset(&mut self) -> PetSnapshot {
        *self = Self::new(self.history_capacity);
        self.snapshot()
    }

    /// Administrative override. Out-of-range values are clamped.
    pub fn set_health(&mut self, health: i64) -> PetSnapshot {
        let target = health.clamp(0, i64::from(MAX_HEALTH)) as u8;
        let delta = i32::from(target) - i32::from(self.health);
        self.health = target;
        self.record(EventKind::Admin, "set_health", delta);
        self.snapshot()
    }

    /// Returns the delta actually applied after clamping.
    fn adjust_health(&mut self, delta: i32) -> i32 {
        let before = i32::from(self.health);
        let after = (before + delta).clamp(0, i32::from(MAX_HEALTH));
        self.health = after as u8;
        after - before
    }

    fn award_points(&mut self, points: u64) {
        self.points = self.points.saturating_add(points);
        self.evolution_stage = self.evolution_stage.max(stage_for_points(self.points));
    }

    fn record(&mut self, kind: EventKind, label: &str, delta: i32) {
        self.history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            kind,
            label: label.to_string(),
            delta,
            health: self.health,
        });
        self.trim_history();
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }
}

struct Persistence {
    store: StateStore,
    /// Revision of the newest state on disk.
    written: Mutex<u64>,
}

/// Thread-safe owner of the single `PetState`.
pub struct PetEngine {
    state: Mutex<PetState>,
    /// Bumped under the state lock on every committed mutation.
    revision: AtomicU64,
    threat_policy: ThreatPolicy,
    good_behavior: GoodBehaviorPolicy,
    persistence: Option<Persistence>,
}

impl PetEngine {
    pub fn new(
        history_capacity: usize,
        threat_policy: ThreatPolicy,
        good_behavior: GoodBehaviorPolicy,
    ) -> Self {
        Self {
            state: Mutex::new(PetState::new(history_capacity)),
            revision: AtomicU64::new(0),
            threat_policy,
            good_behavior,
            persistence: None,
        }
    }

    /// Restores the last saved state, falling back to defaults when the file is missing or unreadable.
    pub fn with_store(mut self, store: StateStore) -> Self {
        match store.load() {
            Ok(Some(mut saved)) => {
                let capacity = self.state.lock().history_capacity;
                saved.set_history_capacity(capacity);
                saved.normalize();
                debug!(path = ?store.path(), health = saved.health, "restored pet state");
                *self.state.get_mut() = saved;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "ignoring saved pet state"),
        }
        self.persistence = Some(Persistence {
            store,
            written: Mutex::new(0),
        });
        self
    }

    pub fn threat_policy(&self) -> &ThreatPolicy {
        &self.threat_policy
    }

    pub fn good_behavior_policy(&self) -> &GoodBehaviorPolicy {
        &self.good_behavior
    }

    /// Runs `f` with exclusive access, then persists. Only one mutation is ever in flight.
    ///
    /// The file is written after the state lock is released; a copy taken
    /// under the lock is saved only if nothing newer has reached disk.
    pub fn transact<R>(&self, f: impl FnOnce(&mut PetState) -> R) -> R {
        let (result, pending) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, self.commit(&state))
        };
        self.flush(pending);
        result
    }

    /// Like `transact`, but `f` may decline by returning `None`, in which
    /// case nothing is persisted.
    pub fn try_transact<R>(&self, f: impl FnOnce(&mut PetState) -> Option<R>) -> Option<R> {
        let (result, pending) = {
            let mut state = self.state.lock();
            let result = f(&mut state)?;
            (result, self.commit(&state))
        };
        self.flush(pending);
        Some(result)
    }

    /// Must be called with the state lock held.
    fn commit(&self, state: &PetState) -> Option<(u64, PetState)> {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.persistence.as_ref().map(|_| (revision, state.clone()))
    }

    fn flush(&self, pending: Option<(u64, PetState)>) {
        if let Some((revision, copy)) = pending {
            self.persist(revision, &copy);
        }
    }

    fn persist(&self, revision: u64, state: &PetState) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let mut written = persistence.written.lock();
        if revision <= *written {
            return;
        }
        match persistence.store.save(state) {
            Ok(()) => *written = revision,
            Err(e) => warn!(error = %e, "failed to persist pet state"),
        }
    }

    /// Read-only access under the same lock, without persisting.
    pub fn inspect<R>(&self, f: impl FnOnce(&PetState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn snapshot(&self) -> PetSnapshot {
        self.state.lock().snapshot()
    }

    pub fn recent_events(&self, n: usize) -> Vec<HistoryEntry> {
        self.state.lock().recent(n)
    }

    pub fn apply_event(&self, label: &str) -> PetSnapshot {
        self.transact(|pet| pet.apply_event(label))
    }

    pub fn process_threat_event(&self, severity: i64, threat_type: &str) -> ThreatOutcome {
        let policy = self.threat_policy;
        self.transact(|pet| pet.apply_threat(severity, threat_type, &policy))
    }

    pub fn process_good_behavior(&self, seconds_safe: u64) -> PetSnapshot {
        let policy = self.good_behavior;
        self.transact(|pet| pet.apply_good_behavior(seconds_safe, &policy))
    }

    pub fn reset(&self) -> PetSnapshot {
        self.transact(|pet| pet.reset())
    }

    pub fn set_health(&self, health: i64) -> PetSnapshot {
        self.transact(|pet| pet.set_health(health))
    }
}

impl Default for PetEngine {
    fn default() -> Self {
        Self::new(
            DEFAULT_HISTORY_CAPACITY,
            ThreatPolicy::default(),
            GoodBehaviorPolicy::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mood_thresholds() {
        for h in 0..=100u8 {
            let expected = if h >= 75 {
                Mood::Happy
            } else if h >= 50 {
                Mood::Concerned
            } else if h >= 25 {
                Mood::Sick
            } else if h > 0 {
                Mood::Critical
            } else {
                Mood::Dead
            };
            assert_eq!(Mood::from_health(h), expected, "health {}", h);
        }
    }

    #[test]
    fn test_phishing_walk_down() {
        let mut pet = PetState::default();
        let snap = pet.apply_event("phishing_detected");
        assert_eq!((snap.health, snap.mood), (85, Mood::Happy));

        pet.apply_event("phishing_detected");
        let snap = pet.apply_event("phishing_detected");
        assert_eq!((snap.health, snap.mood), (55, Mood::Concerned));

        let snap = pet.apply_event("phishing_detected");
        assert_eq!((snap.health, snap.mood), (40, Mood::Sick));
        assert_eq!(snap.last_event.as_deref(), Some("phishing_detected"));
    }

    #[test]
    fn test_health_is_clamped() {
        let mut pet = PetState::default();
        for _ in 0..20 {
            let snap = pet.apply_event("password_weak");
            assert!(snap.health <= 100);
        }
        assert_eq!(pet.health(), 0);
        assert_eq!(pet.mood(), Mood::Dead);

        let policy = ThreatPolicy::default();
        let outcome = pet.apply_threat(100, "phishing_email", &policy);
        assert_eq!(outcome.snapshot.health, 0);
        assert_eq!(outcome.delta, 0);

        let mut pet = PetState::default();
        for _ in 0..20 {
            pet.apply_event("mfa_enabled");
        }
        assert_eq!(pet.health(), 100);
    }

    #[test]
    fn test_unknown_label_is_recorded_without_effect() {
        let mut pet = PetState::default();
        pet.apply_event("phishing_detected");
        let snap = pet.apply_event("mystery");
        assert_eq!(snap.health, 85);
        assert_eq!(snap.mood, Mood::Happy);
        assert_eq!(snap.last_event.as_deref(), Some("mystery"));

        let last = pet.recent(1).pop().expect("history entry");
        assert_eq!(last.label, "mystery");
        assert_eq!(last.delta, 0);
    }

    #[test]
    fn test_threat_below_threshold_is_ignored() {
        let mut pet = PetState::default();
        let outcome = pet.apply_threat(30, "x", &ThreatPolicy::default());
        assert!(!outcome.applied);
        assert!(!outcome.should_alert);
        assert_eq!(outcome.snapshot.health, 100);
        assert!(pet.recent(10).is_empty());
        assert_eq!(outcome.snapshot.last_event, None);
    }

    #[test]
    fn test_threat_penalty_scales_with_severity() {
        let policy = ThreatPolicy::default();
        let mut low = PetState::default();
        let mut high = PetState::default();
        let a = low.apply_threat(72, "fake_login", &policy);
        let b = high.apply_threat(99, "fake_login", &policy);
        assert!(a.snapshot.health >= b.snapshot.health);
        assert!(b.should_alert);
        assert_eq!(high.recent(1)[0].kind, EventKind::Threat);
    }

    #[test]
    fn test_good_behavior_recovers_without_overflow() {
        let policy = GoodBehaviorPolicy::default();
        let mut pet = PetState::default();
        pet.set_health(10);
        let snap = pet.apply_good_behavior(120, &policy);
        assert!(snap.health > 10 && snap.health <= 100);
        assert_eq!(snap.mood, Mood::from_health(snap.health));
        assert_eq!(snap.good_behavior_streak, 1);

        let mut pet = PetState::default();
        let mut streak = 0;
        for _ in 0..5 {
            let snap = pet.apply_good_behavior(3600, &policy);
            assert_eq!(snap.health, 100);
            assert!(snap.good_behavior_streak > streak);
            streak = snap.good_behavior_streak;
        }
    }

    #[test]
    fn test_evolution_and_points() {
        let mut pet = PetState::default();
        let snap = pet.apply_event("pet_evolve");
        assert_eq!(snap.evolution_stage, 2);
        assert_eq!(snap.points, 5);

        // 20 hours of safe time crosses every points threshold.
        let snap = pet.apply_good_behavior(20 * 3600, &GoodBehaviorPolicy::default());
        assert_eq!(snap.points, 6005);
        assert_eq!(snap.evolution_stage, MAX_STAGE);

        let snap = pet.apply_event("pet_evolve");
        assert_eq!(snap.evolution_stage, MAX_STAGE);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut pet = PetState::new(5);
        pet.apply_event("phishing_detected");
        pet.apply_good_behavior(60, &GoodBehaviorPolicy::default());
        let snap = pet.reset();
        assert_eq!(snap.health, 100);
        assert_eq!(snap.evolution_stage, 1);
        assert_eq!(snap.points, 0);
        assert_eq!(snap.good_behavior_streak, 0);
        assert!(pet.recent(10).is_empty());
    }

    #[test]
    fn test_set_health_clamps_and_is_idempotent() {
        let mut pet = PetState::default();
        assert_eq!(pet.set_health(250).health, 100);
        assert_eq!(pet.set_health(-3).health, 0);
        let first = pet.set_health(40);
        let second = pet.set_health(40);
        assert_eq!(first, second);
        assert_eq!(second.mood, Mood::Sick);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut pet = PetState::new(3);
        for label in ["a", "b", "c", "d", "e"] {
            pet.apply_event(label);
        }
        let labels: Vec<_> = pet.recent(10).into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["c", "d", "e"]);
        assert_eq!(pet.recent(2).len(), 2);
    }

    #[test]
    fn test_recent_returns_copies() {
        let engine = PetEngine::default();
        engine.apply_event("safe_action");
        let mut copy = engine.recent_events(10);
        copy.clear();
        assert_eq!(engine.recent_events(10).len(), 1);
    }

    #[test]
    fn test_engine_restores_saved_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pet_state.json");

        let engine = PetEngine::default().with_store(StateStore::new(&path));
        engine.apply_event("phishing_detected");
        engine.process_good_behavior(60);
        drop(engine);

        let restored = PetEngine::new(1, ThreatPolicy::default(), GoodBehaviorPolicy::default())
            .with_store(StateStore::new(&path));
        let snap = restored.snapshot();
        assert_eq!(snap.health, 87);
        assert_eq!(snap.good_behavior_streak, 1);
        // Restored history is trimmed to the new capacity.
        assert_eq!(restored.recent_events(10).len(), 1);
        Ok(())
    }

    #[test]
    fn test_out_of_range_saved_state_is_clamped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pet_state.json");
        std::fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({
                "health": 250,
                "last_event": null,
                "evolution_stage": 9,
                "points": 0,
                "good_behavior_streak": 0,
                "history": [],
            }))?,
        )?;

        let engine = PetEngine::default().with_store(StateStore::new(&path));
        let snap = engine.snapshot();
        assert_eq!(snap.health, MAX_HEALTH);
        assert_eq!(snap.mood, Mood::Happy);
        assert_eq!(snap.evolution_stage, MAX_STAGE);
        Ok(())
    }

    #[test]
    fn test_declined_transaction_changes_nothing() {
        let engine = PetEngine::default();
        let out: Option<()> = engine.try_transact(|_| None);
        assert!(out.is_none());
        assert!(engine.recent_events(10).is_empty());
    }

    #[test]
    fn test_concurrent_saves_keep_the_newest_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pet_state.json");
        let engine = Arc::new(PetEngine::default().with_store(StateStore::new(&path)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        engine.process_good_behavior(60);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker thread");
        }

        let live = engine.snapshot();
        assert_eq!(live.good_behavior_streak, 40);
        let saved = StateStore::new(&path).load()?.expect("state was saved");
        assert_eq!(saved.snapshot(), live);
        Ok(())
    }

    #[test]
    fn test_concurrent_events_do_not_lose_updates() {
        let engine = Arc::new(PetEngine::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    engine.apply_event("mystery");
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker thread");
        }
        engine.apply_event("phishing_detected");
        engine.apply_event("phishing_detected");
        assert_eq!(engine.snapshot().health, 70);
        assert_eq!(engine.recent_events(100).len(), 6);
    }
}
