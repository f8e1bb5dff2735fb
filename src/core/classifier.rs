//! Event Classifier
//!
//! Turns a raw event label or a detected-threat severity into a health delta.
//! Transport-agnostic and pure: nothing here touches the pet itself.

use serde::{Deserialize, Serialize};

use super::pet::MAX_HEALTH;

/// Health penalty for labels that signal a risky action.
pub const RISKY_DELTA: i32 = -15;
/// Health reward for labels that signal a safe action.
pub const SAFE_DELTA: i32 = 10;
/// Health reward for an explicit evolution event.
pub const EVOLVE_DELTA: i32 = 5;

pub const EVOLVE_LABEL: &str = "pet_evolve";

/// Upper bound on `ThreatPolicy::max_penalty`, so no single report can take a healthy pet to zero.
pub const PENALTY_CEILING: u8 = 50;

/// Static label table. Unknown labels map to `0`.
pub fn classify_label(label: &str) -> i32 {
    match label {
        "phishing_detected" | "password_weak" | "http_insecure_site" => RISKY_DELTA,
        "password_strong" | "mfa_enabled" | "safe_action" => SAFE_DELTA,
        EVOLVE_LABEL => EVOLVE_DELTA,
        _ => 0,
    }
}

/// Whether a label is part of the table at all.
pub fn is_known_label(label: &str) -> bool {
    matches!(
        label,
        "phishing_detected"
            | "password_weak"
            | "http_insecure_site"
            | "password_strong"
            | "mfa_enabled"
            | "safe_action"
            | EVOLVE_LABEL
    )
}

/// Clamp an externally supplied severity/confidence into `[0, 100]`.
pub fn clamp_severity(raw: i64) -> u8 {
    raw.clamp(0, 100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatAssessment {
    /// Below the ignore threshold: treat as a non-event.
    Ignored,
    /// Apply this (non-positive) delta.
    Penalty(i32),
}

/// How detected threats translate into health loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatPolicy {
    /// Confidences strictly below this are ignored.
    pub ignore_below: u8,
    /// Applied threats with severity strictly above this should alert the user.
    pub alert_above: u8,
    /// Largest health loss a single report can cause.
    pub max_penalty: u8,
}

impl Default for ThreatPolicy {
    fn default() -> Self {
        Self {
            ignore_below: 70,
            alert_above: 50,
            max_penalty: 25,
        }
    }
}

impl ThreatPolicy {
    pub fn is_actionable(&self, severity: u8) -> bool {
        severity >= self.ignore_below
    }

    pub fn should_alert(&self, severity: u8) -> bool {
        severity > self.alert_above
    }

    /// Bounded linear mapping: `ceil(severity * max_penalty / 100)`, negated.
    ///
    /// Monotonic non-decreasing in severity and never larger than `max_penalty`.
    pub fn penalty(&self, severity: u8) -> i32 {
        let severity = u32::from(severity.min(100));
        let max = u32::from(self.max_penalty.min(PENALTY_CEILING));
        let loss = (severity * max).div_ceil(100);
        -(loss as i32)
    }

    /// Pulls every field back into its meaningful range.
    pub fn sanitized(self) -> Self {
        Self {
            ignore_below: self.ignore_below.min(100),
            alert_above: self.alert_above.min(100),
            max_penalty: self.max_penalty.min(PENALTY_CEILING),
        }
    }

    pub fn assess(&self, severity: u8) -> ThreatAssessment {
        if self.is_actionable(severity) {
            ThreatAssessment::Penalty(self.penalty(severity))
        } else {
            ThreatAssessment::Ignored
        }
    }
}

/// Reward for time spent without incidents. Credit is granted in whole steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoodBehaviorPolicy {
    pub step_secs: u64,
    pub health_per_step: u32,
    pub max_health_per_credit: u32,
    pub points_per_step: u64,
}

impl Default for GoodBehaviorPolicy {
    fn default() -> Self {
        Self {
            step_secs: 60,
            health_per_step: 2,
            max_health_per_credit: 10,
            points_per_step: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    pub health: i32,
    pub points: u64,
}

impl GoodBehaviorPolicy {
    /// Every call earns at least one step.
    pub fn steps(&self, seconds_safe: u64) -> u64 {
        (seconds_safe / self.step_secs.max(1)).max(1)
    }

    /// Never negative, and never more than a full bar of health.
    pub fn credit(&self, seconds_safe: u64) -> Credit {
        let steps = self.steps(seconds_safe);
        let health = steps
            .saturating_mul(u64::from(self.health_per_step))
            .min(u64::from(self.max_health_per_credit))
            .min(u64::from(MAX_HEALTH));
        Credit {
            health: i32::try_from(health).unwrap_or(0),
            points: steps.saturating_mul(self.points_per_step),
        }
    }

    pub fn sanitized(self) -> Self {
        let cap = u32::from(MAX_HEALTH);
        Self {
            step_secs: self.step_secs.max(1),
            health_per_step: self.health_per_step.min(cap),
            max_health_per_credit: self.max_health_per_credit.min(cap),
            points_per_step: self.points_per_step,
        }
    }
}
