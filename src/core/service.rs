//! Couples the State Engine with the Connection Hub.
//!
//! Each operation mutates the pet and broadcasts the result inside the same
//! engine transaction, so clients observe snapshots in mutation order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pet::{HistoryEntry, PetEngine, PetSnapshot};
use crate::io::analyzer::ScanReport;
use crate::io::hub::{ClientId, ClientSink, ConnectionHub, DeliveryError};
use crate::io::messages::{ServerMessage, ThreatNotice};

/// A threat reported through the API (e.g. by the browser extension).
#[derive(Debug, Clone, Deserialize)]
pub struct ThreatReport {
    #[serde(rename = "type")]
    pub threat_type: String,
    pub severity: i64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreatResponse {
    pub pet_state: PetSnapshot,
    pub should_alert: bool,
}

/// What a monitoring scan did to the pet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEffect {
    Threat { delta: i32 },
    Credit,
}

pub struct PetService {
    engine: PetEngine,
    hub: Arc<ConnectionHub>,
}

impl PetService {
    pub fn new(engine: PetEngine, hub: Arc<ConnectionHub>) -> Self {
        Self { engine, hub }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn snapshot(&self) -> PetSnapshot {
        self.engine.snapshot()
    }

    pub fn recent_events(&self, n: usize) -> Vec<HistoryEntry> {
        self.engine.recent_events(n)
    }

    /// Registers a real-time client; its first frame is the current snapshot.
    ///
    /// Locks are always taken engine first, hub second.
    pub fn connect_client<S>(&self, sink: S) -> Result<ClientId, DeliveryError>
    where
        S: ClientSink + 'static,
    {
        self.engine.inspect(|pet| {
            self.hub.connect(sink, || {
                ServerMessage::HealthUpdate {
                    pet_state: pet.snapshot(),
                }
                .to_frame()
            })
        })
    }

    /// Re-sends the current snapshot to everyone as a `pet_snapshot`.
    pub fn announce_snapshot(&self) -> usize {
        self.engine.inspect(|pet| {
            self.hub
                .broadcast(ServerMessage::PetSnapshot { data: pet.snapshot() }.to_frame())
        })
    }

    pub fn submit_event(&self, label: &str) -> PetSnapshot {
        self.engine.transact(|pet| {
            let snap = pet.apply_event(label);
            debug!(label, health = snap.health, "event applied");
            self.hub
                .broadcast(ServerMessage::PetSnapshot { data: snap.clone() }.to_frame());
            snap
        })
    }

    /// Applies a reported threat. Reports under the ignore threshold change
    /// nothing and broadcast nothing.
    pub fn submit_threat(&self, report: &ThreatReport) -> ThreatResponse {
        let policy = *self.engine.threat_policy();
        self.engine.transact(|pet| {
            let outcome = pet.apply_threat(report.severity, &report.threat_type, &policy);
            if outcome.applied {
                let explanation = report
                    .metadata
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let threat =
                    ThreatNotice::from_type(&report.threat_type, outcome.severity, explanation);
                info!(
                    threat = %report.threat_type,
                    severity = outcome.severity,
                    health = outcome.snapshot.health,
                    "threat applied"
                );
                self.hub.broadcast(
                    ServerMessage::ThreatDetected {
                        threat,
                        pet_state: outcome.snapshot.clone(),
                    }
                    .to_frame(),
                );
            } else {
                debug!(threat = %report.threat_type, severity = outcome.severity, "threat below ignore threshold");
            }
            ThreatResponse {
                pet_state: outcome.snapshot,
                should_alert: outcome.should_alert,
            }
        })
    }

    pub fn credit_good_behavior(&self, seconds_safe: u64) -> PetSnapshot {
        let policy = *self.engine.good_behavior_policy();
        self.engine.transact(|pet| {
            let snap = pet.apply_good_behavior(seconds_safe, &policy);
            self.broadcast_health(&snap);
            snap
        })
    }

    /// Feeds one monitoring result into the pet. Low-confidence detections
    /// count as a clean scan. Returns `None` without touching the pet once
    /// `cancel` has fired; the check runs under the engine lock.
    pub fn apply_scan(
        &self,
        report: &ScanReport,
        seconds_safe: u64,
        cancel: &CancellationToken,
    ) -> Option<ScanEffect> {
        let threat_policy = *self.engine.threat_policy();
        let credit_policy = *self.engine.good_behavior_policy();
        self.engine.try_transact(|pet| {
            if cancel.is_cancelled() {
                return None;
            }
            if report.threat_detected && threat_policy.is_actionable(report.confidence) {
                let threat_type = report.threat_type.as_deref().unwrap_or("unknown_threat");
                let outcome = pet.apply_threat(i64::from(report.confidence), threat_type, &threat_policy);
                let threat = ThreatNotice {
                    threat_type: threat_type.to_string(),
                    confidence: outcome.severity,
                    explanation: report.explanation.clone(),
                    user_friendly_message: report.user_friendly_message.clone(),
                };
                info!(threat = threat_type, confidence = outcome.severity, "alert sent to clients");
                self.hub.broadcast(
                    ServerMessage::ThreatDetected {
                        threat,
                        pet_state: outcome.snapshot,
                    }
                    .to_frame(),
                );
                Some(ScanEffect::Threat { delta: outcome.delta })
            } else {
                let snap = pet.apply_good_behavior(seconds_safe, &credit_policy);
                self.broadcast_health(&snap);
                Some(ScanEffect::Credit)
            }
        })
    }

    pub fn reset(&self) -> PetSnapshot {
        self.engine.transact(|pet| {
            let snap = pet.reset();
            info!("pet reset to default state");
            self.broadcast_health(&snap);
            snap
        })
    }

    pub fn set_health(&self, health: i64) -> PetSnapshot {
        self.engine.transact(|pet| {
            let snap = pet.set_health(health);
            info!(health = snap.health, "pet health set manually");
            self.broadcast_health(&snap);
            snap
        })
    }

    fn broadcast_health(&self, snap: &PetSnapshot) {
        self.hub.broadcast(
            ServerMessage::HealthUpdate {
                pet_state: snap.clone(),
            }
            .to_frame(),
        );
    }
}
