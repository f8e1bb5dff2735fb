//! Monitoring Loop Controller
//!
//! At most one background scan loop per process. `stop` cancels the loop and
//! joins it, so once `stop` returns the loop can no longer touch the pet.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::service::PetService;
use super::state::MonitorConfig;
use crate::io::analyzer::{Analyzer, AnalyzerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    pub interval: Duration,
    pub analyzer_timeout: Duration,
    pub error_backoff: Duration,
}

impl From<&MonitorConfig> for MonitorTiming {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            interval: config.interval(),
            analyzer_timeout: config.analyzer_timeout(),
            error_backoff: config.error_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Started,
    AlreadyRunning,
    Stopped,
    NotRunning,
}

impl MonitorStatus {
    pub fn message(&self, timing: &MonitorTiming) -> String {
        match self {
            MonitorStatus::Started => format!(
                "Monitoring started - checking every {} seconds",
                timing.interval.as_secs()
            ),
            MonitorStatus::AlreadyRunning => "Monitoring is already active".to_string(),
            MonitorStatus::Stopped => "Monitoring stopped".to_string(),
            MonitorStatus::NotRunning => "Monitoring is not active".to_string(),
        }
    }
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Monitor {
    service: Arc<PetService>,
    analyzer: Arc<dyn Analyzer>,
    timing: MonitorTiming,
    running: Mutex<Option<Running>>,
    checks: Arc<AtomicU64>,
}

impl Monitor {
    pub fn new(service: Arc<PetService>, analyzer: Arc<dyn Analyzer>, timing: MonitorTiming) -> Self {
        Self {
            service,
            analyzer,
            timing,
            running: Mutex::new(None),
            checks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn timing(&self) -> &MonitorTiming {
        &self.timing
    }

    /// Number of scans attempted since the process started.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    pub async fn start(&self) -> MonitorStatus {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return MonitorStatus::AlreadyRunning;
        }
        let token = CancellationToken::new();
        let task = tokio::spawn(scan_loop(
            self.service.clone(),
            self.analyzer.clone(),
            self.timing,
            token.clone(),
            self.checks.clone(),
        ));
        *running = Some(Running { token, task });
        MonitorStatus::Started
    }

    pub async fn stop(&self) -> MonitorStatus {
        let mut running = self.running.lock().await;
        let Some(Running { token, task }) = running.take() else {
            return MonitorStatus::NotRunning;
        };
        let was_live = !task.is_finished();
        token.cancel();
        if let Err(e) = task.await {
            error!(error = %e, "monitoring task ended abnormally");
        }
        if was_live {
            MonitorStatus::Stopped
        } else {
            MonitorStatus::NotRunning
        }
    }
}

async fn scan_loop(
    service: Arc<PetService>,
    analyzer: Arc<dyn Analyzer>,
    timing: MonitorTiming,
    token: CancellationToken,
    checks: Arc<AtomicU64>,
) {
    info!(
        interval_secs = timing.interval.as_secs(),
        analyzer = analyzer.name(),
        "monitoring started"
    );

    loop {
        let check = checks.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(check, "scanning");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            res = tokio::time::timeout(timing.analyzer_timeout, analyzer.analyze()) => {
                res.unwrap_or(Err(AnalyzerError::Timeout(timing.analyzer_timeout)))
            }
        };

        let pause = match result {
            Ok(report) => match service.apply_scan(&report, timing.interval.as_secs(), &token) {
                Some(effect) => {
                    debug!(check, ?effect, "scan applied");
                    timing.interval
                }
                None => break,
            },
            Err(e) => {
                warn!(check, error = %e, "scan failed, backing off");
                timing.error_backoff
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    info!("monitoring stopped");
}
