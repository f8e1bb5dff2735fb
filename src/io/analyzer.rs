//! External screen analyzer.
//!
//! The core only needs `analyze() -> ScanReport`. Which variant runs is picked
//! once at start-up from the config.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::core::classifier::clamp_severity;
use crate::core::state::{AnalyzerConfig, AnalyzerKind};

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer timed out after {0:?}")]
    Timeout(Duration),
    #[error("analyzer request failed: {0}")]
    Transport(String),
    #[error("malformed analyzer report: {0}")]
    Malformed(String),
}

fn clamped_confidence<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
    let raw = Option::<f64>::deserialize(d)?.unwrap_or(0.0);
    Ok(clamp_severity(raw.round() as i64))
}

/// One scan result, as returned by any analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub threat_detected: bool,
    #[serde(default)]
    pub threat_type: Option<String>,
    #[serde(default, deserialize_with = "clamped_confidence")]
    pub confidence: u8,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub user_friendly_message: String,
}

impl ScanReport {
    pub fn clean() -> Self {
        Self {
            threat_detected: false,
            threat_type: None,
            confidence: 0,
            explanation: "Screen appears safe".to_string(),
            user_friendly_message: String::new(),
        }
    }

    pub fn threat(threat_type: &str, confidence: u8, explanation: &str) -> Self {
        Self {
            threat_detected: true,
            threat_type: Some(threat_type.to_string()),
            confidence: confidence.min(100),
            explanation: explanation.to_string(),
            user_friendly_message: String::new(),
        }
    }
}

/// Parses a report that may be bare JSON or wrapped in a Markdown code fence.
pub fn parse_report(response: &str) -> Result<ScanReport, AnalyzerError> {
    let mut body = response.trim();
    if let Some(rest) = body.strip_prefix("```json") {
        body = rest;
    } else if let Some(rest) = body.strip_prefix("```") {
        body = rest;
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }
    serde_json::from_str(body.trim()).map_err(|e| AnalyzerError::Malformed(e.to_string()))
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self) -> Result<ScanReport, AnalyzerError>;

    fn name(&self) -> &'static str;
}

/// Replays a fixed script of outcomes, forever. Empty script means always clean.
pub struct MockAnalyzer {
    script: Vec<Result<ScanReport, String>>,
    cursor: Mutex<usize>,
}

impl MockAnalyzer {
    pub fn clean() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Result<ScanReport, String>>) -> Self {
        Self {
            script,
            cursor: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.cursor.lock()
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(&self) -> Result<ScanReport, AnalyzerError> {
        let mut cursor = self.cursor.lock();
        let step = *cursor;
        *cursor += 1;
        if self.script.is_empty() {
            return Ok(ScanReport::clean());
        }
        match &self.script[step % self.script.len()] {
            Ok(report) => Ok(report.clone()),
            Err(reason) => Err(AnalyzerError::Transport(reason.clone())),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Asks a remote classification service for a verdict on the current screen.
pub struct HttpAnalyzer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self) -> Result<ScanReport, AnalyzerError> {
        let mut req = self.client.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req
            .send()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(AnalyzerError::Transport(format!("{} - {}", status, text)));
        }
        debug!(bytes = text.len(), "analyzer replied");
        parse_report(&text)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Composition-time selection of the analyzer variant.
pub fn from_config(config: &AnalyzerConfig) -> anyhow::Result<Arc<dyn Analyzer>> {
    match config.kind {
        AnalyzerKind::Mock => Ok(Arc::new(MockAnalyzer::clean())),
        AnalyzerKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| anyhow::anyhow!("analyzer.endpoint is required for the http analyzer"))?;
            let api_key = config
                .api_key_env
                .as_deref()
                .and_then(|name| env::var(name).ok());
            Ok(Arc::new(HttpAnalyzer::new(endpoint, api_key)))
        }
    }
}
