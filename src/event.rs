use std::collections::BTreeMap;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{EvaluationState, PhaseState};
use crate::ingress::request::ParsedRequest;

/// Security event emitted to the downstream bus when either phase reached a
/// non-`Allow` disposition.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub engine: String,
    pub request_id: String,
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub client_ip: Option<String>,
    pub remote_addr: String,
    pub inband: PhaseSummary,
    pub outofband: PhaseSummary,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub matched_rules: Vec<String>,
    pub disposition: String,
}

impl PhaseSummary {
    fn from_state(state: &PhaseState) -> Self {
        Self {
            matched_rules: state
                .matched_rules
                .iter()
                .map(|rule| rule.to_string())
                .collect(),
            disposition: state.disposition.kind().to_string(),
        }
    }
}

impl SecurityEvent {
    pub fn from_evaluation(
        request: &ParsedRequest,
        state: &EvaluationState,
        labels: BTreeMap<String, String>,
    ) -> Self {
        let timestamp = request
            .received_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| request.received_at.to_string());
        Self {
            engine: request.engine_name.to_string(),
            request_id: request.id.to_string(),
            timestamp,
            method: request.method.to_string(),
            path: request.path.clone(),
            client_ip: request.client_ip.map(|ip| ip.to_string()),
            remote_addr: request.remote_addr_normalized.clone(),
            inband: PhaseSummary::from_state(&state.in_band),
            outofband: PhaseSummary::from_state(&state.out_of_band),
            labels,
        }
    }
}

/// Default sink for the binary: logs each event as one JSON line. Embedders
/// wanting a real bus keep the receiver themselves.
pub fn spawn_log_sink(mut events: mpsc::Receiver<SecurityEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!(target: "security_event", event = %line),
                Err(err) => warn!(error = %err, "failed to serialize security event"),
            }
        }
    })
}
