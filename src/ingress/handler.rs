use std::net::SocketAddr;

use http::StatusCode;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use super::AppContext;
use super::codec::RawRequest;
use super::request::ParsedRequest;
use crate::auth::{API_KEY_HEADER, CLIENT_IP_HEADER};
use crate::metrics;

/// What the server writes back for one request.
#[derive(Debug)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: Option<Value>,
}

impl HttpReply {
    pub fn status_only(status: StatusCode) -> Self {
        Self { status, body: None }
    }
}

/// One request flow: route check, API-key auth with cached validations,
/// parse, dispatch to a runner, await the in-band verdict.
///
/// Evaluation state is never touched here; all mutation happens on the runner
/// that owns the request.
pub async fn handle(app: &AppContext, raw: RawRequest, remote_addr: Option<SocketAddr>) -> HttpReply {
    let peer_label = remote_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unix".to_string());

    let path_part = raw.target.split('?').next().unwrap_or("");
    if !path_part.starts_with(app.settings.path.as_str()) {
        debug!(peer = %peer_label, target = %raw.target, "request outside configured path prefix");
        return HttpReply {
            status: StatusCode::NOT_FOUND,
            body: Some(json!({ "action": "unknown" })),
        };
    }

    let declared_ip = raw.headers.get(CLIENT_IP_HEADER).unwrap_or("").to_string();
    let Some(api_key) = raw.headers.get(API_KEY_HEADER).map(str::to_string) else {
        error!(peer = %peer_label, real_ip = %declared_ip, "unauthorized request without API key");
        return HttpReply::status_only(StatusCode::UNAUTHORIZED);
    };

    let now = OffsetDateTime::now_utc();
    if !app.auth.cache.is_fresh(&api_key, now) {
        if !app.auth.probe.is_valid(&api_key).await {
            error!(peer = %peer_label, real_ip = %declared_ip, "unauthorized request");
            return HttpReply::status_only(StatusCode::UNAUTHORIZED);
        }
        // only positive validations enter the cache
        app.auth.cache.set(&api_key, now + app.auth.ttl);
    }

    let (request, reply_rx) =
        match ParsedRequest::from_raw(raw, remote_addr, app.engine_name.clone()) {
            Ok(pair) => pair,
            Err(err) => {
                error!(peer = %peer_label, error = %err, "failed to parse forwarded request");
                return HttpReply::status_only(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
    let source = request.remote_addr_normalized.clone();
    let request_id = request.id;
    metrics::record_request(&source, &app.engine_name);

    // Synchronous handoff to the runner pool; a shutdown signal aborts the
    // wait so drain never deadlocks on a full queue.
    let mut shutdown = app.shutdown.clone();
    tokio::select! {
        sent = app.queue.send(request) => {
            if sent.is_err() {
                warn!(request = %request_id, "work queue closed, rejecting request");
                return HttpReply::status_only(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
        _ = shutdown.changed() => {
            warn!(request = %request_id, "shutdown while waiting for a runner, rejecting request");
            return HttpReply::status_only(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    // No deadline here: the in-band phase is expected to complete promptly,
    // and the runner delivers exactly one verdict even on panic.
    let verdict = match reply_rx.await {
        Ok(verdict) => verdict,
        Err(_) => {
            error!(request = %request_id, "runner dropped the reply channel");
            return HttpReply::status_only(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if verdict.interrupt {
        metrics::record_block(&source, &app.engine_name);
    }
    HttpReply {
        status: verdict.status,
        body: Some(verdict.body),
    }
}
