use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Result, bail};
use http::Method;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::auth::CLIENT_IP_HEADER;
use crate::engine::EvaluationState;
use crate::ingress::codec::RawRequest;
use crate::ingress::response::InBandVerdict;
use crate::util::normalize_remote_addr;

/// Ordered header collection with preserved case for emission and
/// case-insensitive lookup for evaluation.
#[derive(Debug, Clone, Default)]
pub struct HeaderFields {
    fields: Vec<HeaderField>,
}

#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + 'b
    where
        'a: 'b,
    {
        self.fields
            .iter()
            .filter(move |field| field.name.eq_ignore_ascii_case(name))
            .map(|field| field.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }
}

/// Canonical snapshot of one forwarded HTTP request, plus the single-shot
/// reply channel the in-band verdict travels back on.
///
/// Created by the ingress handler, handed to a runner through the work queue,
/// and dropped once both phases completed and the event, if any, went out.
#[derive(Debug)]
pub struct ParsedRequest {
    pub id: Uuid,
    pub received_at: OffsetDateTime,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderFields,
    pub body: Vec<u8>,
    /// Original client IP declared by the front-end, when parseable.
    pub client_ip: Option<IpAddr>,
    /// Peer of the forwarding connection; `None` on the unix socket listener.
    pub remote_addr: Option<SocketAddr>,
    pub remote_addr_normalized: String,
    pub engine_name: Arc<str>,
    /// Built by the owning runner during processing; empty until then.
    pub state: EvaluationState,
    /// Taken by the runner; delivered to exactly once per request.
    pub reply: Option<oneshot::Sender<InBandVerdict>>,
}

impl ParsedRequest {
    pub fn from_raw(
        raw: RawRequest,
        remote_addr: Option<SocketAddr>,
        engine_name: Arc<str>,
    ) -> Result<(Self, oneshot::Receiver<InBandVerdict>)> {
        let (path, query) = split_target(&raw.target)?;
        let client_ip = raw
            .headers
            .get(CLIENT_IP_HEADER)
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        let remote_addr_normalized = remote_addr
            .map(normalize_remote_addr)
            .unwrap_or_else(|| "unix".to_string());

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            received_at: OffsetDateTime::now_utc(),
            method: raw.method,
            path,
            query,
            headers: raw.headers,
            body: raw.body,
            client_ip,
            remote_addr,
            remote_addr_normalized,
            engine_name,
            state: EvaluationState::default(),
            reply: Some(reply_tx),
        };
        Ok((request, reply_rx))
    }
}

fn split_target(target: &str) -> Result<(String, Option<String>)> {
    if !target.starts_with('/') {
        bail!("request target must be origin-form (start with '/'), got '{target}'");
    }
    match target.split_once('?') {
        Some((path, query)) => Ok((path.to_string(), Some(query.to_string()))),
        None => Ok((target.to_string(), None)),
    }
}

#[cfg(test)]
pub(crate) fn test_request(
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> ParsedRequest {
    let mut fields = HeaderFields::new();
    for (name, value) in headers {
        fields.push(*name, *value);
    }
    ParsedRequest {
        id: Uuid::new_v4(),
        received_at: OffsetDateTime::now_utc(),
        method,
        path: path.to_string(),
        query: None,
        headers: fields,
        body: body.to_vec(),
        client_ip: None,
        remote_addr: Some("127.0.0.1:9999".parse().unwrap()),
        remote_addr_normalized: "127.0.0.1".to_string(),
        engine_name: Arc::from("test-engine"),
        state: EvaluationState::default(),
        reply: None,
    }
}
