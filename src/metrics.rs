use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpListener,
};

use crate::ingress::codec;
use crate::ingress::server::build_response;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "ingressguard_requests_total",
        "Requests received by source and engine",
    );
    let vec = IntCounterVec::new(opts, &["source", "appsec_engine"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register ingressguard_requests_total");
    vec
});

static BLOCKED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "ingressguard_blocked_total",
        "Requests interrupted by the in-band phase",
    );
    let vec = IntCounterVec::new(opts, &["source", "appsec_engine"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register ingressguard_blocked_total");
    vec
});

static RULE_HITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("ingressguard_rule_hits_total", "Rule match counter");
    let vec = IntCounterVec::new(opts, &["rule_name", "phase", "source", "appsec_engine"])
        .expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register ingressguard_rule_hits_total");
    vec
});

static INBAND_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "ingressguard_inband_seconds",
        "In-band phase evaluation time",
    )
    .buckets(evaluation_buckets());
    let vec = HistogramVec::new(opts, &["source", "appsec_engine"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register ingressguard_inband_seconds");
    vec
});

static OUTOFBAND_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "ingressguard_outofband_seconds",
        "Out-of-band phase evaluation time",
    )
    .buckets(evaluation_buckets());
    let vec = HistogramVec::new(opts, &["source", "appsec_engine"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register ingressguard_outofband_seconds");
    vec
});

static PROCESSING_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "ingressguard_processing_seconds",
        "Total per-request evaluation time across both phases",
    )
    .buckets(evaluation_buckets());
    let vec = HistogramVec::new(opts, &["source", "appsec_engine"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register ingressguard_processing_seconds");
    vec
});

fn evaluation_buckets() -> Vec<f64> {
    // Rule evaluation is expected to stay in the sub-millisecond range.
    vec![
        0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
    ]
}

// Scrape requests carry no meaningful body.
const METRICS_MAX_BODY_BYTES: usize = 1024;

pub fn record_request(source: &str, engine: &str) {
    REQUESTS_TOTAL.with_label_values(&[source, engine]).inc();
}

pub fn record_block(source: &str, engine: &str) {
    BLOCKED_TOTAL.with_label_values(&[source, engine]).inc();
}

pub fn record_rule_hit(rule_name: &str, phase: &str, source: &str, engine: &str) {
    RULE_HITS_TOTAL
        .with_label_values(&[rule_name, phase, source, engine])
        .inc();
}

pub fn observe_inband(source: &str, engine: &str, elapsed: Duration) {
    INBAND_SECONDS
        .with_label_values(&[source, engine])
        .observe(elapsed.as_secs_f64());
}

pub fn observe_outofband(source: &str, engine: &str, elapsed: Duration) {
    OUTOFBAND_SECONDS
        .with_label_values(&[source, engine])
        .observe(elapsed.as_secs_f64());
}

pub fn observe_processing(source: &str, engine: &str, elapsed: Duration) {
    PROCESSING_SECONDS
        .with_label_values(&[source, engine])
        .observe(elapsed.as_secs_f64());
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

pub struct MetricsTlsConfig {
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}

/// Text-format exporter endpoint. One request per connection; the request is
/// read with the same codec the ingress listeners use.
pub async fn serve(addr: SocketAddr, path: String, tls: Option<MetricsTlsConfig>) -> Result<()> {
    let tls_acceptor = match tls {
        Some(cfg) => Some(crate::tls::build_acceptor(&cfg.cert_path, &cfg.key_path)?),
        None => None,
    };
    let listener = TcpListener::bind(addr).await?;
    let path = if path.is_empty() {
        "/metrics".to_string()
    } else {
        path
    };
    loop {
        let (stream, _) = listener.accept().await?;
        let path = path.clone();
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &path, tls_acceptor).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    path: &str,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
) -> Result<()> {
    if let Some(acceptor) = tls_acceptor {
        let tls = acceptor.accept(stream).await?;
        handle_stream(tls, path).await
    } else {
        handle_stream(stream, path).await
    }
}

async fn handle_stream<S>(stream: S, path: &str) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Some(raw) = codec::read_request(&mut reader, METRICS_MAX_BODY_BYTES).await? else {
        return Ok(());
    };
    let response = if raw.method == Method::GET && raw.target == path {
        build_response(
            StatusCode::OK,
            TextEncoder::new().format_type(),
            &gather(),
            true,
        )
    } else {
        build_response(StatusCode::NOT_FOUND, "text/plain", b"not found", true)
    };
    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn record_basic_metrics() {
        record_request("10.0.0.1", "engine-a");
        record_rule_hit("rule-1", "inband", "10.0.0.1", "engine-a");
        observe_inband("10.0.0.1", "engine-a", Duration::from_micros(120));
        let text = String::from_utf8(gather()).expect("utf8");
        assert!(
            text.contains("ingressguard_requests_total"),
            "expected request counter in metrics output"
        );
        assert!(
            text.contains("ingressguard_rule_hits_total"),
            "expected rule hit counter in metrics output"
        );
        assert!(
            text.contains("ingressguard_inband_seconds"),
            "expected in-band histogram in metrics output"
        );
    }

    #[tokio::test]
    async fn serves_text_format_on_the_configured_path() {
        record_request("10.9.9.9", "metrics-endpoint-test");
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handle_stream(server, "/metrics").await });
        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: m\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        task.await.expect("join").expect("handler");

        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.contains("ingressguard_requests_total"));
    }

    #[tokio::test]
    async fn unknown_path_gets_404() {
        let (mut client, server) = tokio::io::duplex(8 * 1024);
        let task = tokio::spawn(async move { handle_stream(server, "/metrics").await });
        client
            .write_all(b"GET /other HTTP/1.1\r\nHost: m\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        task.await.expect("join").expect("handler");

        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {text}");
    }
}
