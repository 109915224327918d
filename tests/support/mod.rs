#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use ingressguard::cli::LogFormat;
use ingressguard::settings::Settings;

pub const API_KEY_HEADER: &str = "x-appsec-api-key";

pub fn write_ruleset(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(format!("{name}.yaml"));
    let mut file = std::fs::File::create(&path).expect("create rule set file");
    file.write_all(yaml.as_bytes()).expect("write rule set");
    path
}

pub fn test_settings(ruleset_path: &Path, lapi_url: &str) -> Settings {
    Settings {
        listen_addr: Some("127.0.0.1:0".parse().expect("loopback addr")),
        listen_socket: None,
        cert_file: None,
        key_file: None,
        path: "/".to_string(),
        routines: 2,
        appsec_config: None,
        appsec_config_path: Some(ruleset_path.to_path_buf()),
        auth_cache_duration: Duration::from_secs(60),
        lapi_url: lapi_url.to_string(),
        engine_name: String::new(),
        rules_dir: PathBuf::from("."),
        labels: BTreeMap::new(),
        log: LogFormat::Text,
        metrics_listen: None,
        metrics_tls_cert: None,
        metrics_tls_key: None,
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.body).context("response body is not JSON")
    }
}

/// Sends one raw HTTP/1.1 request (must carry `Connection: close`) and reads
/// the full response.
pub async fn send_raw(addr: SocketAddr, request: &str) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_response(&raw)
}

pub fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow!("response missing header terminator: {text:?}"))?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed status line '{status_line}'"))?
        .parse::<u16>()
        .with_context(|| format!("invalid status in '{status_line}'"))?;
    Ok(HttpResponse {
        status,
        body: body.to_string(),
    })
}

pub fn request_line(method: &str, target: &str, api_key: Option<&str>, body: &str) -> String {
    let mut request = format!("{method} {target} HTTP/1.1\r\nHost: ingress\r\n");
    if let Some(key) = api_key {
        request.push_str(&format!("{API_KEY_HEADER}: {key}\r\n"));
    }
    request.push_str("x-appsec-real-ip: 203.0.113.9\r\n");
    request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    request.push_str("Connection: close\r\n\r\n");
    request.push_str(body);
    request
}

/// Minimal stand-in for the upstream decision service: answers the HEAD probe
/// with 200 for known keys, 403 otherwise, and counts every probe it serves.
pub struct StubLapi {
    pub addr: SocketAddr,
    pub probes: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl StubLapi {
    pub async fn start(valid_keys: &[&str]) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let probes = Arc::new(AtomicUsize::new(0));
        let keys: HashSet<String> = valid_keys.iter().map(|key| key.to_string()).collect();

        let counter = probes.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let keys = keys.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _ = serve_probe(stream, &keys, &counter).await;
                });
            }
        });

        Ok(Self {
            addr,
            probes,
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Drop for StubLapi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_probe(
    stream: TcpStream,
    keys: &HashSet<String>,
    counter: &AtomicUsize,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut api_key = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with(API_KEY_HEADER) && lower[API_KEY_HEADER.len()..].starts_with(':') {
            api_key = Some(trimmed[API_KEY_HEADER.len() + 1..].trim().to_string());
        }
    }

    counter.fetch_add(1, Ordering::SeqCst);
    let authorized = api_key.map(|key| keys.contains(&key)).unwrap_or(false);
    let status = if authorized {
        "200 OK"
    } else {
        "403 Forbidden"
    };
    let response =
        format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    reader.get_mut().write_all(response.as_bytes()).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}
