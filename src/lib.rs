pub mod auth;
pub mod cli;
pub mod engine;
pub mod event;
pub mod ingress;
pub mod logging;
pub mod metrics;
pub mod ruleset;
pub mod settings;
pub mod tls;
pub mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{AuthCache, AuthProbe};
use crate::engine::{RuleEngineHandle, Runner};
use crate::event::SecurityEvent;
use crate::ingress::request::ParsedRequest;
use crate::ingress::{AppContext, AuthState, server};
use crate::settings::Settings;

/// Running engine instance. Dropping the handle does not stop the engine;
/// call [`EngineHandle::shutdown`] for a coordinated stop.
pub struct EngineHandle {
    tcp_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    queue_tx: Option<mpsc::Sender<ParsedRequest>>,
    listener_tasks: Vec<JoinHandle<Result<()>>>,
    runner_tasks: Vec<JoinHandle<()>>,
    socket_path: Option<PathBuf>,
}

impl EngineHandle {
    /// Bound TCP address, useful when listening on an ephemeral port.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Graceful stop: listeners stop accepting and drain in-flight requests,
    /// then the work queue closes and every runner drains and exits.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for task in self.listener_tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "listener stopped with error"),
                Err(err) => error!(error = %err, "listener task panicked"),
            }
        }
        // no handler can enqueue anymore; closing the queue ends the runners
        self.queue_tx.take();
        for task in self.runner_tasks.drain(..) {
            if let Err(err) = task.await {
                error!(error = %err, "runner task panicked");
            }
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

/// Builds the rule set, spawns the runner pool, and opens the listeners.
/// Security events are delivered on `events`.
pub async fn start(
    mut settings: Settings,
    events: mpsc::Sender<SecurityEvent>,
) -> Result<EngineHandle> {
    settings.normalize();
    settings.validate()?;

    if let Some(addr) = settings.metrics_listen {
        let tls = match (&settings.metrics_tls_cert, &settings.metrics_tls_key) {
            (Some(cert), Some(key)) => Some(metrics::MetricsTlsConfig {
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            _ => None,
        };
        tokio::spawn(async move {
            info!(address = %addr, tls = tls.is_some(), "metrics endpoint starting");
            if let Err(err) = metrics::serve(addr, "/metrics".to_string(), tls).await {
                error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let ruleset = if let Some(path) = &settings.appsec_config_path {
        ruleset::load_by_path(path)?
    } else if let Some(name) = &settings.appsec_config {
        ruleset::load_by_name(name, &settings.rules_dir)?
    } else {
        bail!("appsec_config or appsec_config_path must be set");
    };
    let ruleset = Arc::new(ruleset.process_on_load()?);
    info!(
        name = %ruleset.name,
        inband_rules = ruleset.inband.len(),
        outofband_rules = ruleset.outofband.len(),
        data_dir = %ruleset.data_dir.display(),
        "rule set loaded"
    );

    let auth = Arc::new(AuthState {
        cache: AuthCache::new(),
        probe: AuthProbe::new(&settings.lapi_url)?,
        ttl: time::Duration::try_from(settings.auth_cache_duration)
            .context("auth_cache_duration out of range")?,
    });

    // capacity 1: the dispatch is a near-synchronous rendezvous, so a full
    // runner pool backpressures the HTTP layer
    let (queue_tx, queue_rx) = mpsc::channel(1);
    let queue_rx = Arc::new(Mutex::new(queue_rx));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settings = Arc::new(settings);

    let mut runner_tasks = Vec::with_capacity(settings.routines);
    for _ in 0..settings.routines {
        let runner = Runner {
            id: Uuid::new_v4(),
            queue: queue_rx.clone(),
            engine: RuleEngineHandle::new(ruleset.clone()),
            events: events.clone(),
            labels: settings.labels.clone(),
        };
        runner_tasks.push(tokio::spawn(runner.run()));
    }
    info!(count = settings.routines, "appsec runners started");

    let tls = match (&settings.cert_file, &settings.key_file) {
        (Some(cert), Some(key)) => Some(tls::build_acceptor(cert, key)?),
        _ => None,
    };

    let app = AppContext {
        settings: settings.clone(),
        ruleset,
        auth,
        engine_name: Arc::from(settings.engine_name.as_str()),
        queue: queue_tx.clone(),
        shutdown: shutdown_rx,
    };

    let mut listener_tasks = Vec::new();
    let mut tcp_addr = None;
    let mut socket_path = None;

    if let Some(addr) = settings.listen_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))?;
        let local_addr = listener.local_addr().unwrap_or(addr);
        tcp_addr = Some(local_addr);
        info!(address = %local_addr, tls = tls.is_some(), "ingress TCP listener started");
        listener_tasks.push(tokio::spawn(server::run_tcp_listener(
            app.clone(),
            listener,
            tls.clone(),
        )));
    }

    if let Some(path) = &settings.listen_socket {
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(path);
            let listener = tokio::net::UnixListener::bind(path)
                .with_context(|| format!("failed to bind socket {}", path.display()))?;
            socket_path = Some(path.clone());
            info!(path = %path.display(), tls = tls.is_some(), "ingress socket listener started");
            listener_tasks.push(tokio::spawn(server::run_unix_listener(
                app.clone(),
                listener,
                tls.clone(),
            )));
        }
        #[cfg(not(unix))]
        bail!("listen_socket is not supported on this platform");
    }

    ensure!(!listener_tasks.is_empty(), "no listener configured");

    Ok(EngineHandle {
        tcp_addr,
        shutdown_tx,
        queue_tx: Some(queue_tx),
        listener_tasks,
        runner_tasks,
        socket_path,
    })
}

/// Binary entry point: runs the engine until ctrl-c / SIGTERM, logging each
/// security event as one JSON line.
pub async fn run(settings: Settings) -> Result<()> {
    let (event_tx, event_rx) = mpsc::channel(256);
    let sink = event::spawn_log_sink(event_rx);
    let handle = start(settings, event_tx).await?;

    wait_for_shutdown_signal().await;
    info!("shutting down ingress engine");
    handle.shutdown().await?;
    sink.await.ok();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
