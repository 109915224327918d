use std::net::SocketAddr;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::handler::{self, HttpReply};
use super::{AppContext, codec};

/// Accept loop for the TCP listener. Returns once the shutdown signal fired
/// and every in-flight connection finished.
pub async fn run_tcp_listener(
    app: AppContext,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    let mut shutdown = app.shutdown.clone();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
                }
                let connection_app = app.clone();
                let tls = tls.clone();
                connections.spawn(async move {
                    if let Err(err) =
                        handle_tcp_connection(stream, peer_addr, connection_app, tls).await
                    {
                        debug!(peer = %peer_addr, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
    drain(connections).await;
    info!("ingress TCP listener stopped");
    Ok(())
}

/// Accept loop for the filesystem socket listener.
#[cfg(unix)]
pub async fn run_unix_listener(
    app: AppContext,
    listener: tokio::net::UnixListener,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    let mut shutdown = app.shutdown.clone();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming socket connection");
                        continue;
                    }
                };
                let connection_app = app.clone();
                let tls = tls.clone();
                connections.spawn(async move {
                    let result = match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => handle_stream(stream, None, connection_app).await,
                            Err(err) => Err(err.into()),
                        },
                        None => handle_stream(stream, None, connection_app).await,
                    };
                    if let Err(err) = result {
                        debug!(error = %err, "socket connection closed with error");
                    }
                });
            }
        }
    }
    drain(connections).await;
    info!("ingress socket listener stopped");
    Ok(())
}

async fn drain(mut connections: JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}

async fn handle_tcp_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: AppContext,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            handle_stream(stream, Some(peer), app).await
        }
        None => handle_stream(stream, Some(peer), app).await,
    }
}

async fn handle_stream<S>(
    stream: S,
    remote_addr: Option<SocketAddr>,
    app: AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    loop {
        let raw = match codec::read_request(&mut reader, app.ruleset.max_body_size).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(()),
            Err(err) if err.is_parse_failure() => {
                warn!(error = %err, "failed to parse forwarded request");
                let reply = HttpReply::status_only(StatusCode::INTERNAL_SERVER_ERROR);
                write_reply(reader.get_mut(), &reply, true).await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let close = raw.close || *app.shutdown.borrow();
        let reply = handler::handle(&app, raw, remote_addr).await;
        write_reply(reader.get_mut(), &reply, close).await?;
        if close {
            return Ok(());
        }
    }
}

async fn write_reply<W>(writer: &mut W, reply: &HttpReply, close: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = match &reply.body {
        Some(body) => match serde_json::to_vec(body) {
            Ok(bytes) => build_response(reply.status, "application/json", &bytes, close),
            Err(err) => {
                // best effort: the verdict body could not be serialized
                error!(error = %err, "unable to serialize response body");
                build_response(StatusCode::INTERNAL_SERVER_ERROR, "application/json", b"", true)
            }
        },
        None => build_response(reply.status, "application/json", b"", close),
    };
    writer.write_all(&response).await?;
    writer.flush().await?;
    Ok(())
}

/// Formats one HTTP/1.1 response. Shared with the metrics endpoint, which
/// serves a different content type.
pub(crate) fn build_response(
    status: StatusCode,
    content_type: &str,
    body: &[u8],
    close: bool,
) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let connection = if close { "close" } else { "keep-alive" };
    let header = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: {connection}\r\n\r\n",
        status.as_u16(),
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(body);
    response
}
