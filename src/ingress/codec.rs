use std::time::Duration;

use http::Method;
use http::header::HeaderName;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::request::HeaderFields;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_HEADER_BYTES: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unsupported request: {0}")]
    Unsupported(String),
    #[error("connection closed mid-request")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Parse failures get a 500 written back; everything else just drops the
    /// connection.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, CodecError::Malformed(_) | CodecError::Unsupported(_))
    }
}

/// One wire-level request as read off the connection, before it becomes a
/// [`super::request::ParsedRequest`].
#[derive(Debug)]
pub struct RawRequest {
    pub method: Method,
    pub target: String,
    pub headers: HeaderFields,
    pub body: Vec<u8>,
    /// Close the connection after responding.
    pub close: bool,
}

/// Reads one HTTP/1.1 request. `Ok(None)` means the peer closed (or idled
/// out) between requests; the connection ends quietly.
pub async fn read_request<S>(
    reader: &mut BufReader<S>,
    max_body_size: usize,
) -> Result<Option<RawRequest>, CodecError>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(IDLE_TIMEOUT, reader.fill_buf()).await {
        Err(_) => return Ok(None),
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(available)) if available.is_empty() => return Ok(None),
        Ok(Ok(_)) => {}
    }

    let deadline = Instant::now() + HEADER_TIMEOUT;
    let mut budget = MAX_HEADER_BYTES;

    let Some(request_line) =
        read_line_with_deadline(reader, deadline, &mut budget, "reading request line").await?
    else {
        return Ok(None);
    };
    if request_line.is_empty() {
        return Err(CodecError::Malformed("empty request line".to_string()));
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| CodecError::Malformed("missing method".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| CodecError::Malformed("missing request target".to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| CodecError::Malformed("missing HTTP version".to_string()))?;
    if parts.next().is_some() {
        return Err(CodecError::Malformed(
            "unexpected data after HTTP version".to_string(),
        ));
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => {
            return Err(CodecError::Unsupported(
                "HTTP/1.0 requests are not supported".to_string(),
            ));
        }
        other => {
            return Err(CodecError::Malformed(format!("invalid HTTP version '{other}'")));
        }
    }
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| CodecError::Malformed(format!("invalid method '{method_str}'")))?;

    let mut headers = HeaderFields::new();
    let mut content_length: Option<usize> = None;
    let mut close = false;
    loop {
        let Some(line) =
            read_line_with_deadline(reader, deadline, &mut budget, "reading request headers")
                .await?
        else {
            return Err(CodecError::UnexpectedEof);
        };
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::Malformed("header missing ':' separator".to_string()))?;
        let name = name.trim();
        let value = value.trim();
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CodecError::Malformed(format!("invalid header name '{name}'")))?;

        if name.eq_ignore_ascii_case("content-length") {
            let parsed: usize = value.parse().map_err(|_| {
                CodecError::Malformed(format!("invalid Content-Length '{value}'"))
            })?;
            if let Some(existing) = content_length
                && existing != parsed
            {
                return Err(CodecError::Malformed(
                    "conflicting Content-Length headers".to_string(),
                ));
            }
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(CodecError::Unsupported(
                "transfer encodings are not supported".to_string(),
            ));
        } else if name.eq_ignore_ascii_case("connection")
            && value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        {
            close = true;
        }
        headers.push(name, value);
    }

    let mut body = Vec::new();
    if let Some(length) = content_length
        && length > 0
    {
        let take = length.min(max_body_size);
        body = vec![0u8; take];
        tokio::time::timeout(BODY_TIMEOUT, reader.read_exact(&mut body))
            .await
            .map_err(|_| CodecError::Timeout("reading request body"))??;
        if length > take {
            // leave the remainder unread; the connection closes after the reply
            debug!(declared = length, kept = take, "request body truncated at configured bound");
            close = true;
        }
    }

    Ok(Some(RawRequest {
        method,
        target: target.to_string(),
        headers,
        body,
        close,
    }))
}

async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    budget: &mut usize,
    context: &'static str,
) -> Result<Option<String>, CodecError>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(CodecError::Timeout(context))?;
        let available = tokio::time::timeout(remaining, reader.fill_buf())
            .await
            .map_err(|_| CodecError::Timeout(context))??;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(None);
            }
            return Err(CodecError::UnexpectedEof);
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());
        if collected.len() + consume > *budget {
            return Err(CodecError::Malformed(
                "request head exceeds configured limit".to_string(),
            ));
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        if newline_pos.is_some() {
            break;
        }
    }

    *budget -= collected.len();
    let mut line = String::from_utf8(collected)
        .map_err(|_| CodecError::Malformed("line contained invalid bytes".to_string()))?;
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}
