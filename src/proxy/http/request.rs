use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::{Instant, timeout};

/// Parsed head of a downstream HTTP/1.1 request. Header names are stored
/// lowercased; values are trimmed. GET/HEAD never carry a body, so no body
/// framing state is kept.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    pub(crate) fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name == lower_name)
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|value| value.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
    }

    /// True when the request advertises a body; the server never reads
    /// request bodies.
    pub(crate) fn has_body(&self) -> bool {
        if self.header("transfer-encoding").is_some() {
            return true;
        }
        self.header("content-length")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .is_some_and(|len| len > 0)
    }
}

/// Read one request head. `Ok(None)` means the client closed (or went
/// idle past the keep-alive timeout) between requests; errors mean a
/// malformed or oversized request.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_header_bytes > 0, "header size limit must be greater than zero");
    let available = match timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    let mut line = String::new();
    let mut consumed =
        read_line_with_deadline(reader, &mut line, deadline, peer, max_header_bytes).await?;
    if consumed == 0 {
        return Ok(None);
    }
    let (method, target) = parse_request_line(&line, peer)?;

    let mut headers = Vec::new();
    loop {
        let remaining = max_header_bytes
            .checked_sub(consumed)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request head from {peer} exceeds {max_header_bytes} bytes"))?;
        let read = read_line_with_deadline(reader, &mut line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed inside request headers from {peer}");
        }
        consumed += read;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header from {peer} missing ':' separator"))?;
        let name = name.trim();
        ensure!(!name.is_empty(), "empty header name from {peer}");
        ensure!(
            name.bytes().all(is_header_name_byte),
            "invalid header name '{name}' from {peer}"
        );
        headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

fn parse_request_line(line: &str, peer: SocketAddr) -> Result<(Method, String)> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line from {peer}: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line from {peer}: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line from {peer}: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line from {peer}: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    Ok((method, target.to_string()))
}

fn is_header_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'^' | b'`' | b'|')
}

async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("timed out reading request from {peer}"))?;
        let available = match timeout(remaining, reader.fill_buf()).await {
            Ok(Ok(available)) => available,
            Ok(Err(err)) => return Err(err).with_context(|| format!("reading line from {peer}")),
            Err(_) => bail!("timed out reading request from {peer}"),
        };

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed mid-line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());
        if collected.len() + consume > max_len {
            bail!("line from {peer} exceeds limit of {max_len} bytes");
        }
        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = line.len();
    *buf = line;
    Ok(len)
}
