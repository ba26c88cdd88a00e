use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write a response head. Returns the number of bytes written so callers
/// can account for them in the access log.
pub(crate) async fn write_head<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &[(&str, String)],
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    Ok(head.len() as u64)
}

/// Plain-text error response. The connection is closed afterwards, so the
/// head always carries `Connection: close`.
pub(crate) async fn send_error<S>(stream: &mut S, status: StatusCode, body: &str) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let written = write_head(
        stream,
        status,
        &[
            ("Content-Length", body.len().to_string()),
            ("Content-Type", "text/plain; charset=utf-8".to_string()),
            ("Connection", "close".to_string()),
        ],
    )
    .await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await?;
    Ok(written + body.len() as u64)
}
