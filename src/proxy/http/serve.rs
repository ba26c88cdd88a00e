use std::io::SeekFrom;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::proxy::cache::ObjectReader;

use super::response::write_head;

/// The parts of a downstream request that drive object serving.
pub(crate) struct ServeRequest<'a> {
    pub method: &'a Method,
    pub range: Option<&'a str>,
    pub if_modified_since: Option<&'a str>,
}

pub(crate) struct ServeOutcome {
    pub status: StatusCode,
    pub bytes_out: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Span { start: u64, end: u64 },
    Unsatisfiable,
}

/// Serve an object through a reader, honoring single byte ranges and
/// downstream conditional requests. Works identically for completed cache
/// files and in-flight downloads: a range that starts past the ready
/// boundary simply blocks in the reader until the writer catches up.
pub(crate) async fn serve_object<S>(
    stream: &mut S,
    req: ServeRequest<'_>,
    name: &str,
    mtime: SystemTime,
    reader: &mut ObjectReader,
) -> Result<ServeOutcome>
where
    S: AsyncWrite + Unpin,
{
    let size = reader.size();

    if let Some(since) = req.if_modified_since
        && let Ok(since) = httpdate::parse_http_date(since)
        && !modified_since(mtime, since)
    {
        let headers = base_headers(name, mtime);
        let bytes_out = write_head(stream, StatusCode::NOT_MODIFIED, &headers).await?;
        stream.flush().await?;
        return Ok(ServeOutcome {
            status: StatusCode::NOT_MODIFIED,
            bytes_out,
        });
    }

    let mut headers = base_headers(name, mtime);
    let (status, body_start, body_len) = match req.range.and_then(|value| parse_range(value, size))
    {
        Some(ByteRange::Unsatisfiable) => {
            headers.push(("Content-Range", format!("bytes */{size}")));
            headers.push(("Content-Length", "0".to_string()));
            let bytes_out =
                write_head(stream, StatusCode::RANGE_NOT_SATISFIABLE, &headers).await?;
            stream.flush().await?;
            return Ok(ServeOutcome {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                bytes_out,
            });
        }
        Some(ByteRange::Span { start, end }) => {
            headers.push(("Content-Range", format!("bytes {start}-{end}/{size}")));
            headers.push(("Content-Length", (end - start + 1).to_string()));
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
        None => {
            headers.push(("Content-Length", size.to_string()));
            (StatusCode::OK, 0, size)
        }
    };

    let mut bytes_out = write_head(stream, status, &headers).await?;
    if req.method == Method::GET {
        reader.seek(SeekFrom::Start(body_start))?;
        bytes_out += copy_range(reader, stream, body_len).await?;
    }
    stream.flush().await?;
    Ok(ServeOutcome { status, bytes_out })
}

fn base_headers(name: &str, mtime: SystemTime) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("Last-Modified", httpdate::fmt_http_date(mtime)),
        ("Accept-Ranges", "bytes".to_string()),
    ];
    if let Some(mime) = mime_guess::from_path(name).first_raw() {
        headers.push(("Content-Type", mime.to_string()));
    }
    headers
}

/// HTTP dates carry whole-second resolution, so the comparison truncates
/// the filesystem mtime before deciding.
fn modified_since(mtime: SystemTime, since: SystemTime) -> bool {
    let seconds = |time: SystemTime| {
        time.duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    };
    seconds(mtime) > seconds(since)
}

/// Parse a `Range` header against the object size. `None` means the header
/// is absent, malformed, or multi-range; the caller serves the full
/// representation. Suffix ranges (`bytes=-n`) address the final n bytes.
fn parse_range(value: &str, size: u64) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start_text, end_text) = spec.split_once('-')?;
    let (start_text, end_text) = (start_text.trim(), end_text.trim());

    if start_text.is_empty() {
        let suffix_len: u64 = end_text.parse().ok()?;
        if suffix_len == 0 || size == 0 {
            return Some(ByteRange::Unsatisfiable);
        }
        return Some(ByteRange::Span {
            start: size.saturating_sub(suffix_len),
            end: size - 1,
        });
    }

    let start: u64 = start_text.parse().ok()?;
    if start >= size {
        return Some(ByteRange::Unsatisfiable);
    }
    let end = if end_text.is_empty() {
        size - 1
    } else {
        let end: u64 = end_text.parse().ok()?;
        if end < start {
            return None;
        }
        end.min(size - 1)
    };
    Some(ByteRange::Span { start, end })
}

async fn copy_range<S>(reader: &mut ObjectReader, stream: &mut S, len: u64) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; 8192];
    let mut remaining = len;
    let mut copied = 0u64;
    while remaining > 0 {
        let want = buffer.len().min(remaining.min(usize::MAX as u64) as usize);
        let read = reader.read(&mut buffer[..want]).await?;
        if read == 0 {
            // Short download: the stream ends at the final ready boundary.
            break;
        }
        stream.write_all(&buffer[..read]).await?;
        copied += read as u64;
        remaining -= read as u64;
    }
    Ok(copied)
}
