use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

use crate::logging::log_access;
use crate::proxy::AppContext;
use crate::proxy::cache::{CompleteReader, ObjectReader};
use crate::proxy::http::request::RequestHead;
use crate::proxy::http::response::send_error;
use crate::proxy::http::serve::{ServeRequest, serve_object};
use crate::proxy::path::canonical_path;
use crate::proxy::upstream::{
    accepts_byte_ranges, cacheable_object, declared_content_length, parsed_last_modified,
};

pub(crate) enum ClientDisposition {
    Continue,
    Close,
}

/// Per-request state machine: method gate, path canonicalization, cache
/// probe, conditional upstream request, then one of serve-from-cache,
/// serve-through-cache, or pass-through.
pub(crate) async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    head: RequestHead,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if head.method != Method::GET && head.method != Method::HEAD {
        let bytes_out = send_error(
            reader.get_mut(),
            StatusCode::METHOD_NOT_ALLOWED,
            "Only HEAD or GET allowed\n",
        )
        .await?;
        log_access(
            peer,
            &head.method,
            &head.target,
            StatusCode::METHOD_NOT_ALLOWED,
            "REJECT",
            bytes_out,
            start.elapsed(),
        );
        return Ok(ClientDisposition::Close);
    }
    if head.has_body() {
        let bytes_out = send_error(
            reader.get_mut(),
            StatusCode::BAD_REQUEST,
            "request bodies are not supported\n",
        )
        .await?;
        log_access(
            peer,
            &head.method,
            &head.target,
            StatusCode::BAD_REQUEST,
            "REJECT",
            bytes_out,
            start.elapsed(),
        );
        return Ok(ClientDisposition::Close);
    }

    let clean_path = canonical_path(&head.target);

    // A GET for an object already being downloaded attaches straight to the
    // in-flight copy; no second upstream request is made.
    if head.method == Method::GET
        && let Some(handle) = app.registry.get(&clean_path)
        && let Some((mut object, mtime)) = handle.attach().await
    {
        let outcome = serve_object(
            reader.get_mut(),
            serve_request(&head),
            basename(&clean_path),
            mtime,
            &mut object,
        )
        .await?;
        log_access(
            peer,
            &head.method,
            &clean_path,
            outcome.status,
            "COALESCE",
            outcome.bytes_out,
            start.elapsed(),
        );
        return Ok(disposition_after(&head));
    }

    let cached = app.store.probe(&clean_path).await;
    let cached_mtime = cached.as_ref().map(|entry| entry.mtime);

    let response = match app
        .upstream
        .fetch(&head.method, &clean_path, cached_mtime)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            error!(path = %clean_path, error = %err, "upstream request failed");
            let bytes_out =
                send_error(reader.get_mut(), StatusCode::BAD_GATEWAY, "Bad Gateway\n").await?;
            log_access(
                peer,
                &head.method,
                &clean_path,
                StatusCode::BAD_GATEWAY,
                "ERROR",
                bytes_out,
                start.elapsed(),
            );
            return Ok(ClientDisposition::Close);
        }
    };

    // Revalidated: the conditional request confirmed the cached copy, and
    // the descriptor opened by the probe serves it.
    if response.status() == StatusCode::NOT_MODIFIED
        && let Some(entry) = cached
    {
        debug!(path = %clean_path, "serving locally cached object");
        let mut object = ObjectReader::Complete(CompleteReader::new(entry.file, entry.size));
        let outcome = serve_object(
            reader.get_mut(),
            serve_request(&head),
            basename(&clean_path),
            entry.mtime,
            &mut object,
        )
        .await?;
        log_access(
            peer,
            &head.method,
            &clean_path,
            outcome.status,
            "HIT",
            outcome.bytes_out,
            start.elapsed(),
        );
        return Ok(disposition_after(&head));
    }

    if head.method == Method::GET
        && let Some(object_meta) = cacheable_object(&response)
    {
        debug!(path = %clean_path, size = object_meta.size, "object is cacheable");
        let cache_path = app.store.file_path(&clean_path);
        let handle = app.registry.get_or_insert(&clean_path);
        match handle
            .get(
                &app.registry,
                response,
                object_meta.mtime,
                object_meta.size,
                cache_path,
            )
            .await
        {
            Ok(mut object) => {
                let outcome = serve_object(
                    reader.get_mut(),
                    serve_request(&head),
                    basename(&clean_path),
                    object_meta.mtime,
                    &mut object,
                )
                .await?;
                log_access(
                    peer,
                    &head.method,
                    &clean_path,
                    outcome.status,
                    "MISS",
                    outcome.bytes_out,
                    start.elapsed(),
                );
                return Ok(disposition_after(&head));
            }
            Err(err) => {
                error!(path = %clean_path, error = %err, "cannot stream object");
                let bytes_out = send_error(
                    reader.get_mut(),
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error\n",
                )
                .await?;
                log_access(
                    peer,
                    &head.method,
                    &clean_path,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERROR",
                    bytes_out,
                    start.elapsed(),
                );
                return Ok(ClientDisposition::Close);
            }
        }
    }

    debug!(path = %clean_path, status = %response.status(), "passing through uncached");
    let (status, bytes_out, must_close) = pass_through(reader.get_mut(), &head, response).await?;
    log_access(
        peer,
        &head.method,
        &clean_path,
        status,
        "PASS",
        bytes_out,
        start.elapsed(),
    );
    if must_close || head.wants_close() {
        Ok(ClientDisposition::Close)
    } else {
        Ok(ClientDisposition::Continue)
    }
}

/// Forward a non-cacheable response verbatim, with only Content-Length,
/// Last-Modified, Content-Type, and Accept-Ranges surviving the header
/// filter. Nothing touches the disk on this path.
async fn pass_through<S>(
    stream: &mut S,
    head: &RequestHead,
    mut response: reqwest::Response,
) -> Result<(StatusCode, u64, bool)>
where
    S: AsyncWrite + Unpin,
{
    let status = response.status();
    let upstream_headers = response.headers();

    let mut headers: Vec<(&str, String)> = Vec::new();
    let content_length = declared_content_length(upstream_headers);
    if let Some(length) = content_length {
        headers.push(("Content-Length", length.to_string()));
    }
    if parsed_last_modified(upstream_headers).is_some()
        && let Some(last_modified) = upstream_headers.get(header::LAST_MODIFIED)
        && let Ok(last_modified) = last_modified.to_str()
    {
        headers.push(("Last-Modified", last_modified.to_string()));
    }
    if let Some(content_type) = upstream_headers.get(header::CONTENT_TYPE)
        && let Ok(content_type) = content_type.to_str()
    {
        headers.push(("Content-Type", content_type.to_string()));
    }
    if accepts_byte_ranges(upstream_headers) {
        headers.push(("Accept-Ranges", "bytes".to_string()));
    }

    let has_downstream_body = head.method == Method::GET && !bodyless_status(status);
    let mut must_close = has_downstream_body && content_length.is_none();
    if must_close {
        headers.push(("Connection", "close".to_string()));
    }

    let mut bytes_out = crate::proxy::http::response::write_head(stream, status, &headers).await?;
    if has_downstream_body {
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    stream.write_all(&chunk).await?;
                    bytes_out += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "error copying upstream response");
                    must_close = true;
                    break;
                }
            }
        }
    }
    stream.flush().await?;
    Ok((status, bytes_out, must_close))
}

fn bodyless_status(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn serve_request(head: &RequestHead) -> ServeRequest<'_> {
    ServeRequest {
        method: &head.method,
        range: head.header("range"),
        if_modified_since: head.header("if-modified-since"),
    }
}

fn basename(clean_path: &str) -> &str {
    clean_path.rsplit('/').next().unwrap_or(clean_path)
}

fn disposition_after(head: &RequestHead) -> ClientDisposition {
    if head.wants_close() {
        ClientDisposition::Close
    } else {
        ClientDisposition::Continue
    }
}
