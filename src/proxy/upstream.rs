use std::time::SystemTime;

use anyhow::{Context, Result};
use http::{HeaderMap, Method, StatusCode, header};

/// HTTP client for the one configured origin. Requests reuse the
/// downstream method, append the canonical path to the base URL, and carry
/// `If-Modified-Since` when a cached copy exists. Redirects are resolved
/// here and never reach the downstream client.
#[derive(Debug, Clone)]
pub(crate) struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

/// Parsed headers that qualify a 200 response for the cache-through path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheableObject {
    pub size: u64,
    pub mtime: SystemTime,
}

impl UpstreamClient {
    pub(crate) fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building upstream HTTP client")?;
        Ok(Self { client, base_url })
    }

    pub(crate) async fn fetch(
        &self,
        method: &Method,
        clean_path: &str,
        cached_mtime: Option<SystemTime>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, clean_path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(mtime) = cached_mtime {
            request = request.header(header::IF_MODIFIED_SINCE, httpdate::fmt_http_date(mtime));
        }
        request
            .send()
            .await
            .with_context(|| format!("upstream request {url} failed"))
    }
}

/// A 200 is eligible for caching only when the origin declares the exact
/// body size, a parseable Last-Modified, and byte-range support. Anything
/// less (directory listings, dynamic pages) is passed through uncached.
pub(crate) fn cacheable_object(response: &reqwest::Response) -> Option<CacheableObject> {
    if response.status() != StatusCode::OK {
        return None;
    }
    let headers = response.headers();
    let size = declared_content_length(headers)?;
    let mtime = parsed_last_modified(headers)?;
    if !accepts_byte_ranges(headers) {
        return None;
    }
    Some(CacheableObject { size, mtime })
}

pub(crate) fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub(crate) fn parsed_last_modified(headers: &HeaderMap) -> Option<SystemTime> {
    headers
        .get(header::LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
}

pub(crate) fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_RANGES)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("bytes"))
}
