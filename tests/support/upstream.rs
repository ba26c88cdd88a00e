use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::read_until_double_crlf;

/// Scripted origin server. Objects are keyed by request path; each
/// response closes the connection. A request whose `If-Modified-Since`
/// matches the object's `Last-Modified` verbatim gets a 304.
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<UpstreamState>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct MockObject {
    pub body: Vec<u8>,
    pub last_modified: Option<String>,
    pub content_length: bool,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

impl MockObject {
    /// A fully cacheable immutable object: Content-Length, Last-Modified,
    /// and Accept-Ranges all present.
    pub fn immutable(body: impl Into<Vec<u8>>, last_modified: &str) -> Self {
        Self {
            body: body.into(),
            last_modified: Some(last_modified.to_string()),
            content_length: true,
            accept_ranges: true,
            content_type: None,
            extra_headers: Vec::new(),
        }
    }

    /// A close-delimited response with no Content-Length, the shape of a
    /// generated directory listing.
    pub fn listing(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            last_modified: None,
            content_length: false,
            accept_ranges: false,
            content_type: Some("text/html".to_string()),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_extra_header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub if_modified_since: Option<String>,
}

#[derive(Clone, Copy)]
struct StreamPacing {
    chunk_size: usize,
    delay: Duration,
}

struct UpstreamState {
    objects: Mutex<HashMap<String, MockObject>>,
    requests: Mutex<Vec<RecordedRequest>>,
    pacing: Mutex<StreamPacing>,
}

impl MockUpstream {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(UpstreamState {
            objects: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            pacing: Mutex::new(StreamPacing {
                chunk_size: 64 * 1024,
                delay: Duration::ZERO,
            }),
        });
        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let connection_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, connection_state).await;
                });
            }
        });
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn insert(&self, path: &str, object: MockObject) {
        self.state
            .objects
            .lock()
            .expect("objects lock")
            .insert(path.to_string(), object);
    }

    /// Deliver bodies in `chunk_size` pieces with a pause between them, to
    /// keep a download in flight while clients attach.
    pub fn set_pacing(&self, chunk_size: usize, delay: Duration) {
        *self.state.pacing.lock().expect("pacing lock") = StreamPacing { chunk_size, delay };
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<UpstreamState>) -> Result<()> {
    let head = read_until_double_crlf(&mut stream).await?;
    let head_text = String::from_utf8_lossy(&head);
    let mut lines = head_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let if_modified_since = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("if-modified-since"))
        .map(|(_, value)| value.trim().to_string());

    let object = state
        .objects
        .lock()
        .expect("objects lock")
        .get(&path)
        .cloned();
    state
        .requests
        .lock()
        .expect("requests lock")
        .push(RecordedRequest {
            method: method.clone(),
            path,
            if_modified_since: if_modified_since.clone(),
        });

    let Some(object) = object else {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        stream.shutdown().await.ok();
        return Ok(());
    };

    let not_modified = match (&if_modified_since, &object.last_modified) {
        (Some(since), Some(last_modified)) => since == last_modified,
        _ => false,
    };
    if not_modified {
        stream
            .write_all(b"HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n")
            .await?;
        stream.shutdown().await.ok();
        return Ok(());
    }

    let mut head = String::from("HTTP/1.1 200 OK\r\n");
    if object.content_length {
        head.push_str(&format!("Content-Length: {}\r\n", object.body.len()));
    }
    if let Some(last_modified) = &object.last_modified {
        head.push_str(&format!("Last-Modified: {last_modified}\r\n"));
    }
    if object.accept_ranges {
        head.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(content_type) = &object.content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    for (name, value) in &object.extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");
    stream.write_all(head.as_bytes()).await?;

    if method != "HEAD" {
        let pacing = *state.pacing.lock().expect("pacing lock");
        for chunk in object.body.chunks(pacing.chunk_size.max(1)) {
            stream.write_all(chunk).await?;
            stream.flush().await?;
            if !pacing.delay.is_zero() {
                sleep(pacing.delay).await;
            }
        }
    }
    stream.shutdown().await.ok();
    Ok(())
}
