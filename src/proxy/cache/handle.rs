use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use filetime::FileTime;
use tokio::fs::File;
use tokio::sync::{OnceCell, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::reader::{CompleteReader, ObjectReader, PartialReader};
use super::registry::HandleRegistry;
use super::writer::{Progress, TrackingWriter};

/// Per-object download coordinator. Exactly one handle is live per
/// canonical path at a time; the first caller to reach it creates the
/// tempfile and spawns the downloader, everyone else attaches a reader to
/// the same in-flight file.
pub(crate) struct ObjectHandle {
    clean_path: String,
    init: OnceCell<DownloadState>,
}

struct DownloadState {
    temp_path: PathBuf,
    cache_path: PathBuf,
    size: u64,
    mtime: SystemTime,
    progress: watch::Receiver<Progress>,
}

impl ObjectHandle {
    pub(crate) fn new(clean_path: String) -> Self {
        Self {
            clean_path,
            init: OnceCell::new(),
        }
    }

    /// Obtain a reader over the object, initializing the download on first
    /// call. Ownership of `response` transfers to the downloader on the
    /// initializing call; on every other call the response is simply
    /// dropped, which closes the redundant upstream body.
    pub(crate) async fn get(
        &self,
        registry: &Arc<HandleRegistry>,
        response: reqwest::Response,
        mtime: SystemTime,
        size: u64,
        cache_path: PathBuf,
    ) -> Result<ObjectReader> {
        let mut response = Some(response);
        let state = self
            .init
            .get_or_try_init(|| {
                let response = response
                    .take()
                    .expect("object handle init attempts are serialized");
                self.start_download(registry, response, mtime, size, cache_path)
            })
            .await;
        let state = match state {
            Ok(state) => state,
            Err(err) => {
                // Release the handle so the next request starts fresh.
                registry.remove(&self.clean_path);
                return Err(err);
            }
        };
        attach_reader(state).await
    }

    /// Attach to an already-initialized in-flight download without an
    /// upstream response, returning the reader and the object's effective
    /// modification time. `None` when the handle is not initialized yet or
    /// the underlying files have already disappeared.
    pub(crate) async fn attach(&self) -> Option<(ObjectReader, SystemTime)> {
        let state = self.init.get()?;
        match attach_reader(state).await {
            Ok(reader) => Some((reader, state.mtime)),
            Err(err) => {
                warn!(path = %self.clean_path, error = %err, "cannot attach to in-flight download");
                None
            }
        }
    }

    async fn start_download(
        &self,
        registry: &Arc<HandleRegistry>,
        response: reqwest::Response,
        mtime: SystemTime,
        size: u64,
        cache_path: PathBuf,
    ) -> Result<DownloadState> {
        let parent = cache_path
            .parent()
            .ok_or_else(|| anyhow!("cache path {} has no parent directory", cache_path.display()))?;
        let mut dirs = tokio::fs::DirBuilder::new();
        dirs.recursive(true);
        #[cfg(unix)]
        dirs.mode(0o755);
        dirs.create(parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let basename = cache_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("cache path {} has no file name", cache_path.display()))?;
        let temp_path = parent.join(format!("{basename}.part.{}", Uuid::new_v4()));
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("creating tempfile {}", temp_path.display()))?;
        let (writer, progress) = TrackingWriter::new(file);

        debug!(path = %self.clean_path, temp = %temp_path.display(), size, "download starting");
        tokio::spawn(run_download(DownloadJob {
            registry: registry.clone(),
            clean_path: self.clean_path.clone(),
            response,
            writer,
            mtime,
            size,
            temp_path: temp_path.clone(),
            cache_path: cache_path.clone(),
        }));

        Ok(DownloadState {
            temp_path,
            cache_path,
            size,
            mtime,
            progress,
        })
    }
}

async fn attach_reader(state: &DownloadState) -> Result<ObjectReader> {
    match File::open(&state.temp_path).await {
        Ok(file) => Ok(ObjectReader::Streaming(PartialReader::new(
            file,
            state.size,
            state.progress.clone(),
        ))),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            // The downloader finished and renamed the tempfile between the
            // registry lookup and this open; the completed file serves.
            let file = File::open(&state.cache_path).await.with_context(|| {
                format!("opening completed object {}", state.cache_path.display())
            })?;
            Ok(ObjectReader::Complete(CompleteReader::new(file, state.size)))
        }
        Err(err) => {
            Err(err).with_context(|| format!("opening tempfile {}", state.temp_path.display()))
        }
    }
}

struct DownloadJob {
    registry: Arc<HandleRegistry>,
    clean_path: String,
    response: reqwest::Response,
    writer: TrackingWriter,
    mtime: SystemTime,
    size: u64,
    temp_path: PathBuf,
    cache_path: PathBuf,
}

/// Runs to completion independently of the request that spawned it; a
/// disconnecting client never cancels an in-flight download.
async fn run_download(job: DownloadJob) {
    let DownloadJob {
        registry,
        clean_path,
        mut response,
        mut writer,
        mtime,
        size,
        temp_path,
        cache_path,
    } = job;

    let copied = copy_body(&mut response, &mut writer).await;
    drop(response);

    let published = match copied {
        Ok(()) => {
            let (written, closed) = writer.close().await;
            match closed.context("closing tempfile") {
                Ok(()) if written == size => publish(&temp_path, &cache_path, mtime).await,
                Ok(()) => Err(anyhow!("short download: {written} of {size} bytes")),
                Err(err) => Err(err),
            }
        }
        Err(err) => {
            let _ = writer.close().await;
            Err(err)
        }
    };

    match published {
        Ok(()) => debug!(path = %clean_path, size, "download published"),
        Err(err) => {
            warn!(path = %clean_path, error = %err, "download failed; discarding tempfile");
            match tokio::fs::remove_file(&temp_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(temp = %temp_path.display(), error = %err, "failed to remove tempfile");
                }
            }
        }
    }

    registry.remove(&clean_path);
}

async fn copy_body(response: &mut reqwest::Response, writer: &mut TrackingWriter) -> Result<()> {
    while let Some(chunk) = response.chunk().await.context("reading upstream body")? {
        writer.write_chunk(&chunk).await.context("writing tempfile")?;
    }
    Ok(())
}

/// The mtime stamp and the rename are ordered strictly after the last
/// write, so a file observed at the cache path always carries the mtime of
/// the body it holds.
async fn publish(temp_path: &Path, cache_path: &Path, mtime: SystemTime) -> Result<()> {
    filetime::set_file_mtime(temp_path, FileTime::from_system_time(mtime))
        .with_context(|| format!("setting mtime on {}", temp_path.display()))?;
    tokio::fs::rename(temp_path, cache_path)
        .await
        .with_context(|| format!("renaming {} into place", temp_path.display()))?;
    Ok(())
}
