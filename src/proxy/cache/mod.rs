use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::SystemTime;

use tokio::fs::File;
use tracing::warn;

mod handle;
mod reader;
mod registry;
mod writer;

pub(crate) use reader::{CompleteReader, ObjectReader};
pub(crate) use registry::HandleRegistry;

/// On-disk cache layout: one regular file per canonical URL path, rooted at
/// the configured cache directory. No index, no metadata sidecars; the
/// file's mtime carries the upstream Last-Modified.
#[derive(Debug, Clone)]
pub(crate) struct ObjectStore {
    root: PathBuf,
}

/// A fully cached object, opened for serving. The descriptor is captured
/// before the upstream request so a concurrent replacement cannot swap the
/// bytes out from under the response.
pub(crate) struct CachedObject {
    pub(crate) file: File,
    pub(crate) size: u64,
    pub(crate) mtime: SystemTime,
}

impl ObjectStore {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn file_path(&self, clean_path: &str) -> PathBuf {
        self.root.join(clean_path.trim_start_matches('/'))
    }

    /// Open and stat the cached object for a canonical path. Not-found is a
    /// plain miss; any other failure is logged and treated as a miss.
    pub(crate) async fn probe(&self, clean_path: &str) -> Option<CachedObject> {
        let path = self.file_path(clean_path);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "cache probe failed; treating as miss");
                }
                return None;
            }
        };
        let meta = match file.metadata().await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache stat failed; treating as miss");
                return None;
            }
        };
        if !meta.is_file() {
            return None;
        }
        let mtime = match meta.modified() {
            Ok(mtime) => mtime,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache mtime unavailable; treating as miss");
                return None;
            }
        };
        Some(CachedObject {
            file,
            size: meta.len(),
            mtime,
        })
    }
}
