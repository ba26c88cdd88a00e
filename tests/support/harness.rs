use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use mirrorcache::cli::LogFormat;
use mirrorcache::settings::Settings;

use super::net::{find_free_port, wait_for_listener};

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    _workspace: TempDir,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn spawn(upstream_url: &str) -> Result<Self> {
        let workspace = TempDir::new()?;
        let cache_dir = workspace.path().join("cache.d");
        let port = find_free_port()?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let settings = Settings {
            upstream: upstream_url.trim_end_matches('/').to_string(),
            cache_dir: cache_dir.clone(),
            listen: addr,
            log: LogFormat::Text,
        };
        let handle = tokio::spawn(async move {
            if let Err(err) = mirrorcache::run(settings).await {
                eprintln!("proxy exited with error: {err:?}");
            }
        });
        wait_for_listener(addr).await?;
        Ok(Self {
            addr,
            cache_dir,
            _workspace: workspace,
            handle,
        })
    }

    pub fn cache_file(&self, clean_path: &str) -> PathBuf {
        self.cache_dir.join(clean_path.trim_start_matches('/'))
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Poll until the condition holds; panics after ~2 seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Every `*.part.*` tempfile below the given directory.
pub fn part_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(part_files(&path));
        } else if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(".part."))
        {
            found.push(path);
        }
    }
    found
}
