use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result, ensure};

use crate::cli::{Cli, LogFormat};

/// Validated runtime settings. The whole surface is the CLI: three flags
/// plus the log format, no config file, no environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub upstream: String,
    pub cache_dir: PathBuf,
    pub listen: SocketAddr,
    pub log: LogFormat,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let upstream = cli.upstream.trim_end_matches('/').to_string();
        let url = reqwest::Url::parse(&upstream)
            .with_context(|| format!("invalid upstream URL '{}'", cli.upstream))?;
        ensure!(
            matches!(url.scheme(), "http" | "https"),
            "upstream URL must use http or https (got '{}')",
            url.scheme()
        );
        ensure!(
            url.host_str().is_some(),
            "upstream URL '{}' has no host",
            cli.upstream
        );
        ensure!(
            !cli.cachedir.as_os_str().is_empty(),
            "cache directory must not be empty"
        );
        Ok(Self {
            upstream,
            cache_dir: cli.cachedir.clone(),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port)),
            log: cli.log,
        })
    }
}
