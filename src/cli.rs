use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "mirrorcache", about = "Caching reverse proxy for a single upstream mirror")]
pub struct Cli {
    /// Upstream mirror base URL.
    #[arg(long, default_value = "http://mirror.archlinux.example.org")]
    pub upstream: String,

    /// Directory to store cached objects in.
    #[arg(long, default_value = "cache.d")]
    pub cachedir: PathBuf,

    /// HTTP port to serve on.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log: LogFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}
