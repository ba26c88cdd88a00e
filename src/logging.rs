use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::{Method, StatusCode};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One structured event per completed request. `disposition` records how
/// the object was served: HIT (revalidated from disk), MISS (fresh
/// cache-through), COALESCE (attached to an in-flight download), PASS
/// (forwarded uncached), REJECT, or ERROR.
pub(crate) fn log_access(
    peer: SocketAddr,
    method: &Method,
    path: &str,
    status: StatusCode,
    disposition: &'static str,
    bytes_out: u64,
    elapsed: Duration,
) {
    tracing::info!(
        target: "access_log",
        peer = %peer,
        method = %method,
        path,
        status = status.as_u16(),
        disposition,
        bytes_out,
        elapsed_ms = elapsed.as_millis() as u64,
    );
}
