pub mod cli;
pub mod logging;
pub mod settings;

mod proxy;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::settings::Settings;

/// Run the proxy until the process is killed: ensure the cache root
/// exists, build the shared context, and serve the listener.
pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    tokio::fs::create_dir_all(&settings.cache_dir)
        .await
        .with_context(|| format!("creating cache directory {}", settings.cache_dir.display()))?;
    let app = proxy::AppContext::new(settings)?;
    proxy::run(app).await
}
