pub(crate) mod cache;
pub(crate) mod http;
pub(crate) mod listener;
pub(crate) mod path;
pub(crate) mod pipeline;
pub(crate) mod server;
pub(crate) mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;
use cache::{HandleRegistry, ObjectStore};
use upstream::UpstreamClient;

/// Shared per-process state handed to every connection task.
#[derive(Clone)]
pub(crate) struct AppContext {
    pub(crate) settings: Arc<Settings>,
    pub(crate) store: ObjectStore,
    pub(crate) registry: Arc<HandleRegistry>,
    pub(crate) upstream: Arc<UpstreamClient>,
}

impl AppContext {
    pub(crate) fn new(settings: Arc<Settings>) -> Result<Self> {
        let store = ObjectStore::new(settings.cache_dir.clone());
        let upstream = Arc::new(UpstreamClient::new(settings.upstream.clone())?);
        Ok(Self {
            settings,
            store,
            registry: HandleRegistry::new(),
            upstream,
        })
    }
}

pub(crate) async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
