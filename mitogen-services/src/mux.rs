//! The multiplexer: master context of a run, holding every connection.
//!
//! Worker processes join through the unix listener and ask the mux for
//! targets via the [`ContextService`]; files they hand to targets are served
//! by the [`FileService`]. Both run on one [`ServicePool`].
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use mitogen_core::{
    config::{RouterConfig, RuntimeConfig},
    unix::Listener,
    Broker, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    connect::{Connector, ConnectorConfig, ProcessConnector},
    context_service::ContextService,
    file_service::{FileService, DEFAULT_CHUNK_SIZE},
    service::ServicePool,
    Result,
};

// Default service threads: 16
const DEFAULT_POOL_SIZE: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MuxConfig {
    pub listener_path: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: usize,
    #[serde(default)]
    pub connect: ConnectorConfig,
}

define_const!(default_pool_size, DEFAULT_POOL_SIZE, usize);
define_const!(default_file_chunk_size, DEFAULT_CHUNK_SIZE, usize);

impl MuxConfig {
    pub fn new(listener_path: impl Into<PathBuf>) -> Self {
        Self {
            listener_path: listener_path.into(),
            runtime: RuntimeConfig::default(),
            router: RouterConfig::default(),
            pool_size: default_pool_size(),
            file_chunk_size: default_file_chunk_size(),
            connect: ConnectorConfig::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        mitogen_core::config::load(path)
    }
}

pub struct Mux {
    router: Router,
    pool: ServicePool,
    listener: Listener,
    contexts: Arc<ContextService>,
    files: Arc<FileService>,
    stopped: AtomicBool,
}

impl Mux {
    pub fn start(config: &MuxConfig) -> Result<Self> {
        let connector = ProcessConnector::new(config.connect.clone());
        Self::with_connector(config, Arc::new(connector))
    }

    /// Start with a custom way of reaching targets.
    pub fn with_connector(config: &MuxConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let broker = Broker::new(&config.runtime)?;
        let router = Router::new(broker, &config.router)?;
        let pool = ServicePool::new(&router, config.pool_size)?;
        let contexts = Arc::new(ContextService::new(&router, connector)?);
        pool.add(contexts.clone());
        let files = Arc::new(FileService::new(config.file_chunk_size));
        pool.add(files.clone());
        let listener = Listener::bind(&router, &config.listener_path)?;
        info!("mux listening on {}", listener.path().display());
        Ok(Self {
            router,
            pool,
            listener,
            contexts,
            files,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn listener_path(&self) -> &Path {
        self.listener.path()
    }

    pub fn context_service(&self) -> &ContextService {
        &self.contexts
    }

    pub fn file_service(&self) -> &FileService {
        &self.files
    }

    /// Block until the broker stops.
    pub fn join(&self) {
        self.router.broker().join();
        self.pool.join();
    }

    /// Stop accepting workers and tear every connection down. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("mux shutting down");
        self.listener.close();
        self.pool.stop();
        self.router.broker().shutdown();
        self.join();
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shutdown();
    }
}
