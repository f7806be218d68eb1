//! A resumer node: listener, store, registry, router and background sweeper

use crate::address::{self, NodeAddress};
use crate::config::Config;
use crate::error::ResumerError;
use crate::locator::LocatorDirectory;
use crate::registry::RecordingRegistry;
use crate::router::Router;
use crate::server;
use crate::store::AppendStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A bound but not yet serving node
#[derive(Debug)]
pub struct Node {
    listener: TcpListener,
    router: Router,
    sweep_interval: Duration,
}

impl Node {
    /// Bind the listener, open the spool and clean up stale spool files.
    pub async fn bind(
        config: &Config,
        directory: Arc<dyn LocatorDirectory>,
    ) -> Result<Self, ResumerError> {
        let listener = TcpListener::bind(&config.listen).await?;
        let bound = listener.local_addr()?;
        let advertised = address::resolve_advertised(config.advertised_address.as_deref(), bound);

        let options = config.recording_options();
        let store = Arc::new(AppendStore::open(config.spool_dir())?);
        store.remove_stale_files(options.retention);

        info!(
            %bound,
            node = %advertised,
            directory = directory.name(),
            spool = %store.dir().display(),
            "node ready"
        );
        let registry = Arc::new(RecordingRegistry::new(advertised, store, directory, options));
        Ok(Self {
            listener,
            router: Router::new(registry),
            sweep_interval: config.sweep_interval(),
        })
    }

    /// Address published to the cluster.
    pub fn address(&self) -> &NodeAddress {
        self.router.node()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &Arc<RecordingRegistry> {
        self.router.registry()
    }

    /// Serve until the task is dropped.
    pub async fn run(self) {
        let _sweeper = SweeperGuard(spawn_sweeper(
            Arc::clone(self.router.registry()),
            self.sweep_interval,
        ));
        server::serve(self.listener, self.router).await;
    }

    /// Serve in the background; the node stops when the handle is dropped.
    pub fn spawn(self) -> NodeHandle {
        let address = self.address().clone();
        let local_addr = self.listener.local_addr().ok();
        let router = self.router.clone();
        let sweeper = spawn_sweeper(Arc::clone(router.registry()), self.sweep_interval);
        let server = tokio::spawn(server::serve(self.listener, self.router));
        NodeHandle {
            address,
            local_addr,
            router,
            server,
            sweeper,
        }
    }
}

/// Running node; aborts its tasks on drop
#[derive(Debug)]
pub struct NodeHandle {
    address: NodeAddress,
    local_addr: Option<SocketAddr>,
    router: Router,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl NodeHandle {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// Address clients can dial, as bound.
    pub fn dial_address(&self) -> String {
        self.local_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.address.authority())
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &Arc<RecordingRegistry> {
        self.router.registry()
    }

    /// Stop accepting connections and stop sweeping.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.server.abort();
        self.sweeper.abort();
    }
}

struct SweeperGuard(JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Periodically delete expired spools and locator entries.
fn spawn_sweeper(registry: Arc<RecordingRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let retention = registry.options().retention;
            let removed = registry
                .store()
                .sweep(retention, registry.directory().as_ref());
            let purged = registry.directory().purge_expired();
            if !removed.is_empty() || purged > 0 {
                debug!(spools = removed.len(), locators = purged, "sweep finished");
            }
        }
    })
}
