//! The live cluster: started and stoppable node processes.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::error;
use tracing::info;

use crate::cluster::Broker;
use crate::cluster::ClusterCtl;
use crate::cluster::ComputeEndpoint;
use crate::cluster::Coordinator;
use crate::cluster::StorageNode;
use crate::cluster::WalNode;
use crate::config::ClusterConfig;
use crate::config::NodeDescriptor;
use crate::config::NodeId;
use crate::config::NodePorts;
use crate::config::NodeRole;
use crate::config::TenantId;
use crate::worker::PortAllocator;
use crate::Error;
use crate::Result;

/// One orchestrated cluster: a coordinator, a broker, and the configured
/// storage and WAL nodes, all rooted under a single directory owned by this
/// instance.
#[derive(Debug)]
pub struct Cluster {
    pub config: ClusterConfig,
    root: PathBuf,
    pub coordinator: Coordinator,
    pub broker: Broker,
    pub storage_nodes: Vec<StorageNode>,
    pub wal_nodes: Vec<WalNode>,
    computes: Mutex<Vec<Arc<ComputeEndpoint>>>,
    cli: Arc<ClusterCtl>,
}

impl Cluster {
    pub(crate) fn new(
        config: ClusterConfig,
        root: PathBuf,
        coordinator: Coordinator,
        broker: Broker,
        storage_nodes: Vec<StorageNode>,
        wal_nodes: Vec<WalNode>,
        cli: Arc<ClusterCtl>,
    ) -> Self {
        Self {
            config,
            root,
            coordinator,
            broker,
            storage_nodes,
            wal_nodes,
            computes: Mutex::new(Vec::new()),
            cli,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cli(&self) -> &ClusterCtl {
        &self.cli
    }

    /// Start every node.
    ///
    /// The coordinator comes up synchronously first, since storage nodes
    /// call back into it during startup. Broker and all storage/WAL nodes
    /// then start concurrently; every attempt runs to completion and the
    /// first error is surfaced only after all of them finished, so a partial
    /// failure never leaves unattempted nodes behind.
    pub async fn start_all(&self) -> Result<()> {
        info!("Starting cluster at {}", self.root.display());
        self.coordinator.start(HashMap::new()).await?;

        let mut tasks: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
        tasks.push(self.broker.start().boxed());
        for node in &self.storage_nodes {
            tasks.push(node.start(HashMap::new()).boxed());
        }
        for node in &self.wal_nodes {
            tasks.push(node.start(HashMap::new()).boxed());
        }
        let mut first_error = None;
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Node start failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Stop every node in reverse dependency order: computes, WAL nodes,
    /// storage nodes, coordinator, broker.
    ///
    /// With `check_metrics`, each storage node's unexpected-error metrics
    /// are asserted zero before it goes down. All phases run regardless of
    /// earlier failures; the first error is returned at the end.
    pub async fn stop_all(&self, immediate: bool, check_metrics: bool) -> Result<()> {
        info!("Stopping cluster at {}", self.root.display());
        let mut first_error = None;
        let mut record = |result: Result<()>| {
            if let Err(e) = result {
                error!("Node stop failed: {e}");
                first_error.get_or_insert(e);
            }
        };

        let computes: Vec<Arc<ComputeEndpoint>> = self.computes.lock().clone();
        for compute in &computes {
            record(compute.stop(immediate).await);
        }
        for node in &self.wal_nodes {
            record(node.stop(immediate).await);
        }
        for node in &self.storage_nodes {
            if check_metrics && node.running() {
                record(node.assert_no_metric_errors().await);
            }
            record(node.stop(immediate).await);
        }
        record(self.coordinator.stop(immediate).await);
        record(self.broker.stop(immediate).await);

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn storage_node(&self, id: NodeId) -> Result<&StorageNode> {
        self.storage_nodes
            .iter()
            .find(|node| node.id() == id)
            .ok_or_else(|| Error::not_found(format!("storage node {id}")))
    }

    /// The single storage node of a one-node topology. Errors in multi-node
    /// clusters rather than silently picking one.
    pub fn the_storage_node(&self) -> Result<&StorageNode> {
        match self.storage_nodes.as_slice() {
            [node] => Ok(node),
            nodes => Err(Error::invalid_config(format!(
                "the_storage_node requires exactly one storage node, cluster has {}",
                nodes.len()
            ))),
        }
    }

    pub fn wal_node(&self, id: NodeId) -> Result<&WalNode> {
        self.wal_nodes
            .iter()
            .find(|node| node.id() == id)
            .ok_or_else(|| Error::not_found(format!("WAL node {id}")))
    }

    pub fn the_wal_node(&self) -> Result<&WalNode> {
        match self.wal_nodes.as_slice() {
            [node] => Ok(node),
            nodes => Err(Error::invalid_config(format!(
                "the_wal_node requires exactly one WAL node, cluster has {}",
                nodes.len()
            ))),
        }
    }

    /// Comma-separated WAL ingest addresses, the form compute endpoints
    /// expect in their config.
    pub fn wal_connstrs(&self) -> String {
        self.wal_nodes
            .iter()
            .map(WalNode::connstr)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Create (but do not start) a compute endpoint on a tenant branch.
    /// Ports come from the worker's allocator like every other listener.
    pub async fn create_compute(
        &self,
        ports: &PortAllocator,
        name: &str,
        tenant: &TenantId,
        branch_name: &str,
    ) -> Result<Arc<ComputeEndpoint>> {
        let data_port = ports.get_port()?;
        let http_port = ports.get_port()?;
        self.cli
            .compute_create(name, tenant, branch_name, data_port, http_port)
            .await?;
        let desc = NodeDescriptor {
            id: NodeId(self.computes.lock().len() as u64 + 1),
            role: NodeRole::Compute,
            ports: NodePorts::with_data(data_port, http_port),
            root_dir: self.root.join(format!("compute_{name}")),
            auth: self.config.auth,
        };
        let compute = Arc::new(ComputeEndpoint::new(
            name.to_owned(),
            tenant.clone(),
            branch_name.to_owned(),
            desc,
            Arc::clone(&self.cli),
        ));
        self.computes.lock().push(Arc::clone(&compute));
        Ok(compute)
    }

    pub fn computes(&self) -> Vec<Arc<ComputeEndpoint>> {
        self.computes.lock().clone()
    }
}
