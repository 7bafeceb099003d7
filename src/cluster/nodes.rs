//! Handles for the individual node processes of a running cluster.
//!
//! Each handle wraps one [`NodeDescriptor`] plus the control-CLI calls that
//! start and stop the process behind it. The processes themselves are
//! daemonized by `storctl`, so a handle tracks liveness from the calls it
//! has made rather than owning a child directly.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing::warn;

use crate::cluster::metric_value;
use crate::cluster::ClusterCtl;
use crate::cluster::NodeHttpClient;
use crate::config::NodeDescriptor;
use crate::config::NodeId;
use crate::config::TenantId;
use crate::errors::StorageError;
use crate::retry::wait_until;
use crate::Error;
use crate::Result;

/// Poll budget for a node's readiness and tenant-stabilization checks.
pub const NODE_POLL_ATTEMPTS: usize = 20;
pub const NODE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Metrics that must read zero before a storage node is considered to have
/// run cleanly.
const UNEXPECTED_ERROR_METRICS: &[&str] = &["storage_unexpected_errors_total"];

fn log_contains(desc: &NodeDescriptor, pattern: &str) -> Result<bool> {
    let log_path = desc.root_dir.join(format!("{}.log", desc.role));
    if !log_path.exists() {
        return Ok(false);
    }
    let contents = std::fs::read_to_string(&log_path).map_err(|source| StorageError::Path {
        path: log_path,
        source,
    })?;
    Ok(contents.contains(pattern))
}

async fn wait_ready(desc: &NodeDescriptor, http: &NodeHttpClient) -> Result<()> {
    let what = format!("{} {} ready", desc.role, desc.id);
    wait_until(NODE_POLL_ATTEMPTS, NODE_POLL_INTERVAL, &what, || async move {
        http.status().await.map(|_| ())
    })
    .await
}

/// Discovery service the other nodes register with.
#[derive(Debug)]
pub struct Broker {
    pub desc: NodeDescriptor,
    cli: Arc<ClusterCtl>,
    running: AtomicBool,
}

impl Broker {
    pub(crate) fn new(desc: NodeDescriptor, cli: Arc<ClusterCtl>) -> Self {
        Self {
            desc,
            cli,
            running: AtomicBool::new(false),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        self.cli.broker_start().await?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop(&self, immediate: bool) -> Result<()> {
        if !self.running() {
            return Ok(());
        }
        self.cli.broker_stop(immediate).await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// The coordination/attachment service. Must be up before any storage node
/// starts, since those call back into it on startup.
#[derive(Debug)]
pub struct Coordinator {
    pub desc: NodeDescriptor,
    cli: Arc<ClusterCtl>,
    running: AtomicBool,
}

impl Coordinator {
    pub(crate) fn new(desc: NodeDescriptor, cli: Arc<ClusterCtl>) -> Self {
        Self {
            desc,
            cli,
            running: AtomicBool::new(false),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn http_client(&self) -> NodeHttpClient {
        NodeHttpClient::new(self.desc.http_base_url())
    }

    pub async fn start(&self, extra_env: HashMap<String, String>) -> Result<()> {
        self.cli.coordinator_start(extra_env).await?;
        // The process exists once the CLI call returns; mark it running
        // before the readiness wait so a timed-out node still gets stopped
        // at teardown.
        self.running.store(true, Ordering::SeqCst);
        wait_ready(&self.desc, &self.http_client()).await
    }

    pub async fn stop(&self, immediate: bool) -> Result<()> {
        if !self.running() {
            return Ok(());
        }
        self.cli.coordinator_stop(immediate).await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// One storage node: owns persisted data shards for attached tenants.
#[derive(Debug)]
pub struct StorageNode {
    pub desc: NodeDescriptor,
    cli: Arc<ClusterCtl>,
    running: AtomicBool,
    /// `key=value` config overrides applied on every start, assembled by the
    /// builder (remote-storage wiring, engine variant, caller overrides)
    start_overrides: Vec<String>,
}

impl StorageNode {
    pub(crate) fn new(
        desc: NodeDescriptor,
        cli: Arc<ClusterCtl>,
        start_overrides: Vec<String>,
    ) -> Self {
        Self {
            desc,
            cli,
            running: AtomicBool::new(false),
            start_overrides,
        }
    }

    pub fn id(&self) -> NodeId {
        self.desc.id
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn http_client(&self) -> NodeHttpClient {
        NodeHttpClient::new(self.desc.http_base_url())
    }

    pub async fn start(&self, extra_env: HashMap<String, String>) -> Result<()> {
        self.cli
            .storage_start(self.desc.id, &self.start_overrides, extra_env)
            .await?;
        // Process already spawned; see Coordinator::start.
        self.running.store(true, Ordering::SeqCst);
        wait_ready(&self.desc, &self.http_client()).await
    }

    pub async fn stop(&self, immediate: bool) -> Result<()> {
        if !self.running() {
            return Ok(());
        }
        self.cli.storage_stop(self.desc.id, immediate).await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop, start, then block until every tenant on this node settles.
    pub async fn restart(&self, immediate: bool) -> Result<()> {
        info!("Restarting storage node {}", self.desc.id);
        self.stop(immediate).await?;
        self.start(HashMap::new()).await?;
        self.quiesce_tenants().await
    }

    /// Wait until every tenant reaches a stable terminal state, `Active` or
    /// `Broken`. Not settling within the poll budget is a failure, never
    /// silently ignored.
    pub async fn quiesce_tenants(&self) -> Result<()> {
        let http = self.http_client();
        let what = format!("storage node {} tenants stable", self.desc.id);
        wait_until(NODE_POLL_ATTEMPTS, NODE_POLL_INTERVAL, &what, || {
            let http = http.clone();
            async move {
                let tenants = http.tenant_list().await?;
                for tenant in &tenants {
                    if tenant.state != "Active" && tenant.state != "Broken" {
                        return Err(Error::not_found(format!(
                            "tenant {} still in state {}",
                            tenant.id, tenant.state
                        )));
                    }
                }
                Ok(())
            }
        })
        .await
    }

    /// Fail if any unexpected-error metric on this node is nonzero.
    pub async fn assert_no_metric_errors(&self) -> Result<()> {
        let metrics = self.http_client().metrics().await?;
        for name in UNEXPECTED_ERROR_METRICS {
            let value = metric_value(&metrics, name).unwrap_or(0.0);
            if value > 0.0 {
                return Err(Error::Consistency(format!(
                    "storage node {}: metric {name} is {value}, expected 0",
                    self.desc.id
                )));
            }
        }
        Ok(())
    }

    pub async fn attach_tenant(&self, tenant: &TenantId) -> Result<()> {
        self.http_client().tenant_attach(tenant).await
    }

    pub async fn detach_tenant(&self, tenant: &TenantId) -> Result<()> {
        self.http_client().tenant_detach(tenant).await
    }

    pub fn log_contains(&self, pattern: &str) -> Result<bool> {
        log_contains(&self.desc, pattern)
    }
}

/// One WAL node: durably persists write-ahead-log segments.
#[derive(Debug)]
pub struct WalNode {
    pub desc: NodeDescriptor,
    cli: Arc<ClusterCtl>,
    running: AtomicBool,
}

impl WalNode {
    pub(crate) fn new(desc: NodeDescriptor, cli: Arc<ClusterCtl>) -> Self {
        Self {
            desc,
            cli,
            running: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.desc.id
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn http_client(&self) -> NodeHttpClient {
        NodeHttpClient::new(self.desc.http_base_url())
    }

    /// host:port of the WAL ingest listener.
    pub fn connstr(&self) -> String {
        self.desc
            .data_addr()
            .unwrap_or_else(|| format!("localhost:{}", self.desc.ports.http))
    }

    pub async fn start(&self, extra_env: HashMap<String, String>) -> Result<()> {
        self.cli.wal_start(self.desc.id, extra_env).await?;
        // Process already spawned; see Coordinator::start.
        self.running.store(true, Ordering::SeqCst);
        wait_ready(&self.desc, &self.http_client()).await
    }

    pub async fn stop(&self, immediate: bool) -> Result<()> {
        if !self.running() {
            return Ok(());
        }
        self.cli.wal_stop(self.desc.id, immediate).await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn restart(&self, immediate: bool) -> Result<()> {
        info!("Restarting WAL node {}", self.desc.id);
        self.stop(immediate).await?;
        self.start(HashMap::new()).await
    }

    pub fn log_contains(&self, pattern: &str) -> Result<bool> {
        log_contains(&self.desc, pattern)
    }
}

/// A compute endpoint attached to one tenant branch. Created on demand, any
/// number per cluster.
#[derive(Debug)]
pub struct ComputeEndpoint {
    pub name: String,
    pub tenant: TenantId,
    pub branch_name: String,
    pub desc: NodeDescriptor,
    cli: Arc<ClusterCtl>,
    running: AtomicBool,
}

impl ComputeEndpoint {
    pub(crate) fn new(
        name: String,
        tenant: TenantId,
        branch_name: String,
        desc: NodeDescriptor,
        cli: Arc<ClusterCtl>,
    ) -> Self {
        Self {
            name,
            tenant,
            branch_name,
            desc,
            cli,
            running: AtomicBool::new(false),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// host:port the SQL client connects to.
    pub fn connstr(&self) -> String {
        self.desc.data_addr().unwrap_or_default()
    }

    pub async fn start(&self) -> Result<()> {
        self.cli.compute_start(&self.name).await?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop(&self, immediate: bool) -> Result<()> {
        if !self.running() {
            return Ok(());
        }
        if let Err(e) = self.cli.compute_stop(&self.name, immediate).await {
            warn!("Stopping compute {} failed: {e}", self.name);
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Re-point at the current tenant-to-storage assignment, after a tenant
    /// migration.
    pub async fn reconfigure(&self) -> Result<()> {
        self.cli.compute_reconfigure(&self.name).await?;
        Ok(())
    }
}
