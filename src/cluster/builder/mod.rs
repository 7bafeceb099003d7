//! Cluster assembly, snapshot reuse and teardown.
//!
//! A builder accumulates the declarative cluster spec, then `init()` turns
//! it into directories, ports and a config file, `start()` brings the
//! processes up, and `teardown()` is the single recovery path that always
//! runs to completion, failure or not.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cluster::Broker;
use crate::cluster::Cluster;
use crate::cluster::ClusterCtl;
use crate::cluster::Coordinator;
use crate::cluster::StorageNode;
use crate::cluster::WalNode;
use crate::config::ClusterConfig;
use crate::config::NodeDescriptor;
use crate::config::NodeId;
use crate::config::NodePorts;
use crate::config::NodeRole;
use crate::config::TenantId;
use crate::config::TimelineId;
use crate::errors::ConfigError;
use crate::errors::StorageError;
use crate::process::CommandRunner;
use crate::remote_storage::BucketOverrides;
use crate::remote_storage::MockS3Server;
use crate::remote_storage::RemoteStorage;
use crate::remote_storage::RemoteStorageKind;
use crate::remote_storage::RemoteStorageUser;
use crate::scrub::StorageScrubber;
use crate::snapshot::overlay_mounts_beneath;
use crate::snapshot::OverlayState;
use crate::snapshot::SnapshotStore;
use crate::worker::WorkerContext;
use crate::Error;
use crate::Result;

const CONFIG_FILE_NAME: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderState {
    Unconfigured,
    Configured,
    Started,
    Stopped,
    TornDown,
}

/// On-disk cluster config, the TOML document `storctl init` consumes.
#[derive(Debug, Serialize, Deserialize)]
struct ClusterFileConfig {
    default_branch_name: String,
    initial_tenant: TenantId,
    initial_timeline: TimelineId,
    auth: String,
    wal_fsync: bool,
    broker: BrokerFileConfig,
    coordinator: CoordinatorFileConfig,
    #[serde(rename = "storage")]
    storage_nodes: Vec<StorageNodeFileConfig>,
    #[serde(rename = "wal")]
    wal_nodes: Vec<WalNodeFileConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BrokerFileConfig {
    http_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct CoordinatorFileConfig {
    http_port: u16,
    db_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageNodeFileConfig {
    id: u64,
    data_port: u16,
    http_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_storage: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WalNodeFileConfig {
    id: u64,
    data_port: u16,
    http_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_storage: Option<String>,
}

/// Builds, reuses and tears down one cluster per test.
///
/// Lifecycle: `Unconfigured → Configured → Started ⇄ Stopped → TornDown`.
/// `teardown()` is valid from any state and idempotent.
pub struct ClusterBuilder<'a> {
    ctx: &'a WorkerContext,
    test_name: String,
    root: PathBuf,
    config: ClusterConfig,
    storage_kind: RemoteStorageKind,
    wal_kind: Option<RemoteStorageKind>,
    bucket_overrides: Option<BucketOverrides>,
    cleanup_mock_buckets: bool,
    scrub_on_exit: bool,
    state: BuilderState,
    runner: CommandRunner,
    cli: Arc<ClusterCtl>,
    cluster: Option<Cluster>,
    storage_remote: Option<RemoteStorage>,
    wal_remote: Option<RemoteStorage>,
    mock_server: Option<MockS3Server>,
    overlay: Option<OverlayState>,
}

impl<'a> ClusterBuilder<'a> {
    pub fn new(ctx: &'a WorkerContext, test_name: impl Into<String>) -> Self {
        let test_name = test_name.into();
        let root = ctx.test_output_dir(&test_name).join("cluster");
        let runner = CommandRunner::new(&root, &ctx.settings.dist_dir)
            .with_log_filter(ctx.settings.log_filter.clone());
        let cli = Arc::new(ClusterCtl::new(&ctx.settings.bin_dir, runner.clone()));
        let overlay = ctx
            .settings
            .overlay_snapshots
            .then(|| OverlayState::new(ctx.test_overlay_dir(&test_name)));
        Self {
            ctx,
            test_name,
            root,
            config: ClusterConfig::default(),
            storage_kind: RemoteStorageKind::LocalFs,
            wal_kind: None,
            bucket_overrides: None,
            cleanup_mock_buckets: false,
            scrub_on_exit: false,
            state: BuilderState::Unconfigured,
            runner,
            cli,
            cluster: None,
            storage_remote: None,
            wal_remote: None,
            mock_server: None,
            overlay,
        }
    }

    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Mutable access to the declarative spec, valid until `init()` freezes
    /// it.
    pub fn config_mut(&mut self) -> &mut ClusterConfig {
        &mut self.config
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn enable_storage_remote_storage(mut self, kind: RemoteStorageKind) -> Self {
        self.storage_kind = kind;
        self
    }

    pub fn enable_wal_remote_storage(mut self, kind: RemoteStorageKind) -> Self {
        self.wal_kind = Some(kind);
        self
    }

    pub fn with_bucket_overrides(mut self, overrides: BucketOverrides) -> Self {
        self.bucket_overrides = Some(overrides);
        self
    }

    /// Empty mock-server buckets during teardown. Off by default: the mock
    /// server dies with the test anyway, but a shared external mock needs the
    /// bucket emptied between tests.
    pub fn cleanup_mock_buckets(mut self) -> Self {
        self.cleanup_mock_buckets = true;
        self
    }

    /// Run the metadata scrubber during teardown. Requires an object-store
    /// storage backend; there is nothing to scan on a local filesystem.
    pub fn enable_scrub_on_exit(mut self) -> Result<Self> {
        match self.storage_kind {
            RemoteStorageKind::MockS3 | RemoteStorageKind::RealS3 => {
                self.scrub_on_exit = true;
                Ok(self)
            }
            RemoteStorageKind::LocalFs => Err(Error::invalid_config(
                "scrub on exit requires an object-store storage backend",
            )),
        }
    }

    pub fn storage_remote(&self) -> Option<&RemoteStorage> {
        self.storage_remote.as_ref()
    }

    pub fn cluster(&self) -> Result<&Cluster> {
        self.cluster
            .as_ref()
            .ok_or_else(|| ConfigError::State("cluster is not initialized".into()).into())
    }

    /// Resolve remote storage, allocate ports and directories for every
    /// configured node, write the config file and run `storctl init`.
    pub async fn init(&mut self) -> Result<&Cluster> {
        if self.state != BuilderState::Unconfigured {
            return Err(ConfigError::State("init called twice on this builder".into()).into());
        }
        self.config.validate()?;
        std::fs::create_dir_all(&self.root).map_err(|source| StorageError::Path {
            path: self.root.clone(),
            source,
        })?;
        self.configure_remote_storage().await?;
        self.init_configured().await?;
        self.cluster()
    }

    /// `init()` + `start()` + initial tenant and timeline creation, the
    /// common opening move of most tests.
    pub async fn init_start(&mut self) -> Result<&Cluster> {
        self.init().await?;
        self.start().await?;
        let (tenant, timeline) = {
            let config = &self.cluster()?.config;
            (config.initial_tenant.clone(), config.initial_timeline.clone())
        };
        info!("Creating initial tenant {tenant}");
        self.cli.tenant_create(&tenant, &timeline).await?;
        self.cluster()
    }

    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            BuilderState::Configured | BuilderState::Stopped => {}
            _ => {
                return Err(
                    ConfigError::State("start requires an initialized, stopped cluster".into())
                        .into(),
                )
            }
        }
        self.cluster()?.start_all().await?;
        self.state = BuilderState::Started;
        Ok(())
    }

    pub async fn stop(&mut self, immediate: bool) -> Result<()> {
        if self.state != BuilderState::Started {
            return Err(ConfigError::State("stop requires a started cluster".into()).into());
        }
        self.cluster()?.stop_all(immediate, false).await?;
        self.state = BuilderState::Stopped;
        Ok(())
    }

    /// Build this cluster from a cached snapshot, constructing the snapshot
    /// first if no compatible one exists.
    ///
    /// `ctor` receives the builder and must leave behind a fully built,
    /// stopped cluster under the builder's root. On an ephemeral CI runner
    /// the cache never pays off across runs, so the constructor's fresh
    /// build is used directly and nothing is cached.
    pub async fn build_and_use_snapshot<F>(
        &mut self,
        store: &SnapshotStore,
        ident: &str,
        ctor: F,
    ) -> Result<&Cluster>
    where
        F: for<'b> FnOnce(&'b mut ClusterBuilder<'a>) -> BoxFuture<'b, Result<()>>,
    {
        if self.ctx.settings.ci {
            info!("CI run: building {ident} fresh, skipping the snapshot cache");
            ctor(self).await?;
            self.stop_if_started().await?;
            self.state = BuilderState::Stopped;
            return self.cluster();
        }

        let tag = self.config.compatibility_tag(self.storage_kind.as_str());
        let dir = store.snapshot_dir(ident);
        let locked = dir.lock()?;
        if !locked.is_initialized(&tag) {
            locked.clear()?;
            info!("Building snapshot {ident} ({tag})");
            if let Some(overlay) = &self.overlay {
                std::fs::create_dir_all(locked.path()).map_err(|source| StorageError::Path {
                    path: locked.path(),
                    source,
                })?;
                overlay
                    .mount(&self.runner, ident, &locked.path(), &self.root)
                    .await?;
            }

            ctor(self).await?;
            self.stop_if_started().await?;

            if let Some(overlay) = &self.overlay {
                overlay
                    .unmount_and_move(&self.runner, ident, &self.root, &locked.path())
                    .await?;
            } else {
                std::fs::rename(&self.root, locked.path()).map_err(|source| {
                    StorageError::Snapshot(format!(
                        "moving {} into the cache failed: {source}",
                        self.root.display()
                    ))
                })?;
            }
            locked.set_initialized(&tag)?;
        } else {
            info!("Reusing snapshot {ident} ({tag})");
        }

        self.reset_for_reuse();
        self.from_snapshot_dir(&locked.path()).await?;
        self.cluster()
    }

    /// Re-create this cluster from a snapshot directory: recover the tenant
    /// and timeline ids recorded there, materialize the payload under the
    /// builder's root (copy, or overlay mount in overlay mode), then re-init
    /// with freshly allocated ports.
    pub async fn from_snapshot_dir(&mut self, snapshot: &Path) -> Result<&Cluster> {
        if self.state != BuilderState::Unconfigured {
            return Err(
                ConfigError::State("from_snapshot_dir requires an unused builder".into()).into(),
            );
        }
        let config_path = snapshot.join(CONFIG_FILE_NAME);
        let raw = std::fs::read_to_string(&config_path).map_err(|source| StorageError::Path {
            path: config_path,
            source,
        })?;
        let file_config: ClusterFileConfig = toml::from_str(&raw)
            .map_err(|e| Error::invalid_config(format!("unreadable snapshot config: {e}")))?;
        self.config.initial_tenant = file_config.initial_tenant;
        self.config.initial_timeline = file_config.initial_timeline;
        self.config.default_branch_name = file_config.default_branch_name;

        if let Some(overlay) = &self.overlay {
            let clone_ident = format!("{}-clone", self.test_name.replace('/', "-"));
            overlay
                .mount(&self.runner, &clone_ident, snapshot, &self.root)
                .await?;
        } else {
            copy_dir_all(snapshot, &self.root)?;
        }

        self.configure_remote_storage().await?;
        self.init_configured().await?;
        self.cluster()
    }

    /// Allocate descriptors, write the config file, run `storctl init` and
    /// assemble the node handles. The remote storage backends must already
    /// be configured.
    async fn init_configured(&mut self) -> Result<()> {
        let ports = &self.ctx.ports;
        let (coord_http, coord_db) = ports.get_adjacent_pair()?;
        let coordinator_desc = NodeDescriptor {
            id: NodeId(1),
            role: NodeRole::Coordinator,
            ports: NodePorts::with_data(coord_db, coord_http),
            root_dir: self.root.join("coordinator"),
            auth: self.config.auth,
        };
        let broker_desc = NodeDescriptor {
            id: NodeId(1),
            role: NodeRole::Broker,
            ports: NodePorts::http_only(ports.get_port()?),
            root_dir: self.root.join("broker"),
            auth: self.config.auth,
        };

        let storage_inline = self.storage_remote.as_ref().map(RemoteStorage::to_toml_inline_table);
        let wal_inline = self.wal_remote.as_ref().map(RemoteStorage::to_toml_inline_table);

        let mut storage_descs = Vec::new();
        for n in 1..=self.config.num_storage_nodes {
            storage_descs.push(NodeDescriptor {
                id: NodeId(u64::from(n)),
                role: NodeRole::Storage,
                ports: NodePorts::with_data(ports.get_port()?, ports.get_port()?),
                root_dir: self.root.join(format!("storage_{n}")),
                auth: self.config.auth,
            });
        }
        let mut wal_descs = Vec::new();
        for n in 0..self.config.num_wal_nodes {
            let id = self.config.wal_ids_start + u64::from(n) + 1;
            wal_descs.push(NodeDescriptor {
                id: NodeId(id),
                role: NodeRole::Wal,
                ports: NodePorts::with_data(ports.get_port()?, ports.get_port()?),
                root_dir: self.root.join(format!("wal_{id}")),
                auth: self.config.auth,
            });
        }

        let file_config = ClusterFileConfig {
            default_branch_name: self.config.default_branch_name.clone(),
            initial_tenant: self.config.initial_tenant.clone(),
            initial_timeline: self.config.initial_timeline.clone(),
            auth: self.config.auth.as_config_str().to_owned(),
            wal_fsync: self.config.wal_fsync,
            broker: BrokerFileConfig {
                http_port: broker_desc.ports.http,
            },
            coordinator: CoordinatorFileConfig {
                http_port: coord_http,
                db_port: coord_db,
            },
            storage_nodes: storage_descs
                .iter()
                .map(|desc| StorageNodeFileConfig {
                    id: desc.id.0,
                    data_port: desc.ports.data.unwrap_or_default(),
                    http_port: desc.ports.http,
                    remote_storage: storage_inline.clone(),
                })
                .collect(),
            wal_nodes: wal_descs
                .iter()
                .map(|desc| WalNodeFileConfig {
                    id: desc.id.0,
                    data_port: desc.ports.data.unwrap_or_default(),
                    http_port: desc.ports.http,
                    remote_storage: wal_inline.clone(),
                })
                .collect(),
        };
        let rendered = toml::to_string_pretty(&file_config)
            .map_err(|e| Error::invalid_config(format!("unserializable cluster config: {e}")))?;
        let config_path = self.root.join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, rendered).map_err(|source| StorageError::Path {
            path: config_path.clone(),
            source,
        })?;

        self.cli.init(&config_path).await?;

        let mut storage_overrides = Vec::new();
        if let Some(inline) = &storage_inline {
            storage_overrides.push(format!("remote_storage={inline}"));
        }
        if let Some(variant) = &self.ctx.settings.storage_engine_variant {
            storage_overrides.push(format!("storage_engine={variant}"));
        }
        if let Some(raw) = &self.config.storage_config_override {
            storage_overrides.push(raw.clone());
        }

        let coordinator = Coordinator::new(coordinator_desc, Arc::clone(&self.cli));
        let broker = Broker::new(broker_desc, Arc::clone(&self.cli));
        let storage_nodes = storage_descs
            .into_iter()
            .map(|desc| StorageNode::new(desc, Arc::clone(&self.cli), storage_overrides.clone()))
            .collect();
        let wal_nodes = wal_descs
            .into_iter()
            .map(|desc| WalNode::new(desc, Arc::clone(&self.cli)))
            .collect();

        self.cluster = Some(Cluster::new(
            self.config.clone(),
            self.root.clone(),
            coordinator,
            broker,
            storage_nodes,
            wal_nodes,
            Arc::clone(&self.cli),
        ));
        self.state = BuilderState::Configured;
        Ok(())
    }

    async fn configure_remote_storage(&mut self) -> Result<()> {
        if matches!(self.storage_kind, RemoteStorageKind::MockS3)
            || matches!(self.wal_kind, Some(RemoteStorageKind::MockS3))
        {
            self.ensure_mock_server().await?;
        }
        let storage_remote = self
            .storage_kind
            .configure(
                &self.root,
                self.mock_server.as_ref(),
                &self.ctx.run_id,
                &self.test_name,
                RemoteStorageUser::Storage,
                self.bucket_overrides.clone(),
            )
            .await?;
        self.storage_remote = Some(self.apply_mock_cleanup(storage_remote));
        if let Some(kind) = self.wal_kind {
            let wal_remote = kind
                .configure(
                    &self.root,
                    self.mock_server.as_ref(),
                    &self.ctx.run_id,
                    &self.test_name,
                    RemoteStorageUser::Wal,
                    self.bucket_overrides.clone(),
                )
                .await?;
            self.wal_remote = Some(self.apply_mock_cleanup(wal_remote));
        }
        Ok(())
    }

    fn apply_mock_cleanup(&self, remote: RemoteStorage) -> RemoteStorage {
        match remote {
            RemoteStorage::S3(s3) if self.cleanup_mock_buckets && !s3.real => {
                RemoteStorage::S3(s3.with_cleanup(true))
            }
            other => other,
        }
    }

    async fn ensure_mock_server(&mut self) -> Result<()> {
        if self.mock_server.is_some() {
            return Ok(());
        }
        let port = self.ctx.ports.get_port()?;
        let server =
            MockS3Server::start(port, self.ctx.settings.mock_s3_command.as_deref()).await?;
        self.mock_server = Some(server);
        Ok(())
    }

    async fn stop_if_started(&mut self) -> Result<()> {
        if self.state == BuilderState::Started {
            self.stop(true).await?;
        }
        Ok(())
    }

    fn reset_for_reuse(&mut self) {
        self.cluster = None;
        self.storage_remote = None;
        self.wal_remote = None;
        self.state = BuilderState::Unconfigured;
    }

    /// Stop everything and clean up, running every phase even when earlier
    /// ones fail. The first error is returned at the end; callers triggered
    /// by a test failure pass `failed = true` to skip the strict checks that
    /// would only bury the original problem.
    pub async fn teardown(&mut self, failed: bool) -> Result<()> {
        if self.state == BuilderState::TornDown {
            return Ok(());
        }
        info!("Tearing down cluster for {}", self.test_name);
        let mut first_error: Option<Error> = None;
        let mut record = |phase: &str, result: Result<()>| {
            if let Err(e) = result {
                error!("Teardown phase `{phase}` failed: {e}");
                first_error.get_or_insert(e);
            }
        };

        if let Some(cluster) = &self.cluster {
            record("stop", cluster.stop_all(true, !failed).await);
        }

        if self.scrub_on_exit && !failed {
            match self.storage_remote.as_ref().and_then(RemoteStorage::as_s3) {
                Some(s3) => {
                    let scrubber = StorageScrubber::new(&self.ctx.settings.bin_dir, s3.clone());
                    record(
                        "scrub",
                        scrubber.scan_metadata(&self.runner).await.map(|_| ()),
                    );
                }
                None => record(
                    "scrub",
                    Err(Error::invalid_config(
                        "scrub requested without an object-store backend",
                    )),
                ),
            }
        }

        for remote in [&self.storage_remote, &self.wal_remote].into_iter().flatten() {
            record("remote cleanup", remote.cleanup().await);
        }

        if let Some(server) = &mut self.mock_server {
            server.stop().await;
        }

        if self.config.preserve_files {
            info!("Preserving local files under {}", self.root.display());
        } else {
            record("local cleanup", cleanup_local_storage(&self.root));
        }

        if let Some(overlay) = &self.overlay {
            let test_dir = self.ctx.test_output_dir(&self.test_name);
            record(
                "overlay unmount",
                overlay.unmount_all_beneath(&self.runner, &test_dir).await,
            );
        }

        self.state = BuilderState::TornDown;
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Prune bulky node data under `root`, keeping the config file and logs for
/// post-mortem reading and leaving live overlay mountpoints alone.
fn cleanup_local_storage(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    let mountpoints = overlay_mounts_beneath(root)?;
    prune_dir(root, &mountpoints)
}

fn prune_dir(dir: &Path, mountpoints: &[PathBuf]) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|source| StorageError::Path {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Path {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if mountpoints.contains(&path) {
            warn!("Skipping live overlay mountpoint {}", path.display());
            continue;
        }
        if path.is_dir() {
            prune_dir(&path, mountpoints)?;
            // non-empty means something below was kept
            let _ = std::fs::remove_dir(&path);
        } else {
            let keep = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name == CONFIG_FILE_NAME || name.ends_with(".log"));
            if !keep {
                std::fs::remove_file(&path).map_err(|source| StorageError::Path {
                    path: path.clone(),
                    source,
                })?;
            }
        }
    }
    Ok(())
}

/// Plain recursive directory copy. Snapshot payloads contain only regular
/// files and directories.
fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|source| StorageError::Path {
        path: dst.to_path_buf(),
        source,
    })?;
    let entries = std::fs::read_dir(src).map_err(|source| StorageError::Path {
        path: src.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Path {
            path: src.to_path_buf(),
            source,
        })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir_all(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|source| StorageError::Path {
                path: from.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod builder_test;
