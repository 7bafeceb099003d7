use std::path::Path;
use std::path::PathBuf;

use crate::config::TenantId;
use crate::config::TimelineId;
use crate::errors::StorageError;
use crate::remote_storage::RemoteStorageUser;
use crate::Result;

/// Local-directory backend. Nodes mirror their artifacts into a plain
/// directory tree under the cluster root, which makes test assertions on
/// uploaded layers a matter of listing files.
#[derive(Debug, Clone)]
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Canonical mirror directory for a node role under the cluster root.
    pub fn component_path(cluster_root: &Path, user: RemoteStorageUser) -> PathBuf {
        cluster_root.join(format!("local_fs_remote_storage/{user}"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tenant_path(&self, tenant: &TenantId) -> PathBuf {
        self.root.join("tenants").join(tenant.to_string())
    }

    pub fn timeline_path(&self, tenant: &TenantId, timeline: &TimelineId) -> PathBuf {
        self.tenant_path(tenant)
            .join("timelines")
            .join(timeline.to_string())
    }

    /// List layer file names uploaded for a timeline, sorted for stable
    /// assertions. Missing timeline directory reads as empty.
    pub fn list_layers(&self, tenant: &TenantId, timeline: &TimelineId) -> Result<Vec<String>> {
        let dir = self.timeline_path(tenant, timeline);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|source| StorageError::Path {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Path {
                path: dir.clone(),
                source,
            })?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn to_toml_inline_table(&self) -> String {
        format!("{{ local_path = \"{}\" }}", self.root.display())
    }
}
