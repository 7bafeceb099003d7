use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;
use crate::Result;

/// How node APIs authenticate callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication; the default for tests
    #[default]
    Trust,
    /// Token-based authentication on every node API
    Token,
}

impl AuthMode {
    /// The value written into node config files.
    pub fn as_config_str(&self) -> &'static str {
        match self {
            AuthMode::Trust => "trust",
            AuthMode::Token => "token",
        }
    }
}

/// Hex identifier of a tenant, generated per test unless pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

/// Hex identifier of a timeline within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimelineId(pub String);

impl TenantId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl TimelineId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The full declarative cluster spec accumulated by the builder.
///
/// Owned exclusively by the builder until handed to the cluster; frozen
/// after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_num_storage_nodes")]
    pub num_storage_nodes: u32,

    #[serde(default = "default_num_wal_nodes")]
    pub num_wal_nodes: u32,

    /// First WAL node id. Non-standard start values shake out id-parsing
    /// bugs in the orchestrated binaries.
    #[serde(default)]
    pub wal_ids_start: u64,

    /// fsync on WAL nodes is off by default to keep tests fast
    #[serde(default)]
    pub wal_fsync: bool,

    #[serde(default)]
    pub auth: AuthMode,

    /// Raw `key=value` overrides appended to every storage node start
    #[serde(default)]
    pub storage_config_override: Option<String>,

    #[serde(default = "default_branch_name")]
    pub default_branch_name: String,

    pub initial_tenant: TenantId,
    pub initial_timeline: TimelineId,

    /// Keep node data files on teardown instead of pruning them
    #[serde(default)]
    pub preserve_files: bool,
}

fn default_num_storage_nodes() -> u32 {
    1
}
fn default_num_wal_nodes() -> u32 {
    1
}
fn default_branch_name() -> String {
    "main".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_storage_nodes: default_num_storage_nodes(),
            num_wal_nodes: default_num_wal_nodes(),
            wal_ids_start: 0,
            wal_fsync: false,
            auth: AuthMode::default(),
            storage_config_override: None,
            default_branch_name: default_branch_name(),
            initial_tenant: TenantId::generate(),
            initial_timeline: TimelineId::generate(),
            preserve_files: false,
        }
    }
}

impl ClusterConfig {
    /// Validates the declarative spec before any resource is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.num_storage_nodes == 0 {
            return Err(
                ConfigError::Invalid("cluster needs at least one storage node".into()).into(),
            );
        }
        if self.num_wal_nodes == 0 {
            return Err(ConfigError::Invalid("cluster needs at least one WAL node".into()).into());
        }
        if self.default_branch_name.is_empty() {
            return Err(ConfigError::Invalid("default_branch_name cannot be empty".into()).into());
        }
        Ok(())
    }

    /// Compact fingerprint of the parameters that must match for a cached
    /// snapshot of this cluster to be reusable.
    pub fn compatibility_tag(&self, storage_kind: &str) -> String {
        format!(
            "storage={} wal={} auth={} remote={}",
            self.num_storage_nodes,
            self.num_wal_nodes,
            self.auth.as_config_str(),
            storage_kind,
        )
    }
}

#[cfg(test)]
mod cluster_config_test {
    use super::*;

    #[test]
    fn default_config_is_single_node_trust() {
        let config = ClusterConfig::default();

        assert_eq!(config.num_storage_nodes, 1);
        assert_eq!(config.num_wal_nodes, 1);
        assert_eq!(config.auth, AuthMode::Trust);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_storage_nodes_is_rejected() {
        let config = ClusterConfig {
            num_storage_nodes: 0,
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn compatibility_tag_tracks_topology_and_storage_kind() {
        let config = ClusterConfig::default();

        let local = config.compatibility_tag("local_fs");
        let mock = config.compatibility_tag("mock_s3");
        assert_ne!(local, mock);

        let bigger = ClusterConfig {
            num_storage_nodes: 2,
            ..ClusterConfig::default()
        };
        assert_ne!(local, bigger.compatibility_tag("local_fs"));
    }
}
