//! Remote storage backends for the orchestrated nodes.
//!
//! One abstraction over three places a node can mirror its data to: a local
//! directory, a mock object store running on this machine, or a real
//! object-store bucket. Each variant knows how to serialize itself into the
//! inline-table form node config files expect and how to clean up after a
//! test.

mod local_fs;
mod mock_server;
mod s3;

pub use local_fs::*;
pub use mock_server::*;
pub use s3::*;

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Which node role a storage config belongs to. Storage and WAL nodes get
/// separate mirror directories / key prefixes so their artifacts never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStorageUser {
    Storage,
    Wal,
}

impl RemoteStorageUser {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStorageUser::Storage => "storage",
            RemoteStorageUser::Wal => "wal",
        }
    }
}

impl fmt::Display for RemoteStorageUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The selectable backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStorageKind {
    LocalFs,
    MockS3,
    RealS3,
}

impl RemoteStorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStorageKind::LocalFs => "local_fs",
            RemoteStorageKind::MockS3 => "mock_s3",
            RemoteStorageKind::RealS3 => "real_s3",
        }
    }

    /// Build a concrete backend for `user` in this cluster.
    ///
    /// MockS3 provisions its bucket immediately; RealS3 validates
    /// credentials and prefixes every key with the run-unique path.
    pub async fn configure(
        &self,
        cluster_root: &Path,
        mock_server: Option<&MockS3Server>,
        run_id: &str,
        test_ident: &str,
        user: RemoteStorageUser,
        bucket_overrides: Option<BucketOverrides>,
    ) -> Result<RemoteStorage> {
        match self {
            RemoteStorageKind::LocalFs => Ok(RemoteStorage::LocalFs(LocalFsStorage::new(
                LocalFsStorage::component_path(cluster_root, user),
            ))),
            RemoteStorageKind::MockS3 => {
                let server = mock_server.ok_or_else(|| {
                    crate::Error::invalid_config("mock_s3 storage requires a running mock server")
                })?;
                let storage = S3Storage::mock(server, user, test_ident).await?;
                Ok(RemoteStorage::S3(storage))
            }
            RemoteStorageKind::RealS3 => {
                let storage = S3Storage::real(run_id, test_ident, user, bucket_overrides).await?;
                Ok(RemoteStorage::S3(storage))
            }
        }
    }
}

impl fmt::Display for RemoteStorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket name/region overrides for the real object store; fall back to the
/// `REMOTE_STORAGE_S3_BUCKET` / `REMOTE_STORAGE_S3_REGION` environment.
#[derive(Debug, Clone, Default)]
pub struct BucketOverrides {
    pub bucket_name: Option<String>,
    pub bucket_region: Option<String>,
}

/// A configured backend, one of the [`RemoteStorageKind`] variants.
#[derive(Debug, Clone)]
pub enum RemoteStorage {
    LocalFs(LocalFsStorage),
    S3(S3Storage),
}

impl RemoteStorage {
    pub fn kind(&self) -> RemoteStorageKind {
        match self {
            RemoteStorage::LocalFs(_) => RemoteStorageKind::LocalFs,
            RemoteStorage::S3(s3) if s3.real => RemoteStorageKind::RealS3,
            RemoteStorage::S3(_) => RemoteStorageKind::MockS3,
        }
    }

    /// Serialized inline-table form consumed by node config files.
    pub fn to_toml_inline_table(&self) -> String {
        match self {
            RemoteStorage::LocalFs(local) => local.to_toml_inline_table(),
            RemoteStorage::S3(s3) => s3.to_toml_inline_table(),
        }
    }

    /// Delete test artifacts from the backend.
    ///
    /// LocalFs is a no-op (directory-tree cleanup owns it); mock buckets are
    /// kept for post-test inspection unless explicitly marked; real buckets
    /// are always swept under the run prefix.
    pub async fn cleanup(&self) -> Result<()> {
        match self {
            RemoteStorage::LocalFs(_) => Ok(()),
            RemoteStorage::S3(s3) => s3.do_cleanup().await,
        }
    }

    pub fn as_s3(&self) -> Option<&S3Storage> {
        match self {
            RemoteStorage::S3(s3) => Some(s3),
            RemoteStorage::LocalFs(_) => None,
        }
    }
}
