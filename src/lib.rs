//! Test-environment orchestration for a distributed storage cluster.
//!
//! Each test gets an isolated cluster: a coordinator, a broker, and a
//! configurable number of storage and WAL nodes, rooted in a per-test
//! directory with worker-disjoint TCP ports. Expensive initialized clusters
//! can be cached as snapshots and cloned into later tests, by physical copy
//! or copy-on-write overlay mount.
//!
//! The usual shape of a test:
//!
//! ```no_run
//! # async fn demo() -> clusterbed::Result<()> {
//! use clusterbed::ClusterBuilder;
//! use clusterbed::WorkerContext;
//!
//! let ctx = WorkerContext::from_env()?;
//! let mut builder = ClusterBuilder::new(&ctx, "my_test");
//! let cluster = builder.init_start().await?;
//! cluster.the_storage_node()?.http_client().status().await?;
//! builder.teardown(false).await?;
//! # Ok(())
//! # }
//! ```

mod cluster;
mod config;
mod errors;
mod process;
mod remote_storage;
mod retry;
mod scrub;
mod snapshot;
mod worker;

pub use cluster::*;
pub use config::*;
pub use errors::*;
pub use process::*;
pub use remote_storage::*;
pub use retry::*;
pub use scrub::*;
pub use snapshot::*;
pub use worker::*;
