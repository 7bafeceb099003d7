//! Declarative cluster configuration.
//!
//! A [`ClusterConfig`] is assembled by the builder, validated once, and
//! frozen when the cluster is constructed. Node descriptors are derived from
//! it at init time and are immutable afterwards.

mod cluster;
mod node;

pub use cluster::*;
pub use node::*;
