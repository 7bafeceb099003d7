//! Cluster lifecycle: building, running and tearing down the node set.

mod builder;
#[allow(clippy::module_inception)]
mod cluster;
mod cli;
mod http;
mod nodes;

pub use builder::*;
pub use cli::*;
pub use cluster::*;
pub use http::*;
pub use nodes::*;
