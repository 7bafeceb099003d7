//! Error hierarchy for the cluster test harness.
//!
//! Errors are categorized by the subsystem they originate from: builder
//! configuration, external command invocation, node HTTP APIs, shared
//! resources (ports), and storage cleanup. CLI and HTTP failures are not
//! retried at this layer; retry loops live with the callers that want them.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad or missing builder parameters, caught at configure time
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// External CLI invocation failures
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Node REST API failures
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Shared resource exhaustion
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Node/tenant lookup failures
    #[error("Not found: {0}")]
    NotFound(String),

    /// Post-teardown scrub found invalid remote state
    #[error("Consistency check failed: {0}")]
    Consistency(String),

    /// Local filesystem and remote object storage failures
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Violations of the declarative cluster spec
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A builder method was called in the wrong lifecycle state
    #[error("Invalid builder state: {0}")]
    State(String),

    /// Settings-layer loading failures (env overlays, files)
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    /// Missing object-store credentials
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Non-zero exit with captured output for diagnostics
    #[error("Command `{command}` failed with {status}:\n  stdout:\n{stdout}\n  stderr:\n{stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// The invocation exceeded its time budget; distinguishes "process hung"
    /// from "process refused"
    #[error("Command `{command}` timed out after {timeout:?}:\n  stdout:\n{stdout}\n  stderr:\n{stderr}")]
    TimedOut {
        command: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Non-2xx response from a node's REST API
    #[error("HTTP status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// Connection-level failures
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The poll budget for a node condition ran out
    #[error("Condition `{condition}` not met after {attempts} attempts")]
    RetriesExhausted { condition: String, attempts: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// The worker's port range ran dry; a fatal misconfiguration since
    /// ranges are sized for the worst-case cluster.
    #[error("Port range exhausted: base {base}, {count} ports")]
    PortRangeExhausted { base: u16, count: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Error occurred at path {}: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bulk-delete or bucket provisioning failures against an object store.
    /// Deletion failures propagate as fatal teardown errors.
    #[error("Object storage error: {0}")]
    ObjectStore(String),

    /// Snapshot cache failures (staging, marker, clone)
    #[error("Snapshot operation failed: {0}")]
    Snapshot(String),

    /// Overlay mount bookkeeping failures
    #[error("Overlay mount error: {0}")]
    Overlay(String),
}

impl Error {
    /// Fatal misconfigurations found while assembling a builder.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::Config(ConfigError::Invalid(msg.into()))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}
