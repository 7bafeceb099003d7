//! Per-test-worker execution context.
//!
//! Parallel test workers share one machine, so everything a worker hands out
//! (TCP ports, output directories) is carved from a worker-private slice of
//! the global resource space. The context is created once per worker process
//! and passed by reference into every builder; there is no ambient global
//! state.

use std::path::PathBuf;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

use config::Config;
use config::Environment;
use serde::Deserialize;

use crate::ConfigError;
use crate::ResourceError;
use crate::Result;

/// First port of the global allocation space shared by all workers.
pub const BASE_PORT: u16 = 15000;

/// One past the last usable port. Ephemeral ports start here.
pub const PORT_CEILING: u16 = 32768;

/// Worker-level settings, loaded once from `CLUSTERBED__*` environment
/// variables with hardcoded defaults for local single-worker runs.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    /// Total number of concurrently running test workers
    #[serde(default = "default_worker_count")]
    pub worker_count: u16,

    /// This worker's index, `0..worker_count`
    #[serde(default)]
    pub worker_index: u16,

    /// Directory holding the node binaries and the `storctl` control binary
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,

    /// External data distribution directory exported to child processes
    #[serde(default = "default_dist_dir")]
    pub dist_dir: PathBuf,

    /// Root under which per-test cluster directories and the shared snapshot
    /// cache are created
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Log-verbosity override propagated to every spawned child via RUST_LOG
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Clone snapshots with copy-on-write overlay mounts instead of copies
    #[serde(default)]
    pub overlay_snapshots: bool,

    /// Ephemeral CI environment: snapshot caching is skipped entirely
    #[serde(default)]
    pub ci: bool,

    /// Alternate storage-engine implementation variant to select on storage
    /// nodes, passed through as a config override
    #[serde(default)]
    pub storage_engine_variant: Option<String>,

    /// Launcher for the worker-local mock object store
    #[serde(default)]
    pub mock_s3_command: Option<String>,
}

fn default_worker_count() -> u16 {
    1
}
fn default_bin_dir() -> PathBuf {
    PathBuf::from("./target/debug")
}
fn default_dist_dir() -> PathBuf {
    PathBuf::from("./dist")
}
fn default_output_root() -> PathBuf {
    PathBuf::from("./test_output")
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            worker_index: 0,
            bin_dir: default_bin_dir(),
            dist_dir: default_dist_dir(),
            output_root: default_output_root(),
            log_filter: None,
            overlay_snapshots: false,
            ci: false,
            storage_engine_variant: None,
            mock_s3_command: None,
        }
    }
}

impl WorkerSettings {
    /// Load settings from the environment (highest priority) over defaults.
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix("CLUSTERBED")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()
            .map_err(ConfigError::Load)?
            .try_deserialize::<WorkerSettings>()
            .map_err(ConfigError::Load)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count cannot be 0".into()).into());
        }
        if self.worker_index >= self.worker_count {
            return Err(ConfigError::Invalid(format!(
                "worker_index {} out of range for {} workers",
                self.worker_index, self.worker_count
            ))
            .into());
        }
        Ok(())
    }
}

/// An immutable slice of the port space owned by exactly one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub base: u16,
    pub count: u16,
}

impl PortRange {
    /// Divide `[BASE_PORT, PORT_CEILING)` into equal disjoint slices, one per
    /// worker. Workers never share a port by construction.
    pub fn for_worker(worker_index: u16, worker_count: u16) -> Self {
        let per_worker = (PORT_CEILING - BASE_PORT) / worker_count;
        Self {
            base: BASE_PORT + worker_index * per_worker,
            count: per_worker,
        }
    }
}

/// Hands out unique TCP ports from the worker's range.
///
/// Ports are handed out monotonically and never recycled; a test process
/// leaks its ports for its lifetime, which sidesteps reuse races entirely.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    next: AtomicU16,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            next: AtomicU16::new(range.base),
        }
    }

    pub fn get_port(&self) -> Result<u16> {
        // Check-then-claim so the counter never moves past the range end:
        // once exhausted, every later call fails instead of wrapping the
        // counter back into the range.
        let end = self.range.base + self.range.count;
        let mut port = self.next.load(Ordering::SeqCst);
        loop {
            if port >= end {
                return Err(ResourceError::PortRangeExhausted {
                    base: self.range.base,
                    count: self.range.count,
                }
                .into());
            }
            match self
                .next
                .compare_exchange(port, port + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(port),
                Err(current) => port = current,
            }
        }
    }

    /// Allocate two numerically adjacent ports.
    ///
    /// The coordination service wants its API port and its database port next
    /// to each other. With a monotonic allocator any two consecutive grants
    /// are adjacent, so this cannot loop more than once in practice; the loop
    /// guards against a concurrent `get_port` interleaving between the two
    /// grants.
    pub fn get_adjacent_pair(&self) -> Result<(u16, u16)> {
        loop {
            let first = self.get_port()?;
            let second = self.get_port()?;
            if second == first + 1 {
                return Ok((first, second));
            }
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }
}

/// Everything a builder needs from its worker: settings, the port allocator
/// and the shared directory roots.
#[derive(Debug)]
pub struct WorkerContext {
    pub settings: WorkerSettings,
    pub ports: PortAllocator,
    /// Unique per test-session; prefixes real object-store keys
    pub run_id: String,
}

impl WorkerContext {
    pub fn new(settings: WorkerSettings) -> Self {
        let range = PortRange::for_worker(settings.worker_index, settings.worker_count);
        Self {
            settings,
            ports: PortAllocator::new(range),
            run_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Load settings from the environment and build the context.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(WorkerSettings::load()?))
    }

    /// The shared cache directory for snapshots, common to all workers.
    pub fn snapshot_cache_dir(&self) -> PathBuf {
        self.settings.output_root.join("shared-snapshots")
    }

    /// Per-test working directory.
    pub fn test_output_dir(&self, test_name: &str) -> PathBuf {
        self.settings.output_root.join(test_name.replace('/', "-"))
    }

    /// Per-test overlayfs state directory (upper/work dirs live here).
    pub fn test_overlay_dir(&self, test_name: &str) -> PathBuf {
        self.settings
            .output_root
            .join(format!("overlay-{}", test_name.replace('/', "-")))
    }
}
