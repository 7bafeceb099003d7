//! Post-run consistency checking of remote storage metadata.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::process::CommandRunner;
use crate::process::RunSpec;
use crate::remote_storage::S3Storage;
use crate::Error;
use crate::Result;

const SCRUBBER_BINARY: &str = "storage-scrubber";
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wrapper for the external `storage-scrubber` tool, which walks an object
/// store bucket and validates the storage-node metadata found there.
///
/// Only meaningful against an object-store backend; local-filesystem runs
/// have nothing for it to scan.
#[derive(Debug)]
pub struct StorageScrubber {
    binary: PathBuf,
    storage: S3Storage,
}

impl StorageScrubber {
    pub fn new(bin_dir: &Path, storage: S3Storage) -> Self {
        Self {
            binary: bin_dir.join(SCRUBBER_BINARY),
            storage,
        }
    }

    /// Scan bucket metadata and return the tool's JSON report.
    ///
    /// Non-zero exit or unparseable output both mean the remote state is
    /// suspect and surface as [`Error::Consistency`].
    pub async fn scan_metadata(&self, runner: &CommandRunner) -> Result<serde_json::Value> {
        info!(
            "Scrubbing remote storage: {}/{}",
            self.storage.bucket_name,
            self.storage.prefix_in_bucket.as_deref().unwrap_or("")
        );
        let mut spec = RunSpec::new(&self.binary)
            .arg("scan-metadata")
            .env("REGION", &self.storage.bucket_region)
            .env("BUCKET", &self.storage.bucket_name)
            .timeout(SCAN_TIMEOUT)
            .no_strict();
        if let Some(prefix) = &self.storage.prefix_in_bucket {
            spec = spec.env("BUCKET_PREFIX", prefix);
        }
        if let Some(endpoint) = &self.storage.endpoint {
            spec = spec.env("AWS_ENDPOINT_URL", endpoint);
        }
        for (key, value) in self.storage.access_env_vars() {
            spec = spec.env(key, value);
        }

        let output = runner.run(spec).await?;
        if !output.success() {
            return Err(Error::Consistency(format!(
                "metadata scan exited with {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }
        serde_json::from_str(&output.stdout).map_err(|e| {
            Error::Consistency(format!("metadata scan produced unparseable output: {e}"))
        })
    }
}
