use std::time::Duration;

use tracing::info;

use crate::process::SpawnedProcess;
use crate::Error;
use crate::Result;

const DEFAULT_COMMAND: &str = "mock-s3-server";

/// A worker-local mock object-store server.
///
/// One per worker, shared by every test the worker runs; buckets give the
/// per-test isolation. Killed on drop through the owned child handle.
#[derive(Debug)]
pub struct MockS3Server {
    port: u16,
    process: SpawnedProcess,
}

impl MockS3Server {
    /// Spawn the server on `port` and verify it did not exit immediately.
    ///
    /// `command` overrides the launcher (extra words become leading
    /// arguments); the port is always appended as `-p<port>`.
    pub async fn start(port: u16, command: Option<&str>) -> Result<Self> {
        let command = command.unwrap_or(DEFAULT_COMMAND);
        let mut words = command.split_whitespace();
        let binary = words
            .next()
            .ok_or_else(|| Error::invalid_config("mock server command is empty"))?;
        let mut args: Vec<String> = words.map(str::to_owned).collect();
        args.push(format!("-p{port}"));

        info!("Starting mock object store: {command} on port {port}");
        let mut process = SpawnedProcess::spawn(binary, &args)?;

        // An unusable port or missing binary shows up as an instant exit.
        tokio::time::sleep(Duration::from_millis(300)).await;
        if let Some(status) = process.try_exit_status() {
            return Err(Error::invalid_config(format!(
                "mock object store exited immediately with {status}"
            )));
        }
        Ok(Self { port, process })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn region(&self) -> &'static str {
        "us-east-1"
    }

    pub fn access_key(&self) -> &'static str {
        "test"
    }

    pub fn secret_key(&self) -> &'static str {
        "test"
    }

    pub async fn stop(&mut self) {
        self.process.kill().await;
    }
}
