//! Typed wrapper over the external `storctl` control binary.
//!
//! Every cluster mutation goes through `storctl` subcommands. The wrapper
//! builds argument lists and delegates execution, environment merging and
//! error conversion to [`CommandRunner`].

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use crate::config::NodeId;
use crate::config::TenantId;
use crate::config::TimelineId;
use crate::process::CommandOutput;
use crate::process::CommandRunner;
use crate::process::RunSpec;
use crate::Result;

const CONTROL_BINARY: &str = "storctl";

#[derive(Debug, Clone)]
pub struct ClusterCtl {
    binary: PathBuf,
    runner: CommandRunner,
}

impl ClusterCtl {
    pub fn new(bin_dir: &Path, runner: CommandRunner) -> Self {
        Self {
            binary: bin_dir.join(CONTROL_BINARY),
            runner,
        }
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    async fn run<I, S>(&self, args: I, extra_env: HashMap<String, String>) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = RunSpec::new(&self.binary).args(args);
        spec.extra_env = extra_env;
        self.runner.run(spec).await
    }

    /// `storctl init --config <file>`. The config file is the TOML document
    /// written by the builder during `init()`.
    pub async fn init(&self, config_path: &Path) -> Result<CommandOutput> {
        self.run(
            ["init", "--config", &config_path.display().to_string()],
            HashMap::new(),
        )
        .await
    }

    pub async fn coordinator_start(
        &self,
        extra_env: HashMap<String, String>,
    ) -> Result<CommandOutput> {
        self.run(["coordinator", "start"], extra_env).await
    }

    pub async fn coordinator_stop(&self, immediate: bool) -> Result<CommandOutput> {
        self.run(stop_args(&["coordinator"], immediate), HashMap::new())
            .await
    }

    pub async fn broker_start(&self) -> Result<CommandOutput> {
        self.run(["broker", "start"], HashMap::new()).await
    }

    pub async fn broker_stop(&self, immediate: bool) -> Result<CommandOutput> {
        self.run(stop_args(&["broker"], immediate), HashMap::new())
            .await
    }

    /// Start one storage node. `overrides` are `key=value` pairs passed as
    /// repeated `--config-override` flags; remote-storage wiring arrives
    /// this way.
    pub async fn storage_start(
        &self,
        id: NodeId,
        overrides: &[String],
        extra_env: HashMap<String, String>,
    ) -> Result<CommandOutput> {
        let mut args = vec![
            "storage".to_owned(),
            "start".to_owned(),
            "--id".to_owned(),
            id.to_string(),
        ];
        for over in overrides {
            args.push("--config-override".to_owned());
            args.push(over.clone());
        }
        self.run(args, extra_env).await
    }

    pub async fn storage_stop(&self, id: NodeId, immediate: bool) -> Result<CommandOutput> {
        let mut args: Vec<String> = stop_args(&["storage"], immediate);
        args.push("--id".to_owned());
        args.push(id.to_string());
        self.run(args, HashMap::new()).await
    }

    pub async fn wal_start(
        &self,
        id: NodeId,
        extra_env: HashMap<String, String>,
    ) -> Result<CommandOutput> {
        self.run(
            ["wal".to_owned(), "start".to_owned(), "--id".to_owned(), id.to_string()],
            extra_env,
        )
        .await
    }

    pub async fn wal_stop(&self, id: NodeId, immediate: bool) -> Result<CommandOutput> {
        let mut args: Vec<String> = stop_args(&["wal"], immediate);
        args.push("--id".to_owned());
        args.push(id.to_string());
        self.run(args, HashMap::new()).await
    }

    pub async fn tenant_create(
        &self,
        tenant: &TenantId,
        timeline: &TimelineId,
    ) -> Result<CommandOutput> {
        self.run(
            [
                "tenant",
                "create",
                "--tenant-id",
                &tenant.to_string(),
                "--timeline-id",
                &timeline.to_string(),
            ],
            HashMap::new(),
        )
        .await
    }

    /// Create a fresh root timeline with the given id on an existing tenant.
    pub async fn timeline_create(
        &self,
        tenant: &TenantId,
        timeline: &TimelineId,
    ) -> Result<CommandOutput> {
        self.run(
            [
                "timeline",
                "create",
                "--tenant-id",
                &tenant.to_string(),
                "--timeline-id",
                &timeline.to_string(),
            ],
            HashMap::new(),
        )
        .await
    }

    /// Branch a new timeline off `ancestor` (or off the tenant's default
    /// branch when no ancestor is given).
    pub async fn timeline_branch(
        &self,
        tenant: &TenantId,
        branch_name: &str,
        ancestor: Option<&str>,
    ) -> Result<CommandOutput> {
        let mut args = vec![
            "timeline".to_owned(),
            "branch".to_owned(),
            "--tenant-id".to_owned(),
            tenant.to_string(),
            "--branch-name".to_owned(),
            branch_name.to_owned(),
        ];
        if let Some(ancestor) = ancestor {
            args.push("--ancestor-branch-name".to_owned());
            args.push(ancestor.to_owned());
        }
        self.run(args, HashMap::new()).await
    }

    pub async fn compute_create(
        &self,
        name: &str,
        tenant: &TenantId,
        branch_name: &str,
        data_port: u16,
        http_port: u16,
    ) -> Result<CommandOutput> {
        self.run(
            [
                "compute",
                "create",
                name,
                "--tenant-id",
                &tenant.to_string(),
                "--branch-name",
                branch_name,
                "--port",
                &data_port.to_string(),
                "--http-port",
                &http_port.to_string(),
            ],
            HashMap::new(),
        )
        .await
    }

    pub async fn compute_start(&self, name: &str) -> Result<CommandOutput> {
        self.run(["compute", "start", name], HashMap::new()).await
    }

    pub async fn compute_stop(&self, name: &str, immediate: bool) -> Result<CommandOutput> {
        let mut args: Vec<String> = stop_args(&["compute"], immediate);
        args.push(name.to_owned());
        self.run(args, HashMap::new()).await
    }

    /// Re-point a running compute at the current storage assignment.
    pub async fn compute_reconfigure(&self, name: &str) -> Result<CommandOutput> {
        self.run(["compute", "reconfigure", name], HashMap::new())
            .await
    }

    /// Move a tenant's attachment to another storage node.
    pub async fn tenant_migrate(&self, tenant: &TenantId, to: NodeId) -> Result<CommandOutput> {
        self.run(
            [
                "tenant",
                "migrate",
                "--tenant-id",
                &tenant.to_string(),
                "--storage-id",
                &to.to_string(),
            ],
            HashMap::new(),
        )
        .await
    }
}

fn stop_args(role: &[&str], immediate: bool) -> Vec<String> {
    let mut args: Vec<String> = role.iter().map(|s| (*s).to_owned()).collect();
    args.push("stop".to_owned());
    if immediate {
        args.push("-m".to_owned());
        args.push("immediate".to_owned());
    }
    args
}

#[cfg(test)]
mod cli_test {
    use super::*;

    #[test]
    fn immediate_stop_adds_the_mode_flag() {
        assert_eq!(stop_args(&["storage"], true), vec!["storage", "stop", "-m", "immediate"]);
        assert_eq!(stop_args(&["broker"], false), vec!["broker", "stop"]);
    }
}
