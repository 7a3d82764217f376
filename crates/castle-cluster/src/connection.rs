//! Cluster Connection capability

use crate::command::MonCommand;
use crate::conf::{self, GlobalConfig};
use crate::info::ClusterInfo;
use crate::{keyring, paths};
use async_trait::async_trait;
use castle_common::{Error, Result};
use castle_common::config::StoreType;
use castle_supervisor::{ExecError, Executor};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Exit status the ceph CLI reports for ENOENT
const ENOENT: i32 = 2;

/// Commands whose output is binary and is written to a file by the CLI
const BINARY_OUTPUT: &[&str] = &["mon getmap"];

/// An authenticated session with the cluster monitors
#[async_trait]
pub trait ClusterConnection: Send + Sync {
    /// Run a monitor command and return its output buffer
    async fn mon_command(&self, cmd: &MonCommand) -> Result<Vec<u8>>;

    /// Run a monitor command with an input buffer (keyrings for `auth add`)
    async fn mon_command_with_input_buffer(&self, cmd: &MonCommand, input: &[u8])
    -> Result<Vec<u8>>;

    async fn shutdown(&self);
}

/// Opens connections to a cluster as a given user
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, info: &ClusterInfo, user: &str) -> Result<Box<dyn ClusterConnection>>;
}

/// Open an admin connection
pub async fn connect_as_admin(
    factory: &dyn ConnectionFactory,
    info: &ClusterInfo,
) -> Result<Box<dyn ClusterConnection>> {
    factory.connect(info, crate::ADMIN_USER).await
}

/// Connection factory that drives the `ceph` command line tool.
///
/// Each connect renders a config file for the user from the current
/// [`ClusterInfo`], so monitor changes are picked up on the next connect.
pub struct CephCliFactory {
    config_dir: PathBuf,
    executor: Arc<dyn Executor>,
}

impl CephCliFactory {
    pub fn new(config_dir: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            config_dir: config_dir.into(),
            executor,
        }
    }
}

#[async_trait]
impl ConnectionFactory for CephCliFactory {
    async fn connect(&self, info: &ClusterInfo, user: &str) -> Result<Box<dyn ClusterConnection>> {
        if info.monitors.is_empty() {
            return Err(Error::unavailable(format!("cluster {} has no monitors", info.name)));
        }
        let root = paths::connection_root(&self.config_dir, &info.name, user);
        let keyring = paths::user_keyring(&self.config_dir, &info.name, user);
        if conf::qualified_user(user) == conf::qualified_user(crate::ADMIN_USER) {
            keyring::write_keyring(&keyring, &keyring::admin_keyring(&info.admin_secret))?;
        }
        let global = GlobalConfig::new(info, &root, StoreType::default());
        let conf = conf::generate_config_file(info, &root, &global, user, &keyring, &BTreeMap::new())?;
        Ok(Box::new(CephCliConnection {
            cluster: info.name.clone(),
            name: conf::qualified_user(user),
            conf,
            keyring,
            executor: Arc::clone(&self.executor),
        }))
    }
}

struct CephCliConnection {
    cluster: String,
    name: String,
    conf: PathBuf,
    keyring: PathBuf,
    executor: Arc<dyn Executor>,
}

impl CephCliConnection {
    fn base_args(&self) -> Vec<String> {
        vec![
            format!("--cluster={}", self.cluster),
            format!("--conf={}", self.conf.display()),
            format!("--name={}", self.name),
            format!("--keyring={}", self.keyring.display()),
            "--format".to_string(),
            "json".to_string(),
        ]
    }

    async fn run(&self, cmd: &MonCommand, extra: Vec<String>) -> Result<Vec<u8>> {
        let mut args = self.base_args();
        args.extend(extra);
        args.extend(cmd.cli_args());
        debug!("Running mon command '{}' as {}", cmd, self.name);
        match self
            .executor
            .execute_with_output(cmd.prefix(), "ceph", &args)
            .await
        {
            Ok(out) => Ok(out.into_bytes()),
            Err(e @ ExecError::Failed { code: Some(ENOENT), .. }) => {
                Err(Error::not_found(format!("{cmd}: {e}")))
            }
            Err(e) => Err(Error::from(e).context(format!("mon command '{cmd}'"))),
        }
    }
}

#[async_trait]
impl ClusterConnection for CephCliConnection {
    async fn mon_command(&self, cmd: &MonCommand) -> Result<Vec<u8>> {
        if !BINARY_OUTPUT.contains(&cmd.prefix()) {
            return self.run(cmd, Vec::new()).await;
        }
        let file = tempfile::NamedTempFile::new()?;
        let extra = vec!["-o".to_string(), file.path().display().to_string()];
        self.run(cmd, extra).await?;
        Ok(std::fs::read(file.path())?)
    }

    async fn mon_command_with_input_buffer(
        &self,
        cmd: &MonCommand,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(input)?;
        file.flush()?;
        let extra = vec!["-i".to_string(), file.path().display().to_string()];
        self.run(cmd, extra).await
    }

    async fn shutdown(&self) {}
}
