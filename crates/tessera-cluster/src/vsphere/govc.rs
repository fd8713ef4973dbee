//! vCenter inventory lookups
//!
//! [`GovcInventory`] shells out to `govc`, passing the connection on the
//! child's environment only.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use tessera_common::Error;

use super::credentials::VSphereConnection;

/// Timeout for a single govc invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Read-only queries against a vCenter inventory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VSphereInventory: Send + Sync {
    /// Whether an inventory path (datastore, folder, pool, template) exists
    async fn path_exists(&self, conn: &VSphereConnection, path: &str) -> Result<bool, Error>;

    /// SHA-1 thumbprint of the vCenter server certificate
    async fn server_thumbprint(&self, conn: &VSphereConnection) -> Result<String, Error>;
}

/// [`VSphereInventory`] backed by the `govc` CLI
#[derive(Clone, Debug)]
pub struct GovcInventory {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for GovcInventory {
    fn default() -> Self {
        Self::new("govc")
    }
}

impl GovcInventory {
    /// Use the given govc binary
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Child process for one govc call; the connection goes on its env only
    fn command(&self, conn: &VSphereConnection, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).envs(conn.govc_env()).kill_on_drop(true);
        cmd
    }

    async fn run(&self, conn: &VSphereConnection, args: &[&str]) -> Result<String, Error> {
        let description = format!("govc {}", args.join(" "));
        let mut cmd = self.command(conn, args);

        debug!(command = %description, "running govc");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(command = %description, timeout = ?self.timeout, "govc timed out");
                Error::command(&description, format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| Error::command(&description, format!("failed to execute: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command = %description, %stderr, "govc failed");
            Err(Error::command(description, stderr))
        }
    }
}

#[async_trait]
impl VSphereInventory for GovcInventory {
    async fn path_exists(&self, conn: &VSphereConnection, path: &str) -> Result<bool, Error> {
        let stdout = self.run(conn, &["ls", path]).await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn server_thumbprint(&self, conn: &VSphereConnection) -> Result<String, Error> {
        let stdout = self.run(conn, &["about.cert", "-k", "-thumbprint"]).await?;
        parse_thumbprint(&stdout).ok_or_else(|| {
            Error::command(
                "govc about.cert -k -thumbprint",
                format!("unexpected output: {}", stdout.trim()),
            )
        })
    }
}

/// `govc about.cert -thumbprint` prints `host THUMBPRINT`
fn parse_thumbprint(output: &str) -> Option<String> {
    output
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
}
