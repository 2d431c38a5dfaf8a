//! External configuration helper
//!
//! The helper is a local executable that decides, per node, what
//! configuration and credentials it receives. The host's state is written
//! to its stdin as JSON and a single [`HelperResponse`] is read back from
//! stdout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::tokens::ServerClaimOverrides;
use crate::types::{ProvisionerError, Result};

/// Decision returned by the helper
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelperResponse {
    /// Skip this node for now, it will be rediscovered
    #[serde(default)]
    pub defer: bool,
    /// Shut the node down instead of provisioning it
    #[serde(default)]
    pub shutdown: bool,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub ca: String,
    #[serde(default)]
    pub ssldir: String,
    #[serde(default)]
    pub server_claims: Option<ServerClaimOverrides>,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
    #[serde(default)]
    pub action_policies: HashMap<String, String>,
    #[serde(default)]
    pub opa_policies: HashMap<String, String>,
    /// Version the node should be upgraded to before provisioning
    #[serde(default)]
    pub upgrade: String,
}

/// Source of per-node configuration decisions
#[async_trait]
pub trait ConfigHelper: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Resolve configuration for a node given its JSON encoded state
    async fn resolve(&self, input: &str, cancel: &CancellationToken) -> Result<HelperResponse>;
}

/// Runs the helper as a subprocess with a timeout
#[derive(Debug, Clone)]
pub struct ExecHelper {
    path: PathBuf,
    name: String,
    timeout: Duration,
}

impl ExecHelper {
    pub fn new(path: impl AsRef<Path>, timeout: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            timeout,
        }
    }
}

#[async_trait]
impl ConfigHelper for ExecHelper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, input: &str, cancel: &CancellationToken) -> Result<HelperResponse> {
        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionerError::Helper(format!("cannot start {}: {}", self.name, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = input.as_bytes().to_vec();
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!("Could not write input to {}: {}", name, e);
                }
            });
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProvisionerError::Cancelled(format!("helper {}", self.name)));
            }
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(ProvisionerError::Helper(format!(
                        "cannot read {} output: {}",
                        self.name, e
                    )));
                }
                Err(_) => {
                    return Err(ProvisionerError::Helper(format!(
                        "could not run helper {}: timed out after {:?}",
                        self.name, self.timeout
                    )));
                }
            },
        };

        if !output.stderr.is_empty() {
            debug!(
                "Helper {} stderr: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        if !output.status.success() {
            return Err(ProvisionerError::Helper(format!(
                "could not run helper {}: exited with non 0 exitcode ({})",
                self.name, output.status
            )));
        }

        if output.stdout.is_empty() {
            return Err(ProvisionerError::Helper(format!(
                "cannot read {} output: zero bytes received",
                self.name
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            ProvisionerError::Helper(format!("cannot decode output from {}: {}", self.name, e))
        })
    }
}
