use crate::domain::key::PublicKey;
use crate::domain::ports::{ControlPlane, PeerChange};
use crate::error::{MeterError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::process::Command;
use tracing::debug;

/// Drives a WireGuard device through the `wg` command-line tool.
#[derive(Debug, Clone)]
pub struct WgCli {
    program: String,
}

impl Default for WgCli {
    fn default() -> Self {
        Self::new("wg")
    }
}

impl WgCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(program = %self.program, ?args, "Running control plane command");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| MeterError::upstream(&format!("Could not run {}", self.program), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeterError::UpstreamError(format!(
                "{} {} failed ({}): {}",
                self.program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ControlPlane for WgCli {
    async fn device_peers(&self, device: &str) -> Result<HashSet<PublicKey>> {
        let args = ["show", device, "peers"].map(String::from);
        let stdout = self.run(&args).await?;
        parse_peers(&stdout)
    }

    async fn configure_device(&self, device: &str, change: PeerChange) -> Result<()> {
        self.run(&peer_args(device, &change)).await?;
        Ok(())
    }
}

/// Parses `wg show <device> peers`: one base64 public key per line.
pub fn parse_peers(output: &str) -> Result<HashSet<PublicKey>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

/// Arguments of the `wg set` invocation applying `change`.
pub fn peer_args(device: &str, change: &PeerChange) -> Vec<String> {
    let mut args = vec!["set".to_string(), device.to_string(), "peer".to_string()];
    match change {
        PeerChange::Add { key, allowed_ips } => {
            args.push(key.to_base64());
            args.push("allowed-ips".to_string());
            args.push(
                allowed_ips
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        PeerChange::Remove { key } => {
            args.push(key.to_base64());
            args.push("remove".to_string());
        }
    }
    args
}
