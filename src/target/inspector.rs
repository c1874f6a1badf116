//! Container Inspector
//!
//! Narrow view of the container runtime: is it running, what address does it
//! have, and what does a command print inside it.

use anyhow::{anyhow, Context};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::Result;

/// Read-only container queries needed to resolve a target
pub trait ContainerInspector: Send + Sync {
    fn is_running(&self, name: &str) -> bool;

    /// Internal network address of the container
    fn inspect_ip(&self, name: &str) -> Result<String>;

    /// Run `command` inside the container and return its stdout
    fn exec_capture(&self, name: &str, command: &[&str]) -> Result<String>;
}

/// Inspector backed by a docker-compatible CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    runtime: PathBuf,
}

impl DockerCli {
    /// Create an inspector that runs the given runtime binary
    pub fn new(runtime: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    /// Runtime binary invoked for every query
    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    fn output(&self, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", self.runtime.display(), args.join(" "));
        let output = Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {}", self.runtime.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} {} exited with {}: {}",
                self.runtime.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerInspector for DockerCli {
    fn is_running(&self, name: &str) -> bool {
        self.output(&["inspect", "--format", "{{.State.Running}}", name])
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    fn inspect_ip(&self, name: &str) -> Result<String> {
        let out = self.output(&[
            "inspect",
            "--format",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
            name,
        ])?;
        first_address(&out).ok_or_else(|| anyhow!("container {} has no network address", name))
    }

    fn exec_capture(&self, name: &str, command: &[&str]) -> Result<String> {
        let mut args = vec!["exec", name];
        args.extend_from_slice(command);
        self.output(&args)
    }
}

/// First IP address in whitespace separated inspect output. Networks without
/// an address render as `<no value>` or nothing at all.
fn first_address(out: &str) -> Option<String> {
    out.split_whitespace()
        .find(|s| s.parse::<IpAddr>().is_ok())
        .map(str::to_string)
}
