//! Local Service Process
//!
//! Optional subprocess started alongside an exposure session. When it exits
//! on its own the session ends with it.

use anyhow::{bail, Context};
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::Result;

/// A child process whose lifetime bounds the session
pub struct ServiceProcess {
    program: String,
    child: Child,
}

impl ServiceProcess {
    /// Spawn `command[0]` with the remaining arguments, inheriting stdio
    pub fn spawn(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("service command must not be empty");
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start service command '{}'", program))?;

        info!(
            "Started service process '{}' (pid {})",
            program,
            child.id().map_or_else(|| "?".to_string(), |id| id.to_string())
        );

        Ok(Self {
            program: program.clone(),
            child,
        })
    }

    /// Program name the service was started with
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;
        info!("Service process '{}' exited with {}", self.program, status);
        Ok(status)
    }

    /// Kill the process if it is still running
    pub async fn stop(&mut self) -> Result<()> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Service process '{}' already exited with {}", self.program, status);
                Ok(())
            }
            Ok(None) => {
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to stop service process '{}': {}", self.program, e);
                    return Err(e.into());
                }
                debug!("Service process '{}' stopped", self.program);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolve when `signal` fires or `service` exits on its own, whichever is
/// first. A signal listener that cannot be installed is an error, not a stop
/// request.
pub async fn wait_for_stop<S>(signal: S, service: Option<&mut ServiceProcess>) -> Result<()>
where
    S: Future<Output = Result<()>>,
{
    match service {
        Some(service) => {
            tokio::select! {
                result = signal => result.context("Failed to listen for shutdown signals"),
                status = service.wait() => {
                    status?;
                    info!("Service process '{}' ended, stopping exposure", service.program());
                    Ok(())
                }
            }
        }
        None => signal.await.context("Failed to listen for shutdown signals"),
    }
}
