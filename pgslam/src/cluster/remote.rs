use crate::debug::debug_command;
use crate::error::ClusterError;
use crate::shutdown::StopListener;
use std::process::Stdio;
use tokio::process::Command;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Runs a command line on a remote host.
#[trait_variant::make(RemoteExec: Send)]
pub trait LocalRemoteExec: Clone + Send + Sync + 'static {
    /// Run `command` on `host` to completion. When `cancel` fires the command is killed and
    /// the call returns `Ok(())`: being told to stop is a normal exit.
    async fn exec(
        &self,
        host: &str,
        command: &[String],
        cancel: Option<StopListener>,
    ) -> Result<(), ClusterError>;
}

/// [`RemoteExec`] over the local `ssh` client. Output is inherited from this process.
#[derive(Debug, Clone)]
pub struct SshExec {
    program: String,
}

impl SshExec {
    pub fn new() -> Self {
        Self {
            program: "ssh".to_string(),
        }
    }
}

impl Default for SshExec {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteExec for SshExec {
    async fn exec(
        &self,
        host: &str,
        command: &[String],
        cancel: Option<StopListener>,
    ) -> Result<(), ClusterError> {
        let mut args = vec![host.to_string()];
        args.extend(command.iter().cloned());
        info!("{}", debug_command(&self.program, &args));

        let spawn_error = |source| ClusterError::Spawn {
            host: host.to_string(),
            source,
        };
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let status = match cancel {
            Some(mut cancel) => {
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = cancel.stopped() => None,
                };
                match exited {
                    Some(status) => status,
                    None => {
                        debug!("Killing {} on {host}", command.first().map_or("", String::as_str));
                        if let Err(err) = child.kill().await {
                            warn!("Failed to kill ssh session to {host}: {err}");
                        }
                        return Ok(());
                    }
                }
            }
            None => child.wait().await,
        }
        .map_err(spawn_error)?;

        if status.success() {
            Ok(())
        } else {
            Err(ClusterError::Exit {
                host: host.to_string(),
                status: status.to_string(),
            })
        }
    }
}
