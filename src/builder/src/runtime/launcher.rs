//! RUN instruction launcher.
//!
//! [`OciLauncher`] drives an OCI runtime binary (runc, crun, ...):
//!
//! ```text
//! bundle/config.json ─► <runtime> run --bundle <dir> --pid-file <file> <id>
//!                          │ stdout/stderr ─► build status channel
//!                          └ wait ┬ exit 0     ─► Ok
//!                                 ├ exit n     ─► RunFailed
//!                                 ├ signal     ─► RunSignaled
//!                                 └ cancelled  ─► kill + delete ─► Cancelled
//! ```

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};
use kiln_core::StatusSender;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::spec::{RunRequest, RuntimeSpec};

/// Interval between pid-file checks while a RUN step starts.
const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs a process inside a working container.
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    /// Run the request to completion. Cancellation stops the process and
    /// returns [`KilnError::Cancelled`].
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<()>;
}

/// Launcher backed by an OCI runtime binary.
pub struct OciLauncher {
    runtime: String,
    bundles_dir: PathBuf,
    status: StatusSender,
}

impl OciLauncher {
    pub fn new(runtime: impl Into<String>, bundles_dir: &Path, status: StatusSender) -> Self {
        Self {
            runtime: runtime.into(),
            bundles_dir: bundles_dir.to_path_buf(),
            status,
        }
    }

    async fn run_bundle(
        &self,
        request: &RunRequest,
        runtime_id: &str,
        bundle: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pid_file = bundle.join("pid");
        let mut child = Command::new(&self.runtime)
            .arg("run")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(&pid_file)
            .arg(runtime_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KilnError::Runtime(format!("failed to start {}: {}", self.runtime, e)))?;

        let forwarders = [
            child.stdout.take().map(|out| self.forward(out)),
            child.stderr.take().map(|err| self.forward(err)),
        ];

        let mut started = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    self.force_delete(runtime_id).await;
                    return Err(KilnError::Cancelled);
                }
                pid = wait_for_pid(&pid_file), if !started => {
                    started = true;
                    tracing::debug!(pid, container = %request.container_id, "RUN process started");
                }
            }
        };

        for handle in forwarders.into_iter().flatten() {
            let _ = handle.await;
        }

        let command = request.args.join(" ");
        if status.success() {
            Ok(())
        } else if let Some(code) = status.code() {
            Err(KilnError::RunFailed { command, code })
        } else {
            Err(KilnError::RunSignaled {
                command,
                signal: status.signal().unwrap_or_default(),
            })
        }
    }

    /// Copy process output to the status channel line by line.
    fn forward<R>(&self, reader: R) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let status = self.status.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => status.send(line).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Error reading RUN output: {}", e);
                        break;
                    }
                }
            }
        })
    }

    /// Best-effort removal of a runtime container left behind by a kill.
    async fn force_delete(&self, runtime_id: &str) {
        let result = Command::new(&self.runtime)
            .args(["delete", "--force", runtime_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(container = %runtime_id, "Failed to delete runtime container: {}", e);
        }
    }
}

async fn wait_for_pid(pid_file: &Path) -> i32 {
    loop {
        if let Ok(content) = tokio::fs::read_to_string(pid_file).await {
            if let Ok(pid) = content.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(PID_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl RuntimeLauncher for OciLauncher {
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<()> {
        let runtime_id = format!(
            "kiln-run-{}",
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        let bundle = self.bundles_dir.join(&runtime_id);
        std::fs::create_dir_all(&bundle)?;

        let spec = RuntimeSpec::for_run(request);
        std::fs::write(bundle.join("config.json"), serde_json::to_vec_pretty(&spec)?)?;

        tracing::debug!(
            container = %request.container_id,
            bundle = %bundle.display(),
            args = ?request.args,
            "Launching RUN process"
        );
        let result = self.run_bundle(request, &runtime_id, &bundle, cancel).await;

        if let Err(e) = tokio::fs::remove_dir_all(&bundle).await {
            tracing::warn!(bundle = %bundle.display(), "Failed to remove bundle: {}", e);
        }
        result
    }
}
