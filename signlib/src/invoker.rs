use crate::artifact::{Artifact, Role};
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::workspace::Workspace;
use bytes::BytesMut;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process;
use tokio::select;

/// Outcome of one run of the external signing tool. Classification is by
/// exit status and timeout only; stderr is opaque diagnostic text.
#[derive(Debug)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug)]
pub enum InvocationStatus {
    Succeeded { output: Artifact },
    Failed { code: Option<i32> },
    TimedOut,
}

/// Runs the signing tool against a fully staged workspace.
#[derive(Clone)]
pub struct SignerInvoker {
    program: PathBuf,
    timeout: Duration,
    max_stderr_bytes: usize,
}

impl SignerInvoker {
    pub fn new(config: &Config) -> Self {
        Self {
            program: config.signer_program.clone(),
            timeout: config.invocation_timeout,
            max_stderr_bytes: config.max_stderr_bytes,
        }
    }

    /// Invoke `<program> -k <cert> -m <profile> [-e <entitlements>]
    /// -o <output> <package>` with the workspace as working directory.
    ///
    /// The child carries `kill_on_drop`, so cancelling the future that
    /// awaits this call terminates the process as well.
    pub async fn invoke(&self, workspace: &Workspace) -> Result<InvocationResult> {
        let output_path = workspace.role_path(Role::Output);
        let mut command = process::Command::new(&self.program);
        command
            .arg("-k")
            .arg(workspace.role_path(Role::Certificate))
            .arg("-m")
            .arg(workspace.role_path(Role::Profile));
        if workspace.has(Role::Entitlements).await {
            command.arg("-e").arg(workspace.role_path(Role::Entitlements));
        }
        command
            .arg("-o")
            .arg(&output_path)
            .arg(workspace.role_path(Role::Package))
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // own process group, so a kill reaches anything the tool forks
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|err| {
            JobError::ResourceExhausted(format!(
                "cannot launch signing tool {}: {}",
                self.program.display(),
                err
            ))
        })?;
        let mut group = ProcessGroup::of(&child);
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let max_stderr = self.max_stderr_bytes;
        let stderr_task = tokio::spawn(read_tail(stderr_pipe, max_stderr));

        let exit = select! {
            status = child.wait() => {
                group.disarm();
                let status = status.map_err(|err| {
                    JobError::ResourceExhausted(format!("cannot wait for signing tool: {}", err))
                })?;
                Some(status)
            }
            _ = tokio::time::sleep(self.timeout) => {
                group.kill();
                let _ = child.wait().await;
                None
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();
        let duration = started.elapsed();

        let status = match exit {
            None => {
                tracing::warn!(program = %self.program.display(), ?duration, "signing tool timed out");
                InvocationStatus::TimedOut
            }
            Some(exit) if exit.success() => match tokio::fs::metadata(&output_path).await {
                Ok(meta) => {
                    tracing::info!(?duration, len = meta.len(), "signing tool succeeded");
                    InvocationStatus::Succeeded {
                        output: Artifact {
                            role: Role::Output,
                            path: output_path,
                            len: meta.len(),
                        },
                    }
                }
                Err(_) => {
                    // exit 0 without an output file is still a tool failure
                    tracing::warn!(?duration, "signing tool exited 0 but wrote no output");
                    InvocationStatus::Failed { code: Some(0) }
                }
            },
            Some(exit) => {
                tracing::warn!(code = ?exit.code(), ?duration, "signing tool failed");
                InvocationStatus::Failed { code: exit.code() }
            }
        };
        Ok(InvocationResult {
            status,
            stderr,
            duration,
        })
    }
}

/// The signing tool's process group. A plain kill of the leader would
/// orphan anything it forked with the workspace's files still open, so
/// both the timeout path and the drop path (cancellation mid-invocation)
/// kill the whole group.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &process::Child) -> Self {
        // the child was spawned with process_group(0): its pgid is its pid
        Self {
            pgid: child.id().map(|pid| pid as i32),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: delivers a signal to the group; no memory is touched
            let _ = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        }
    }

    /// The leader has been reaped; its pgid may be reused, so stop
    /// tracking it.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Read a pipe to EOF keeping only the last `max_bytes` bytes. Discarded
/// excess is replaced by a truncation marker so the tail still reads as a
/// diagnostic.
async fn read_tail(mut pipe: process::ChildStderr, max_bytes: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match pipe.read_buf(&mut buf).await {
            Ok(n) if n > 0 => {
                tail.extend_from_slice(&buf.split()[..]);
                if tail.len() > max_bytes {
                    tail.drain(..tail.len() - max_bytes);
                    truncated = true;
                }
            }
            _ => break,
        }
    }
    let text = String::from_utf8_lossy(&tail).into_owned();
    if truncated {
        format!("[truncated] {}", text)
    } else {
        text
    }
}
