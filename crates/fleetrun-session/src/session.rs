//! Session wrapper: run one command, get exit code/stdout/stderr, enforce timeout.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

use fleetrun_core::error::OutputStream;
use fleetrun_core::traits::{RemoteShell, SpawnedCommand};
use fleetrun_core::{ExecError, ExecOutput};

/// Per-execution stream limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Maximum buffered bytes per output stream.
    pub max_output_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// One authenticated remote-shell connection with execution semantics on top.
pub struct RemoteSession {
    host: String,
    shell: Box<dyn RemoteShell>,
    limits: SessionLimits,
    broken: bool,
}

impl RemoteSession {
    pub(crate) fn new(host: String, shell: Box<dyn RemoteShell>, limits: SessionLimits) -> Self {
        Self {
            host,
            shell,
            limits,
            broken: false,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// A broken session must be discarded, never returned to the pool.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken || !self.shell.is_open()
    }

    /// Tear down the underlying connection.
    pub async fn close(&mut self) {
        self.broken = true;
        self.shell.close().await;
    }

    /// Run a command and capture its output.
    ///
    /// The wall-clock timeout is enforced locally, independent of remote
    /// command behavior: on expiry the underlying stream is destroyed. Each
    /// output stream is capped at `limits.max_output_bytes`.
    ///
    /// # Errors
    /// - `Timeout` when the wall clock expires (session becomes broken)
    /// - `BufferExceeded` when an output cap is hit (session becomes broken)
    /// - `Command` for a non-zero remote exit code (session stays usable)
    /// - `Connection` when the transport fails mid-stream
    pub async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let started = Instant::now();
        let spawned = self.shell.spawn(command).await?;

        match tokio::time::timeout(
            timeout,
            collect(spawned, &self.host, self.limits.max_output_bytes),
        )
        .await
        {
            Err(_elapsed) => {
                tracing::warn!(host = %self.host, timeout_secs = timeout.as_secs(), "command timed out, destroying stream");
                self.close().await;
                Err(ExecError::Timeout {
                    host: self.host.clone(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            Ok(Err(err)) => {
                self.close().await;
                Err(err)
            }
            Ok(Ok((exit_code, stdout, stderr))) => {
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let output = ExecOutput {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                };
                if exit_code == 0 {
                    Ok(output)
                } else {
                    Err(ExecError::Command {
                        host: self.host.clone(),
                        output,
                    })
                }
            }
        }
    }
}

async fn collect(
    spawned: SpawnedCommand,
    host: &str,
    cap: usize,
) -> Result<(i32, String, String), ExecError> {
    let SpawnedCommand {
        stdout,
        stderr,
        exit,
    } = spawned;

    let (stdout, stderr) = tokio::try_join!(
        drain(stdout, host, OutputStream::Stdout, cap),
        drain(stderr, host, OutputStream::Stderr, cap),
    )?;
    let exit_code = exit.await?;
    Ok((exit_code, stdout, stderr))
}

/// Read a stream to EOF, incrementally, enforcing the byte cap.
async fn drain(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    host: &str,
    stream: OutputStream,
    cap: usize,
) -> Result<String, ExecError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ExecError::Connection {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        if n == 0 {
            break;
        }
        if buf.len() + n > cap {
            return Err(ExecError::BufferExceeded {
                host: host.to_string(),
                stream,
                limit: cap,
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
