//! Scripted transport doubles for tests.
//!
//! `FakeTransport` implements the `Transport`/`RemoteShell` seams with
//! per-host scripts and connection accounting, so pool, executor, and
//! coordinator behavior can be exercised without a real remote protocol.

use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncRead, ReadBuf};

use fleetrun_core::traits::{RemoteShell, SpawnedCommand, Transport};
use fleetrun_core::{AuthMaterial, AuthSecret, ExecError, HostTarget};

/// Convenience target for tests: `ops@{host_id}.internal:22`.
#[must_use]
pub fn target(host_id: &str) -> HostTarget {
    HostTarget {
        host_id: host_id.into(),
        address: format!("{host_id}.internal"),
        port: 22,
        auth: AuthMaterial {
            username: "ops".into(),
            secret: AuthSecret::Agent,
        },
    }
}

/// One scripted reaction to a spawn on a fake shell.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Exit with the given code and canned output.
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Never produce output or an exit status (forces the exec timeout).
    Hang,
    /// Emit this many stdout bytes, then exit 0 (for buffer-cap tests).
    Spew { bytes: usize },
}

#[derive(Default)]
struct HostScript {
    connect_failures: usize,
    runs: Vec<ScriptedRun>,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<String, HostScript>>,
    open: AtomicUsize,
    opened_total: AtomicUsize,
    max_open: AtomicUsize,
}

/// Transport double with per-host scripts and connection accounting.
///
/// Hosts without a script (or whose script ran out) succeed with exit 0 and
/// empty output. Clones share scripts and counters.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Inner>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue spawn reactions for a host, consumed in order.
    pub fn script(&self, host_id: &str, runs: Vec<ScriptedRun>) {
        let mut scripts = self.inner.scripts.lock().unwrap();
        scripts.entry(host_id.to_string()).or_default().runs = runs;
    }

    /// Make the next `count` connects to this host fail.
    pub fn fail_connects(&self, host_id: &str, count: usize) {
        let mut scripts = self.inner.scripts.lock().unwrap();
        scripts
            .entry(host_id.to_string())
            .or_default()
            .connect_failures = count;
    }

    /// Connections open right now.
    #[must_use]
    pub fn open_now(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Total connections ever opened.
    #[must_use]
    pub fn opened_total(&self) -> usize {
        self.inner.opened_total.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently open connections.
    #[must_use]
    pub fn max_open(&self) -> usize {
        self.inner.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn RemoteShell>, ExecError> {
        {
            let mut scripts = self.inner.scripts.lock().unwrap();
            let script = scripts.entry(target.host_id.clone()).or_default();
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(ExecError::Connection {
                    host: target.host_id.clone(),
                    reason: "scripted connect failure".into(),
                });
            }
        }

        let open = self.inner.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.opened_total.fetch_add(1, Ordering::SeqCst);
        self.inner.max_open.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(FakeShell {
            host_id: target.host_id.clone(),
            inner: Arc::clone(&self.inner),
            open: true,
        }))
    }
}

struct FakeShell {
    host_id: String,
    inner: Arc<Inner>,
    open: bool,
}

impl FakeShell {
    fn next_run(&self) -> ScriptedRun {
        let mut scripts = self.inner.scripts.lock().unwrap();
        scripts
            .get_mut(&self.host_id)
            .filter(|s| !s.runs.is_empty())
            .map_or(
                ScriptedRun::Exit {
                    code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                },
                |s| s.runs.remove(0),
            )
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn spawn(&mut self, _command: &str) -> Result<SpawnedCommand, ExecError> {
        if !self.open {
            return Err(ExecError::Connection {
                host: self.host_id.clone(),
                reason: "shell is closed".into(),
            });
        }

        Ok(match self.next_run() {
            ScriptedRun::Exit {
                code,
                stdout,
                stderr,
            } => SpawnedCommand {
                stdout: Box::new(Cursor::new(stdout.into_bytes())),
                stderr: Box::new(Cursor::new(stderr.into_bytes())),
                exit: futures::future::ready(Ok(code)).boxed(),
            },
            ScriptedRun::Hang => SpawnedCommand {
                stdout: Box::new(PendingRead),
                stderr: Box::new(PendingRead),
                exit: futures::future::pending().boxed(),
            },
            ScriptedRun::Spew { bytes } => SpawnedCommand {
                stdout: Box::new(Cursor::new(vec![b'x'; bytes])),
                stderr: Box::new(Cursor::new(Vec::new())),
                exit: futures::future::ready(Ok(0)).boxed(),
            },
        })
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for FakeShell {
    fn drop(&mut self) {
        if self.open {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Reader that never yields, like a remote command that never writes.
struct PendingRead;

impl AsyncRead for PendingRead {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}
