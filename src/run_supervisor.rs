//! Run supervisor: spawns the external agent, polls the local proxy's
//! health endpoint, and enforces the "never run while unhealthy" policy
//! that is this core's whole reason to exist (§4.11).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;

use crate::error::ProxyError;

/// Consecutive health-check failures tolerated before a recovery attempt.
pub const TRANSIENT_FAILURE_THRESHOLD: u32 = 3;

/// Default health-poll interval (§4.11: "configurable interval (default ~5 s)").
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The external agent to spawn, plus any hosts that must bypass the proxy
/// in addition to the loopback defaults.
pub struct AgentSpec {
    pub program: String,
    pub args: Vec<String>,
    pub extra_no_proxy_hosts: Vec<String>,
}

/// How the run supervisor asks its caller to rebuild a degraded stack.
/// Implemented by the orchestrator/CLI layer, which owns the tunnel and
/// proxy lifetimes that a recreation has to replace.
#[async_trait]
pub trait StackRecovery: Send + Sync {
    /// Tear down and recreate the tunnel+proxy stack, returning the health
    /// endpoint address to poll going forward. An `Err` means recovery is
    /// not possible and the agent must be terminated.
    async fn recover(&self) -> anyhow::Result<SocketAddr>;
}

#[derive(Debug)]
pub enum SupervisorOutcome {
    /// The agent process exited on its own; carries its exit code.
    AgentExited(Option<i32>),
}

// A health-policy failure never produces an `Ok(SupervisorOutcome)` — it is
// reported through `Err(ProxyError::HealthDegraded)` instead (see `run`
// below), since the caller needs to distinguish it from a clean agent exit
// in `?`-propagating contexts rather than matching on an outcome value.

pub struct RunSupervisor {
    poll_interval: Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawn `agent` against `health_addr`'s proxy, then poll health until
    /// the agent exits or the failure policy decides its fate. `recovery`,
    /// when present, is given a chance to rebuild the stack after
    /// [`TRANSIENT_FAILURE_THRESHOLD`] consecutive failures before the
    /// agent is terminated for good.
    pub async fn run(
        &self,
        agent: AgentSpec,
        mut health_addr: SocketAddr,
        recovery: Option<Arc<dyn StackRecovery>>,
    ) -> anyhow::Result<SupervisorOutcome> {
        let mut child = self.spawn_agent(&agent, health_addr)?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status
                        .map_err(|e| anyhow::anyhow!("waiting on agent process failed: {e}"))?;
                    return Ok(SupervisorOutcome::AgentExited(status.code()));
                }
                _ = ticker.tick() => {
                    if self.check_health(health_addr).await {
                        consecutive_failures = 0;
                        continue;
                    }

                    consecutive_failures += 1;
                    tracing::warn!(consecutive_failures, %health_addr, "proxy health check failed");
                    if consecutive_failures < TRANSIENT_FAILURE_THRESHOLD {
                        continue;
                    }

                    let Some(recovery) = recovery.as_ref() else {
                        tracing::error!(
                            consecutive_failures,
                            "proxy unhealthy with no recovery path; terminating agent"
                        );
                        terminate(&mut child).await;
                        return Err(ProxyError::HealthDegraded { consecutive_failures }.into());
                    };

                    match recovery.recover().await {
                        Ok(new_health_addr) => {
                            tracing::warn!(%new_health_addr, "stack recreated after health degradation; restarting agent");
                            terminate(&mut child).await;
                            health_addr = new_health_addr;
                            child = self.spawn_agent(&agent, health_addr)?;
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            tracing::error!("stack recovery failed: {e}; terminating agent");
                            terminate(&mut child).await;
                            return Err(ProxyError::HealthDegraded { consecutive_failures }.into());
                        }
                    }
                }
            }
        }
    }

    async fn check_health(&self, health_addr: SocketAddr) -> bool {
        let uri: hyper::Uri = format!("http://{health_addr}/_codex_proxy/health")
            .parse()
            .expect("a socket address always forms a valid authority");
        let req = hyper::Request::get(uri)
            .body(Empty::<Bytes>::new())
            .expect("static health request is well-formed");
        match self.client.request(req).await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn spawn_agent(&self, agent: &AgentSpec, health_addr: SocketAddr) -> anyhow::Result<Child> {
        let proxy_url = format!("http://{health_addr}");
        let mut no_proxy = vec!["127.0.0.1".to_string(), "localhost".to_string()];
        no_proxy.extend(agent.extra_no_proxy_hosts.iter().cloned());

        let mut env: HashMap<&str, String> = HashMap::new();
        env.insert("HTTP_PROXY", proxy_url.clone());
        env.insert("HTTPS_PROXY", proxy_url);
        env.insert("NO_PROXY", no_proxy.join(","));

        Command::new(&agent.program)
            .args(&agent.args)
            .envs(env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn agent {}: {e}", agent.program))
    }
}

async fn terminate(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
