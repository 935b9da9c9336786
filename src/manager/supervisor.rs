//! Child agent process lifecycle.
//!
//! The supervisor owns at most one child. It spawns, soft-terminates with a
//! hard-kill escalation, and polls the child's status endpoint once a second.
//! A child that exits non-zero parks the supervisor in `error`; it is never
//! restarted automatically — restarting is operator policy.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::ai::cache::epoch_ms;
use crate::manager::overrides::{Overrides, OverridesStore};

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Supervisor errors.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("child spawn failed: {0}")]
    Spawn(String),
}

/// Readiness predicates for `POST /control/start?wait=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPredicate {
    Child,
    Heartbeat,
    Detection,
    Session,
}

impl WaitPredicate {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "child" => Some(Self::Child),
            "heartbeat" => Some(Self::Heartbeat),
            "detection" => Some(Self::Detection),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub child_command: String,
    pub child_args: Vec<String>,
    /// Port injected into the child as `EDGE_AGENT_STATUS_PORT`.
    pub child_status_port: u16,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    /// Consecutive poll failures before a running child is demoted back to
    /// `starting`.
    pub poll_failure_limit: u32,
}

impl SupervisorConfig {
    pub fn new(child_command: impl Into<String>) -> Self {
        Self {
            child_command: child_command.into(),
            child_args: Vec::new(),
            child_status_port: 7081,
            stop_timeout: Duration::from_millis(4_000),
            poll_interval: Duration::from_secs(1),
            poll_failure_limit: 3,
        }
    }

    /// Build from the environment. `EDGE_AGENT_CHILD_COMMAND` defaults to
    /// the sibling `vigil-agent` binary.
    pub fn from_env() -> Self {
        let command =
            std::env::var("EDGE_AGENT_CHILD_COMMAND").unwrap_or_else(|_| "vigil-agent".to_string());
        let mut config = Self::new(command);
        if let Ok(args) = std::env::var("EDGE_AGENT_CHILD_ARGS") {
            config.child_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(port) = std::env::var("EDGE_AGENT_CHILD_STATUS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.child_status_port = port;
        }
        config
    }
}

/// Read-only projection for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSnapshot {
    pub state: ManagerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_start_ts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stop_ts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_uptime_ms: Option<u64>,
    pub status_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Overrides>,
}

struct SupState {
    state: ManagerState,
    last_start_ts: Option<u64>,
    last_stop_ts: Option<u64>,
    last_exit: Option<i32>,
    child_pid: Option<u32>,
    agent_status: Option<serde_json::Value>,
    poll_failures: u32,
}

struct SupervisorInner {
    config: SupervisorConfig,
    overrides: Arc<OverridesStore>,
    /// Serializes start/stop so lifecycle transitions never overlap.
    lifecycle: tokio::sync::Mutex<()>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    state: Mutex<SupState>,
    client: reqwest::Client,
}

/// The supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, overrides: Arc<OverridesStore>) -> Self {
        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                config,
                overrides,
                lifecycle: tokio::sync::Mutex::new(()),
                child: tokio::sync::Mutex::new(None),
                state: Mutex::new(SupState {
                    state: ManagerState::Idle,
                    last_start_ts: None,
                    last_stop_ts: None,
                    last_exit: None,
                    child_pid: None,
                    agent_status: None,
                    poll_failures: 0,
                }),
                client: reqwest::Client::new(),
            }),
        };
        supervisor.spawn_poll_task();
        supervisor
    }

    pub fn state(&self) -> ManagerState {
        self.inner.state.lock().state
    }

    /// Spawn the child. Idempotent while a child is starting or running.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let _guard = self.inner.lifecycle.lock().await;
        if matches!(
            self.state(),
            ManagerState::Starting | ManagerState::Running | ManagerState::Stopping
        ) {
            return Ok(());
        }

        let config = &self.inner.config;
        let mut command = tokio::process::Command::new(&config.child_command);
        command
            .args(&config.child_args)
            .env(
                "EDGE_AGENT_STATUS_PORT",
                config.child_status_port.to_string(),
            )
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(overrides) = self.inner.overrides.current() {
            command.env(
                "EDGE_AGENT_CLASSES_FILTER",
                overrides.classes_filter.join(","),
            );
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("child spawn failed: {e}");
                let mut state = self.inner.state.lock();
                state.state = ManagerState::Error;
                state.last_exit = None;
                return Err(ManagerError::Spawn(e.to_string()));
            }
        };
        let pid = child.id();
        tracing::info!(?pid, command = %config.child_command, "child agent spawned");
        {
            let mut state = self.inner.state.lock();
            state.state = ManagerState::Starting;
            state.last_start_ts = Some(epoch_ms());
            state.last_exit = None;
            state.child_pid = pid;
            state.agent_status = None;
            state.poll_failures = 0;
        }
        *self.inner.child.lock().await = Some(child);
        self.spawn_exit_watcher();
        Ok(())
    }

    /// Soft-terminate the child, escalating to a hard kill after the stop
    /// timeout. Idempotent when nothing is running.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if !matches!(self.state(), ManagerState::Starting | ManagerState::Running) {
            return;
        }
        self.inner.state.lock().state = ManagerState::Stopping;

        let pid = self.inner.state.lock().child_pid;
        #[cfg(unix)]
        if let Some(pid) = pid {
            // SIGTERM first so the agent can run its shutdown sequence
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        let deadline = tokio::time::Instant::now() + self.inner.config.stop_timeout;
        loop {
            if self.inner.child.lock().await.is_none() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("child ignored soft stop, killing");
                if let Some(mut child) = self.inner.child.lock().await.take() {
                    let _ = child.kill().await;
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut state = self.inner.state.lock();
        state.state = ManagerState::Idle;
        state.last_stop_ts = Some(epoch_ms());
        state.child_pid = None;
        state.agent_status = None;
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let state = self.inner.state.lock();
        let child_uptime_ms = match (state.child_pid, state.last_start_ts) {
            (Some(_), Some(start)) => Some(epoch_ms().saturating_sub(start)),
            _ => None,
        };
        ManagerSnapshot {
            state: state.state,
            last_start_ts: state.last_start_ts,
            last_stop_ts: state.last_stop_ts,
            last_exit: state.last_exit,
            child_pid: state.child_pid,
            child_uptime_ms,
            status_port: self.inner.config.child_status_port,
            overrides: self.inner.overrides.current(),
        }
    }

    /// Last telemetry polled from the child, if any.
    pub fn agent_status(&self) -> Option<serde_json::Value> {
        self.inner.state.lock().agent_status.clone()
    }

    /// Evaluate a readiness predicate against the current snapshot.
    pub fn is_ready(&self, predicate: WaitPredicate) -> bool {
        let state = self.inner.state.lock();
        match predicate {
            WaitPredicate::Child => state.state == ManagerState::Running,
            WaitPredicate::Heartbeat => state
                .agent_status
                .as_ref()
                .is_some_and(|s| s["heartbeatTs"].is_number()),
            WaitPredicate::Detection => state
                .agent_status
                .as_ref()
                .is_some_and(|s| s["detections"]["total"].as_u64().unwrap_or(0) > 0),
            WaitPredicate::Session => state.agent_status.as_ref().is_some_and(|s| {
                s["session"]["active"].as_bool().unwrap_or(false)
                    || s["session"]["lastSessionId"].is_string()
            }),
        }
    }

    /// Watch for child exit and record the outcome. Exits observed while
    /// stopping are an expected part of `stop()`.
    fn spawn_exit_watcher(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let mut child_slot = inner.child.lock().await;
                let Some(child) = child_slot.as_mut() else {
                    return;
                };
                match child.try_wait() {
                    Ok(Some(exit)) => {
                        *child_slot = None;
                        drop(child_slot);
                        let code = exit.code();
                        let mut state = inner.state.lock();
                        state.last_exit = code;
                        state.child_pid = None;
                        state.agent_status = None;
                        if state.state == ManagerState::Stopping {
                            tracing::info!(?code, "child exited during stop");
                        } else if exit.success() {
                            tracing::info!("child exited cleanly");
                            state.state = ManagerState::Idle;
                        } else {
                            tracing::error!(?code, "child exited abnormally");
                            state.state = ManagerState::Error;
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("child wait failed: {e}");
                        return;
                    }
                }
            }
        });
    }

    /// Poll the child's `/status` endpoint once per interval.
    fn spawn_poll_task(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let url = format!(
                "http://127.0.0.1:{}/status",
                inner.config.child_status_port
            );
            let mut interval = tokio::time::interval(inner.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let current = inner.state.lock().state;
                if !matches!(current, ManagerState::Starting | ManagerState::Running) {
                    continue;
                }
                let result = inner
                    .client
                    .get(&url)
                    .timeout(Duration::from_millis(800))
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        let body = resp.json::<serde_json::Value>().await.ok();
                        let mut state = inner.state.lock();
                        state.agent_status = body;
                        state.poll_failures = 0;
                        if state.state == ManagerState::Starting {
                            tracing::info!("child status endpoint up, child is running");
                            state.state = ManagerState::Running;
                        }
                    }
                    _ => {
                        let mut state = inner.state.lock();
                        state.poll_failures += 1;
                        if state.state == ManagerState::Running
                            && state.poll_failures >= inner.config.poll_failure_limit
                        {
                            tracing::warn!(
                                failures = state.poll_failures,
                                "child stopped answering status polls"
                            );
                            state.state = ManagerState::Starting;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::overrides::OVERRIDES_FILE;
    use tempfile::TempDir;

    fn overrides() -> (Arc<OverridesStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        (
            Arc::new(OverridesStore::new(dir.path().join(OVERRIDES_FILE))),
            dir,
        )
    }

    fn sh_supervisor(script: &str, overrides: Arc<OverridesStore>) -> Supervisor {
        let config = SupervisorConfig {
            child_args: vec!["-c".to_string(), script.to_string()],
            stop_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            ..SupervisorConfig::new("/bin/sh")
        };
        Supervisor::new(config, overrides)
    }

    async fn wait_for_state(sup: &Supervisor, wanted: ManagerState) {
        for _ in 0..100 {
            if sup.state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("state never reached {wanted:?}, still {:?}", sup.state());
    }

    #[tokio::test]
    async fn start_spawns_child_and_records_pid() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("sleep 30", overrides);
        sup.start().await.unwrap();

        assert_eq!(sup.state(), ManagerState::Starting);
        let snapshot = sup.snapshot();
        assert!(snapshot.child_pid.is_some());
        assert!(snapshot.last_start_ts.is_some());
        sup.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("sleep 30", overrides);
        sup.start().await.unwrap();
        let pid = sup.snapshot().child_pid;
        sup.start().await.unwrap();
        assert_eq!(sup.snapshot().child_pid, pid, "second start must not respawn");
        sup.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_and_returns_to_idle() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("sleep 30", overrides);
        sup.start().await.unwrap();
        sup.stop().await;

        assert_eq!(sup.state(), ManagerState::Idle);
        let snapshot = sup.snapshot();
        assert!(snapshot.child_pid.is_none());
        assert!(snapshot.last_stop_ts.is_some());
    }

    #[tokio::test]
    async fn stop_without_child_is_a_noop() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("sleep 30", overrides);
        sup.stop().await;
        assert_eq!(sup.state(), ManagerState::Idle);
    }

    #[tokio::test]
    async fn nonzero_exit_parks_in_error() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("exit 3", overrides);
        sup.start().await.unwrap();

        wait_for_state(&sup, ManagerState::Error).await;
        assert_eq!(sup.snapshot().last_exit, Some(3));
        // No auto-restart: the state stays parked
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.state(), ManagerState::Error);
    }

    #[tokio::test]
    async fn clean_exit_returns_to_idle() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("exit 0", overrides);
        sup.start().await.unwrap();
        wait_for_state(&sup, ManagerState::Idle).await;
        assert_eq!(sup.snapshot().last_exit, Some(0));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let (overrides, _dir) = overrides();
        let config = SupervisorConfig::new("/nonexistent/binary-xyz");
        let sup = Supervisor::new(config, overrides);
        assert!(sup.start().await.is_err());
        assert_eq!(sup.state(), ManagerState::Error);
    }

    #[tokio::test]
    async fn snapshot_carries_overrides() {
        let (overrides, _dir) = overrides();
        overrides.update(vec!["person".to_string()]).unwrap();
        let sup = sh_supervisor("sleep 30", overrides);
        let snapshot = sup.snapshot();
        assert_eq!(
            snapshot.overrides.unwrap().classes_filter,
            vec!["person"]
        );
    }

    #[test]
    fn wait_predicate_parses_known_names() {
        assert_eq!(WaitPredicate::parse("child"), Some(WaitPredicate::Child));
        assert_eq!(
            WaitPredicate::parse("heartbeat"),
            Some(WaitPredicate::Heartbeat)
        );
        assert_eq!(
            WaitPredicate::parse("detection"),
            Some(WaitPredicate::Detection)
        );
        assert_eq!(WaitPredicate::parse("session"), Some(WaitPredicate::Session));
        assert_eq!(WaitPredicate::parse("bogus"), None);
    }

    #[tokio::test]
    async fn predicates_read_agent_status() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("sleep 30", overrides);
        assert!(!sup.is_ready(WaitPredicate::Heartbeat));

        sup.inner.state.lock().agent_status = Some(serde_json::json!({
            "heartbeatTs": 1000,
            "detections": {"total": 2},
            "session": {"active": false, "lastSessionId": "sess-1"},
        }));
        assert!(sup.is_ready(WaitPredicate::Heartbeat));
        assert!(sup.is_ready(WaitPredicate::Detection));
        assert!(sup.is_ready(WaitPredicate::Session));
        assert!(!sup.is_ready(WaitPredicate::Child), "child predicate needs Running");
    }

    #[tokio::test]
    async fn snapshot_serialises_to_camel_case() {
        let (overrides, _dir) = overrides();
        let sup = sh_supervisor("sleep 30", overrides);
        let json = serde_json::to_value(sup.snapshot()).unwrap();
        assert_eq!(json["state"], "idle");
        assert!(json["statusPort"].is_number());
        assert!(json.get("status_port").is_none());
    }
}
