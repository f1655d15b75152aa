//! Tunnel supervisor: spawns and monitors the `bore` helper process.
//!
//! Keeps a public reachability tunnel alive across crashes: spawn the
//! helper, parse the public URL it announces on stdout, drain its
//! output, and restart it automatically if it exits.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::ansi::strip_ansi;

const URL_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors raised by [`Supervisor::start`].
#[derive(Debug)]
pub enum TunnelError {
    /// The helper binary could not be spawned (e.g. not installed).
    SpawnFailed(std::io::Error),
    /// No `listening at host:port` line arrived within
    /// [`URL_WAIT_TIMEOUT`].
    Timeout,
    /// The helper's stdout closed before a URL line appeared.
    StdoutClosed,
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpawnFailed(e) => write!(f, "failed to spawn tunnel helper: {e}"),
            Self::Timeout => write!(f, "timed out waiting for tunnel URL"),
            Self::StdoutClosed => write!(f, "tunnel helper stdout closed without a URL"),
        }
    }
}

impl std::error::Error for TunnelError {}

/// Snapshot of supervisor state.
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub running: bool,
    pub url: Option<String>,
    pub local_port: u16,
    pub relay: String,
    pub auto_reconnect: bool,
}

type UrlChangeCb = Box<dyn Fn(&str) + Send + Sync>;
type ConnectedCb = Box<dyn Fn(&str) + Send + Sync>;
type DisconnectedCb = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_url_change: Option<UrlChangeCb>,
    on_connected: Option<ConnectedCb>,
    on_disconnected: Option<DisconnectedCb>,
}

struct Inner {
    running: bool,
    shutdown_requested: bool,
    current_url: Option<String>,
}

/// Drives the `bore` helper process: spawn, parse its announced public
/// URL, keep draining its output, and auto-reconnect on exit.
///
/// One `Supervisor` owns at most one live child process at a time; state
/// transitions follow
/// `stopped → starting → running → (exited | stopping) → stopped`,
/// with `exited --auto_reconnect--> starting`.
pub struct Supervisor {
    local_port: u16,
    relay: String,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    state: Arc<Mutex<Inner>>,
    callbacks: Arc<Callbacks>,
    child: Arc<Mutex<Option<Child>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Build a supervisor for `bore local <local_port> --to <relay>`.
    pub fn new(local_port: u16, relay: impl Into<String>) -> Self {
        Self {
            local_port,
            relay: relay.into(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            state: Arc::new(Mutex::new(Inner {
                running: false,
                shutdown_requested: false,
                current_url: None,
            })),
            callbacks: Arc::new(Callbacks::default()),
            child: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Disable auto-reconnect (enabled by default).
    pub fn without_auto_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Override the reconnect delay (default 5s).
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Register the `on_connected(url)` callback. Fires once per
    /// successful `start()` transition.
    pub fn on_connected(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Arc::get_mut(&mut self.callbacks).unwrap().on_connected = Some(Box::new(f));
        self
    }

    /// Register the `on_disconnected()` callback. Fires whenever the
    /// child exits, regardless of cause.
    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        Arc::get_mut(&mut self.callbacks).unwrap().on_disconnected = Some(Box::new(f));
        self
    }

    /// Register the `on_url_change(new_url)` callback. Fires only when
    /// an auto-reconnect produces a URL different from the prior one.
    pub fn on_url_change(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Arc::get_mut(&mut self.callbacks).unwrap().on_url_change = Some(Box::new(f));
        self
    }

    /// Current public URL, if the tunnel is up.
    pub fn current_url(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.running {
            state.current_url.clone()
        } else {
            None
        }
    }

    /// Whether the tunnel is currently considered up.
    pub fn is_alive(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.running && self.child.lock().unwrap().is_some()
    }

    /// A status snapshot.
    pub fn status(&self) -> TunnelStatus {
        let state = self.state.lock().unwrap();
        TunnelStatus {
            running: state.running,
            url: state.current_url.clone(),
            local_port: self.local_port,
            relay: self.relay.clone(),
            auto_reconnect: self.auto_reconnect,
        }
    }

    /// Spawn the helper and wait for its announced public URL.
    ///
    /// On success, starts the stdout drain, stderr drain and process
    /// monitor tasks and fires `on_connected` exactly once.
    pub async fn start(self: &Arc<Self>) -> Result<String, TunnelError> {
        {
            let state = self.state.lock().unwrap();
            if state.running {
                log::warn!("tunnel already running");
                return state.current_url.clone().ok_or(TunnelError::StdoutClosed);
            }
        }

        log::info!(
            "starting tunnel: {} -> {}",
            self.local_port,
            self.relay
        );

        let mut child = Command::new("bore")
            .arg("local")
            .arg(self.local_port.to_string())
            .arg("--to")
            .arg(&self.relay)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TunnelError::SpawnFailed)?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let url = match wait_for_url(stdout, URL_WAIT_TIMEOUT).await {
            Ok((url, stdout_reader)) => {
                self.spawn_stdout_drain(stdout_reader);
                url
            }
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
        };

        self.spawn_stderr_drain(stderr);

        {
            let mut state = self.state.lock().unwrap();
            state.running = true;
            state.current_url = Some(url.clone());
        }
        *self.child.lock().unwrap() = Some(child);

        self.spawn_monitor();

        log::info!("tunnel established: {url}");
        if let Some(cb) = &self.callbacks.on_connected {
            cb(&url);
        }

        Ok(url)
    }

    fn spawn_stdout_drain(self: &Arc<Self>, reader: BufReader<tokio::process::ChildStdout>) {
        let handle = tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let clean = strip_ansi(&line);
                        if !clean.is_empty() {
                            log::debug!("tunnel stdout: {clean}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("error reading tunnel stdout: {e}");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_stderr_drain(self: &Arc<Self>, stderr: tokio::process::ChildStderr) {
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let clean = strip_ansi(&line);
                        if clean.is_empty() {
                            continue;
                        }
                        let lower = clean.to_lowercase();
                        if ["error", "fatal", "failed"].iter().any(|w| lower.contains(w)) {
                            log::error!("tunnel stderr: {clean}");
                        } else if lower.contains("warn") {
                            log::warn!("tunnel stderr: {clean}");
                        } else {
                            log::debug!("tunnel stderr: {clean}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("error reading tunnel stderr: {e}");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let wait_result = {
                let child_opt = { this.child.lock().unwrap().take() };
                match child_opt {
                    Some(mut child) => {
                        let result = child.wait().await;
                        *this.child.lock().unwrap() = None;
                        result
                    }
                    None => return,
                }
            };

            match wait_result {
                Ok(status) => log::warn!("tunnel process exited with {status}"),
                Err(e) => log::error!("error waiting on tunnel process: {e}"),
            }

            {
                let mut state = this.state.lock().unwrap();
                state.running = false;
            }

            if let Some(cb) = &this.callbacks.on_disconnected {
                cb();
            }

            let (shutdown, auto_reconnect) = {
                let state = this.state.lock().unwrap();
                (state.shutdown_requested, this.auto_reconnect)
            };

            if auto_reconnect && !shutdown {
                log::info!("auto-reconnecting tunnel in {:?}", this.reconnect_delay);
                tokio::time::sleep(this.reconnect_delay).await;

                let still_shutdown = this.state.lock().unwrap().shutdown_requested;
                if still_shutdown {
                    log::info!("shutdown requested during reconnect delay, not restarting");
                    return;
                }

                let previous_url = this.state.lock().unwrap().current_url.clone();
                match this.start().await {
                    Ok(new_url) => {
                        if Some(&new_url) != previous_url.as_ref() {
                            log::warn!(
                                "tunnel URL changed after reconnect: {:?} -> {new_url}",
                                previous_url
                            );
                            if let Some(cb) = &this.callbacks.on_url_change {
                                cb(&new_url);
                            }
                        }
                    }
                    Err(e) => log::error!("tunnel reconnect failed: {e}"),
                }
            } else {
                log::info!("tunnel stopped, auto-reconnect disabled or shutdown requested");
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Stop the tunnel: cancel the drain/monitor tasks, terminate the
    /// child gracefully (3s grace, then kill), and clear state so a
    /// later `start()` can run again.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.running && self.child.lock().unwrap().is_none() {
                return;
            }
            state.shutdown_requested = true;
            state.running = false;
        }

        log::info!("stopping tunnel");

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            terminate_gracefully(&mut child).await;
        }

        let mut state = self.state.lock().unwrap();
        state.current_url = None;

        log::info!("tunnel stopped");
    }

    /// `stop()` → sleep 1s → clear the shutdown flag → `start()`.
    pub async fn restart(self: &Arc<Self>) -> Result<String, TunnelError> {
        log::info!("restarting tunnel");
        self.stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.state.lock().unwrap().shutdown_requested = false;
        self.start().await
    }
}

async fn terminate_gracefully(child: &mut Child) {
    if child.start_kill().is_err() {
        return;
    }
    match timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
        Ok(_) => log::debug!("tunnel process terminated"),
        Err(_) => {
            log::warn!("tunnel process didn't exit in time, killing");
            let _ = child.kill().await;
        }
    }
}

/// Read stdout lines until one matches `listening at host:port`
/// (case-insensitive, ANSI-stripped first) or the timeout elapses.
///
/// Returns the matched URL and the `BufReader` so the caller can keep
/// draining the remainder of stdout afterward.
async fn wait_for_url(
    stdout: tokio::process::ChildStdout,
    overall_timeout: Duration,
) -> Result<(String, BufReader<tokio::process::ChildStdout>), TunnelError> {
    let mut reader = BufReader::new(stdout);
    let deadline = Instant::now() + overall_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TunnelError::Timeout);
        }

        let mut line = String::new();
        let read = timeout(remaining, reader.read_line(&mut line)).await;

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => return Err(TunnelError::StdoutClosed),
            Err(_) => return Err(TunnelError::Timeout),
        };
        if n == 0 {
            return Err(TunnelError::StdoutClosed);
        }

        let clean = strip_ansi(line.trim_end());
        if clean.is_empty() {
            continue;
        }
        log::debug!("tunnel: {clean}");

        if let Some(url) = parse_listening_line(&clean) {
            return Ok((url, reader));
        }
    }
}

/// Parse a line matching `listening at ([a-z0-9.-]+):(\d+)`
/// (case-insensitive) into `AoNET/TCP://<host>:<port>`.
fn parse_listening_line(line: &str) -> Option<String> {
    let lower = line.to_lowercase();
    let idx = lower.find("listening at ")?;
    let rest = &line[idx + "listening at ".len()..];
    let colon_pos = rest.find(':')?;

    let host = &rest[..colon_pos];
    if host.is_empty() || !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return None;
    }

    let port_str: String = rest[colon_pos + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if port_str.is_empty() {
        return None;
    }

    Some(format!("AoNET/TCP://{host}:{port_str}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listening_line() {
        let line = "2025-01-01T00:00:00Z INFO listening at bore.pub:12345";
        assert_eq!(
            parse_listening_line(line),
            Some("AoNET/TCP://bore.pub:12345".to_string())
        );
    }

    #[test]
    fn is_case_insensitive() {
        let line = "LISTENING AT example.com:80";
        assert_eq!(
            parse_listening_line(line),
            Some("AoNET/TCP://example.com:80".to_string())
        );
    }

    #[test]
    fn rejects_lines_without_a_match() {
        assert_eq!(parse_listening_line("connected to server"), None);
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert_eq!(parse_listening_line("listening at bore.pub:abc"), None);
    }

    #[test]
    fn fresh_supervisor_reports_not_alive() {
        let sup = Supervisor::new(9000, "bore.pub:7835");
        assert!(!sup.is_alive());
        assert_eq!(sup.current_url(), None);
        let status = sup.status();
        assert!(!status.running);
        assert_eq!(status.local_port, 9000);
        assert!(status.auto_reconnect);
    }

    #[test]
    fn without_auto_reconnect_is_reflected_in_status() {
        let sup = Supervisor::new(9000, "bore.pub:7835").without_auto_reconnect();
        assert!(!sup.status().auto_reconnect);
    }
}
