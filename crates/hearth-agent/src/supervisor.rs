use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Local};
use hearth_process::{
    ChannelId, PlayerCount, ServerState, ServerStatus, SessionId, StopReason, archive_log_name,
};
use regex::Regex;
use serde::Serialize;
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, Command},
    sync::watch,
    time::Instant,
};

use crate::config::{AgentConfig, ConfigError};
use crate::error::LifecycleError;
use crate::log_tail::{self, LogMatch, LogWatch};

const RUN_INFO_FILE: &str = "hearth_run.json";
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub program: String,
    pub args: Vec<String>,
    pub server_dir: PathBuf,
    pub log_path: PathBuf,
    pub ready: Regex,
    pub players: Regex,
    pub stop_command: String,
    pub list_command: String,
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    /// Portion of `stop_timeout` reserved for SIGTERM before SIGKILL.
    pub graceful_term_grace: Duration,
    pub settle_delay: Duration,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &AgentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            server_dir: cfg.server_dir.clone(),
            log_path: cfg.log_path(),
            ready: cfg.ready_regex()?,
            players: cfg.player_regex()?,
            stop_command: cfg.stop_command.clone(),
            list_command: cfg.list_command.clone(),
            poll_interval: cfg.poll_interval(),
            start_timeout: cfg.start_timeout(),
            stop_timeout: cfg.stop_timeout(),
            graceful_term_grace: cfg.graceful_term_grace(),
            settle_delay: cfg.settle_delay(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReadyInfo {
    pub session: SessionId,
    pub pid: Option<u32>,
    /// Wall time from spawn until the ready line was seen.
    pub elapsed: Duration,
    /// First capture of the ready pattern, e.g. the server's own boot time.
    pub reported_boot: Option<String>,
}

impl ReadyInfo {
    pub fn reported_boot_secs(&self) -> Option<f64> {
        self.reported_boot.as_deref()?.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct StopInfo {
    pub session: SessionId,
    pub reason: StopReason,
    pub exit_code: Option<i32>,
    /// The process had to be signalled.
    pub forced: bool,
    pub uptime: Duration,
    pub archived_log: Option<PathBuf>,
    /// Non-fatal problems hit while stopping.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct RunInfo {
    session: String,
    started_at: DateTime<Local>,
    agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pgid: Option<i32>,
    program: String,
    args: Vec<String>,
    cwd: String,
    log_path: String,
}

async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    let path = dir.join(RUN_INFO_FILE);
    let tmp = dir.join(format!("{RUN_INFO_FILE}.tmp"));
    let data = serde_json::to_vec_pretty(info).context("serialize run info")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create run info tmp")?;
    f.write_all(&data).await.context("write run info tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run info")?;
    Ok(())
}

#[derive(Debug)]
struct RunningServer {
    session: SessionId,
    child: Child,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    pgid: Option<i32>,
    started: Instant,
    started_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(server: &mut RunningServer, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if let Some(pgid) = server.pgid {
        unsafe {
            libc::kill(-pgid, sig);
        }
    }
    if matches!(signal, Signal::Kill) {
        let _ = server.child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_group(server: &mut RunningServer, _signal: Signal) {
    let _ = server.child.start_kill();
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    // The server must not outlive the agent.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

async fn write_line(stdin: &mut ChildStdin, command: &str) -> io::Result<()> {
    stdin.write_all(command.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

fn parse_player_count(m: &LogMatch) -> Option<PlayerCount> {
    Some(PlayerCount {
        online: m.group(1)?.parse().ok()?,
        max: m.group(2)?.parse().ok()?,
    })
}

/// Owner of the single game server process slot.
///
/// All methods take `&mut self`; callers serialize access (the controller
/// keeps the supervisor behind one mutex).
#[derive(Debug)]
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    running: Option<RunningServer>,
    state_tx: watch::Sender<ServerState>,
    bound_channel: Option<ChannelId>,
    spawns: u64,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Stopped);
        Self {
            settings,
            running: None,
            state_tx,
            bound_channel: None,
            spawns: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    /// Lock-free view of the state for readers outside the lifecycle lock.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    pub fn bound_channel(&self) -> Option<&ChannelId> {
        self.bound_channel.as_ref()
    }

    /// Number of processes spawned over the supervisor's lifetime.
    #[cfg(test)]
    pub fn spawn_count(&self) -> u64 {
        self.spawns
    }

    fn set_state(&self, state: ServerState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            tracing::debug!(from = ?prev, to = ?state, "server state changed");
        }
    }

    pub fn status(&self) -> ServerStatus {
        match &self.running {
            Some(s) => ServerStatus {
                session: Some(s.session.clone()),
                state: self.state(),
                pid: s.pid,
                started_at: Some(s.started_at),
                uptime_secs: Some(s.started.elapsed().as_secs()),
            },
            None => ServerStatus {
                state: self.state(),
                ..ServerStatus::stopped()
            },
        }
    }

    /// True iff a process handle exists and the OS reports it alive.
    pub fn is_alive(&mut self) -> bool {
        self.running
            .as_mut()
            .is_some_and(|s| matches!(s.child.try_wait(), Ok(None)))
    }

    pub async fn start(&mut self, channel: ChannelId) -> Result<ReadyInfo, LifecycleError> {
        self.reap_exited().await;
        if self.running.is_some() || !self.state().is_stopped() {
            return Err(LifecycleError::AlreadyRunning);
        }

        self.set_state(ServerState::Starting);
        let server = match self.launch().await {
            Ok(s) => s,
            Err(e) => {
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };
        self.running = Some(server);

        match self.wait_until_ready().await {
            Ok(info) => {
                self.set_state(ServerState::Running);
                self.bound_channel = Some(channel);
                Ok(info)
            }
            Err(e) => {
                tracing::warn!(error = %e, "server start failed; cleaning up");
                self.abort_start().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<RunningServer, LifecycleError> {
        let s = &self.settings;

        if let Some(parent) = s.log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(LifecycleError::io("create log directory"))?;
        }
        match tokio::fs::remove_file(&s.log_path).await {
            Ok(()) => tracing::info!(path = %s.log_path.display(), "deleted stale server log"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LifecycleError::io("delete stale server log")(e)),
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&s.log_path)
            .map_err(LifecycleError::io("open server log"))?;
        let log_err = log
            .try_clone()
            .map_err(LifecycleError::io("open server log"))?;

        let mut cmd = Command::new(&s.program);
        cmd.current_dir(&s.server_dir)
            .args(&s.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let started_at = Local::now();
        let mut child = cmd.spawn().map_err(|source| {
            tracing::error!(program = %s.program, error = %source, "failed to spawn server");
            LifecycleError::Spawn {
                program: s.program.clone(),
                source,
            }
        })?;
        self.spawns = self.spawns.saturating_add(1);

        let pid = child.id();
        // setsid() makes the child its own group leader.
        let pgid = if cfg!(unix) {
            pid.and_then(|p| i32::try_from(p).ok())
        } else {
            None
        };
        let session = SessionId::new();
        tracing::info!(
            %session,
            pid = ?pid,
            spawn = self.spawns,
            program = %s.program,
            cwd = %s.server_dir.display(),
            "server process spawned"
        );

        let run = RunInfo {
            session: session.0.clone(),
            started_at,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid,
            pgid,
            program: s.program.clone(),
            args: s.args.clone(),
            cwd: s.server_dir.display().to_string(),
            log_path: s.log_path.display().to_string(),
        };
        if let Err(e) = write_run_json(&s.server_dir, &run).await {
            tracing::debug!(error = %e, "failed to write run info");
        }

        Ok(RunningServer {
            session,
            stdin: child.stdin.take(),
            child,
            pid,
            pgid,
            started: Instant::now(),
            started_at,
        })
    }

    async fn wait_until_ready(&mut self) -> Result<ReadyInfo, LifecycleError> {
        let settings = &self.settings;
        let Some(server) = self.running.as_mut() else {
            return Err(LifecycleError::NotRunning);
        };

        let deadline = server.started + settings.start_timeout;
        let mut watch = LogWatch::new(settings.ready.clone());
        loop {
            tokio::time::sleep(settings.poll_interval).await;

            match watch.poll(&settings.log_path).await {
                Ok(found) => {
                    if let Some(m) = found.into_iter().next() {
                        let elapsed = server.started.elapsed();
                        tracing::info!(
                            session = %server.session,
                            elapsed_ms = elapsed.as_millis() as u64,
                            reported = ?m.group(1),
                            "server is ready"
                        );
                        return Ok(ReadyInfo {
                            session: server.session.clone(),
                            pid: server.pid,
                            elapsed,
                            reported_boot: m.group(1).map(str::to_string),
                        });
                    }
                }
                Err(e) => tracing::warn!(
                    error = %e,
                    path = %settings.log_path.display(),
                    "failed to read server log; retrying"
                ),
            }

            match server.child.try_wait() {
                Ok(Some(status)) => {
                    return Err(LifecycleError::ExitedBeforeReady {
                        exit_code: status.code(),
                    });
                }
                Ok(None) => {}
                Err(source) => return Err(LifecycleError::InterruptedWait { source }),
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    session = %server.session,
                    log_bytes_scanned = watch.position(),
                    "ready line never appeared"
                );
                return Err(LifecycleError::StartTimeout {
                    timeout_secs: settings.start_timeout.as_secs(),
                });
            }
        }
    }

    async fn abort_start(&mut self) {
        if let Some(mut server) = self.running.take() {
            signal_group(&mut server, Signal::Kill);
            if tokio::time::timeout(KILL_REAP_TIMEOUT, server.child.wait())
                .await
                .is_err()
            {
                tracing::warn!(session = %server.session, "server did not exit after SIGKILL");
            }
            if let Err(e) = self.archive_log(&server.started_at).await {
                tracing::warn!(error = %e, "failed to archive log of failed start");
            }
        }
        self.set_state(ServerState::Stopped);
    }

    /// Stop the server: stop command on stdin, then SIGTERM, then SIGKILL.
    ///
    /// Once a process was running the slot is always cleared, even when the
    /// wait or the log archive fails.
    pub async fn stop(&mut self, reason: StopReason) -> Result<StopInfo, LifecycleError> {
        if self.reap_exited().await.is_some() {
            return Err(LifecycleError::NotRunning);
        }
        let Some(mut server) = self.running.take() else {
            return Err(LifecycleError::NotRunning);
        };
        self.set_state(ServerState::Stopping);
        tracing::info!(session = %server.session, ?reason, "stopping server");

        let mut warnings = Vec::new();
        let mut graceful = false;
        if let Some(mut stdin) = server.stdin.take() {
            match write_line(&mut stdin, &self.settings.stop_command).await {
                Ok(()) => graceful = true,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to send stop command");
                    warnings.push(format!("failed to send stop command: {e}"));
                }
            }
            // Dropping stdin closes it, so the server also sees EOF.
        }

        let exit = self.wait_for_exit(&mut server, graceful).await;

        let archived_log = match self.archive_log(&server.started_at).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to archive server log");
                warnings.push(e.to_string());
                None
            }
        };
        self.set_state(ServerState::Stopped);

        let (exit_code, forced) = exit.map_err(|source| {
            tracing::error!(error = %source, "wait for server exit failed");
            LifecycleError::InterruptedWait { source }
        })?;
        let uptime = server.started.elapsed();
        tracing::info!(
            session = %server.session,
            exit_code = ?exit_code,
            forced,
            uptime_secs = uptime.as_secs(),
            "server stopped"
        );

        Ok(StopInfo {
            session: server.session,
            reason,
            exit_code,
            forced,
            uptime,
            archived_log,
            warnings,
        })
    }

    async fn wait_for_exit(
        &self,
        server: &mut RunningServer,
        graceful: bool,
    ) -> io::Result<(Option<i32>, bool)> {
        let timeout = self.settings.stop_timeout;
        let grace = self.settings.graceful_term_grace.min(timeout);
        // Without a stop command there is nothing to wait for before SIGTERM.
        let term_after = if graceful {
            timeout - grace
        } else {
            Duration::ZERO
        };

        if let Ok(res) = tokio::time::timeout(term_after, server.child.wait()).await {
            return res.map(|s| (s.code(), false));
        }

        tracing::warn!(session = %server.session, "server still running; sending SIGTERM");
        signal_group(server, Signal::Term);
        if let Ok(res) = tokio::time::timeout(timeout - term_after, server.child.wait()).await {
            return res.map(|s| (s.code(), true));
        }

        tracing::warn!(
            session = %server.session,
            timeout_ms = timeout.as_millis() as u64,
            "server did not exit in time; sending SIGKILL"
        );
        signal_group(server, Signal::Kill);
        let status = server.child.wait().await?;
        Ok((status.code(), true))
    }

    /// Rename the live log to its session archive name, replacing any
    /// archive of the same name.
    async fn archive_log(
        &self,
        started_at: &DateTime<Local>,
    ) -> Result<Option<PathBuf>, LifecycleError> {
        let live = &self.settings.log_path;
        match tokio::fs::metadata(live).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LifecycleError::io("inspect server log")(e)),
        }

        let target = live.with_file_name(archive_log_name(started_at));
        match tokio::fs::remove_file(&target).await {
            Ok(()) => tracing::info!(path = %target.display(), "replacing existing log archive"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LifecycleError::io("replace archived server log")(e)),
        }
        tokio::fs::rename(live, &target)
            .await
            .map_err(LifecycleError::io("archive server log"))?;
        tracing::info!(path = %target.display(), "server log archived");
        Ok(Some(target))
    }

    /// Clear the slot if the process exited without being asked to.
    pub async fn reap_exited(&mut self) -> Option<StopInfo> {
        let server = self.running.as_mut()?;
        let status = match server.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to query server process");
                return None;
            }
        };

        let server = self.running.take()?;
        tracing::warn!(
            session = %server.session,
            exit_code = ?status.code(),
            "server process exited unexpectedly"
        );

        let mut warnings = Vec::new();
        let archived_log = match self.archive_log(&server.started_at).await {
            Ok(p) => p,
            Err(e) => {
                warnings.push(e.to_string());
                None
            }
        };
        self.set_state(ServerState::Stopped);

        Some(StopInfo {
            session: server.session,
            reason: StopReason::Crashed,
            exit_code: status.code(),
            forced: false,
            uptime: server.started.elapsed(),
            archived_log,
            warnings,
        })
    }

    /// Ask the server for its player list and read the answer from the log.
    ///
    /// The answer is whatever the log holds after `settle_delay`; there is no
    /// acknowledgement from the server.
    pub async fn query_player_activity(&mut self) -> Result<PlayerCount, LifecycleError> {
        if self.reap_exited().await.is_some() || !matches!(self.state(), ServerState::Running) {
            return Err(LifecycleError::NotRunning);
        }
        let settings = &self.settings;
        let stdin = self
            .running
            .as_mut()
            .and_then(|s| s.stdin.as_mut())
            .ok_or(LifecycleError::NotRunning)?;

        write_line(stdin, &settings.list_command)
            .await
            .map_err(LifecycleError::io("send list command"))?;
        tokio::time::sleep(settings.settle_delay).await;

        let scan = log_tail::find_pattern(&settings.log_path, &settings.players, 0)
            .await
            .map_err(LifecycleError::io("read server log"))?;
        let count = scan
            .into_iter()
            .filter_map(|m| parse_player_count(&m))
            .last()
            .ok_or(LifecycleError::NoDataFound)?;
        tracing::debug!(online = count.online, max = count.max, "player count");
        Ok(count)
    }
}
