use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use hearth_process::{ChannelId, PlayerCount, ServerState, ServerStatus, StopReason};
use tokio::{
    sync::{Mutex, MutexGuard, mpsc, watch},
    task::JoinHandle,
};

use crate::config::AgentConfig;
use crate::error::LifecycleError;
use crate::idle::IdleScheduler;
use crate::reply::{Notifier, Reply};
use crate::status::{self, MetricsProvider, StatusReport};
use crate::supervisor::{ProcessSupervisor, ReadyInfo, StopInfo};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Status,
    PlayerQuery,
}

impl Command {
    pub fn parse(input: &str) -> Option<Self> {
        let verb = input.trim().trim_start_matches('/').to_ascii_lowercase();
        match verb.as_str() {
            "start" | "startserver" => Some(Command::Start),
            "stop" | "stopserver" => Some(Command::Stop),
            "restart" | "restartserver" => Some(Command::Restart),
            "status" | "serverstatus" => Some(Command::Status),
            "player-query" | "playercount" | "players" => Some(Command::PlayerQuery),
            _ => None,
        }
    }

    fn acknowledgement(self) -> &'static str {
        match self {
            Command::Start => "⏳ Waiting for the server to start...",
            Command::Stop => "🔴 Stopping server...",
            Command::Restart => "🔄 Rebooting...",
            Command::Status => "🔍 Checking server status...",
            Command::PlayerQuery => "👥 Fetching player count...",
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatusOutcome {
    Offline,
    /// The process is alive but the game port refuses connections.
    PortClosed(ServerStatus),
    Online(StatusReport),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub idle_timeout: Duration,
    pub restart_delay: Duration,
    pub server_port: u16,
}

impl ControllerOptions {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout(),
            restart_delay: cfg.restart_delay(),
            server_port: cfg.server_port,
        }
    }
}

struct Inner {
    supervisor: Mutex<ProcessSupervisor>,
    state: watch::Receiver<ServerState>,
    idle: IdleScheduler,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsProvider>,
    opts: ControllerOptions,
}

/// Serializes lifecycle commands against one [`ProcessSupervisor`] and owns
/// the idle timer.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .field("idle", &self.inner.idle)
            .finish()
    }
}

fn reject_when_stopped(state: ServerState) -> Option<LifecycleError> {
    state.is_stopped().then_some(LifecycleError::NotRunning)
}

fn log_ready(ready: &ReadyInfo) {
    tracing::info!(
        session = %ready.session,
        pid = ?ready.pid,
        boot_secs = ?ready.reported_boot_secs(),
        "server started"
    );
}

async fn idle_listener(inner: Weak<Inner>, mut fires: mpsc::UnboundedReceiver<u64>) {
    while let Some(generation) = fires.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Controller { inner }.idle_stop(generation).await;
    }
}

impl Controller {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        supervisor: ProcessSupervisor,
        opts: ControllerOptions,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsProvider>,
    ) -> Self {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let idle = IdleScheduler::new(opts.idle_timeout, move |generation| {
            let _ = fire_tx.send(generation);
        });
        let inner = Arc::new(Inner {
            state: supervisor.subscribe(),
            supervisor: Mutex::new(supervisor),
            idle,
            notifier,
            metrics,
            opts,
        });
        tokio::spawn(idle_listener(Arc::downgrade(&inner), fire_rx));
        Self { inner }
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    #[cfg(test)]
    pub fn idle(&self) -> &IdleScheduler {
        &self.inner.idle
    }

    fn notify(&self, channel: Option<&ChannelId>, reply: Reply) {
        match channel {
            Some(c) => self.inner.notifier.send(c, reply),
            None => tracing::warn!(reply = %reply.render(), "no channel to deliver reply to"),
        }
    }

    /// Take the lifecycle lock. While another command holds it, fail fast
    /// with whatever `rejects` returns for the published state.
    async fn lock_lifecycle(
        &self,
        rejects: fn(ServerState) -> Option<LifecycleError>,
    ) -> Result<MutexGuard<'_, ProcessSupervisor>, LifecycleError> {
        if let Ok(guard) = self.inner.supervisor.try_lock() {
            return Ok(guard);
        }
        if let Some(err) = rejects(self.state()) {
            return Err(err);
        }
        Ok(self.inner.supervisor.lock().await)
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, ProcessSupervisor>, LifecycleError> {
        self.inner
            .supervisor
            .try_lock()
            .map_err(|_| LifecycleError::Busy)
    }

    fn report_stop(&self, channel: Option<&ChannelId>, info: &StopInfo) {
        tracing::info!(
            session = %info.session,
            reason = ?info.reason,
            forced = info.forced,
            uptime_secs = info.uptime.as_secs(),
            archived_log = ?info.archived_log,
            "server session ended"
        );
        self.notify(channel, Reply::stopped(info));
    }

    /// Report a server that died on its own and drop its idle timer.
    /// Returns whether anything was reaped.
    async fn reap_crash(&self, sup: &mut ProcessSupervisor) -> bool {
        let Some(info) = sup.reap_exited().await else {
            return false;
        };
        self.inner.idle.disarm();
        self.report_stop(sup.bound_channel(), &info);
        true
    }

    async fn after_start(&self, sup: &mut ProcessSupervisor) {
        self.inner.idle.arm();
        match sup.query_player_activity().await {
            Ok(count) if count.is_active() => {
                tracing::info!(online = count.online, "players already online; idle timer reset");
                self.inner.idle.arm();
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "initial player query failed"),
        }
    }

    pub async fn start(&self, channel: Option<ChannelId>) -> Result<ReadyInfo, LifecycleError> {
        let channel = channel.ok_or(LifecycleError::InvalidChannelContext)?;
        let mut sup = self
            .lock_lifecycle(|s| match s {
                ServerState::Stopped => None,
                ServerState::Stopping => Some(LifecycleError::Busy),
                ServerState::Starting | ServerState::Running => {
                    Some(LifecycleError::AlreadyRunning)
                }
            })
            .await?;
        self.reap_crash(&mut sup).await;

        let ready = sup.start(channel).await?;
        log_ready(&ready);
        self.after_start(&mut sup).await;
        Ok(ready)
    }

    async fn stop_locked(&self, sup: &mut ProcessSupervisor) -> Result<StopInfo, LifecycleError> {
        self.reap_crash(sup).await;
        let result = sup.stop(StopReason::ManualStop).await;
        if sup.state().is_stopped() {
            self.inner.idle.disarm();
        }
        result
    }

    pub async fn stop(&self) -> Result<StopInfo, LifecycleError> {
        let mut sup = self.lock_lifecycle(reject_when_stopped).await?;
        self.stop_locked(&mut sup).await
    }

    /// Stop, wait `restart_delay`, start again on `channel` (or the bound
    /// channel). The lifecycle lock is held throughout.
    pub async fn restart(&self, channel: Option<ChannelId>) -> Result<ReadyInfo, LifecycleError> {
        let mut sup = self.lock_lifecycle(reject_when_stopped).await?;

        let stopped = self.stop_locked(&mut sup).await?;
        let target = channel.or_else(|| sup.bound_channel().cloned());
        self.report_stop(target.as_ref(), &stopped);
        self.notify(target.as_ref(), Reply::text("🛠️ Restarting server"));

        tokio::time::sleep(self.inner.opts.restart_delay).await;

        let started = match target {
            Some(c) => sup.start(c).await,
            None => Err(LifecycleError::InvalidChannelContext),
        };
        match started {
            Ok(ready) => {
                log_ready(&ready);
                self.after_start(&mut sup).await;
                Ok(ready)
            }
            Err(e) => Err(LifecycleError::RestartPartialFailure {
                source: Box::new(e),
            }),
        }
    }

    pub async fn status(&self) -> Result<StatusOutcome, LifecycleError> {
        let server = {
            let mut sup = self.try_lock()?;
            self.reap_crash(&mut sup).await;
            if !sup.is_alive() {
                return Ok(StatusOutcome::Offline);
            }
            sup.status()
        };

        let port = self.inner.opts.server_port;
        if !status::port_open(port, PORT_PROBE_TIMEOUT).await {
            tracing::warn!(port, "server process is running, but the port is closed");
            return Ok(StatusOutcome::PortClosed(server));
        }
        let idle = self.inner.idle.snapshot();
        tracing::debug!(armed = idle.armed, arms = idle.arms, "idle timer state");
        Ok(StatusOutcome::Online(StatusReport {
            server,
            port,
            idle_shutdown_in_secs: idle.remaining.filter(|_| idle.armed).map(|d| d.as_secs()),
            host: self.inner.metrics.sample(),
        }))
    }

    /// Any online player counts as activity and resets the idle timer.
    pub async fn player_query(&self) -> Result<PlayerCount, LifecycleError> {
        let mut sup = self.try_lock()?;
        self.reap_crash(&mut sup).await;
        let count = sup.query_player_activity().await?;
        if count.is_active() {
            tracing::info!(online = count.online, "player activity detected; idle timer reset");
            self.inner.idle.arm();
        }
        Ok(count)
    }

    async fn idle_stop(&self, generation: u64) {
        let mut sup = self.inner.supervisor.lock().await;
        if !self.inner.idle.is_current(generation) {
            tracing::debug!(generation, "discarding superseded idle fire");
            return;
        }
        // A server that already died is reported as a crash, not an idle stop.
        if self.reap_crash(&mut sup).await {
            return;
        }
        match sup.stop(StopReason::IdleStop).await {
            Ok(info) => self.report_stop(sup.bound_channel(), &info),
            Err(LifecycleError::NotRunning) => {
                tracing::debug!("idle fire found no running server")
            }
            Err(e) => {
                tracing::warn!(error = %e, "idle stop failed");
                self.notify(sup.bound_channel(), Reply::error(&e));
            }
        }
    }

    /// One activity check; skipped while a lifecycle command runs.
    pub async fn probe_activity(&self) {
        let Ok(mut sup) = self.inner.supervisor.try_lock() else {
            tracing::debug!("lifecycle busy; skipping activity probe");
            return;
        };
        self.reap_crash(&mut sup).await;
        if !matches!(sup.state(), ServerState::Running) {
            return;
        }
        match sup.query_player_activity().await {
            Ok(count) if count.is_active() => {
                tracing::info!(online = count.online, "player activity detected; idle timer reset");
                self.inner.idle.arm();
            }
            Ok(_) => tracing::debug!("no players online"),
            Err(e) => tracing::debug!(error = %e, "activity probe failed"),
        }
    }

    pub fn spawn_activity_probe(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                this.probe_activity().await;
            }
        })
    }

    /// Stop a running server before the agent exits.
    pub async fn shutdown(&self) -> Option<StopInfo> {
        let mut sup = self.inner.supervisor.lock().await;
        self.inner.idle.disarm();
        if sup.state().is_stopped() {
            return None;
        }
        match sup.stop(StopReason::ManualStop).await {
            Ok(info) => {
                self.report_stop(sup.bound_channel(), &info);
                Some(info)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to stop server on shutdown");
                None
            }
        }
    }

    /// Run one operator command and send its acknowledgement and outcome to
    /// `channel`.
    pub async fn handle(&self, command: Command, channel: Option<ChannelId>) {
        let to = channel.as_ref();
        self.notify(to, Reply::text(command.acknowledgement()));
        tracing::info!(?command, channel = ?to.map(|c| c.0.as_str()), "command received");

        let reply = match command {
            Command::Start => self.start(channel.clone()).await.map(|r| Reply::ready(&r)),
            Command::Stop => self.stop().await.map(|s| Reply::stopped(&s)),
            Command::Restart => self.restart(channel.clone()).await.map(|r| Reply::ready(&r)),
            Command::Status => self.status().await.map(|s| match s {
                StatusOutcome::Offline => Reply::text("❌ Server is offline"),
                StatusOutcome::PortClosed(server) => Reply::text(match server.pid {
                    Some(pid) => {
                        format!("⚠️ Server is running (pid {pid}), but the port is closed.")
                    }
                    None => "⚠️ Server is running, but the port is closed.".to_string(),
                }),
                StatusOutcome::Online(report) => Reply::Status(report),
            }),
            Command::PlayerQuery => self.player_query().await.map(Reply::players),
        };

        let reply = reply.unwrap_or_else(|e| {
            tracing::warn!(?command, code = e.code(), error = %e, "command failed");
            Reply::error(&e)
        });
        self.notify(channel.as_ref(), reply);
    }

    /// Parse and run one line of operator input.
    pub async fn handle_line(&self, line: &str, channel: Option<ChannelId>) {
        match Command::parse(line) {
            Some(command) => self.handle(command, channel).await,
            None => {
                tracing::debug!(input = line, "unknown command");
                self.notify(channel.as_ref(), Reply::text("❌ Unknown command!"));
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorSettings;
    use crate::test_support::{self, FAKE_SERVER, FixedMetrics, Recorder, STUBBORN_SERVER};

    fn opts(idle_timeout: Duration) -> ControllerOptions {
        ControllerOptions {
            idle_timeout,
            restart_delay: Duration::from_millis(10),
            server_port: 1,
        }
    }

    fn controller(
        settings: SupervisorSettings,
        opts: ControllerOptions,
    ) -> (Controller, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let ctl = Controller::new(
            ProcessSupervisor::new(settings),
            opts,
            rec.clone(),
            Arc::new(FixedMetrics),
        );
        (ctl, rec)
    }

    fn ops() -> Option<ChannelId> {
        Some(ChannelId::new("ops"))
    }

    async fn wait_for_state(ctl: &Controller, want: ServerState) {
        for _ in 0..200 {
            if ctl.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("state never became {want:?}");
    }

    #[test]
    fn parses_verbs_and_aliases() {
        assert_eq!(Command::parse("start"), Some(Command::Start));
        assert_eq!(Command::parse("/startserver"), Some(Command::Start));
        assert_eq!(Command::parse(" StopServer "), Some(Command::Stop));
        assert_eq!(Command::parse("restartserver"), Some(Command::Restart));
        assert_eq!(Command::parse("serverstatus"), Some(Command::Status));
        assert_eq!(Command::parse("players"), Some(Command::PlayerQuery));
        assert_eq!(Command::parse("playercount"), Some(Command::PlayerQuery));
        assert_eq!(Command::parse("dance"), None);
    }

    #[tokio::test]
    async fn start_with_no_players_arms_once() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 0),
            opts(Duration::from_secs(600)),
        );

        ctl.start(ops()).await.unwrap();
        let snap = ctl.idle().snapshot();
        assert!(snap.armed);
        assert_eq!(snap.arms, 1);

        ctl.stop().await.unwrap();
        assert!(!ctl.idle().snapshot().armed);
    }

    #[tokio::test]
    async fn start_with_players_rearms() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 3),
            opts(Duration::from_secs(600)),
        );

        ctl.start(ops()).await.unwrap();
        assert_eq!(ctl.idle().snapshot().arms, 2);

        // Each answered query with players online counts as activity.
        let count = ctl.player_query().await.unwrap();
        assert_eq!(count, PlayerCount { online: 3, max: 20 });
        assert_eq!(ctl.idle().snapshot().arms, 3);

        ctl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_needs_a_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 0),
            opts(Duration::from_secs(600)),
        );

        let err = ctl.start(None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidChannelContext));
        assert_eq!(ctl.state(), ServerState::Stopped);
        assert_eq!(ctl.idle().snapshot().arms, 0);
    }

    #[tokio::test]
    async fn idle_fire_stops_server_once() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, rec) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 0),
            opts(Duration::from_millis(400)),
        );

        ctl.start(ops()).await.unwrap();
        wait_for_state(&ctl, ServerState::Stopped).await;
        // Give the listener time to send its reply after the state flips.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let idle_replies = rec
            .texts()
            .iter()
            .filter(|t| t.contains("stopped due to inactivity"))
            .count();
        assert_eq!(idle_replies, 1);
        assert!(rec.channels().iter().all(|c| c.0 == "ops"));

        let archived = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("log_"))
            .count();
        assert_eq!(archived, 1);

        let err = ctl.stop().await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotRunning));
    }

    #[tokio::test]
    async fn idle_fire_after_crash_reports_the_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo '[Server thread/INFO]: Done (0.20s)! For help, type "help"'
sleep 0.3
exit 7"#;
        let mut settings = test_support::settings(dir.path(), script, 0);
        settings.settle_delay = Duration::from_millis(10);
        let (ctl, rec) = controller(settings, opts(Duration::from_millis(700)));

        ctl.start(ops()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(ctl.state(), ServerState::Stopped);
        assert!(!ctl.idle().snapshot().armed);
        let texts = rec.texts();
        assert!(
            texts
                .iter()
                .any(|t| t == "⚠️ Server exited unexpectedly (exit code 7).")
        );
        assert!(!texts.iter().any(|t| t.contains("inactivity")));
    }

    #[tokio::test]
    async fn manual_stop_cancels_idle_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, rec) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 0),
            opts(Duration::from_millis(500)),
        );

        ctl.start(ops()).await.unwrap();
        ctl.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert!(!rec.texts().iter().any(|t| t.contains("inactivity")));
        assert_eq!(ctl.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn queries_fail_fast_while_starting() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!("sleep 0.6\n{FAKE_SERVER}");
        let (ctl, _) = controller(
            test_support::settings(dir.path(), &script, 0),
            opts(Duration::from_secs(600)),
        );

        let starting = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.start(ops()).await }
        });
        wait_for_state(&ctl, ServerState::Starting).await;

        assert!(matches!(ctl.status().await, Err(LifecycleError::Busy)));
        assert!(matches!(ctl.player_query().await, Err(LifecycleError::Busy)));
        assert!(matches!(
            ctl.start(ops()).await,
            Err(LifecycleError::AlreadyRunning)
        ));

        starting.await.unwrap().unwrap();
        assert_eq!(ctl.state(), ServerState::Running);
        ctl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_while_stopping_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_support::settings(dir.path(), STUBBORN_SERVER, 0);
        settings.stop_timeout = Duration::from_millis(600);
        settings.graceful_term_grace = Duration::from_millis(300);
        let (ctl, _) = controller(settings, opts(Duration::from_secs(600)));

        ctl.start(ops()).await.unwrap();
        let stopping = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.stop().await }
        });
        wait_for_state(&ctl, ServerState::Stopping).await;

        assert!(matches!(ctl.start(ops()).await, Err(LifecycleError::Busy)));

        let stopped = stopping.await.unwrap().unwrap();
        assert!(stopped.forced);
        assert_eq!(ctl.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn restart_rebinds_channel_and_rearms() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, rec) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 2),
            opts(Duration::from_secs(600)),
        );

        ctl.start(ops()).await.unwrap();
        assert_eq!(ctl.idle().snapshot().arms, 2);

        let ready = ctl
            .restart(Some(ChannelId::new("night-shift")))
            .await
            .unwrap();
        assert!(ready.pid.is_some());
        assert_eq!(ctl.state(), ServerState::Running);
        let snap = ctl.idle().snapshot();
        assert!(snap.armed);
        assert_eq!(snap.arms, 4);

        // Later unsolicited replies go to the channel the restart came from.
        ctl.shutdown().await.unwrap();
        let sent = rec.channels();
        assert_eq!(sent.last(), Some(&ChannelId::new("night-shift")));
        assert!(
            rec.texts()
                .iter()
                .any(|t| t == "✅ Server has safely shut down.")
        );
    }

    #[tokio::test]
    async fn activity_check_rearms_with_players_online() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 1),
            opts(Duration::from_secs(600)),
        );

        ctl.start(ops()).await.unwrap();
        assert_eq!(ctl.idle().snapshot().arms, 2);

        ctl.probe_activity().await;
        let snap = ctl.idle().snapshot();
        assert!(snap.armed);
        assert_eq!(snap.arms, 3);

        ctl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn activity_check_leaves_empty_server_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 0),
            opts(Duration::from_secs(600)),
        );

        ctl.start(ops()).await.unwrap();
        ctl.probe_activity().await;
        assert_eq!(ctl.idle().snapshot().arms, 1);

        ctl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_reports_failed_second_start() {
        let dir = tempfile::tempdir().unwrap();
        // Runs once; the second launch exits before it is ready.
        let script = format!("if [ -f started ]; then exit 4; fi\ntouch started\n{FAKE_SERVER}");
        let (ctl, rec) = controller(
            test_support::settings(dir.path(), &script, 0),
            opts(Duration::from_secs(600)),
        );

        ctl.start(ops()).await.unwrap();
        let err = ctl.restart(None).await.unwrap_err();
        match err {
            LifecycleError::RestartPartialFailure { source } => assert!(matches!(
                *source,
                LifecycleError::ExitedBeforeReady { exit_code: Some(4) }
            )),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ctl.state(), ServerState::Stopped);
        assert!(!ctl.idle().snapshot().armed);

        let texts = rec.texts();
        assert!(texts.iter().any(|t| t == "✅ Server has safely shut down."));
        assert!(texts.iter().any(|t| t == "🛠️ Restarting server"));
    }

    #[tokio::test]
    async fn restart_while_stopped_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 0),
            opts(Duration::from_secs(600)),
        );
        let err = ctl.restart(ops()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotRunning));
    }

    #[tokio::test]
    async fn status_reports_offline_and_online() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let mut o = opts(Duration::from_secs(600));
        o.server_port = listener.local_addr().unwrap().port();
        let (ctl, _) = controller(test_support::settings(dir.path(), FAKE_SERVER, 0), o);

        assert!(matches!(ctl.status().await.unwrap(), StatusOutcome::Offline));

        ctl.start(ops()).await.unwrap();
        match ctl.status().await.unwrap() {
            StatusOutcome::Online(report) => {
                assert_eq!(report.server.state, ServerState::Running);
                assert!(report.server.pid.is_some());
                assert_eq!(report.host, FixedMetrics.sample());
            }
            other => panic!("expected online, got {other:?}"),
        }

        drop(listener);
        assert!(matches!(
            ctl.status().await.unwrap(),
            StatusOutcome::PortClosed(_)
        ));
        ctl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn handle_sends_ack_then_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, rec) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 2),
            opts(Duration::from_secs(600)),
        );

        ctl.handle_line("dance", ops()).await;
        ctl.handle_line("startserver", ops()).await;
        ctl.handle_line("playercount", ops()).await;
        ctl.handle_line("stopserver", ops()).await;
        ctl.handle_line("stopserver", ops()).await;

        assert_eq!(
            rec.texts(),
            vec![
                "❌ Unknown command!",
                "⏳ Waiting for the server to start...",
                "✅ Server is ready! (Started in 1.25s)",
                "👥 Fetching player count...",
                "📊 Players Online: 2/20",
                "🔴 Stopping server...",
                "✅ Server has safely shut down.",
                "🔴 Stopping server...",
                "⚠️ No server is currently running!",
            ]
        );
    }

    #[tokio::test]
    async fn activity_check_reports_crash_and_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo '[Server thread/INFO]: Done (0.20s)! For help, type "help"'
sleep 0.3
exit 7"#;
        let mut settings = test_support::settings(dir.path(), script, 0);
        settings.settle_delay = Duration::from_millis(10);
        let (ctl, rec) = controller(settings, opts(Duration::from_secs(600)));

        ctl.start(ops()).await.unwrap();
        assert!(ctl.idle().snapshot().armed);
        tokio::time::sleep(Duration::from_millis(700)).await;

        ctl.probe_activity().await;
        assert_eq!(ctl.state(), ServerState::Stopped);
        assert!(!ctl.idle().snapshot().armed);
        assert!(
            rec.texts()
                .iter()
                .any(|t| t == "⚠️ Server exited unexpectedly (exit code 7).")
        );
    }

    #[tokio::test]
    async fn shutdown_stops_running_server() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(
            test_support::settings(dir.path(), FAKE_SERVER, 0),
            opts(Duration::from_secs(600)),
        );

        assert!(ctl.shutdown().await.is_none());
        ctl.start(ops()).await.unwrap();
        let info = ctl.shutdown().await.unwrap();
        assert_eq!(info.reason, StopReason::ManualStop);
        assert_eq!(ctl.state(), ServerState::Stopped);
    }
}
