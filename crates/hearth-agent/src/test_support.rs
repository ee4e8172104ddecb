//! A shell script that behaves enough like a game server for lifecycle tests.

use std::{path::Path, sync::Mutex, time::Duration};

use hearth_process::ChannelId;
use regex::Regex;

use crate::config::{DEFAULT_PLAYER_PATTERN, DEFAULT_READY_PATTERN};
use crate::reply::{Notifier, Reply};
use crate::status::{HostMetrics, MetricsProvider};
use crate::supervisor::SupervisorSettings;

/// Boots, answers `list` with `$1` online players, exits on `stop`.
pub(crate) const FAKE_SERVER: &str = r#"echo "[Server thread/INFO]: Starting minecraft server version 1.21"
sleep 0.1
echo '[Server thread/INFO]: Done (1.25s)! For help, type "help"'
while IFS= read -r line; do
  case "$line" in
    stop) echo "[Server thread/INFO]: Stopping the server"; exit 0 ;;
    list) echo "[Server thread/INFO]: There are $1 of a max of 20 players online" ;;
  esac
done
"#;

/// Like [`FAKE_SERVER`] but never answers `list`.
pub(crate) const SILENT_SERVER: &str = r#"echo '[Server thread/INFO]: Done (0.50s)! For help, type "help"'
while IFS= read -r line; do
  case "$line" in
    stop) exit 0 ;;
  esac
done
"#;

/// Ignores both `stop` and SIGTERM; only SIGKILL ends it.
pub(crate) const STUBBORN_SERVER: &str = r#"trap '' TERM
echo '[Server thread/INFO]: Done (0.10s)! For help, type "help"'
while :; do sleep 0.05; done"#;

pub(crate) fn settings(dir: &Path, script: &str, players: u32) -> SupervisorSettings {
    SupervisorSettings {
        program: "/bin/sh".to_string(),
        args: vec![
            "-c".to_string(),
            script.to_string(),
            "fake-server".to_string(),
            players.to_string(),
        ],
        server_dir: dir.to_path_buf(),
        log_path: dir.join("logs").join("latest.log"),
        ready: Regex::new(DEFAULT_READY_PATTERN).unwrap(),
        players: Regex::new(DEFAULT_PLAYER_PATTERN).unwrap(),
        stop_command: "stop".to_string(),
        list_command: "list".to_string(),
        poll_interval: Duration::from_millis(20),
        start_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(5),
        graceful_term_grace: Duration::from_secs(1),
        settle_delay: Duration::from_millis(150),
    }
}

/// Keeps every reply it is handed.
#[derive(Default)]
pub(crate) struct Recorder {
    sent: Mutex<Vec<(ChannelId, Reply)>>,
}

impl Recorder {
    pub(crate) fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.render())
            .collect()
    }

    pub(crate) fn channels(&self) -> Vec<ChannelId> {
        self.sent.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }
}

impl Notifier for Recorder {
    fn send(&self, channel: &ChannelId, reply: Reply) {
        self.sent.lock().unwrap().push((channel.clone(), reply));
    }
}

pub(crate) struct FixedMetrics;

impl MetricsProvider for FixedMetrics {
    fn sample(&self) -> HostMetrics {
        HostMetrics {
            arch: "x86_64".to_string(),
            cpu_load: Some(0.25),
            load_avg_1m: Some(0.5),
            processors: 2,
            total_memory_bytes: 1 << 30,
            free_memory_bytes: 1 << 29,
            agent_uptime_secs: 1,
        }
    }
}
