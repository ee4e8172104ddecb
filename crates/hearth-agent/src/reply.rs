use std::time::Duration;

use hearth_process::{ChannelId, PlayerCount, StopReason};
use serde::Serialize;

use crate::error::LifecycleError;
use crate::status::StatusReport;
use crate::supervisor::{ReadyInfo, StopInfo};

/// Longest text a reply channel accepts.
pub const MAX_REPLY_BYTES: usize = 2000;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Reply {
    Text(String),
    Status(StatusReport),
}

/// Where replies go. Sending never fails from the caller's point of view.
pub trait Notifier: Send + Sync {
    fn send(&self, channel: &ChannelId, reply: Reply);
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(truncate_utf8(&s.into(), MAX_REPLY_BYTES))
    }

    #[cfg(test)]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(t) => Some(t),
            Reply::Status(_) => None,
        }
    }

    /// Uses the server's own boot time when it reported one.
    pub fn ready(info: &ReadyInfo) -> Self {
        let secs = info
            .reported_boot_secs()
            .unwrap_or_else(|| info.elapsed.as_secs_f64());
        Reply::text(format!("✅ Server is ready! (Started in {secs:.2}s)"))
    }

    pub fn stopped(info: &StopInfo) -> Self {
        let mut out = match info.reason {
            StopReason::ManualStop => "✅ Server has safely shut down.".to_string(),
            StopReason::IdleStop => "❌ Server was stopped due to inactivity.".to_string(),
            StopReason::Crashed => match info.exit_code {
                Some(code) => format!("⚠️ Server exited unexpectedly (exit code {code})."),
                None => "⚠️ Server exited unexpectedly.".to_string(),
            },
        };
        if info.forced {
            out.push_str("\n⚠️ The server did not exit on its own and was killed.");
        }
        for w in &info.warnings {
            out.push_str("\n⚠️ ");
            out.push_str(w);
        }
        Reply::text(out)
    }

    pub fn players(count: PlayerCount) -> Self {
        Reply::text(format!("📊 Players Online: {}/{}", count.online, count.max))
    }

    pub fn error(err: &LifecycleError) -> Self {
        let msg = match err {
            LifecycleError::AlreadyRunning => "⚠️ Server is already running!".to_string(),
            LifecycleError::NotRunning => "⚠️ No server is currently running!".to_string(),
            LifecycleError::Busy => {
                "⏳ Another server command is in progress, try again shortly.".to_string()
            }
            LifecycleError::InvalidChannelContext => {
                "❌ This command can only be used in a text channel!".to_string()
            }
            LifecycleError::NoDataFound => "⚠️ Player count not found in logs.".to_string(),
            LifecycleError::InterruptedWait { .. } => {
                "❌ Server shutdown process was interrupted.".to_string()
            }
            LifecycleError::Io { .. } => format!("❌ Server I/O failed: {err}"),
            LifecycleError::Spawn { .. }
            | LifecycleError::StartTimeout { .. }
            | LifecycleError::ExitedBeforeReady { .. } => {
                format!("❌ Failed to start the server: {err}")
            }
            LifecycleError::RestartPartialFailure { source } => {
                format!("❌ Server stopped but failed to start again: {source}")
            }
        };
        Reply::text(msg)
    }

    /// Plain-text form for transports without rich formatting.
    pub fn render(&self) -> String {
        match self {
            Reply::Text(t) => t.clone(),
            Reply::Status(r) => truncate_utf8(&render_status(r), MAX_REPLY_BYTES),
        }
    }
}

fn hours_minutes(d: Duration) -> String {
    let mins = d.as_secs() / 60;
    format!("{:02} hours, {:02} minutes", mins / 60, mins % 60)
}

fn render_status(r: &StatusReport) -> String {
    let h = &r.host;
    let uptime = r.server.uptime_secs.map(Duration::from_secs).unwrap_or_default();
    let cpu = h
        .cpu_load
        .map(|v| format!("{:.2}%", v * 100.0))
        .unwrap_or_else(|| "N/A".to_string());
    let load = h
        .load_avg_1m
        .map(|v| format!("{v:.2}"))
        .unwrap_or_else(|| "N/A".to_string());

    let mut lines = vec![
        "Server Status".to_string(),
        format!(
            "✅ Server is currently running and accepting connections on port {}!",
            r.port
        ),
        format!("Uptime: {}", hours_minutes(uptime)),
    ];
    if let Some(pid) = r.server.pid {
        lines.push(format!("PID: {pid}"));
    }
    if let Some(secs) = r.idle_shutdown_in_secs {
        lines.push(format!(
            "Idle shutdown in: {}",
            hours_minutes(Duration::from_secs(secs))
        ));
    }
    lines.extend([
        format!("Arch Name: {}", h.arch),
        format!("CPU Load: {cpu}"),
        format!("System Load Average: {load}"),
        format!("Processors: {}", h.processors),
        format!("Total Memory: {} MB", h.total_memory_bytes / MIB),
        format!("Used Memory: {} MB", h.used_memory_bytes() / MIB),
        format!("Free Memory: {} MB", h.free_memory_bytes / MIB),
    ]);
    lines.join("\n")
}
