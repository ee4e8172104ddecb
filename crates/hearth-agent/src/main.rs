use std::{future::Future, sync::Arc};

use anyhow::Context;
use hearth_process::ChannelId;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod controller;
mod error;
mod idle;
mod log_tail;
mod reply;
mod status;
mod supervisor;
#[cfg(test)]
mod test_support;

use config::AgentConfig;
use controller::{Controller, ControllerOptions};
use reply::{Notifier, Reply};
use status::ProcMetrics;
use supervisor::{ProcessSupervisor, SupervisorSettings};

/// Prints replies on stdout; agent logs go to stderr.
struct ConsoleNotifier {
    json: bool,
}

#[derive(Serialize)]
struct ConsoleLine<'a> {
    channel: &'a ChannelId,
    reply: &'a Reply,
}

impl Notifier for ConsoleNotifier {
    fn send(&self, channel: &ChannelId, reply: Reply) {
        if !self.json {
            println!("[{channel}] {}", reply.render());
            return;
        }
        match serde_json::to_string(&ConsoleLine {
            channel,
            reply: &reply,
        }) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode reply"),
        }
    }
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match config::env_string("HEARTH_AGENT_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hearth-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

/// Feed console lines to the controller until `shutdown` resolves. A closed
/// or unreadable console only detaches input; the agent keeps supervising.
async fn run_console<R>(
    ctl: &Controller,
    channel: ChannelId,
    mut lines: Lines<R>,
    shutdown: impl Future<Output = ()>,
) where
    R: AsyncBufRead + Unpin,
{
    tokio::pin!(shutdown);
    let mut attached = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if attached => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    // Commands run concurrently so status queries can see Busy.
                    let ctl = ctl.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        ctl.handle_line(&line, Some(channel)).await;
                    });
                }
                Ok(None) => {
                    tracing::info!("console detached; waiting for interrupt");
                    attached = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read console; waiting for interrupt");
                    attached = false;
                }
            },
            _ = &mut shutdown => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let cfg = AgentConfig::load()?;
    let settings = SupervisorSettings::from_config(&cfg).context("compile log patterns")?;
    tracing::info!(
        server_dir = %cfg.server_dir.display(),
        program = %cfg.program,
        idle_timeout_minutes = cfg.idle_timeout_minutes,
        "hearth-agent starting"
    );

    let ctl = Controller::new(
        ProcessSupervisor::new(settings),
        ControllerOptions::from_config(&cfg),
        Arc::new(ConsoleNotifier {
            json: cfg.console_json,
        }),
        Arc::new(ProcMetrics::new()),
    );
    let probe = cfg
        .activity_probe_interval()
        .map(|every| ctl.spawn_activity_probe(every));

    let lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for interrupt");
            std::future::pending::<()>().await;
        }
        tracing::info!("interrupt received");
    };
    run_console(
        &ctl,
        ChannelId::new(cfg.console_channel.clone()),
        lines,
        interrupted,
    )
    .await;

    if let Some(probe) = probe {
        probe.abort();
    }
    if let Some(info) = ctl.shutdown().await {
        tracing::info!(session = %info.session, "server stopped on agent shutdown");
    }
    Ok(())
}
