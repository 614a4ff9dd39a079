//! greenroomd - session daemon
//!
//! Speaks newline-delimited JSON frames: calls come in on stdin, replies
//! and notifications go out on stdout. Logs go to stderr. Closing stdin
//! stops the daemon once every pending call has its reply.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use greenconf::GreenConfig;
use greenproto::{Frame, JsonLines, Message, Notification, WireFormat};
use greenroom::{
    telemetry, BroadcastSink, Daemon, DaemonConfig, DaemonHandle, NixProcessControl, NoRichProtocol, ProcessHost,
    SharedSink, ShellAudioServer, ShellCommands, ShellLoader, Studio, StudioOptions,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notifications buffered per subscriber before a slow reader lags.
const NOTIFICATION_BUFFER: usize = 1024;

/// Greenroom session daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file, read after the system and user configs
    #[arg(long)]
    config: Option<PathBuf>,

    /// Studio name
    #[arg(long)]
    studio_name: Option<String>,

    /// Log filter, e.g. "info" or "greenroom=debug"
    #[arg(long)]
    log_level: Option<String>,

    /// Start the studio right away
    #[arg(long)]
    autostart: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GreenConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(name) = cli.studio_name {
        config.bootstrap.studio.name = name;
    }
    if let Some(level) = cli.log_level {
        config.infra.telemetry.log_level = level;
    }
    if cli.autostart {
        config.bootstrap.studio.autostart = true;
    }

    if cli.show_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    telemetry::init(&config.infra.telemetry.log_level).context("Failed to initialize logging")?;
    info!("greenroomd {} starting", env!("CARGO_PKG_VERSION"));

    let state_dir = config.infra.paths.state_dir.clone();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;
    info!("state directory: {}", state_dir.display());
    info!("projects directory: {}", config.infra.paths.projects_dir.display());

    let sink = Arc::new(BroadcastSink::new(NOTIFICATION_BUFFER));
    let notifications = sink.subscribe();
    let shared: SharedSink = sink.clone();

    let loader = &config.infra.loader;
    let host = ProcessHost {
        loader: Arc::new(ShellLoader::new(loader.shell.clone(), &loader.terminal)),
        control: Arc::new(NixProcessControl),
        rich: Arc::new(NoRichProtocol),
        sink: shared,
        base_dir: state_dir,
    };

    let audio = &config.infra.audio_server;
    // Only start/stop/connect outcomes arrive on this feed; no live client
    // or port watcher is wired in.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let server = ShellAudioServer::new(
        ShellCommands {
            shell: loader.shell.clone(),
            start: audio.start_command.clone(),
            stop: audio.stop_command.clone(),
            connect: audio.connect_command.clone(),
            disconnect: audio.disconnect_command.clone(),
        },
        events_tx,
    );

    let studio_config = &config.bootstrap.studio;
    let studio = Studio::new(
        StudioOptions {
            name: studio_config.name.clone(),
            projects_dir: config.infra.paths.projects_dir.clone(),
        },
        host,
        Arc::new(server),
    );
    let (daemon, handle) = Daemon::new(
        studio,
        DaemonConfig {
            pump_interval: Duration::from_millis(studio_config.pump_interval_ms.max(1)),
            autostart: studio_config.autostart,
        },
        events_rx,
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(wait_for_signal(shutdown_tx));

    let session = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(out_rx));
    tokio::spawn(forward_notifications(session, notifications, out_tx.clone()));
    tokio::spawn(read_calls(handle, out_tx));

    daemon.run(shutdown_rx).await?;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal(shutdown_tx: broadcast::Sender<()>) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot watch SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    let _ = shutdown_tx.send(());
}

/// Decode calls from stdin; each call waits for its reply on its own task.
async fn read_calls(handle: DaemonHandle, out: mpsc::UnboundedSender<Frame>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                warn!("stdin read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let call = match JsonLines::decode::<Frame>(line.as_bytes()) {
            Ok(Frame::Call(call)) => call,
            Ok(other) => {
                warn!("ignoring non-call frame: {:?}", other);
                continue;
            }
            Err(e) => {
                warn!("bad frame: {:#}", e);
                continue;
            }
        };

        let handle = handle.clone();
        let out = out.clone();
        tokio::spawn(async move {
            let reply = match handle.call(call.content).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("call failed: {:#}", e);
                    return;
                }
            };
            let frame = Frame::Reply(Message::reply(&call.header, "reply", reply));
            if out.send(frame).is_err() {
                debug!("output closed, reply dropped");
            }
        });
    }
}

async fn forward_notifications(
    session: Uuid,
    mut notifications: broadcast::Receiver<Notification>,
    out: mpsc::UnboundedSender<Frame>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                let frame = Frame::Notification(Message::new(session, "notification", notification));
                if out.send(frame).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_frames(mut frames: mpsc::UnboundedReceiver<Frame>) {
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = frames.recv().await {
        let bytes = match JsonLines::encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot encode frame: {:#}", e);
                continue;
            }
        };
        if let Err(e) = stdout.write_all(&bytes).await {
            warn!("stdout write failed: {}", e);
            break;
        }
        if let Err(e) = stdout.flush().await {
            warn!("stdout flush failed: {}", e);
            break;
        }
    }
}
