use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use strokesync_replay::{read_log, verify_log, write_log};
use strokesync_server::{
    Clock, Coordinator, CoordinatorError, FileArchive, MemoryArchive, ServerConfig,
    SessionArchive, SystemClock, TeeArchive, log_config,
};
use strokesync_store::UserId;
use strokesync_wire::RawTelemetryProto;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strokesync", version, about = "Live rowing session coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a simulated multi-participant session and verify its log.
    Demo {
        /// TOML configuration file.
        #[arg(long, env = "STROKESYNC_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 2)]
        participants: u64,

        /// Reports sent by each participant.
        #[arg(long, default_value_t = 10)]
        strokes: u64,

        /// Target distance in metres; the session completes once everyone
        /// reaches it.
        #[arg(long)]
        target: Option<f64>,

        /// Write the sealed session log here.
        #[arg(long)]
        log_out: Option<PathBuf>,
    },

    /// Replay a session log and check it against its sealed results.
    Verify { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Demo {
            config,
            participants,
            strokes,
            target,
            log_out,
        } => run_demo(config, participants, strokes, target, log_out).await,
        Command::Verify { path } => run_verify(path),
    }
}

async fn run_demo(
    config_path: Option<PathBuf>,
    participants: u64,
    strokes: u64,
    target: Option<f64>,
    log_out: Option<PathBuf>,
) -> anyhow::Result<()> {
    if participants == 0 {
        bail!("--participants must be at least 1");
    }

    let config = ServerConfig::load(config_path.as_deref()).context("loading configuration")?;
    log_config(&config);
    let report_interval =
        Duration::from_millis(1_000 / u64::from(config.validation.max_events_per_sec) + 10);

    // The demo verifies the log from memory; `archive_dir` also gets a copy.
    let archive = Arc::new(MemoryArchive::new());
    let mut archives = vec![Arc::clone(&archive) as Arc<dyn SessionArchive>];
    if let Some(dir) = &config.archive_dir {
        info!(dir = %dir.display(), "archiving session logs");
        archives.push(Arc::new(FileArchive::new(dir)));
    }
    let coordinator = Arc::new(Coordinator::with_parts(
        config,
        Arc::new(SystemClock) as Arc<dyn Clock>,
        Arc::new(TeeArchive::new(archives)),
    ));
    let monitor = coordinator.spawn_abandon_monitor();

    let users: Vec<UserId> = (1..=participants).collect();
    let session_id = coordinator.create_session(users[0], target)?.session_id;
    for &user in &users {
        coordinator.join(session_id, user).await?;
    }

    let mut viewers = Vec::new();
    for &user in &users {
        let mut stream = coordinator.subscribe(session_id, user).await?;
        viewers.push(tokio::spawn(async move {
            let mut received = 0usize;
            while let Some(snapshot) = stream.next().await {
                received += 1;
                debug!(
                    user_id = user,
                    sequence = snapshot.sequence,
                    state = %snapshot.state,
                    "snapshot received"
                );
            }
            (user, received, stream.close_reason())
        }));
    }

    coordinator.start(session_id).await?;

    let mut rowers = Vec::new();
    for &user in &users {
        let coordinator = Arc::clone(&coordinator);
        rowers.push(tokio::spawn(async move {
            let started = SystemClock.now_ms();
            for stroke in 0..strokes {
                tokio::time::sleep(report_interval).await;
                let raw = RawTelemetryProto {
                    client_timestamp_ms: SystemClock.now_ms(),
                    distance_delta_m: 8.0 + (user % 4) as f64 * 0.75,
                    stroke_rate_spm: 22.0 + (stroke % 6) as f64,
                    strokes: 1,
                };
                match coordinator.submit(session_id, user, raw).await {
                    Ok(_) => {}
                    Err(CoordinatorError::SessionClosed { .. }) => break,
                    Err(err) => warn!(user_id = user, error = %err, "report rejected"),
                }
            }
            debug!(
                user_id = user,
                elapsed_ms = SystemClock.now_ms().saturating_sub(started),
                "rower done"
            );
        }));
    }
    for rower in rowers {
        rower.await?;
    }

    match coordinator.complete(session_id).await {
        Ok(_) => {}
        Err(CoordinatorError::SessionClosed { state, .. }) => {
            info!(session_id, %state, "session already ended");
        }
        Err(err) => return Err(err.into()),
    }

    for viewer in viewers {
        let (user, received, reason) = viewer.await?;
        info!(
            user_id = user,
            received,
            close_reason = reason.map(|r| r.as_str()),
            "stream closed"
        );
    }
    monitor.abort();

    let finished = archive
        .get(session_id)
        .context("finished session missing from archive")?;
    let replayed = verify_log(&finished.log).context("session log failed verification")?;
    for participant in &replayed.participants {
        info!(
            user_id = participant.user_id,
            distance_m = participant.metrics.distance_m,
            strokes = participant.metrics.stroke_count,
            elapsed_ms = participant.metrics.elapsed_ms,
            finished = participant.finished,
            "result"
        );
    }
    info!(
        session_id,
        end_reason = finished.end_reason.as_str(),
        sequence = replayed.sequence,
        digest = %format!("{:016x}", replayed.digest),
        entries = finished.log.entries.len(),
        "session log verified"
    );

    if let Some(path) = log_out {
        write_log(&finished.log, &path)
            .with_context(|| format!("writing session log to {}", path.display()))?;
        info!(path = %path.display(), "session log written");
    }
    Ok(())
}

fn run_verify(path: PathBuf) -> anyhow::Result<()> {
    let log = read_log(&path).with_context(|| format!("reading {}", path.display()))?;
    let snapshot = verify_log(&log)
        .with_context(|| format!("session log {} failed verification", path.display()))?;

    println!(
        "session {}: {} ({} entries, sequence {}, revision {}, digest {:016x})",
        snapshot.session_id,
        log.end_reason,
        log.entries.len(),
        snapshot.sequence,
        snapshot.revision,
        snapshot.digest,
    );
    for participant in &snapshot.participants {
        println!(
            "  user {:>6}  {:>9.1} m  {:>5} strokes  {:>8} ms",
            participant.user_id,
            participant.metrics.distance_m,
            participant.metrics.stroke_count,
            participant.metrics.elapsed_ms,
        );
    }
    Ok(())
}
