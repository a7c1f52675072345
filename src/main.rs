//! # agent-live-audio - Command Line Entry Point
//!
//! Runs a live conversation session from the terminal, and exposes the small
//! utilities that come with the engine.
//!
//! ## Subcommands:
//! - **live**: connect to the peer, stream the microphone up and play the replies
//! - **wav**: wrap raw (or base64) PCM16 in a WAV header
//! - **print-config**: show the effective configuration as TOML
//!
//! ## Configuration:
//! Defaults, then `live-audio.toml` (or `--config`), then `LIVE_*` environment
//! variables, then `PEER_URL`, then `--overrides` JSON, then the subcommand flags.

use agent_live_audio::audio::codec::{build_wav_default, try_decode_base64};
use agent_live_audio::audio::visualizer::{gradient_at, VisualFrame, Visualizer, IDLE_RING_COLOR, PULSE_COLOR};
use agent_live_audio::config::{EngineConfig, TARGET_SAMPLE_RATE};
use agent_live_audio::device::select_backend;
use agent_live_audio::state::{SessionSnapshot, SessionStatus};
use agent_live_audio::transport::WebSocketConnector;
use agent_live_audio::LiveSession;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "agent-live-audio", version, about = "Live audio conversation engine")]
struct Cli {
    /// Configuration file (default: live-audio.toml in the working directory)
    #[arg(long, global = true)]
    config: Option<String>,

    /// JSON overrides applied after loading, e.g. '{"audio":{"backend":"file"}}'
    #[arg(long, global = true)]
    overrides: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a live session until interrupted or closed by the peer
    Live(LiveArgs),
    /// Build a WAV file from PCM16 mono samples
    Wav(WavArgs),
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[derive(Args, Debug)]
struct LiveArgs {
    /// Peer websocket URL (ws:// or wss://)
    #[arg(long)]
    url: Option<String>,

    /// Audio backend: auto, device or file
    #[arg(long)]
    backend: Option<String>,

    /// WAV file used as the microphone by the file backend
    #[arg(long)]
    input_file: Option<PathBuf>,

    /// Record everything played back to this WAV file (file backend)
    #[arg(long)]
    record_file: Option<PathBuf>,

    /// Start with the microphone muted
    #[arg(long)]
    mute: bool,

    /// Draw a level meter on stderr
    #[arg(long)]
    meter: bool,

    /// Disconnect after this many seconds
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Args, Debug)]
struct WavArgs {
    /// File holding little-endian PCM16 mono samples
    input: PathBuf,

    /// Where to write the WAV file
    #[arg(short, long)]
    output: PathBuf,

    /// Treat the input as base64 text
    #[arg(long)]
    base64: bool,

    /// Sample rate written to the header
    #[arg(long, default_value_t = TARGET_SAMPLE_RATE)]
    rate: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(json) = &cli.overrides {
        config
            .update_from_json(json)
            .context("Invalid --overrides")?;
    }

    match cli.command {
        Command::Live(args) => run_live(config, args).await,
        Command::Wav(args) => run_wav(args),
        Command::PrintConfig => {
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// `RUST_LOG` wins; otherwise the engine logs at debug.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_live_audio=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

async fn run_live(mut config: EngineConfig, args: LiveArgs) -> Result<()> {
    if let Some(url) = args.url {
        config.transport.url = url;
    }
    if let Some(backend) = args.backend {
        config.audio.backend = backend;
    }
    if let Some(path) = args.input_file {
        config.audio.input_file = Some(path.display().to_string());
    }
    if let Some(path) = args.record_file {
        config.audio.record_file = Some(path.display().to_string());
    }
    config.validate()?;

    info!("Starting agent-live-audio v{}", env!("CARGO_PKG_VERSION"));
    info!("Peer: {} (model {})", config.transport.url, config.transport.model);

    let backend = select_backend(&config.audio)?;
    info!("Audio backend: {}", backend.name());
    let connector = Arc::new(WebSocketConnector::new(
        config.transport.clone(),
        config.audio.target_rate,
    ));

    let visualizer_config = config.visualizer.clone();
    let session = LiveSession::new(config, backend, connector);
    session.set_muted(args.mute);

    setup_signal_handlers();

    let meter = args.meter.then(|| {
        let visualizer = Visualizer::new(visualizer_config);
        tokio::spawn(visualizer.run(session.analysis_taps(), session.subscribe(), |frame| {
            let mut stderr = std::io::stderr().lock();
            let _ = write!(stderr, "{}", meter_line(frame));
            let _ = stderr.flush();
        }))
    });

    let outcome = tokio::select! {
        outcome = drive_session(&session, args.duration) => outcome,
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, disconnecting...");
            Ok(None)
        }
    };

    session.disconnect().await;
    if let Some(meter) = meter {
        meter.abort();
        eprintln!();
    }

    let metrics = session.metrics();
    info!("Session metrics:\n{}", serde_json::to_string_pretty(&metrics)?);

    match outcome?.and_then(|snapshot| snapshot.last_error) {
        Some(message) => {
            warn!("Session ended with error: {}", message);
            Err(anyhow::anyhow!(message))
        }
        None => {
            info!("Session closed");
            Ok(())
        }
    }
}

/// Connect, then wait for the peer to end the session or for `duration` to pass.
///
/// Returns the final snapshot when the session ended on its own.
async fn drive_session(session: &LiveSession, duration: Option<u64>) -> Result<Option<SessionSnapshot>> {
    if let Err(e) = session.connect().await {
        error!("Failed to start session: {}", e);
        return Err(e.into());
    }

    let mut states = WatchStream::new(session.subscribe());
    let ended = async {
        while let Some(snapshot) = states.next().await {
            info!(
                status = %snapshot.status,
                muted = snapshot.muted,
                "Session state changed"
            );
            if matches!(snapshot.status, SessionStatus::Closed | SessionStatus::Error) {
                return Some(snapshot);
            }
        }
        None
    };
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        snapshot = ended => Ok(snapshot),
        _ = deadline => {
            info!("Session duration reached, disconnecting...");
            Ok(None)
        }
    }
}

fn run_wav(args: WavArgs) -> Result<()> {
    let raw = std::fs::read(&args.input)
        .with_context(|| format!("Cannot read {}", args.input.display()))?;

    let pcm = if args.base64 {
        let text = String::from_utf8(raw).context("Base64 input is not UTF-8")?;
        try_decode_base64(text.trim())?
    } else {
        raw
    };
    if pcm.len() % 2 != 0 {
        warn!("Odd PCM length {}, last byte ignored", pcm.len());
    }

    let wav = build_wav_default(&pcm[..pcm.len() & !1], args.rate);
    std::fs::write(&args.output, &wav)
        .with_context(|| format!("Cannot write {}", args.output.display()))?;

    info!(
        "Wrote {} ({} bytes, {:.2}s at {}Hz)",
        args.output.display(),
        wav.len(),
        (pcm.len() / 2) as f64 / args.rate as f64,
        args.rate
    );
    Ok(())
}

const METER_WIDTH: usize = 32;

/// One terminal line for a visualizer frame, coloured with 24-bit ANSI escapes.
fn meter_line(frame: &VisualFrame) -> String {
    match frame {
        VisualFrame::Idle { .. } => {
            let [r, g, b] = IDLE_RING_COLOR;
            format!("\r\x1b[38;2;{};{};{}m{}\x1b[0m  ", r, g, b, "- ".repeat(METER_WIDTH / 2))
        }
        VisualFrame::Live { pulse, .. } => {
            let filled = ((frame.level() * METER_WIDTH as f32).round() as usize).min(METER_WIDTH);
            let mut line = String::from("\r");
            for i in 0..METER_WIDTH {
                if i < filled {
                    let [r, g, b] = gradient_at(i as f32 / (METER_WIDTH - 1) as f32);
                    line.push_str(&format!("\x1b[38;2;{};{};{}m█", r, g, b));
                } else {
                    line.push(' ');
                }
            }
            line.push_str("\x1b[0m");
            match pulse {
                Some(_) => {
                    let [r, g, b] = PULSE_COLOR;
                    line.push_str(&format!(" \x1b[38;2;{};{};{}m●\x1b[0m", r, g, b));
                }
                None => line.push_str("  "),
            }
            line
        }
    }
}

/// Flip `SHUTDOWN_SIGNAL` on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install SIGINT handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_live_flags() {
        let cli = Cli::parse_from([
            "agent-live-audio",
            "--overrides",
            "{}",
            "live",
            "--backend",
            "file",
            "--mute",
            "--duration",
            "5",
        ]);
        assert_eq!(cli.overrides.as_deref(), Some("{}"));
        match cli.command {
            Command::Live(args) => {
                assert_eq!(args.backend.as_deref(), Some("file"));
                assert!(args.mute);
                assert!(!args.meter);
                assert_eq!(args.duration, Some(5));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_wav_default_rate() {
        let cli = Cli::parse_from(["agent-live-audio", "wav", "in.pcm", "-o", "out.wav"]);
        match cli.command {
            Command::Wav(args) => {
                assert_eq!(args.rate, 24_000);
                assert!(!args.base64);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_meter_line_shapes() {
        let idle = meter_line(&VisualFrame::Idle { ring_radius: 70.0 });
        assert!(idle.contains("- - "));

        let silent = meter_line(&VisualFrame::Live {
            bars: Vec::new(),
            pulse: None,
            level: 0.0,
        });
        assert!(!silent.contains('█'));

        let loud = meter_line(&VisualFrame::Live {
            bars: Vec::new(),
            pulse: Some(agent_live_audio::audio::visualizer::Pulse { radius: 80.0, alpha: 0.5 }),
            level: 255.0,
        });
        assert_eq!(loud.matches('█').count(), METER_WIDTH);
        assert!(loud.contains('●'));
    }
}
