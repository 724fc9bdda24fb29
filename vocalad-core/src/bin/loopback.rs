//! Headless loopback host: runs full voice sessions against the local echo
//! peer, which speaks the JSON wire protocol and replays each user turn back.
//!
//! ```text
//! cargo run -p vocalad-core --bin vocalad-loopback -- \
//!   [--config <file.json>] [--wav <file.wav>] [--turn-secs <s>] [--turns <n>] [--sequential]
//!   [--list-devices]
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vocalad_core::{
    audio::device::{list_devices, DeviceDirection},
    remote::{EchoTransport, WireChannel, WireCodec},
    CaptureSource, PlaybackStrategy, ReplayCapture, SessionComponents, SessionConfig,
    SessionOrchestrator,
};

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    wav: Option<PathBuf>,
    turn_secs: f64,
    turns: usize,
    sequential: bool,
    list_devices: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config: None,
        wav: None,
        turn_secs: 3.0,
        turns: 2,
        sequential: false,
        list_devices: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --config".into());
                };
                args.config = Some(PathBuf::from(v));
            }
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                args.wav = Some(PathBuf::from(v));
            }
            "--turn-secs" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --turn-secs".into());
                };
                args.turn_secs = v
                    .parse::<f64>()
                    .map_err(|_| "invalid value for --turn-secs".to_string())?
                    .clamp(0.5, 60.0);
            }
            "--turns" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --turns".into());
                };
                args.turns = v
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --turns".to_string())?
                    .clamp(1, 20);
            }
            "--sequential" => args.sequential = true,
            "--list-devices" => args.list_devices = true,
            "--help" | "-h" => {
                println!(
                    "Usage: vocalad-loopback [--config <file.json>] [--wav <file.wav>] \\
  [--turn-secs <s>] [--turns <n>] [--sequential] [--list-devices]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vocalad=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("loopback failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args().map_err(anyhow::Error::msg)?;

    if args.list_devices {
        let mut devices = list_devices(DeviceDirection::Input);
        devices.extend(list_devices(DeviceDirection::Output));
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    config.apply_env_overrides();
    if args.sequential {
        config.playback = PlaybackStrategy::Sequential;
    }
    config.validate()?;
    info!(playback = ?config.playback, inbound_rate = config.inbound_sample_rate, "loopback starting");

    let codec = WireCodec::new(config.capture_sample_rate, config.inbound_sample_rate);
    let peer = EchoTransport::new(config.inbound_sample_rate, 40).with_max_reply_secs(args.turn_secs);
    let channel = WireChannel::new(peer, codec).with_model("echo");

    let mut components = SessionComponents::with_devices(&config, Box::new(channel))?;
    if let Some(path) = &args.wav {
        let capture: Box<dyn CaptureSource> = Box::new(
            ReplayCapture::from_wav(path, config.capture_settings())?.pad_with_silence(true),
        );
        components.capture = capture;
    }

    let session = SessionOrchestrator::new(config, components);
    let mut summaries = session.subscribe_summaries();
    if let Err(e) = session.start_session() {
        if e.is_actionable() {
            warn!("check microphone permissions and the echo peer settings");
        }
        return Err(e.into());
    }

    if !wait_for(Duration::from_secs(5), || session.turn_in_progress()) {
        session.stop_all();
        anyhow::bail!("remote session never became ready");
    }

    for turn in 1..=args.turns {
        info!(turn, "speak now");
        let deadline = Instant::now() + Duration::from_secs_f64(args.turn_secs);
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(250));
            info!(level = session.audio_level(), "meter");
        }
        session.end_turn();

        let replied = wait_for(Duration::from_secs_f64(args.turn_secs + 10.0), || {
            session.turn_in_progress()
        });
        while let Ok(event) = summaries.try_recv() {
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        if !replied {
            warn!(turn, "no reply from echo peer");
            break;
        }
        // Let the echoed reply play out.
        wait_for(Duration::from_secs_f64(args.turn_secs + 1.0), || {
            !session.remote_is_speaking()
        });
    }

    session.stop_all();
    println!(
        "{}",
        serde_json::to_string_pretty(&session.diagnostics_snapshot())?
    );
    Ok(())
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut ready: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    ready()
}
