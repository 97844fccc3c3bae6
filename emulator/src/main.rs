mod clock;
mod output;
mod peaks;
mod session;
mod stream;

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use physio_sync_core::config::SyncConfig;
use physio_sync_core::sequence::BlockKind;
use physio_sync_core::settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clock::HostClock;
use output::ConsoleOutput;
use session::{
    BlockRequest, DEFAULT_BASELINE, DEFAULT_ISOCHRONOUS_DELAY, IntervalRange, Session,
    SessionOptions, TranscriptLogger,
};

const USAGE: &str = "\
Usage: physio-sync-emulator <block> [options]

Blocks: baseline | isochronous | asynchronous | synchronous-respiration |
        synchronous-cardiac | session

Options:
  --config <path>        settings file of `key = value` lines
  --duration <seconds>   baseline length (default 60)
  --delay <seconds>      isochronous inter-stimulus delay (default 1)
  --delays <min> <max>   interval range for standalone asynchronous and
                         cardiac blocks (default 0.5 1.5)
  --target <Hz>          target tone frequency (default 1000)
  --deviant <Hz>         deviant tone frequency (default 2000)
  --seed <n>             stream and sequence seed (default: random)
  --transcript <path>    write a timestamped transcript
  --simulated            run on a virtual clock instead of waiting
  --verbose              debug logging (RUST_LOG is honoured otherwise)";

#[derive(Debug, PartialEq)]
struct Invocation {
    tag: String,
    request: BlockRequest,
    config: Option<PathBuf>,
    transcript: Option<PathBuf>,
    target: Option<u32>,
    deviant: Option<u32>,
    seed: Option<u64>,
    simulated: bool,
    verbose: bool,
}

fn main() -> io::Result<()> {
    let invocation = match parse_args(env::args().skip(1)) {
        Ok(Some(invocation)) => invocation,
        Ok(None) => {
            println!("{USAGE}");
            return Ok(());
        }
        Err(err) => {
            eprintln!("{err}");
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_logging(invocation.verbose);

    let config = build_config(&invocation).unwrap_or_else(|err| {
        eprintln!("{err}");
        process::exit(2);
    });

    let clock = if invocation.simulated {
        HostClock::simulated()
    } else {
        HostClock::wall()
    };
    let transcript = match &invocation.transcript {
        Some(path) => TranscriptLogger::create(
            path,
            &format!("physio-sync emulator {} transcript", invocation.tag),
        )?,
        None => TranscriptLogger::disabled(),
    };
    let output = ConsoleOutput::new(clock.clone(), transcript, true);

    let seed = invocation.seed.unwrap_or_else(rand::random);
    info!(seed, block = %invocation.tag, simulated = clock.is_virtual(), "session starting");
    let mut session = Session::new(config, clock, output, &SessionOptions::new(seed))?;
    let reports = session.run(invocation.request)?;

    let stdout = io::stdout();
    let mut writer = stdout.lock();
    for report in &reports {
        writeln!(writer, "{report}")?;
    }
    if let Some(last) = session.output().pulses().last() {
        info!(code = last.code, at = ?last.at, "last trigger");
    }
    writeln!(
        writer,
        "{} pulses, {} playbacks",
        session.output().pulses().len(),
        session.output().playbacks()
    )?;
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig, String> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let text = fs::read_to_string(path)
        .map_err(|err| format!("Cannot read `{}`: {err}", path.display()))?;
    let config = settings::parse(&text).map_err(|err| format!("{}: {err}", path.display()))?;
    config
        .validate()
        .map_err(|err| format!("{}: {err}", path.display()))?;
    Ok(config)
}

/// Settings file first, then the tone frequencies given on the command line.
fn build_config(invocation: &Invocation) -> Result<SyncConfig, String> {
    let mut config = load_config(invocation.config.as_deref())?;
    if let Some(frequency) = invocation.target {
        config.target_frequency = frequency;
    }
    if let Some(frequency) = invocation.deviant {
        config.deviant_frequency = frequency;
    }
    config
        .validate()
        .map_err(|err| format!("Invalid configuration: {err}"))?;
    Ok(config)
}

/// Returns `Ok(None)` when help was requested.
fn parse_args<I>(args: I) -> Result<Option<Invocation>, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut tag = None;
    let mut config = None;
    let mut transcript = None;
    let mut target = None;
    let mut deviant = None;
    let mut seed = None;
    let mut duration = DEFAULT_BASELINE;
    let mut delay = DEFAULT_ISOCHRONOUS_DELAY;
    let mut intervals = IntervalRange::default();
    let mut simulated = false;
    let mut verbose = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--config" => config = Some(PathBuf::from(value(&mut args, &arg)?)),
            "--transcript" => transcript = Some(PathBuf::from(value(&mut args, &arg)?)),
            "--duration" => duration = seconds(&value(&mut args, &arg)?)?,
            "--delay" => delay = seconds(&value(&mut args, &arg)?)?,
            "--delays" => {
                let min = seconds(&value(&mut args, &arg)?)?.as_secs_f64();
                let max = seconds(&value(&mut args, &arg)?)?.as_secs_f64();
                if min > max {
                    return Err(format!("--delays minimum {min} exceeds maximum {max}"));
                }
                intervals = IntervalRange { min, max };
            }
            "--target" => target = Some(hertz(&value(&mut args, &arg)?)?),
            "--deviant" => deviant = Some(hertz(&value(&mut args, &arg)?)?),
            "--seed" => {
                let raw = value(&mut args, &arg)?;
                seed = Some(
                    raw.parse::<u64>()
                        .map_err(|_| format!("Invalid seed `{raw}`"))?,
                );
            }
            "--simulated" => simulated = true,
            "--verbose" => verbose = true,
            other if other.starts_with('-') => return Err(format!("Unknown option `{other}`")),
            other => {
                if tag.is_some() {
                    return Err(format!("Unexpected argument `{other}`"));
                }
                tag = Some(other.to_ascii_lowercase());
            }
        }
    }

    let tag = tag.ok_or_else(|| "Expected a block name".to_string())?;
    let request = match BlockKind::from_tag(&tag) {
        Some(BlockKind::Baseline) => BlockRequest::Baseline { duration },
        Some(BlockKind::Isochronous) => BlockRequest::Isochronous { delay },
        Some(BlockKind::Asynchronous) => BlockRequest::Asynchronous { intervals },
        Some(BlockKind::SynchronousRespiration) => BlockRequest::SynchronousRespiration,
        Some(BlockKind::SynchronousCardiac) => BlockRequest::SynchronousCardiac { intervals },
        None if tag == "session" => BlockRequest::Full,
        None => {
            return Err(format!(
                "Unknown block `{tag}` (expected one of: {})",
                BlockRequest::TAGS.join(", ")
            ));
        }
    };

    Ok(Some(Invocation {
        tag,
        request,
        config,
        transcript,
        target,
        deviant,
        seed,
        simulated,
        verbose,
    }))
}

fn value<I>(args: &mut I, option: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("Expected value after {option}"))
}

fn seconds(raw: &str) -> Result<Duration, String> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| *value > 0.0)
        .and_then(|value| Duration::try_from_secs_f64(value).ok())
        .ok_or_else(|| format!("Invalid duration `{raw}` (expected positive seconds)"))
}

fn hertz(raw: &str) -> Result<u32, String> {
    raw.parse::<u32>()
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| format!("Invalid frequency `{raw}` (expected positive whole Hz)"))
}
