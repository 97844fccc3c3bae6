//! Records one short simulated run per block into `transcripts/`.

use std::io;
use std::path::Path;
use std::time::Duration;

use physio_sync_core::config::SyncConfig;

#[allow(dead_code)]
#[path = "../clock.rs"]
mod clock;
#[allow(dead_code)]
#[path = "../output.rs"]
mod output;
#[allow(dead_code)]
#[path = "../peaks.rs"]
mod peaks;
#[allow(dead_code)]
#[path = "../session.rs"]
mod session;
#[allow(dead_code)]
#[path = "../stream.rs"]
mod stream;

use clock::HostClock;
use output::ConsoleOutput;
use session::{BlockRequest, IntervalRange, Session, SessionOptions, TranscriptLogger};

const TRANSCRIPT_DIR: &str = "transcripts";
const SEED: u64 = 2024;

fn main() -> io::Result<()> {
    let config = SyncConfig {
        n_target: 8,
        n_deviant: 2,
        ..SyncConfig::default()
    };

    record(
        "baseline",
        &config,
        BlockRequest::Baseline {
            duration: Duration::from_secs(5),
        },
    )?;
    record(
        "isochronous",
        &config,
        BlockRequest::Isochronous {
            delay: Duration::from_secs(1),
        },
    )?;
    record(
        "asynchronous",
        &config,
        BlockRequest::Asynchronous {
            intervals: IntervalRange::default(),
        },
    )?;
    record("synchronous-respiration", &config, BlockRequest::SynchronousRespiration)?;
    record(
        "synchronous-cardiac",
        &config,
        BlockRequest::SynchronousCardiac {
            intervals: IntervalRange { min: 3.0, max: 5.0 },
        },
    )?;
    record("session", &config, BlockRequest::Full)?;
    Ok(())
}

fn record(tag: &str, config: &SyncConfig, request: BlockRequest) -> io::Result<()> {
    let path = Path::new(TRANSCRIPT_DIR).join(format!("{tag}.log"));
    let clock = HostClock::simulated();
    let transcript = TranscriptLogger::create(
        &path,
        &format!("physio-sync emulator {tag} transcript (simulated clock, seed {SEED})"),
    )?;
    let output = ConsoleOutput::new(clock.clone(), transcript, false);
    let mut session = Session::new(config.clone(), clock, output, &SessionOptions::new(SEED))?;
    for report in session.run(request)? {
        println!("{}: {report}", path.display());
    }
    Ok(())
}
