//! Boot the OS against a filesystem image.
//!
//! Usage: rill <image> [event-log]
//!
//! The image must already be formatted (see rillfat). The optional
//! second argument names the scheduler event log (default log/log.txt).

use std::path::PathBuf;
use std::process::ExitCode;

use rill::boot::{boot, BootConfig, SLICE};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(image) = args.next() else {
        eprintln!("usage: rill <image> [event-log]");
        return ExitCode::FAILURE;
    };
    let event_log = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("log/log.txt"));

    let config = BootConfig {
        image: PathBuf::from(image),
        event_log: Some(event_log),
        slice: SLICE,
    };

    match boot(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rill: {}", e);
            ExitCode::FAILURE
        }
    }
}
