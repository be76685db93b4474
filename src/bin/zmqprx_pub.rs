//! Publish one sample record and exit
//!
//! Usage:
//!   zmqprx_pub <endpoint> [connect|bind]     (bind by default)

use std::time::{Duration, Instant};

use zmqprx::cli::{self, PubArgs, PublisherConfig, FAILURE_EXIT};
use zmqprx::network::{BusSender, Publisher};
use zmqprx::protocol::{Integer, Record, RecordEncoder, Value};
use zmqprx::runtime::{install_signal_handlers, Shutdown};
use zmqprx::Error;

/// One field of every kind, big integers included.
///
/// `_real` and `_string` carry the binary prefix without being binary, so
/// `--strict` rejects this record.
fn sample_record() -> Result<Record, Error> {
    Ok(Record::new()
        .with("Opaque", Integer::parse("5425423523544523524523525245")?)
        .with("big minus", Integer::parse("-5425423523544523524523525245")?)
        .with("minus1", -1i64)
        .with("Naan", Value::Null)
        .with("_opaque", b"hola".as_slice())
        .with("_real", 452354.5)
        .with("_string", "yo"))
}

/// Sleep for `settle`, returning early on shutdown.
fn settle(duration: Duration, shutdown: &Shutdown) {
    let deadline = Instant::now() + duration;
    while !shutdown.is_triggered() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

fn run(args: &PubArgs) -> Result<(), Error> {
    let config = PublisherConfig::try_from(args)?;
    tracing::debug!(?config, "starting publisher");

    install_signal_handlers().map_err(Error::Signals)?;
    let shutdown = Shutdown::from_signals();

    let record = sample_record()?;
    let mut encoder = RecordEncoder::new(config.format).strict(config.strict);
    let payload = encoder.encode(&record)?.to_vec();

    let mut publisher = Publisher::open(&config.endpoint, config.mode, config.bus.clone())?;
    println!("Publishing ...");

    settle(config.settle, &shutdown);
    if shutdown.is_triggered() {
        tracing::info!("interrupted before publishing");
        return Ok(());
    }

    publisher.send(&payload)?;
    let flushed = publisher.flush(config.bus.linger)?;
    let stats = publisher.stats();
    tracing::info!(
        endpoint = %publisher.endpoint(),
        bytes = payload.len(),
        subscribers = stats.peers_accepted,
        delivered = stats.frames_delivered,
        "record published"
    );

    if stats.frames_delivered == 0 {
        tracing::warn!(endpoint = %publisher.endpoint(), "no subscriber received the record");
    } else if !flushed {
        tracing::warn!("some subscribers did not receive the record before linger expired");
    }
    publisher.close_within(Duration::ZERO)?;
    println!("done");
    Ok(())
}

fn main() {
    let args: PubArgs = cli::parse_or_usage();
    cli::init_tracing(&args.verbosity);

    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "publisher failed");
        eprintln!("Error: {e}");
        std::process::exit(FAILURE_EXIT);
    }
}
