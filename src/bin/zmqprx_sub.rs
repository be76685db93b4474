//! Subscribe and print every record received
//!
//! Usage:
//!   zmqprx_sub <endpoint> [connect|bind]     (connect by default)

use zmqprx::cli::{self, SubArgs, SubscriberConfig, FAILURE_EXIT};
use zmqprx::network::Subscriber;
use zmqprx::runtime::{install_signal_handlers, DecodeLoop, Shutdown};
use zmqprx::Error;

fn run(args: &SubArgs) -> Result<(), Error> {
    let config = SubscriberConfig::try_from(args)?;
    tracing::debug!(?config, "starting subscriber");

    install_signal_handlers().map_err(Error::Signals)?;
    let shutdown = Shutdown::from_signals();

    let subscriber = Subscriber::open(&config.endpoint, config.mode, config.bus.clone())?;
    println!("Subscribing to {} ...", subscriber.endpoint());

    let stdout = std::io::stdout();
    let mut decode = DecodeLoop::new(config.format, stdout.lock());
    let stats = decode.run(subscriber, &shutdown)?;

    tracing::info!(received = stats.received, rendered = stats.handled, skipped = stats.skipped, "subscriber stopped");
    Ok(())
}

fn main() {
    let args: SubArgs = cli::parse_or_usage();
    cli::init_tracing(&args.verbosity);

    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "subscriber failed");
        eprintln!("Error: {e}");
        std::process::exit(FAILURE_EXIT);
    }
}
