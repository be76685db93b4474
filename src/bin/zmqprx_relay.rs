//! Forward every message from one bus to another
//!
//! Usage:
//!   zmqprx_relay <sub_endpoint> <pub_endpoint>
//!
//! The subscriber connects, the publisher binds. Each forwarded message is
//! followed by `invalid message` on the outbound bus.

use zmqprx::cli::{self, RelayArgs, RelayConfig, FAILURE_EXIT};
use zmqprx::network::{Publisher, Subscriber};
use zmqprx::runtime::{install_signal_handlers, Relay, Shutdown};
use zmqprx::Error;

fn run(args: &RelayArgs) -> Result<(), Error> {
    let config = RelayConfig::try_from(args)?;
    tracing::debug!(?config, "starting relay");

    install_signal_handlers().map_err(Error::Signals)?;
    let shutdown = Shutdown::from_signals();

    let subscriber = Subscriber::connect(&config.sub_endpoint, config.bus.clone())?;
    let mut publisher = Publisher::bind(&config.pub_endpoint, config.bus.clone())?;
    println!(
        "Subscribing to {}, publishing on {}",
        config.sub_endpoint,
        publisher.endpoint()
    );

    let stdout = std::io::stdout();
    let mut relay = Relay::new(stdout.lock());
    let stats = relay.run(subscriber, &mut publisher, &shutdown)?;

    let outbound = publisher.stats();
    tracing::info!(
        received = stats.received,
        forwarded = stats.handled,
        subscribers = outbound.peers_accepted,
        frames_delivered = outbound.frames_delivered,
        frames_dropped = outbound.frames_dropped,
        "relay stopped"
    );
    publisher.close()?;
    Ok(())
}

fn main() {
    let args: RelayArgs = cli::parse_or_usage();
    cli::init_tracing(&args.verbosity);

    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "relay failed");
        eprintln!("Error: {e}");
        std::process::exit(FAILURE_EXIT);
    }
}
