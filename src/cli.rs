//! Command-line surface shared by the executables
//!
//! Argument structs are parsed with clap, then turned into the plain config
//! structs the binaries run from.

use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Args, Parser};
use tracing_subscriber::EnvFilter;

use crate::network::{BusOptions, Endpoint, EndpointError, Mode};
use crate::protocol::WireFormat;

/// Exit status for argument errors
pub const USAGE_EXIT: i32 = 2;
/// Exit status for runtime failures
pub const FAILURE_EXIT: i32 = 1;

#[derive(Args, Debug, Clone, Default)]
pub struct Verbosity {
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl Verbosity {
    pub fn level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Publish one sample record and exit
#[derive(Parser, Debug)]
#[command(name = "zmqprx_pub", version)]
pub struct PubArgs {
    /// Endpoint, e.g. tcp://127.0.0.1:5555
    pub endpoint: String,

    #[arg(value_enum, default_value_t = Mode::Bind)]
    pub mode: Mode,

    #[arg(long, value_enum, default_value_t = WireFormat::Prefixed)]
    pub format: WireFormat,

    /// Reject fields whose `_` prefix disagrees with their value
    #[arg(long)]
    pub strict: bool,

    /// Wait before sending so subscribers can join
    #[arg(long, default_value_t = 200)]
    pub settle_ms: u64,

    /// Upper bound on flushing pending output at exit
    #[arg(long, default_value_t = 2000)]
    pub linger_ms: u64,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

/// Decode and print every record received
#[derive(Parser, Debug)]
#[command(name = "zmqprx_sub", version)]
pub struct SubArgs {
    /// Endpoint, e.g. tcp://127.0.0.1:5555
    pub endpoint: String,

    #[arg(value_enum, default_value_t = Mode::Connect)]
    pub mode: Mode,

    #[arg(long, value_enum, default_value_t = WireFormat::Prefixed)]
    pub format: WireFormat,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

/// Forward every message from one bus to another, each followed by a sentinel
#[derive(Parser, Debug)]
#[command(name = "zmqprx_relay", version)]
pub struct RelayArgs {
    /// Upstream publisher to connect to
    pub sub_endpoint: String,

    /// Endpoint to publish on (bound)
    pub pub_endpoint: String,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub endpoint: Endpoint,
    pub mode: Mode,
    pub format: WireFormat,
    pub strict: bool,
    pub settle: Duration,
    pub bus: BusOptions,
}

impl TryFrom<&PubArgs> for PublisherConfig {
    type Error = EndpointError;

    fn try_from(args: &PubArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            endpoint: args.endpoint.parse()?,
            mode: args.mode,
            format: args.format,
            strict: args.strict,
            settle: Duration::from_millis(args.settle_ms),
            bus: BusOptions {
                linger: Duration::from_millis(args.linger_ms),
                ..BusOptions::default()
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub endpoint: Endpoint,
    pub mode: Mode,
    pub format: WireFormat,
    pub bus: BusOptions,
}

impl TryFrom<&SubArgs> for SubscriberConfig {
    type Error = EndpointError;

    fn try_from(args: &SubArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            endpoint: args.endpoint.parse()?,
            mode: args.mode,
            format: args.format,
            bus: BusOptions::default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub sub_endpoint: Endpoint,
    pub pub_endpoint: Endpoint,
    pub bus: BusOptions,
}

impl TryFrom<&RelayArgs> for RelayConfig {
    type Error = EndpointError;

    fn try_from(args: &RelayArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            sub_endpoint: args.sub_endpoint.parse()?,
            pub_endpoint: args.pub_endpoint.parse()?,
            bus: BusOptions::default(),
        })
    }
}

/// Parse the process arguments.
///
/// Help and version exit 0 as usual. Any other argument error prints the
/// message and usage to stdout and exits with `USAGE_EXIT`.
pub fn parse_or_usage<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            print!("{}", e.render());
            // exit skips the stdout buffer's destructor
            let _ = std::io::Write::flush(&mut std::io::stdout());
            std::process::exit(USAGE_EXIT)
        }
    }
}

/// Log to stderr at the level chosen by `-v`. Stdout carries data only.
pub fn init_tracing(verbosity: &Verbosity) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::new(verbosity.level()))
        .with_target(false)
        .try_init();
}
