// CLI entry point for the abridge broadcast relay.
//
// Parses options, optionally daemonizes, binds the listener, and runs the
// event loop on the main thread until the process is killed. See `server.rs`
// for the event loop and `relay.rs` for frame fan-out.
//
// Usage:
//   abridge [OPTIONS]
//     -p, --port <PORT>   Listen port, 1-65535 (default: 9999)
//     -b, --bind <ADDR>   Listen address (default: 0.0.0.0)
//     -d, --dontfork      Stay in the foreground
//     -v, --version       Print version and exit
//     -h, --help          Print help and exit
//
// Exit codes: 1 usage error or fork failure, 2 listener setup failure,
// 3 unparsable port, 4 port out of range.
//
// Logging goes through `tracing`; set `RUST_LOG=abridge_relay=debug` to see
// every relayed frame, `=trace` for payload hex dumps.

use std::net::IpAddr;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use abridge_relay::daemon::daemonize;
use abridge_relay::server::{DEFAULT_PORT, RelayConfig, bind_listener, run_relay_blocking};

const VERSION: &str = "abridge 0.1";

const EXIT_USAGE: u8 = 1;
const EXIT_LISTEN: u8 = 2;
const EXIT_BAD_PORT: u8 = 3;
const EXIT_PORT_RANGE: u8 = 4;

#[derive(Parser, Debug)]
#[command(
    name = "abridge",
    about = "Relay length-prefixed frames between up to five TCP clients",
    disable_version_flag = true
)]
struct Cli {
    /// Port number to listen on (1-65535)
    #[arg(short, long, default_value_t = DEFAULT_PORT.to_string())]
    port: String,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Do not daemonize
    #[arg(short, long)]
    dontfork: bool,

    /// Display version and exit
    #[arg(short = 'v', long)]
    version: bool,
}

/// Parse and range-check a port string.
fn parse_port(raw: &str) -> Result<u16, u8> {
    let value: i64 = raw.trim().parse().map_err(|_| {
        eprintln!("Invalid port number: {raw}");
        EXIT_BAD_PORT
    })?;
    if !(1..=i64::from(u16::MAX)).contains(&value) {
        eprintln!("Port number {raw} out of range: {value}");
        return Err(EXIT_PORT_RANGE);
    }
    u16::try_from(value).map_err(|_| EXIT_PORT_RANGE)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("abridge=info,abridge_relay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };

    if cli.version {
        println!("{VERSION}");
        return ExitCode::SUCCESS;
    }

    let port = match parse_port(&cli.port) {
        Ok(port) => port,
        Err(code) => return ExitCode::from(code),
    };

    let detached = if cli.dontfork { Ok(()) } else { daemonize() };
    if let Err(e) = detached {
        eprintln!("fork: {e}");
        return ExitCode::from(EXIT_USAGE);
    }

    init_logging();

    let config = RelayConfig {
        bind_addr: cli.bind,
        port,
        ..RelayConfig::default()
    };
    let listener = match bind_listener(&config) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "listener setup failed");
            return ExitCode::from(EXIT_LISTEN);
        }
    };
    info!(
        addr = %config.socket_addr(),
        capacity = config.capacity,
        max_frame_len = config.max_frame_len,
        "abridge relay listening"
    );

    match run_relay_blocking(listener, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "relay stopped");
            ExitCode::from(EXIT_USAGE)
        }
    }
}
