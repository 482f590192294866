//! nbiiod - A Non-Blocking IIO Daemon
//!
//! This is the main entry point for the nbiiod server.
//! It sets up the TCP listener and a set of in-memory demo devices, then
//! drives the protocol engine until Ctrl+C.

use bytes::Bytes;
use nbiiod::protocol::AttrTarget;
use nbiiod::{serve, ConnectionPool, EngineConfig, LoopbackOps};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Daemon settings collected from the command line
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Maximum simultaneous clients
    max_connections: usize,
    /// Per-connection scratch buffer size in bytes
    scratch_size: usize,
    /// Coalesce READBUF data into full chunks
    network: bool,
    /// Names of the demo devices
    devices: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            host: nbiiod::DEFAULT_HOST.to_string(),
            port: nbiiod::DEFAULT_PORT,
            max_connections: engine.max_connections,
            scratch_size: engine.scratch_size,
            network: engine.network,
            devices: vec!["iio:device0".to_string(), "iio:device1".to_string()],
        }
    }
}

impl Config {
    /// Builds the configuration from command-line flags, exiting on misuse
    fn from_args() -> Self {
        let mut config = Config::default();
        let mut args = std::env::args().skip(1);

        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--host" | "-h" => config.host = value_of(&mut args, &flag),
                "--port" | "-p" => config.port = number_of(&mut args, &flag),
                "--max-connections" | "-c" => {
                    config.max_connections = number_of(&mut args, &flag);
                }
                "--scratch-size" | "-s" => {
                    config.scratch_size = number_of(&mut args, &flag);
                    if config.scratch_size == 0 {
                        fail("--scratch-size must be greater than zero");
                    }
                }
                "--network" => config.network = true,
                "--serial" => config.network = false,
                "--devices" | "-d" => {
                    config.devices = value_of(&mut args, &flag)
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("nbiiod version {}", nbiiod::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_connections: self.max_connections,
            scratch_size: self.scratch_size,
            network: self.network,
            context_xml: Bytes::from(context_xml(&self.devices)),
            ..Default::default()
        }
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn value_of(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    args.next()
        .unwrap_or_else(|| fail(&format!("{} requires a value", flag)))
}

fn number_of<T: std::str::FromStr>(args: &mut impl Iterator<Item = String>, flag: &str) -> T {
    value_of(args, flag)
        .parse()
        .unwrap_or_else(|_| fail(&format!("invalid value for {}", flag)))
}

/// Describes the demo devices for `PRINT`.
fn context_xml(devices: &[String]) -> String {
    let mut xml = String::from(concat!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
        "<!DOCTYPE context [<!ELEMENT context (device)*>",
        "<!ELEMENT device (attribute)*><!ELEMENT attribute EMPTY>",
        "<!ATTLIST device id CDATA #REQUIRED name CDATA #IMPLIED>",
        "<!ATTLIST attribute name CDATA #REQUIRED>]>",
        "<context name=\"nbiiod\" description=\"nbiiod loop-back devices\">"
    ));
    for name in devices {
        xml.push_str(&format!(
            "<device id=\"{name}\" name=\"{name}\"><attribute name=\"sampling_frequency\" /></device>"
        ));
    }
    xml.push_str("</context>");
    xml
}

fn create_devices(names: &[String]) -> LoopbackOps {
    let ops = LoopbackOps::new(names.iter().cloned());
    for name in names {
        ops.set_attr(name, &AttrTarget::Device, Some("sampling_frequency"), b"1000000");
    }
    ops
}

fn print_help() {
    println!(
        r#"
nbiiod - A Non-Blocking IIO Daemon

USAGE:
    nbiiod [OPTIONS]

OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 0.0.0.0)
    -p, --port <PORT>              Port to listen on (default: 30431)
    -c, --max-connections <N>      Maximum simultaneous clients (default: 16)
    -s, --scratch-size <BYTES>     Per-client buffer size (default: 65536)
        --network                  Send READBUF data in full chunks (default)
        --serial                   Send READBUF data as soon as it is read
    -d, --devices <A,B,...>        Demo device names (default: iio:device0,iio:device1)
    -v, --version                  Print version information
        --help                     Print this help message

LOGGING:
    Set RUST_LOG to adjust verbosity, e.g. RUST_LOG=nbiiod=debug

CONNECTING:
    Use iio_info or any libiio client to connect:
    $ iio_info -u ip:127.0.0.1
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
nbiiod v{} - Non-Blocking IIO Daemon
──────────────────────────────────────────────────────────────
Server started on {}
Devices: {}
Mode: {}, {} clients max, {} byte buffers

Use Ctrl+C to shutdown gracefully.
"#,
        nbiiod::VERSION,
        config.bind_address(),
        config.devices.join(", "),
        if config.network { "network" } else { "serial" },
        config.max_connections,
        config.scratch_size,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    let ops = Arc::new(create_devices(&config.devices));
    info!(devices = ?ops.device_names(), "Loop-back devices created");

    let pool = ConnectionPool::new(ops, config.engine_config());
    let stats = pool.stats();

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        result = serve(listener, pool) => result?,
        _ = shutdown => {}
    }

    info!(
        connections = stats.connections_accepted.load(std::sync::atomic::Ordering::Relaxed),
        commands = stats.commands_processed.load(std::sync::atomic::Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}
