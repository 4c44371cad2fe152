//! Interactive CoAP gateway client
//!
//! A REPL-style front end for the gateway: configure a sensor endpoint,
//! connect, and read values into the reading store.
//!
//! Usage:
//!   cargo run --example coap_client -- [--config gateway.json] [--server 127.0.0.1:5683]
//!
//! Commands:
//!   config <ip> <port>           - Store an endpoint and make it the target
//!   update <id> [ip] [port]      - Edit a stored endpoint
//!   connect / disconnect         - Toggle the link
//!   read <metric>                - Read temperature, humidity or pressure
//!   snapshot                     - Fetch the full reading as CBOR
//!   discover                     - List the server's resources
//!   status / entries / readings  - Show gateway state
//!   help                         - Show commands
//!   quit                         - Exit

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use coap_gateway::coap_types::{ContentFormat, Method, Request};
use coap_gateway::gateway::ConfigLog;
use coap_gateway::sensor::Metric;
use coap_gateway::{CoapClient, Gateway, GatewayConfig, ReadingStore, SensorSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coap-gateway-client")]
#[command(about = "Interactive CoAP gateway client")]
struct Args {
    /// Gateway config file (JSON, optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sensor endpoint to configure and connect at startup
    #[arg(long)]
    server: Option<SocketAddr>,
}

struct Client {
    gateway: Gateway,
    readings: Arc<ReadingStore>,
}

impl Client {
    async fn new(config: &GatewayConfig) -> coap_gateway::Result<Self> {
        let client = Arc::new(CoapClient::bind(&config.client).await?);
        let config_log = match &config.storage.config_log {
            Some(path) => ConfigLog::open(path)?,
            None => ConfigLog::in_memory(),
        };
        let readings = Arc::new(match &config.storage.readings {
            Some(path) => ReadingStore::open(path)?,
            None => ReadingStore::in_memory(),
        });

        Ok(Self {
            gateway: Gateway::new(client, config_log, readings.clone()),
            readings,
        })
    }

    fn cmd_config(&self, ip: IpAddr, port: u16) {
        match self.gateway.set_config(ip, port) {
            Ok((entry, status)) => println!(
                "  {:?}: #{} {} (connect to use it)",
                status,
                entry.id,
                entry.socket_addr()
            ),
            Err(e) => println!("  Error: {}", e),
        }
    }

    fn cmd_update(&self, id: u64, ip: Option<IpAddr>, port: Option<u16>) {
        match self.gateway.update_config(id, ip, port) {
            Ok(entry) => println!("  Updated #{} -> {}", entry.id, entry.socket_addr()),
            Err(e) => println!("  Error: {}", e),
        }
    }

    fn cmd_connect(&self) {
        match self.gateway.connect() {
            Ok(target) => println!("  Connected to coap://{}", target),
            Err(e) => println!("  Error: {}", e),
        }
    }

    async fn cmd_read(&self, metric: &str) {
        println!("GET /sensor \"{}\"", metric);
        match self.gateway.read_data(metric).await {
            Ok(record) => println!("  {} = {}", record.metric, record.value),
            Err(e) => println!("  Error: {}", e),
        }
    }

    async fn cmd_snapshot(&self) {
        let Some(target) = self.gateway.status().target else {
            println!("  Error: no endpoint configured");
            return;
        };
        println!("GET /sensor/snapshot (CBOR)");

        let request = match Request::new(Method::Get).with_path("sensor/snapshot") {
            Ok(request) => request.with_accept(ContentFormat::Cbor),
            Err(e) => {
                println!("  Error: {}", e);
                return;
            }
        };
        let result = self
            .gateway
            .client()
            .request(target, &request)
            .await
            .and_then(|response| {
                println!("  ← CBOR: {}", hex::encode(&response.payload));
                SensorSnapshot::from_cbor(&response.payload)
            });
        match result {
            Ok(snapshot) => {
                for metric in Metric::ALL {
                    println!("  {:<12} = {} {}", metric.name(), snapshot.get(metric), metric.unit());
                }
                println!("  {:<12} = {}", "tick", snapshot.tick());
            }
            Err(e) => println!("  Error: {}", e),
        }
    }

    async fn cmd_discover(&self) {
        let Some(target) = self.gateway.status().target else {
            println!("  Error: no endpoint configured");
            return;
        };
        println!("GET /.well-known/core");
        match self.gateway.client().discover(target).await {
            Ok(links) => {
                for link in links {
                    println!("  {}", link);
                }
            }
            Err(e) => println!("  Error: {}", e),
        }
    }

    fn cmd_status(&self) {
        let status = self.gateway.status();
        match status.target {
            Some(target) => println!("  Target:    coap://{}", target),
            None => println!("  Target:    (not configured)"),
        }
        println!("  Connected: {}", status.connected);
    }

    fn cmd_entries(&self) {
        let entries = self.gateway.config_entries();
        if entries.is_empty() {
            println!("  (no stored endpoints)");
        }
        for entry in entries {
            println!(
                "  #{:<4} {:<22} ts={}",
                entry.id,
                entry.socket_addr(),
                entry.timestamp
            );
        }
    }

    fn cmd_readings(&self) {
        let readings = self.readings.all();
        if readings.is_empty() {
            println!("  (no readings)");
        }
        for r in readings {
            println!(
                "  {:<16} {:<5} {:<12} {:>10} ts={}",
                r.address, r.protocol, r.metric, r.value, r.updated_at
            );
        }
    }
}

fn print_help() {
    println!("\nCommands:");
    println!("  config <ip> <port>          Store an endpoint and make it the target");
    println!("  update <id> [ip] [port]     Edit a stored endpoint");
    println!("  connect                     Connect to the target");
    println!("  disconnect                  Disconnect");
    println!("  read <metric>               Read temperature | humidity | pressure");
    println!("  snapshot                    Fetch the full reading as CBOR");
    println!("  discover                    List the server's resources");
    println!("  status                      Show link state");
    println!("  entries                     Show stored endpoints");
    println!("  readings                    Show stored readings");
    println!("  help                        Show this help");
    println!("  quit                        Exit\n");
}

/// Parse the optional `[ip] [port]` tail of `update`
fn parse_update_args(args: &[&str]) -> Option<(Option<IpAddr>, Option<u16>)> {
    match args {
        [] => Some((None, None)),
        [one] => match one.parse::<IpAddr>() {
            Ok(ip) => Some((Some(ip), None)),
            Err(_) => one.parse().ok().map(|port| (None, Some(port))),
        },
        [ip, port] => Some((Some(ip.parse().ok()?), Some(port.parse().ok()?))),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> coap_gateway::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(args.config.as_deref())?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CoAP Gateway Client                             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");

    let client = Client::new(&config).await?;
    if let Some(server) = args.server {
        client.cmd_config(server.ip(), server.port());
        client.cmd_connect();
    }
    client.cmd_status();
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("gateway> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, rest)) = parts.split_first() else {
            continue;
        };

        match command {
            "config" => match rest {
                [ip, port] => match (ip.parse(), port.parse()) {
                    (Ok(ip), Ok(port)) => client.cmd_config(ip, port),
                    _ => println!("  Usage: config <ip> <port>"),
                },
                _ => println!("  Usage: config <ip> <port>"),
            },
            "update" => match rest.split_first() {
                Some((id, tail)) => match (id.parse(), parse_update_args(tail)) {
                    (Ok(id), Some((ip, port))) => client.cmd_update(id, ip, port),
                    _ => println!("  Usage: update <id> [ip] [port]"),
                },
                None => println!("  Usage: update <id> [ip] [port]"),
            },
            "connect" => client.cmd_connect(),
            "disconnect" => {
                client.gateway.disconnect();
                println!("  Disconnected");
            }
            "read" => match rest {
                [metric] => client.cmd_read(metric).await,
                _ => println!("  Usage: read <metric>"),
            },
            "snapshot" => client.cmd_snapshot().await,
            "discover" => client.cmd_discover().await,
            "status" => client.cmd_status(),
            "entries" => client.cmd_entries(),
            "readings" => client.cmd_readings(),
            "help" | "?" => print_help(),
            "quit" | "exit" | "q" => break,
            other => println!("  Unknown command: {} (type 'help')", other),
        }
    }

    println!("Goodbye!");
    Ok(())
}
