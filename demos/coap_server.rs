//! Simulated CoAP sensor endpoint
//!
//! Usage:
//!   cargo run --example coap_server -- [--config gateway.json] [--port 5683] [--interval-ms 5000]
//!
//! Resources:
//!   /sensor             - GET with payload "temperature" | "humidity" | "pressure"
//!   /sensor/snapshot    - GET the full reading (JSON, or CBOR with Accept: 60)
//!   /.well-known/core   - resource discovery

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use coap_gateway::coap_types::{ContentFormat, resource_types};
use coap_gateway::resource::Link;
use coap_gateway::sensor::{SensorResource, SnapshotResource, snapshot_cell, spawn_simulator};
use coap_gateway::{CoapServer, GatewayConfig, ResourceTree};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coap-sensor-server")]
#[command(about = "CoAP sensor server - serve simulated environmental readings")]
struct Args {
    /// Gateway config file (JSON, optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Milliseconds between sensor updates (overrides the config file)
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> coap_gateway::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.bind.set_port(port);
    }
    if let Some(interval_ms) = args.interval_ms {
        config.server.update_interval_ms = interval_ms;
    }
    config.validate()?;

    run_server(config.server.bind, &config).await
}

async fn run_server(bind: SocketAddr, config: &GatewayConfig) -> coap_gateway::Result<()> {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CoAP Sensor Server                              ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let (writer, reader) = snapshot_cell();
    let simulator = spawn_simulator(writer, config.server.update_interval());

    let mut tree = ResourceTree::new();
    tree.register_with(
        Link::new("sensor")
            .with_resource_type(resource_types::SENSOR)
            .with_content_format(ContentFormat::TextPlain),
        SensorResource::new(reader.clone()),
    )?;
    tree.register_with(
        Link::new("sensor/snapshot")
            .with_resource_type(resource_types::SENSOR_SNAPSHOT)
            .with_content_format(ContentFormat::Json)
            .with_content_format(ContentFormat::Cbor),
        SnapshotResource::new(reader),
    )?;
    tree.register_discovery()?;

    let server = CoapServer::bind(bind, Arc::new(tree)).await?;
    let addr = server.local_addr()?;

    println!("────────────────────────────────────────────────────────────────");
    println!("Server listening on: coap://{}", addr);
    println!("Update interval:     {:?}", config.server.update_interval());
    println!("────────────────────────────────────────────────────────────────");
    println!("\nQuick test:");
    println!(
        "  coap-client -m get -e temperature coap://127.0.0.1:{}/sensor",
        addr.port()
    );
    println!("  cargo run --example coap_client -- --server 127.0.0.1:{}", addr.port());
    println!("\nWaiting for requests... (Ctrl+C to stop)\n");

    server
        .run(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n\nReceived Ctrl+C, shutting down...");
            }
        })
        .await?;

    simulator.abort();
    Ok(())
}
