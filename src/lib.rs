//! coap-gateway - CoAP telemetry endpoint and polling gateway
//!
//! This library provides a CoAP (RFC 7252) message codec, a resource tree with
//! `/.well-known/core` discovery, a simulated environmental sensor served over
//! UDP, and an async client that polls sensor values into a reading store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coap_gateway::{CoapClient, CoapServer, ResourceTree};
//! use coap_gateway::config::ClientConfig;
//! use coap_gateway::sensor::{SensorResource, SensorSimulator, snapshot_cell};
//!
//! # async fn run() -> coap_gateway::Result<()> {
//! let (mut writer, reader) = snapshot_cell();
//! writer.publish(SensorSimulator::new().next_snapshot());
//!
//! let mut tree = ResourceTree::new();
//! tree.register("sensor", SensorResource::new(reader))?;
//! tree.register_discovery()?;
//!
//! let server = CoapServer::bind("127.0.0.1:5683".parse().unwrap(), Arc::new(tree)).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(server.run(std::future::pending()));
//!
//! let client = CoapClient::bind(&ClientConfig::default()).await?;
//! let temperature = client.read_value(addr, "sensor", b"temperature").await?;
//! println!("temperature = {temperature}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod coap_types;
pub mod config;
mod error;
pub mod gateway;
pub mod message;
pub mod resource;
pub mod sensor;
pub mod server;

pub use client::{CoapClient, PendingExchange};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, ReadingSink, ReadingStore};
pub use message::Message;
pub use resource::{Link, ResourceHandler, ResourceTree};
pub use sensor::SensorSnapshot;
pub use server::CoapServer;
