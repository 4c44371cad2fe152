//! Gateway management service
//!
//! Keeps a log of configured sensor endpoints, tracks whether the gateway is
//! connected to one, and turns sensor reads into [`ReadingRecord`]s for a
//! [`ReadingSink`]. Both stores are in-memory, optionally mirrored to a JSON
//! file after every change.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::{CoapClient, check_unicast};
use crate::error::{GatewayError, Result};

/// Resource polled by [`Gateway::read_data`]
pub const SENSOR_PATH: &str = "sensor";

/// Protocol name recorded with each reading
pub const PROTOCOL_NAME: &str = "CoAP";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(T::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn check_endpoint(ip_address: IpAddr, port: u16) -> Result<()> {
    if port == 0 {
        return Err(GatewayError::InvalidConfig("port must be non-zero".into()));
    }
    check_unicast(ip_address)
}

/// One configured sensor endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub id: u64,
    pub ip_address: IpAddr,
    pub port: u16,
    /// Unix seconds of the last `record` touching this entry
    pub timestamp: u64,
}

impl ConfigEntry {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }
}

/// Outcome of [`ConfigLog::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    /// A new entry was appended
    Stored,
    /// An existing entry had its timestamp refreshed
    Updated,
}

/// Ordered log of endpoint configurations
#[derive(Debug, Default)]
pub struct ConfigLog {
    entries: Vec<ConfigEntry>,
    path: Option<PathBuf>,
}

impl ConfigLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a log mirrored to `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = load_json(&path)?;
        Ok(Self {
            entries,
            path: Some(path),
        })
    }

    /// Write `entries` to the backing file, then make them current
    fn commit(&mut self, entries: Vec<ConfigEntry>) -> Result<()> {
        if let Some(path) = &self.path {
            save_json(path, &entries)?;
        }
        self.entries = entries;
        Ok(())
    }

    /// Store an endpoint, refreshing the timestamp if it is already logged
    pub fn record(&mut self, ip_address: IpAddr, port: u16) -> Result<(ConfigEntry, ConfigStatus)> {
        check_endpoint(ip_address, port)?;

        let now = unix_now();
        let mut entries = self.entries.clone();
        let (entry, status) = match entries
            .iter_mut()
            .find(|e| e.ip_address == ip_address && e.port == port)
        {
            Some(existing) => {
                existing.timestamp = now;
                (existing.clone(), ConfigStatus::Updated)
            }
            None => {
                let entry = ConfigEntry {
                    id: entries.iter().map(|e| e.id).max().unwrap_or(0) + 1,
                    ip_address,
                    port,
                    timestamp: now,
                };
                entries.push(entry.clone());
                (entry, ConfigStatus::Stored)
            }
        };

        self.commit(entries)?;
        Ok((entry, status))
    }

    /// Edit an entry in place; the timestamp is left untouched
    pub fn update(&mut self, id: u64, ip_address: Option<IpAddr>, port: Option<u16>) -> Result<ConfigEntry> {
        let mut entries = self.entries.clone();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(GatewayError::ConfigNotFound(id))?;

        if let Some(ip_address) = ip_address {
            entry.ip_address = ip_address;
        }
        if let Some(port) = port {
            entry.port = port;
        }
        check_endpoint(entry.ip_address, entry.port)?;
        let entry = entry.clone();

        self.commit(entries)?;
        Ok(entry)
    }

    /// Entry with the highest id
    pub fn latest(&self) -> Option<&ConfigEntry> {
        self.entries.iter().max_by_key(|e| e.id)
    }

    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }
}

/// A sensor value read through the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingRecord {
    pub address: IpAddr,
    pub protocol: String,
    pub metric: String,
    pub value: f64,
    /// Unix seconds
    pub updated_at: u64,
}

/// Destination for readings
pub trait ReadingSink: Send + Sync {
    /// Insert or replace the reading for its (address, metric)
    fn upsert(&self, record: ReadingRecord) -> Result<()>;
}

type ReadingKey = (IpAddr, String);

/// Latest reading per (address, metric)
#[derive(Debug, Default)]
pub struct ReadingStore {
    readings: Mutex<BTreeMap<ReadingKey, ReadingRecord>>,
    /// Serializes file writers so the file never lags the map
    writer: Mutex<()>,
    path: Option<PathBuf>,
}

impl ReadingStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store mirrored to `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: Vec<ReadingRecord> = load_json(&path)?;
        let readings = records
            .into_iter()
            .map(|r| ((r.address, r.metric.clone()), r))
            .collect();
        Ok(Self {
            readings: Mutex::new(readings),
            writer: Mutex::new(()),
            path: Some(path),
        })
    }

    pub fn get(&self, address: IpAddr, metric: &str) -> Option<ReadingRecord> {
        self.readings
            .lock()
            .get(&(address, metric.to_string()))
            .cloned()
    }

    pub fn all(&self) -> Vec<ReadingRecord> {
        self.readings.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.readings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadingSink for ReadingStore {
    fn upsert(&self, record: ReadingRecord) -> Result<()> {
        let key = (record.address, record.metric.clone());
        let Some(path) = &self.path else {
            self.readings.lock().insert(key, record);
            return Ok(());
        };

        // readers keep the old map until the file holds the new one
        let _writer = self.writer.lock();
        let mut next = self.readings.lock().clone();
        next.insert(key, record);
        let records: Vec<&ReadingRecord> = next.values().collect();
        save_json(path, &records)?;
        *self.readings.lock() = next;
        Ok(())
    }
}

/// Snapshot of the gateway's link state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStatus {
    pub target: Option<SocketAddr>,
    pub active_id: Option<u64>,
    pub connected: bool,
}

#[derive(Debug, Default)]
struct LinkState {
    target: Option<SocketAddr>,
    active_id: Option<u64>,
    connected: bool,
}

/// Management front of the gateway
pub struct Gateway {
    client: Arc<CoapClient>,
    config_log: Mutex<ConfigLog>,
    sink: Arc<dyn ReadingSink>,
    state: Mutex<LinkState>,
}

impl Gateway {
    /// Start disconnected, targeting the most recent logged endpoint if any
    pub fn new(client: Arc<CoapClient>, config_log: ConfigLog, sink: Arc<dyn ReadingSink>) -> Self {
        let state = match config_log.latest() {
            Some(entry) => LinkState {
                target: Some(entry.socket_addr()),
                active_id: Some(entry.id),
                connected: false,
            },
            None => LinkState::default(),
        };
        Self {
            client,
            config_log: Mutex::new(config_log),
            sink,
            state: Mutex::new(state),
        }
    }

    /// Record an endpoint and make it the target; the link drops until `connect`
    pub fn set_config(&self, ip_address: IpAddr, port: u16) -> Result<(ConfigEntry, ConfigStatus)> {
        let (entry, status) = self.config_log.lock().record(ip_address, port)?;
        let mut state = self.state.lock();
        state.target = Some(entry.socket_addr());
        state.active_id = Some(entry.id);
        state.connected = false;
        info!(id = entry.id, target = %entry.socket_addr(), ?status, "gateway configured");
        Ok((entry, status))
    }

    /// Edit a logged endpoint; the target follows if that entry is active
    pub fn update_config(&self, id: u64, ip_address: Option<IpAddr>, port: Option<u16>) -> Result<ConfigEntry> {
        let entry = self.config_log.lock().update(id, ip_address, port)?;
        let mut state = self.state.lock();
        if state.active_id == Some(id) {
            state.target = Some(entry.socket_addr());
        }
        info!(id, target = %entry.socket_addr(), "configuration updated");
        Ok(entry)
    }

    pub fn connect(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock();
        let target = state.target.ok_or(GatewayError::NotConfigured)?;
        state.connected = true;
        info!(%target, "gateway connected");
        Ok(target)
    }

    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.connected {
            info!(target = ?state.target, "gateway disconnected");
        }
        state.connected = false;
    }

    pub fn status(&self) -> GatewayStatus {
        let state = self.state.lock();
        GatewayStatus {
            target: state.target,
            active_id: state.active_id,
            connected: state.connected,
        }
    }

    pub fn config_entries(&self) -> Vec<ConfigEntry> {
        self.config_log.lock().entries().to_vec()
    }

    pub fn client(&self) -> &CoapClient {
        &self.client
    }

    /// Read one metric from the connected sensor and record it
    pub async fn read_data(&self, metric: &str) -> Result<ReadingRecord> {
        let target = {
            let state = self.state.lock();
            match (state.connected, state.target) {
                (true, Some(target)) => target,
                _ => return Err(GatewayError::NotConnected),
            }
        };

        let metric = metric.trim();
        let value = self
            .client
            .read_value(target, SENSOR_PATH, metric.as_bytes())
            .await
            .inspect_err(|e| warn!(%target, metric, error = %e, "sensor read failed"))?;

        let record = ReadingRecord {
            address: target.ip(),
            protocol: PROTOCOL_NAME.to_string(),
            metric: metric.to_string(),
            value,
            updated_at: unix_now(),
        };
        let sink = self.sink.clone();
        let stored = record.clone();
        tokio::task::spawn_blocking(move || sink.upsert(stored))
            .await
            .map_err(std::io::Error::other)??;
        info!(%target, metric, value, "reading stored");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn reading(metric: &str, value: f64) -> ReadingRecord {
        ReadingRecord {
            address: HOST,
            protocol: PROTOCOL_NAME.to_string(),
            metric: metric.to_string(),
            value,
            updated_at: 1,
        }
    }

    #[test]
    fn test_config_log_record_and_update() {
        let mut log = ConfigLog::in_memory();
        let (first, status) = log.record(HOST, 5683).unwrap();
        assert_eq!(status, ConfigStatus::Stored);
        assert_eq!(first.id, 1);

        let (again, status) = log.record(HOST, 5683).unwrap();
        assert_eq!(status, ConfigStatus::Updated);
        assert_eq!(again.id, 1);
        assert_eq!(log.entries().len(), 1);

        let (second, _) = log.record(HOST, 5684).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(log.latest().map(|e| e.id), Some(2));

        let edited = log.update(1, None, Some(6000)).unwrap();
        assert_eq!(edited.port, 6000);
        assert_eq!(edited.timestamp, again.timestamp);

        assert!(matches!(log.update(9, None, None), Err(GatewayError::ConfigNotFound(9))));
        assert!(matches!(log.record(HOST, 0), Err(GatewayError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_log_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_log.json");

        let mut log = ConfigLog::open(&path).unwrap();
        assert!(log.entries().is_empty());
        log.record(HOST, 5683).unwrap();
        log.record(IpAddr::V4(Ipv4Addr::LOCALHOST), 5683).unwrap();

        let reopened = ConfigLog::open(&path).unwrap();
        assert_eq!(reopened.entries(), log.entries());
        assert_eq!(reopened.latest().map(|e| e.ip_address), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_reading_store_upserts() {
        let store = ReadingStore::in_memory();
        store.upsert(reading("temperature", 21.0)).unwrap();
        store.upsert(reading("humidity", 55.0)).unwrap();
        store.upsert(reading("temperature", 22.5)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(HOST, "temperature").map(|r| r.value), Some(22.5));
    }

    #[test]
    fn test_reading_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.json");

        let store = ReadingStore::open(&path).unwrap();
        store.upsert(reading("pressure", 1001.3)).unwrap();
        store.upsert(reading("pressure", 1002.0)).unwrap();

        let reopened = ReadingStore::open(&path).unwrap();
        assert_eq!(reopened.all(), vec![reading("pressure", 1002.0)]);
    }

    #[test]
    fn test_failed_write_leaves_stores_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing_dir").join("store.json");

        let mut log = ConfigLog::open(&path).unwrap();
        assert!(matches!(log.record(HOST, 5683), Err(GatewayError::Io(_))));
        assert!(log.entries().is_empty());
        assert!(log.latest().is_none());

        let store = ReadingStore::open(&path).unwrap();
        assert!(matches!(
            store.upsert(reading("temperature", 21.0)),
            Err(GatewayError::Io(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_update_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_log.json");
        let mut log = ConfigLog::open(&path).unwrap();
        let (entry, _) = log.record(HOST, 5683).unwrap();

        // swap the file for a directory so the next write fails
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(log.update(entry.id, None, Some(7000)).is_err());
        assert_eq!(log.entries(), &[entry]);
    }

    #[test]
    fn test_rejects_non_unicast_endpoints() {
        let mut log = ConfigLog::in_memory();
        for ip in ["0.0.0.0", "::", "239.255.0.1"] {
            assert!(matches!(
                log.record(ip.parse().unwrap(), 5683),
                Err(GatewayError::InvalidConfig(_))
            ));
        }
        assert!(log.entries().is_empty());

        let (entry, _) = log.record(HOST, 5683).unwrap();
        assert!(matches!(
            log.update(entry.id, Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), None),
            Err(GatewayError::InvalidConfig(_))
        ));
        assert_eq!(log.entries(), &[entry]);
    }

    #[tokio::test]
    async fn test_gateway_link_state() {
        let client = Arc::new(CoapClient::bind(&Default::default()).await.unwrap());
        let gateway = Gateway::new(client, ConfigLog::in_memory(), Arc::new(ReadingStore::in_memory()));

        assert!(matches!(gateway.connect(), Err(GatewayError::NotConfigured)));
        assert!(matches!(
            gateway.read_data("temperature").await,
            Err(GatewayError::NotConnected)
        ));

        let (entry, _) = gateway.set_config(HOST, 5683).unwrap();
        assert_eq!(gateway.connect().unwrap(), entry.socket_addr());
        assert!(gateway.status().connected);

        gateway.update_config(entry.id, None, Some(5700)).unwrap();
        assert_eq!(gateway.status().target, Some(SocketAddr::new(HOST, 5700)));

        gateway.disconnect();
        assert!(!gateway.status().connected);

        // a rejected endpoint leaves the target alone
        assert!(gateway.set_config(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5683).is_err());
        assert_eq!(gateway.status().target, Some(SocketAddr::new(HOST, 5700)));
        assert_eq!(gateway.config_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_resumes_latest_config() {
        let mut log = ConfigLog::in_memory();
        log.record(HOST, 5683).unwrap();
        log.record(HOST, 5690).unwrap();

        let client = Arc::new(CoapClient::bind(&Default::default()).await.unwrap());
        let gateway = Gateway::new(client, log, Arc::new(ReadingStore::in_memory()));
        let status = gateway.status();

        assert_eq!(status.target, Some(SocketAddr::new(HOST, 5690)));
        assert_eq!(status.active_id, Some(2));
        assert!(!status.connected);
    }
}
