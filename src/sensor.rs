//! Simulated sensor state and the resources that expose it
//!
//! The latest readings live in a single-writer snapshot cell: the simulator
//! task owns the [`SnapshotWriter`] and replaces the whole
//! [`SensorSnapshot`] on every tick, while handlers hold cloneable
//! [`SnapshotReader`]s and only ever see complete snapshots.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::coap_types::{ContentFormat, Method, Request, Response, ResponseCode};
use crate::error::{GatewayError, Result};

/// Diagnostic returned for unknown metric names
pub const INVALID_PARAMETER: &str = "Invalid sensor parameter";

/// Metrics published by the sensor endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Temperature,
    Humidity,
    Pressure,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Temperature, Metric::Humidity, Metric::Pressure];

    pub fn name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Pressure => "hPa",
        }
    }

    /// Physical range every published value stays within
    pub fn range(self) -> RangeInclusive<f64> {
        match self {
            Self::Temperature => 20.0..=35.0,
            Self::Humidity => 40.0..=80.0,
            Self::Pressure => 950.0..=1050.0,
        }
    }

    /// Exact, case-sensitive name lookup
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One complete set of readings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    temperature: f64,
    humidity: f64,
    pressure: f64,
    /// Simulator tick that produced this snapshot
    tick: u64,
}

#[derive(Deserialize)]
struct RawSnapshot {
    temperature: f64,
    humidity: f64,
    pressure: f64,
    #[serde(default)]
    tick: u64,
}

impl SensorSnapshot {
    /// Build a snapshot, checking every value against its metric's range
    pub fn new(temperature: f64, humidity: f64, pressure: f64) -> Result<Self> {
        let snapshot = Self {
            temperature,
            humidity,
            pressure,
            tick: 0,
        };
        for metric in Metric::ALL {
            let value = snapshot.get(metric);
            if !metric.range().contains(&value) {
                return Err(GatewayError::OutOfRange {
                    metric: metric.name().to_string(),
                    value,
                });
            }
        }
        Ok(snapshot)
    }

    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = tick;
        self
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
            Metric::Pressure => self.pressure,
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<f64> {
        Metric::from_name(name).map(|m| self.get(m))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| GatewayError::CborEncode(e.to_string()))?;
        Ok(bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: RawSnapshot = serde_json::from_slice(bytes)?;
        Self::from_raw(raw)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let raw: RawSnapshot =
            ciborium::from_reader(bytes).map_err(|e| GatewayError::CborDecode(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSnapshot) -> Result<Self> {
        Ok(Self::new(raw.temperature, raw.humidity, raw.pressure)?.with_tick(raw.tick))
    }
}

struct SnapshotSlot {
    current: RwLock<Option<Arc<SensorSnapshot>>>,
}

/// Sole writer of the snapshot cell
pub struct SnapshotWriter {
    slot: Arc<SnapshotSlot>,
}

/// Read-only view of the latest snapshot
#[derive(Clone)]
pub struct SnapshotReader {
    slot: Arc<SnapshotSlot>,
}

/// Create an empty snapshot cell
pub fn snapshot_cell() -> (SnapshotWriter, SnapshotReader) {
    let slot = Arc::new(SnapshotSlot {
        current: RwLock::new(None),
    });
    (
        SnapshotWriter { slot: slot.clone() },
        SnapshotReader { slot },
    )
}

impl SnapshotWriter {
    /// Replace the published snapshot in one step
    pub fn publish(&mut self, snapshot: SensorSnapshot) {
        *self.slot.current.write() = Some(Arc::new(snapshot));
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            slot: self.slot.clone(),
        }
    }
}

impl SnapshotReader {
    /// Latest snapshot, or `None` before the first publish
    pub fn load(&self) -> Option<Arc<SensorSnapshot>> {
        self.slot.current.read().clone()
    }
}

impl fmt::Debug for SnapshotReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotReader")
            .field("current", &self.load())
            .finish()
    }
}

/// Uniform random readings within each metric's range, rounded to 2 decimals
pub struct SensorSimulator {
    rng: StdRng,
    tick: u64,
}

impl Default for SensorSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSimulator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            tick: 0,
        }
    }

    /// Deterministic sequence, for tests
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            tick: 0,
        }
    }

    pub fn next_snapshot(&mut self) -> SensorSnapshot {
        self.tick += 1;
        let rng = &mut self.rng;
        let mut sample = |metric: Metric| round2(rng.gen_range(metric.range()));
        let temperature = sample(Metric::Temperature);
        let humidity = sample(Metric::Humidity);
        let pressure = sample(Metric::Pressure);
        SensorSnapshot {
            temperature,
            humidity,
            pressure,
            tick: self.tick,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Publish a fresh snapshot now and then every `interval`
pub fn spawn_simulator(mut writer: SnapshotWriter, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut simulator = SensorSimulator::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = simulator.next_snapshot();
            info!(
                tick = snapshot.tick,
                temperature = snapshot.temperature,
                humidity = snapshot.humidity,
                pressure = snapshot.pressure,
                "generated sensor data"
            );
            writer.publish(snapshot);
        }
    })
}

/// `/sensor`: GET with a metric name as payload, answers with its value as text
pub struct SensorResource {
    reader: SnapshotReader,
}

impl SensorResource {
    pub fn new(reader: SnapshotReader) -> Self {
        Self { reader }
    }
}

impl crate::resource::ResourceHandler for SensorResource {
    fn handle(&self, request: &Request) -> Response {
        if request.method != Method::Get {
            return Response::method_not_allowed(request.method);
        }

        let Ok(parameter) = std::str::from_utf8(&request.payload) else {
            warn!("sensor parameter is not valid UTF-8");
            return Response::error(ResponseCode::BadRequest, INVALID_PARAMETER);
        };
        let parameter = parameter.trim();
        let Some(metric) = Metric::from_name(parameter) else {
            warn!(parameter, "invalid sensor parameter");
            return Response::error(ResponseCode::BadRequest, INVALID_PARAMETER);
        };

        let Some(snapshot) = self.reader.load() else {
            error!(%metric, "no sensor snapshot published yet");
            return Response::error(
                ResponseCode::InternalServerError,
                "Server Error: sensor data not available",
            );
        };
        let value = snapshot.get(metric);
        if !value.is_finite() {
            error!(%metric, value, "non-finite sensor reading");
            return Response::error(
                ResponseCode::InternalServerError,
                "Server Error: sensor reading unavailable",
            );
        }

        debug!(%metric, value, "sensor reading served");
        // `{:?}` keeps the fractional part: 60.0, not 60
        Response::content(format!("{value:?}").into_bytes(), ContentFormat::TextPlain)
    }
}

/// `/sensor/snapshot`: whole snapshot as JSON, or CBOR with `Accept: 60`
pub struct SnapshotResource {
    reader: SnapshotReader,
}

impl SnapshotResource {
    pub fn new(reader: SnapshotReader) -> Self {
        Self { reader }
    }
}

impl crate::resource::ResourceHandler for SnapshotResource {
    fn handle(&self, request: &Request) -> Response {
        if request.method != Method::Get {
            return Response::method_not_allowed(request.method);
        }

        let format = match request.accept.map(ContentFormat::from_u16) {
            None | Some(Some(ContentFormat::Json)) => ContentFormat::Json,
            Some(Some(ContentFormat::Cbor)) => ContentFormat::Cbor,
            Some(_) => {
                return Response::error(
                    ResponseCode::NotAcceptable,
                    "Supported formats: application/json, application/cbor",
                );
            }
        };

        let Some(snapshot) = self.reader.load() else {
            return Response::error(
                ResponseCode::InternalServerError,
                "Server Error: sensor data not available",
            );
        };
        let encoded = match format {
            ContentFormat::Cbor => snapshot.to_cbor(),
            _ => snapshot.to_json(),
        };
        match encoded {
            Ok(payload) => Response::content(payload, format),
            Err(e) => {
                error!(error = %e, "failed to encode sensor snapshot");
                Response::error(
                    ResponseCode::InternalServerError,
                    &format!("Server Error: {e}"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceHandler;

    fn reader_with(snapshot: SensorSnapshot) -> SnapshotReader {
        let (mut writer, reader) = snapshot_cell();
        writer.publish(snapshot);
        reader
    }

    fn scenario_snapshot() -> SensorSnapshot {
        SensorSnapshot::new(23.5, 60.0, 1001.3).unwrap()
    }

    fn get_metric(payload: &[u8]) -> Request {
        Request::new(Method::Get)
            .with_path("/sensor")
            .unwrap()
            .with_payload(payload.to_vec())
    }

    #[test]
    fn test_known_metric() {
        let handler = SensorResource::new(reader_with(scenario_snapshot()));
        let response = handler.handle(&get_metric(b"temperature"));

        assert_eq!(response.code, ResponseCode::Content);
        assert_eq!(response.payload_text(), "23.5");
        assert_eq!(response.content_format, Some(ContentFormat::TextPlain));
    }

    #[test]
    fn test_whole_values_keep_fraction() {
        let handler = SensorResource::new(reader_with(scenario_snapshot()));
        let response = handler.handle(&get_metric(b"humidity"));
        assert_eq!(response.payload_text(), "60.0");

        let snapshot = SensorSnapshot::new(30.0, 45.25, 1000.0).unwrap();
        let handler = SensorResource::new(reader_with(snapshot));
        assert_eq!(handler.handle(&get_metric(b"pressure")).payload_text(), "1000.0");
    }

    #[test]
    fn test_payload_is_trimmed() {
        let handler = SensorResource::new(reader_with(scenario_snapshot()));
        let response = handler.handle(&get_metric(b"  pressure\n"));
        assert_eq!(response.payload_text().parse::<f64>().unwrap(), 1001.3);
    }

    #[test]
    fn test_unknown_metric_is_bad_request() {
        let handler = SensorResource::new(reader_with(scenario_snapshot()));

        for payload in [&b"voltage"[..], b"", b"Temperature", b"\xff\xfe"] {
            let response = handler.handle(&get_metric(payload));
            assert_eq!(response.code, ResponseCode::BadRequest);
            assert_eq!(response.payload_text(), INVALID_PARAMETER);
        }
    }

    #[test]
    fn test_missing_snapshot_is_server_error() {
        let (_writer, reader) = snapshot_cell();
        let response = SensorResource::new(reader).handle(&get_metric(b"humidity"));
        assert_eq!(response.code, ResponseCode::InternalServerError);
        assert!(response.payload_text().starts_with("Server Error"));
    }

    #[test]
    fn test_non_get_is_rejected() {
        let handler = SensorResource::new(reader_with(scenario_snapshot()));
        let request = Request::new(Method::Put).with_payload(b"temperature".to_vec());
        assert_eq!(handler.handle(&request).code, ResponseCode::MethodNotAllowed);
    }

    #[test]
    fn test_snapshot_validates_ranges() {
        let result = SensorSnapshot::new(23.0, 81.0, 1000.0);
        assert!(matches!(
            result,
            Err(GatewayError::OutOfRange { metric, .. }) if metric == "humidity"
        ));
        assert!(SensorSnapshot::new(f64::NAN, 50.0, 1000.0).is_err());
    }

    #[test]
    fn test_simulator_stays_in_range() {
        let mut simulator = SensorSimulator::with_seed(7);
        for expected_tick in 1..=500 {
            let snapshot = simulator.next_snapshot();
            assert_eq!(snapshot.tick(), expected_tick);
            for metric in Metric::ALL {
                let value = snapshot.get(metric);
                assert!(metric.range().contains(&value), "{metric} = {value}");
                assert_eq!(round2(value), value);
            }
        }
    }

    #[test]
    fn test_every_metric_served_in_range() {
        let mut simulator = SensorSimulator::with_seed(11);
        let handler = SensorResource::new(reader_with(simulator.next_snapshot()));

        for metric in Metric::ALL {
            let response = handler.handle(&get_metric(metric.name().as_bytes()));
            assert_eq!(response.code, ResponseCode::Content);
            let value: f64 = response.payload_text().parse().unwrap();
            assert!(metric.range().contains(&value));
        }
    }

    #[test]
    fn test_readers_never_see_mixed_ticks() {
        let (mut writer, reader) = snapshot_cell();
        let consistent = |n: u64| {
            let offset = (n % 10) as f64;
            SensorSnapshot::new(20.0 + offset, 40.0 + offset, 950.0 + offset)
                .unwrap()
                .with_tick(n)
        };
        writer.publish(consistent(0));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader = reader.clone();
                std::thread::spawn(move || {
                    for _ in 0..20_000 {
                        let snapshot = reader.load().unwrap();
                        let offset = (snapshot.tick() % 10) as f64;
                        assert_eq!(snapshot.get(Metric::Temperature), 20.0 + offset);
                        assert_eq!(snapshot.get(Metric::Humidity), 40.0 + offset);
                        assert_eq!(snapshot.get(Metric::Pressure), 950.0 + offset);
                    }
                })
            })
            .collect();

        for n in 1..20_000 {
            writer.publish(consistent(n));
        }
        for handle in readers {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_snapshot_resource_formats() {
        let snapshot = scenario_snapshot().with_tick(4);
        let handler = SnapshotResource::new(reader_with(snapshot.clone()));
        let request = Request::new(Method::Get).with_path("/sensor/snapshot").unwrap();

        let json = handler.handle(&request);
        assert_eq!(json.content_format, Some(ContentFormat::Json));
        assert_eq!(SensorSnapshot::from_json(&json.payload).unwrap(), snapshot);

        let cbor = handler.handle(&request.clone().with_accept(ContentFormat::Cbor));
        assert_eq!(cbor.content_format, Some(ContentFormat::Cbor));
        assert_eq!(SensorSnapshot::from_cbor(&cbor.payload).unwrap(), snapshot);

        let text = handler.handle(&request.with_accept(ContentFormat::TextPlain));
        assert_eq!(text.code, ResponseCode::NotAcceptable);
    }

    #[test]
    fn test_decoded_snapshot_is_validated() {
        let bogus = br#"{"temperature": 99.0, "humidity": 50.0, "pressure": 1000.0}"#;
        assert!(matches!(
            SensorSnapshot::from_json(bogus),
            Err(GatewayError::OutOfRange { .. })
        ));
    }
}
