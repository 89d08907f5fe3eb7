//! Sources of sensor and actuator updates for the [`DeviceStateStore`].
//!
//! The store only ever sees [`TelemetryUpdate`]s; whether they come from the
//! synthetic drift generator or a live board makes no difference to it.

use std::{future::Future, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpStream,
    sync::broadcast::{self, error::RecvError},
    time::{self, Interval, MissedTickBehavior},
};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

use super::{DeviceStateStore, StateEvent};
use crate::db::models::{Device, SensorType, SensorValue};

const MOTION_PROBABILITY: f64 = 0.1;
const MAX_FEED_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryUpdate {
    Sensor { id: String, value: SensorValue },
    State { id: String, state: bool },
}

pub trait TelemetrySource: Send {
    fn name(&self) -> &'static str;

    /// Wait for the next batch of updates. `Ok(None)` means the source is
    /// finished for good.
    fn next_batch(
        &mut self,
        store: &DeviceStateStore,
    ) -> impl Future<Output = anyhow::Result<Option<Vec<TelemetryUpdate>>>> + Send;
}

/// Feed `source` into `store` until cancelled or the source ends.
pub async fn pump<T: TelemetrySource>(mut source: T, store: DeviceStateStore, cancel: CancellationToken) {
    info!(source = source.name(), "Telemetry pump started");
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = source.next_batch(&store) => batch,
        };
        match batch {
            Ok(Some(updates)) => {
                for update in updates {
                    store.apply_telemetry(update);
                }
            }
            Ok(None) => {
                info!(source = source.name(), "Telemetry source finished");
                break;
            }
            Err(e) => error!(source = source.name(), error = %e, "Telemetry batch failed"),
        }
    }
    info!(source = source.name(), "Telemetry pump stopped");
}

// ---------------------------------------------------------------------------
// Synthetic drift
// ---------------------------------------------------------------------------

/// Demo signal: nudges every numeric sensor by a bounded random step per
/// tick and rolls the dice for motion sensors.
pub struct SyntheticDrift {
    ticker: Interval,
    rng: StdRng,
}

impl SyntheticDrift {
    pub fn new(period: Duration) -> Self {
        Self::with_rng(period, StdRng::from_entropy())
    }

    pub fn with_rng(period: Duration, rng: StdRng) -> Self {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { ticker, rng }
    }
}

impl TelemetrySource for SyntheticDrift {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn next_batch(
        &mut self,
        store: &DeviceStateStore,
    ) -> anyhow::Result<Option<Vec<TelemetryUpdate>>> {
        self.ticker.tick().await;
        let updates = store
            .devices()
            .iter()
            .filter(|d| d.kind.is_sensor())
            .filter_map(|d| {
                drift_value(d, &mut self.rng).map(|value| TelemetryUpdate::Sensor {
                    id: d.id.clone(),
                    value,
                })
            })
            .collect();
        Ok(Some(updates))
    }
}

/// `(min, max, largest step per tick)` for each numeric sensor type.
fn drift_range(sensor_type: SensorType) -> Option<(f64, f64, f64)> {
    let range = match sensor_type {
        SensorType::Temperature => (15.0, 40.0, 0.25),
        SensorType::Humidity => (20.0, 90.0, 1.0),
        SensorType::Light => (0.0, 1500.0, 25.0),
        SensorType::Pressure => (950.0, 1050.0, 0.5),
        SensorType::Gas => (0.0, 1000.0, 10.0),
        SensorType::WaterLevel | SensorType::SoilMoisture => (0.0, 100.0, 1.0),
        SensorType::Distance => (0.0, 400.0, 2.0),
        SensorType::Current => (0.0, 20.0, 0.1),
        SensorType::Voltage => (200.0, 240.0, 0.5),
        SensorType::Power => (0.0, 3000.0, 20.0),
        SensorType::Ph => (0.0, 14.0, 0.05),
        SensorType::Tds => (0.0, 2000.0, 10.0),
        SensorType::Flow => (0.0, 30.0, 0.2),
        SensorType::Motion => return None,
    };
    Some(range)
}

/// Next synthetic value for one sensor, rounded to one decimal.
fn drift_value(device: &Device, rng: &mut impl Rng) -> Option<SensorValue> {
    let sensor_type = device.sensor_type?;
    if sensor_type == SensorType::Motion {
        return Some(SensorValue::Bool(rng.gen_bool(MOTION_PROBABILITY)));
    }
    let (min, max, step) = drift_range(sensor_type)?;
    let SensorValue::Number(current) = device.value? else {
        return None;
    };
    let next = (current + rng.gen_range(-step..=step)).clamp(min, max);
    Some(SensorValue::Number((next * 10.0).round() / 10.0))
}

// ---------------------------------------------------------------------------
// Live device feed
// ---------------------------------------------------------------------------

/// One line of the device feed protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    SensorUpdate {
        id: String,
        value: SensorValue,
    },
    DeviceState {
        id: String,
        state: bool,
    },
    Control {
        id: String,
        state: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brightness: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<u8>,
    },
}

/// Decode an inbound feed line. Malformed lines and outbound-only message
/// types yield `None`.
pub fn parse_feed_line(line: &str) -> Option<TelemetryUpdate> {
    match serde_json::from_str::<FeedMessage>(line.trim()) {
        Ok(FeedMessage::SensorUpdate { id, value }) => Some(TelemetryUpdate::Sensor { id, value }),
        Ok(FeedMessage::DeviceState { id, state }) => Some(TelemetryUpdate::State { id, state }),
        Ok(FeedMessage::Control { .. }) => None,
        Err(e) => {
            debug!(error = %e, line, "Ignoring unreadable feed line");
            None
        }
    }
}

/// Newline-delimited JSON over TCP to a board. Every
/// [`StateEvent::DeviceControlled`] is forwarded as a `control` line.
/// Dropped connections are retried after `reconnect_delay`, forever.
pub struct DeviceFeed {
    addr: String,
    reconnect_delay: Duration,
    conn: Option<Framed<TcpStream, LinesCodec>>,
    controls: Option<broadcast::Receiver<StateEvent>>,
}

enum Wake {
    Line(Option<Result<String, LinesCodecError>>),
    Control(Result<StateEvent, RecvError>),
}

impl DeviceFeed {
    pub fn new(addr: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            addr: addr.into(),
            reconnect_delay,
            conn: None,
            controls: None,
        }
    }

    async fn connect(&mut self) {
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!(addr = %self.addr, "Device feed connected");
                    self.conn = Some(Framed::new(
                        stream,
                        LinesCodec::new_with_max_length(MAX_FEED_LINE),
                    ));
                    return;
                }
                Err(e) => {
                    warn!(
                        addr = %self.addr,
                        error = %e,
                        retry_secs = self.reconnect_delay.as_secs_f64(),
                        "Device feed connect failed"
                    );
                    time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn drop_connection(&mut self, reason: &str) {
        warn!(addr = %self.addr, reason, "Device feed disconnected");
        self.conn = None;
        time::sleep(self.reconnect_delay).await;
    }
}

impl TelemetrySource for DeviceFeed {
    fn name(&self) -> &'static str {
        "device_feed"
    }

    async fn next_batch(
        &mut self,
        store: &DeviceStateStore,
    ) -> anyhow::Result<Option<Vec<TelemetryUpdate>>> {
        if self.controls.is_none() {
            self.controls = Some(store.subscribe());
        }
        loop {
            if self.conn.is_none() {
                self.connect().await;
            }
            let (Some(conn), Some(controls)) = (self.conn.as_mut(), self.controls.as_mut()) else {
                continue;
            };

            let wake = tokio::select! {
                line = conn.next() => Wake::Line(line),
                event = controls.recv() => Wake::Control(event),
            };

            match wake {
                Wake::Line(Some(Ok(line))) => {
                    if let Some(update) = parse_feed_line(&line) {
                        return Ok(Some(vec![update]));
                    }
                }
                Wake::Line(Some(Err(e))) => self.drop_connection(&e.to_string()).await,
                Wake::Line(None) => self.drop_connection("closed by peer").await,
                Wake::Control(Ok(StateEvent::DeviceControlled {
                    id,
                    state,
                    brightness,
                    speed,
                })) => {
                    let line = serde_json::to_string(&FeedMessage::Control {
                        id,
                        state,
                        brightness,
                        speed,
                    })?;
                    let sent = match self.conn.as_mut() {
                        Some(conn) => conn.send(line).await,
                        None => continue,
                    };
                    if let Err(e) = sent {
                        self.drop_connection(&e.to_string()).await;
                    }
                }
                Wake::Control(Ok(_)) => {}
                Wake::Control(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Device feed fell behind on control events");
                }
                Wake::Control(Err(RecvError::Closed)) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;
    use crate::{
        db::models::DeviceKind,
        state::{ControlOptions, StoreSnapshot},
    };

    fn sensor(sensor_type: SensorType, value: f64) -> Device {
        Device {
            sensor_type: Some(sensor_type),
            value: Some(SensorValue::Number(value)),
            ..Device::auto_registered("s1", DeviceKind::Sensor)
        }
    }

    #[test]
    fn drift_stays_inside_range_and_rounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut device = sensor(SensorType::Temperature, 39.9);
        for _ in 0..500 {
            let Some(SensorValue::Number(v)) = drift_value(&device, &mut rng) else {
                panic!("temperature must stay numeric");
            };
            assert!((15.0..=40.0).contains(&v), "{v}");
            assert_eq!((v * 10.0).round() / 10.0, v);
            device.value = Some(SensorValue::Number(v));
        }
    }

    #[test]
    fn drift_step_is_bounded() {
        let mut rng = StdRng::seed_from_u64(11);
        let device = sensor(SensorType::Humidity, 50.0);
        for _ in 0..200 {
            let v = drift_value(&device, &mut rng).unwrap().as_f64();
            assert!((v - 50.0).abs() <= 1.0 + 0.05, "{v}");
        }
    }

    #[test]
    fn motion_resolves_to_bool() {
        let mut rng = StdRng::seed_from_u64(3);
        let device = Device {
            sensor_type: Some(SensorType::Motion),
            value: Some(SensorValue::Bool(false)),
            ..Device::auto_registered("m1", DeviceKind::Sensor)
        };
        let hits = (0..1000)
            .filter(|_| drift_value(&device, &mut rng) == Some(SensorValue::Bool(true)))
            .count();
        assert!((50..200).contains(&hits), "{hits}");
    }

    #[test]
    fn untyped_sensors_do_not_drift() {
        let mut rng = StdRng::seed_from_u64(1);
        let device = Device::auto_registered("esp32", DeviceKind::Sensor);
        assert_eq!(drift_value(&device, &mut rng), None);
    }

    #[test]
    fn feed_lines_decode() {
        assert_eq!(
            parse_feed_line(r#"{"type":"sensor_update","id":"temp1","value":21.5}"#),
            Some(TelemetryUpdate::Sensor {
                id: "temp1".into(),
                value: SensorValue::Number(21.5)
            })
        );
        assert_eq!(
            parse_feed_line(r#"{"type":"device_state","id":"relay1","state":true}"#),
            Some(TelemetryUpdate::State {
                id: "relay1".into(),
                state: true
            })
        );
        assert_eq!(parse_feed_line(r#"{"type":"control","id":"x","state":true}"#), None);
        assert_eq!(parse_feed_line("garbage"), None);
    }

    #[tokio::test]
    async fn synthetic_batch_covers_every_demo_sensor() {
        let store = DeviceStateStore::with_demo_data();
        let mut source = SyntheticDrift::with_rng(Duration::from_millis(5), StdRng::seed_from_u64(5));
        let batch = source.next_batch(&store).await.unwrap().unwrap();
        let mut ids: Vec<_> = batch
            .iter()
            .map(|u| match u {
                TelemetryUpdate::Sensor { id, .. } => id.as_str(),
                TelemetryUpdate::State { id, .. } => id.as_str(),
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["hum1", "light1", "motion1", "temp1"]);
    }

    #[tokio::test]
    async fn pump_applies_updates_and_stops_on_cancel() {
        let store = DeviceStateStore::with_demo_data();
        let mut events = store.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(
            SyntheticDrift::new(Duration::from_millis(5)),
            store.clone(),
            cancel.clone(),
        ));

        let event = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StateEvent::SensorChanged { .. }));

        cancel.cancel();
        time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn device_feed_reads_updates_and_forwards_control() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store = DeviceStateStore::with_demo_data();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(
            DeviceFeed::new(addr, Duration::from_millis(10)),
            store.clone(),
            cancel.clone(),
        ));

        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        write
            .write_all(b"{\"type\":\"sensor_update\",\"id\":\"temp1\",\"value\":30.5}\n")
            .await
            .unwrap();

        time::timeout(Duration::from_secs(2), async {
            while store.device("temp1").and_then(|d| d.value) != Some(SensorValue::Number(30.5)) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        store.control_device("relay1", true, ControlOptions::default());
        let mut lines = BufReader::new(read).lines();
        let line = time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let msg: FeedMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(
            msg,
            FeedMessage::Control {
                id: "relay1".into(),
                state: true,
                brightness: None,
                speed: None
            }
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn device_feed_reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store = DeviceStateStore::new(StoreSnapshot::default());
        let mut feed = DeviceFeed::new(addr, Duration::from_millis(10));

        let server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let (mut second, _) = listener.accept().await.unwrap();
            second
                .write_all(b"{\"type\":\"device_state\",\"id\":\"relay1\",\"state\":true}\n")
                .await
                .unwrap();
            second
        });

        let batch = time::timeout(Duration::from_secs(2), feed.next_batch(&store))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            batch,
            vec![TelemetryUpdate::State {
                id: "relay1".into(),
                state: true
            }]
        );
        drop(server.await.unwrap());
    }
}
