//! MQTT telemetry transport. Nodes publish batches of probe samples to
//! `tele/<node_id>/reading`; each sample is queued on its device's ingest
//! lane as `<node_id>/<sensor_id>`.

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::ingest::{IngestLanes, RawSample};
use crate::state::SharedState;

pub const TELEMETRY_TOPIC: &str = "tele/+/reading";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ProbeSample {
    pub(crate) sensor_id: String,
    #[serde(default)]
    pub(crate) raw: Option<i64>,
    #[serde(default)]
    pub(crate) moisture: Option<f64>,
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) humidity: Option<f64>,
    /// Per-probe battery; falls back to the node's.
    #[serde(default)]
    pub(crate) battery: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    /// Unix seconds. Missing or unparseable means "now".
    #[serde(default)]
    pub(crate) ts: Option<i64>,
    #[serde(default)]
    pub(crate) battery: Option<f64>,
    #[serde(default)]
    pub(crate) rssi: Option<i32>,
    pub(crate) readings: Vec<ProbeSample>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Split a node batch into per-device samples keyed by qualified device id.
pub(crate) fn device_samples(node_id: &str, msg: ReadingMsg) -> Vec<(String, RawSample)> {
    let timestamp = msg
        .ts
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

    msg.readings
        .into_iter()
        .map(|p| {
            let device_id = format!("{node_id}/{}", p.sensor_id);
            let sample = RawSample {
                moisture: p.moisture,
                raw: p.raw,
                temperature: p.temperature,
                humidity: p.humidity,
                battery: p.battery.or(msg.battery),
                signal_strength: msg.rssi,
                timestamp,
            };
            (device_id, sample)
        })
        .collect()
}

pub fn options(client_id: &str, host: &str, port: u16) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive the connection forever, feeding telemetry into `lanes`.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    lanes: Arc<IngestLanes>,
    state: SharedState,
) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(node_id) = extract_node_id(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match serde_json::from_slice::<ReadingMsg>(&p.payload) {
                    Ok(msg) => {
                        debug!(node = node_id, samples = msg.readings.len(), "telemetry");
                        for (device_id, sample) in device_samples(node_id, msg) {
                            lanes.submit(&device_id, sample).await;
                        }
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "bad telemetry json: {e}");
                        let mut st = state.write().await;
                        st.record_error(format!("bad telemetry json from {node_id}: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Sessions are clean, so subscriptions do not survive a reconnect.
                if let Err(e) = client.try_subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce) {
                    warn!("subscribe failed: {e}");
                }
                let mut st = state.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                let mut st = state.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = state.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
