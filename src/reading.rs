use crate::error::Result;
use serde::{Deserialize, Serialize};

/// One measurement cycle's result. Built once per loop iteration and never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Epoch seconds
    pub timestamp: i64,
    pub rms_current_amps: f64,
    pub instantaneous_watts: f64,
    /// None when the deployment does not track energy
    pub cumulative_watt_hours: Option<f64>,
}

impl Reading {
    pub fn to_message(&self) -> TelemetryMessage {
        TelemetryMessage {
            time: self.timestamp,
            rms_current: self.rms_current_amps,
            power: self.instantaneous_watts,
            watt_hours: self.cumulative_watt_hours,
        }
    }

    /// JSON payload published on the telemetry topic.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_message())?)
    }
}

/// Wire shape of a published reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub time: i64,
    pub rms_current: f64,
    pub power: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watt_hours: Option<f64>,
}

impl TelemetryMessage {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Command/control message received on the inbound topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundCommand {
    pub message: String,
}

impl InboundCommand {
    /// None for anything that is not a JSON object with a string `message` field.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}
