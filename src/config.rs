use crate::power::ClampPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Pause at the end of every measurement cycle
    #[serde(default = "default_cycle_delay_ms")]
    pub cycle_delay_ms: u64,
}

fn default_cycle_delay_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identity presented to the broker as the MQTT client id
    pub thing_name: String,
    /// Path of the raw ADC value for the current sensor channel
    #[serde(default = "default_adc_path")]
    pub adc_path: String,
}

fn default_adc_path() -> String {
    "/sys/bus/iio/devices/iio:device0/in_voltage0_raw".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    pub publish_topic: String,
    /// Command/control topic; no subscription is made when absent
    #[serde(default)]
    pub subscribe_topic: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    pub tls: Option<TlsConfig>,
}

fn default_port() -> u16 {
    8883
}
fn default_keep_alive() -> u64 {
    30
}
fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM trust anchor used to verify the broker
    pub ca_file: String,
    /// PEM client certificate
    pub cert_file: String,
    /// PEM private key matching `cert_file`
    pub key_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub servers: Vec<String>,
    pub utc_offset_secs: i64,
    /// Epoch values at or below this are treated as a clock that has not been set yet
    pub min_valid_epoch: i64,
    pub retry_delay_ms: u64,
    pub update_interval_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            servers: vec!["pool.ntp.org:123".into(), "time.nist.gov:123".into()],
            utc_offset_secs: 0,
            min_valid_epoch: 1_705_244_380,
            retry_delay_ms: 500,
            update_interval_secs: 60,
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub adc_reference_volts: f64,
    pub adc_levels: u32,
    pub mv_per_amp: f64,
    pub noise_floor_amps: f64,
    pub line_voltage: f64,
    pub clamp: ClampPolicy,
    pub sample_window_ms: u64,
    pub sample_interval_ms: u64,
    pub calibration_window_us: u64,
    /// 0 samples back to back
    pub calibration_interval_us: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            adc_reference_volts: 3.3,
            adc_levels: 1024,
            mv_per_amp: 100.0,
            noise_floor_amps: 0.075,
            line_voltage: 240.0,
            clamp: ClampPolicy::default(),
            sample_window_ms: 1000,
            sample_interval_ms: 5,
            // one period of 60 Hz mains
            calibration_window_us: 1_000_000 / 60,
            calibration_interval_us: 0,
        }
    }
}

impl SensorConfig {
    pub fn volts_per_adc_step(&self) -> f64 {
        self.adc_reference_volts / f64::from(self.adc_levels)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_millis(self.sample_window_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn calibration_window(&self) -> Duration {
        Duration::from_micros(self.calibration_window_us)
    }

    pub fn calibration_interval(&self) -> Duration {
        Duration::from_micros(self.calibration_interval_us)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// When false, no watt-hours are accumulated or published
    pub track_watt_hours: bool,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            track_watt_hours: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub retry_delay_ms: u64,
    /// None retries forever
    pub max_link_attempts: Option<u32>,
    /// None retries forever
    pub max_session_attempts: Option<u32>,
    /// How long a single broker connect attempt may wait for CONNACK
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 500,
            max_link_attempts: None,
            max_session_attempts: None,
            connect_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards, if MQTT_HOST env is set, override `mqtt.host`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(
            !self.device.thing_name.is_empty(),
            "device.thing_name cannot be empty"
        );
        anyhow::ensure!(!self.mqtt.host.is_empty(), "mqtt.host cannot be empty");
        anyhow::ensure!(
            !self.mqtt.publish_topic.is_empty(),
            "mqtt.publish_topic cannot be empty"
        );
        if let Some(topic) = &self.mqtt.subscribe_topic {
            anyhow::ensure!(!topic.is_empty(), "mqtt.subscribe_topic cannot be empty");
        }
        anyhow::ensure!(self.mqtt.qos <= 2, "mqtt.qos must be 0, 1 or 2");
        anyhow::ensure!(
            !self.time.servers.is_empty(),
            "time.servers must list at least one server"
        );
        anyhow::ensure!(self.sensor.mv_per_amp > 0.0, "sensor.mv_per_amp must be > 0");
        anyhow::ensure!(self.sensor.adc_levels > 0, "sensor.adc_levels must be > 0");
        anyhow::ensure!(
            self.sensor.sample_window_ms > 0,
            "sensor.sample_window_ms must be > 0"
        );
        anyhow::ensure!(
            self.sensor.line_voltage >= 0.0,
            "sensor.line_voltage cannot be negative"
        );
        if let ClampPolicy::BelowThreshold { threshold_amps } = self.sensor.clamp {
            anyhow::ensure!(
                threshold_amps >= 0.0,
                "sensor.clamp.threshold_amps cannot be negative"
            );
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$"; any other '$' is kept as-is.
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close)
            .with_context(|| format!("unterminated env placeholder: missing '{}'", close))?;
        let val = std::env::var(&var)
            .with_context(|| format!("missing environment variable: {}", var))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Consumes characters up to and including `end`; None if `end` never shows up.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
