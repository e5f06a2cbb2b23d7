//! Peak-to-peak sensor swing to RMS current and real power.
//!
//! The RMS step assumes a clean sinusoid (`Vpp / 2 * 0.707`). Distorted or
//! non-sinusoidal loads will read inaccurately; no true RMS integration is done.

use crate::config::SensorConfig;
use serde::{Deserialize, Serialize};

/// Peak to RMS factor for a sinusoid.
const SINE_RMS_FACTOR: f64 = 0.707;

/// How near-zero currents are forced to exactly 0.0 after the noise floor is subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClampPolicy {
    /// Only negative currents become 0.0
    NegativeOnly,
    /// Anything below `threshold_amps` becomes 0.0
    BelowThreshold { threshold_amps: f64 },
}

impl Default for ClampPolicy {
    fn default() -> Self {
        ClampPolicy::BelowThreshold {
            threshold_amps: 0.035,
        }
    }
}

impl ClampPolicy {
    pub fn apply(&self, amps: f64) -> f64 {
        let floor = match *self {
            ClampPolicy::NegativeOnly => 0.0,
            ClampPolicy::BelowThreshold { threshold_amps } => threshold_amps.max(0.0),
        };
        if amps < floor || amps <= 0.0 {
            0.0
        } else {
            amps
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerEstimate {
    pub rms_current_amps: f64,
    pub watts: f64,
}

#[derive(Debug, Clone)]
pub struct PowerEstimator {
    mv_per_amp: f64,
    noise_floor_amps: f64,
    line_voltage: f64,
    clamp: ClampPolicy,
}

impl PowerEstimator {
    pub fn new(mv_per_amp: f64, noise_floor_amps: f64, line_voltage: f64, clamp: ClampPolicy) -> Self {
        Self {
            mv_per_amp,
            noise_floor_amps,
            line_voltage,
            clamp,
        }
    }

    pub fn from_config(cfg: &SensorConfig) -> Self {
        Self::new(cfg.mv_per_amp, cfg.noise_floor_amps, cfg.line_voltage, cfg.clamp)
    }

    pub fn clamp_policy(&self) -> ClampPolicy {
        self.clamp
    }

    pub fn estimate(&self, peak_to_peak_volts: f64) -> PowerEstimate {
        let v_rms = (peak_to_peak_volts / 2.0) * SINE_RMS_FACTOR;
        let i_rms = (v_rms * 1000.0 / self.mv_per_amp) - self.noise_floor_amps;
        let rms_current_amps = self.clamp.apply(i_rms);
        PowerEstimate {
            rms_current_amps,
            watts: rms_current_amps * self.line_voltage,
        }
    }
}
