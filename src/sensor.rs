//! Raw ADC access, zero-offset calibration and peak-to-peak sampling.

use crate::config::SensorConfig;
use crate::error::{AppError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// One instantaneous reading of the current sensor pin.
#[cfg_attr(test, mockall::automock)]
pub trait AnalogInput {
    fn read_raw(&mut self) -> Result<u16>;
}

/// Reads an ADC channel exposed through the Linux IIO sysfs interface.
#[derive(Debug, Clone)]
pub struct SysfsAnalogInput {
    path: PathBuf,
}

impl SysfsAnalogInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AnalogInput for SysfsAnalogInput {
    fn read_raw(&mut self) -> Result<u16> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| AppError::Sensor(format!("read {}: {}", self.path.display(), e)))?;
        raw.trim().parse::<u16>().map_err(|e| {
            AppError::Sensor(format!(
                "unexpected value {:?} in {}: {}",
                raw.trim(),
                self.path.display(),
                e
            ))
        })
    }
}

/// Sensor bias measured at startup with no (or baseline) load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationState {
    pub zero_offset: f64,
}

/// Sleep between samples, or just give the runtime a turn when no pause is configured.
async fn pace(interval: Duration) {
    if interval.is_zero() {
        tokio::task::yield_now().await;
    } else {
        sleep(interval).await;
    }
}

#[derive(Debug, Clone)]
pub struct Calibrator {
    window: Duration,
    interval: Duration,
}

impl Calibrator {
    pub fn new(window: Duration, interval: Duration) -> Self {
        Self { window, interval }
    }

    pub fn from_config(cfg: &SensorConfig) -> Self {
        Self::new(cfg.calibration_window(), cfg.calibration_interval())
    }

    /// Mean raw value over the calibration window. Always takes at least one sample.
    pub async fn compute_zero_offset<A: AnalogInput>(&self, input: &mut A) -> Result<CalibrationState> {
        let start = Instant::now();
        let mut sum = 0u64;
        let mut n = 0u64;
        loop {
            sum += u64::from(input.read_raw()?);
            n += 1;
            if start.elapsed() >= self.window {
                break;
            }
            pace(self.interval).await;
        }
        let zero_offset = sum as f64 / n as f64;
        debug!(samples = n, zero_offset, "calibration window complete");
        Ok(CalibrationState { zero_offset })
    }
}

#[derive(Debug, Clone)]
pub struct Sampler {
    volts_per_adc_step: f64,
    window: Duration,
    interval: Duration,
}

impl Sampler {
    pub fn new(volts_per_adc_step: f64, window: Duration, interval: Duration) -> Self {
        Self {
            volts_per_adc_step,
            window,
            interval,
        }
    }

    pub fn from_config(cfg: &SensorConfig) -> Self {
        Self::new(cfg.volts_per_adc_step(), cfg.sample_window(), cfg.sample_interval())
    }

    /// Swing between the highest and lowest offset-corrected sample over the window, in volts.
    pub async fn measure_peak_to_peak<A: AnalogInput>(
        &self,
        input: &mut A,
        calibration: &CalibrationState,
    ) -> Result<f64> {
        let start = Instant::now();
        let mut max = f64::NEG_INFINITY;
        let mut min = f64::INFINITY;
        let mut n = 0u32;
        loop {
            let value = f64::from(input.read_raw()?) - calibration.zero_offset;
            max = max.max(value);
            min = min.min(value);
            n += 1;
            if start.elapsed() >= self.window {
                break;
            }
            pace(self.interval).await;
        }
        debug!(samples = n, min, max, "sampling window complete");
        Ok((max - min) * self.volts_per_adc_step)
    }
}
