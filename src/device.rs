//! The measurement-and-publish loop.

use crate::config::Config;
use crate::connection::{ConnectOutcome, ConnectionManager};
use crate::energy::EnergyAccumulator;
use crate::error::Result;
use crate::link::NetworkLink;
use crate::mqtt::TelemetryTransport;
use crate::power::PowerEstimator;
use crate::reading::Reading;
use crate::sensor::{AnalogInput, CalibrationState, Calibrator, Sampler};
use crate::time_sync::{TimeSource, TimeSync};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// What happened during one pass of the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub reading: Option<Reading>,
    pub connect: Option<ConnectOutcome>,
    pub published: bool,
    pub inbound_handled: usize,
}

pub struct Device<A, L, T, S> {
    input: A,
    calibrator: Calibrator,
    sampler: Sampler,
    estimator: PowerEstimator,
    calibration: CalibrationState,
    accumulator: Option<EnergyAccumulator>,
    time: TimeSync<S>,
    connection: ConnectionManager<L, T>,
    boot: Instant,
    cycle_delay: Duration,
}

impl<A, L, T, S> Device<A, L, T, S>
where
    A: AnalogInput,
    L: NetworkLink,
    T: TelemetryTransport,
    S: TimeSource,
{
    pub fn new(
        cfg: &Config,
        input: A,
        time: TimeSync<S>,
        connection: ConnectionManager<L, T>,
    ) -> Self {
        Self {
            input,
            calibrator: Calibrator::from_config(&cfg.sensor),
            sampler: Sampler::from_config(&cfg.sensor),
            estimator: PowerEstimator::from_config(&cfg.sensor),
            calibration: CalibrationState { zero_offset: 0.0 },
            accumulator: cfg.energy.track_watt_hours.then(EnergyAccumulator::new),
            time,
            connection,
            boot: Instant::now(),
            cycle_delay: Duration::from_millis(cfg.cycle_delay_ms),
        }
    }

    pub fn calibration(&self) -> CalibrationState {
        self.calibration
    }

    pub fn connection(&self) -> &ConnectionManager<L, T> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<L, T> {
        &mut self.connection
    }

    /// Brings the connection up, then measures the sensor's zero offset.
    pub async fn start(&mut self) -> Result<ConnectOutcome> {
        let outcome = self.connection.ensure_connected(&mut self.time).await;
        self.calibration = self.calibrator.compute_zero_offset(&mut self.input).await?;
        info!(
            zero_offset = self.calibration.zero_offset,
            clamp = ?self.estimator.clamp_policy(),
            "sensor calibrated"
        );
        Ok(outcome)
    }

    /// sample -> estimate -> accumulate -> stamp. None while the clock is unsynced.
    pub async fn acquire_reading(&mut self) -> Result<Option<Reading>> {
        let vpp = self
            .sampler
            .measure_peak_to_peak(&mut self.input, &self.calibration)
            .await?;
        let estimate = self.estimator.estimate(vpp);
        let now_ms = self.boot.elapsed().as_millis() as u64;
        let cumulative_watt_hours = self
            .accumulator
            .as_mut()
            .map(|acc| acc.accumulate(estimate.watts, now_ms));

        let Some(timestamp) = self.time.now_epoch() else {
            warn!("clock not synchronised; reading not timestamped");
            return Ok(None);
        };
        Ok(Some(Reading {
            timestamp,
            rms_current_amps: estimate.rms_current_amps,
            instantaneous_watts: estimate.watts,
            cumulative_watt_hours,
        }))
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        self.time.update().await;

        match self.acquire_reading().await {
            Ok(Some(r)) => {
                info!(
                    amps = %format!("{:.6}", r.rms_current_amps),
                    watts = %format!("{:.4}", r.instantaneous_watts),
                    watt_hours = ?r.cumulative_watt_hours,
                    time = r.timestamp,
                    "reading"
                );
                report.reading = Some(r);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "sensor read failed; skipping cycle"),
        }

        let mut alive = self.connection.is_alive().await;
        if !alive {
            let outcome = self.connection.ensure_connected(&mut self.time).await;
            report.connect = Some(outcome);
            alive = outcome.is_connected();
        }

        if alive {
            if let Some(reading) = &report.reading {
                match self.connection.publish(reading).await {
                    Ok(()) => {
                        debug!(time = reading.timestamp, "published reading");
                        report.published = true;
                    }
                    Err(e) => warn!(error = %e, "publish failed"),
                }
            }
            report.inbound_handled = self.connection.process_inbound().await;
        }

        sleep(self.cycle_delay).await;
        report
    }

    /// Runs cycles until `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = self.run_cycle() => {}
            }
        }
    }
}
