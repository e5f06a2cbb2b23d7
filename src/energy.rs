//! Watt-hour integration over the device's uptime.
//!
//! Totals live in memory only; every restart begins again at zero.

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Default, Clone)]
pub struct EnergyAccumulator {
    cumulative_watt_hours: f64,
    last_sample_ms: Option<u64>,
}

impl EnergyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `watts` over the time since the previous call and returns the running total.
    ///
    /// `now_ms` is a monotonic millisecond tick, not wall-clock epoch, so NTP
    /// steps never distort the interval. The first call only records the
    /// baseline. Negative power is treated as zero to keep the total
    /// non-decreasing, as is a tick that runs backwards.
    pub fn accumulate(&mut self, watts: f64, now_ms: u64) -> f64 {
        if let Some(last) = self.last_sample_ms {
            let elapsed = now_ms.saturating_sub(last) as f64;
            let added = watts.max(0.0) * elapsed / MILLIS_PER_HOUR;
            if added.is_finite() {
                self.cumulative_watt_hours += added;
            }
        }
        self.last_sample_ms = Some(now_ms);
        self.cumulative_watt_hours
    }

    pub fn cumulative_watt_hours(&self) -> f64 {
        self.cumulative_watt_hours
    }

    pub fn last_sample_ms(&self) -> Option<u64> {
        self.last_sample_ms
    }
}
