//! Wall-clock time from the network.
//!
//! [`SntpClient`] asks an SNTP server for the current time; [`TimeSync`] keeps
//! the last plausible answer and extrapolates from it with the monotonic clock.

use crate::config::TimeConfig;
use crate::error::{AppError, Result};
use rsntp::AsyncSntpClient;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Source of the current epoch time in UTC seconds.
#[allow(async_fn_in_trait)]
pub trait TimeSource {
    async fn query_epoch(&mut self) -> Result<i64>;
}

/// SNTP client over the configured servers, tried in order.
///
/// Reply validation (originate timestamp, leap indicator, kiss-o'-death) is
/// left to `rsntp`.
pub struct SntpClient {
    servers: Vec<String>,
    client: AsyncSntpClient,
}

impl SntpClient {
    pub fn new(servers: Vec<String>, request_timeout: Duration) -> Self {
        let mut client = AsyncSntpClient::new();
        client.set_timeout(request_timeout);
        Self { servers, client }
    }

    pub fn from_config(cfg: &TimeConfig) -> Self {
        Self::new(
            cfg.servers.clone(),
            Duration::from_millis(cfg.request_timeout_ms),
        )
    }

    async fn query_server(&self, server: &str) -> Result<i64> {
        let result = self
            .client
            .synchronize(server)
            .await
            .map_err(|e| AppError::Time(format!("{}: {}", server, e)))?;
        debug!(
            server,
            stratum = result.stratum(),
            "SNTP reply accepted"
        );
        let since_epoch = result
            .datetime()
            .unix_timestamp()
            .map_err(|e| AppError::Time(format!("{}: {}", server, e)))?;
        i64::try_from(since_epoch.as_secs())
            .map_err(|_| AppError::Time(format!("{}: epoch out of range", server)))
    }
}

impl TimeSource for SntpClient {
    async fn query_epoch(&mut self) -> Result<i64> {
        let mut last_err = None;
        for server in &self.servers {
            match self.query_server(server).await {
                Ok(epoch) => {
                    debug!(server = %server, epoch, "time server answered");
                    return Ok(epoch);
                }
                Err(e) => {
                    debug!(server = %server, error = %e, "time server query failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::Time("no time servers configured".into())))
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncPoint {
    epoch: i64,
    at: Instant,
}

/// Epoch clock kept alive by periodic queries to a [`TimeSource`].
#[derive(Debug)]
pub struct TimeSync<S> {
    source: S,
    utc_offset_secs: i64,
    min_valid_epoch: i64,
    retry_delay: Duration,
    update_interval: Duration,
    synced: Option<SyncPoint>,
    last_returned: Option<i64>,
}

impl<S: TimeSource> TimeSync<S> {
    pub fn new(source: S, cfg: &TimeConfig) -> Self {
        Self {
            source,
            utc_offset_secs: cfg.utc_offset_secs,
            min_valid_epoch: cfg.min_valid_epoch,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            update_interval: Duration::from_secs(cfg.update_interval_secs),
            synced: None,
            last_returned: None,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.is_some()
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Queries until the source reports an epoch past the sentinel. Never gives up.
    pub async fn sync_until_plausible(&mut self) -> i64 {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.try_sync().await {
                Ok(epoch) => {
                    info!(
                        epoch,
                        attempts = attempt,
                        utc = %format_epoch(epoch),
                        "clock synchronised"
                    );
                    return epoch;
                }
                Err(e) => debug!(attempt, error = %e, "waiting for plausible time"),
            }
            sleep(self.retry_delay).await;
        }
    }

    /// Re-syncs when the update interval has passed. Returns true if a new sync was taken.
    pub async fn update(&mut self) -> bool {
        let due = match self.synced {
            Some(point) => point.at.elapsed() >= self.update_interval,
            None => true,
        };
        if !due {
            return false;
        }
        match self.try_sync().await {
            Ok(epoch) => {
                debug!(epoch, "clock refreshed");
                true
            }
            Err(e) => {
                warn!(error = %e, "time refresh failed; keeping previous sync");
                false
            }
        }
    }

    /// Current local epoch seconds, or None before the first plausible sync.
    /// Never returns less than a value it has already handed out.
    pub fn now_epoch(&mut self) -> Option<i64> {
        let point = self.synced?;
        let estimate =
            point.epoch + point.at.elapsed().as_secs() as i64 + self.utc_offset_secs;
        let now = match self.last_returned {
            Some(prev) if prev > estimate => prev,
            _ => estimate,
        };
        self.last_returned = Some(now);
        Some(now)
    }

    async fn try_sync(&mut self) -> Result<i64> {
        let epoch = self.source.query_epoch().await?;
        if epoch <= self.min_valid_epoch {
            return Err(AppError::Time(format!(
                "implausible epoch {} (must be after {})",
                epoch, self.min_valid_epoch
            )));
        }
        self.synced = Some(SyncPoint {
            epoch,
            at: Instant::now(),
        });
        Ok(epoch)
    }
}

fn format_epoch(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| epoch.to_string())
}
