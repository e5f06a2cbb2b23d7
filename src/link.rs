use crate::error::{AppError, Result};
use tokio::net::lookup_host;
use tracing::debug;

/// The network connectivity underneath the broker session.
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    /// One attempt to bring the link up.
    async fn connect(&mut self) -> Result<()>;
    fn is_up(&self) -> bool;
}

/// Treats the link as up once the broker's host name resolves.
///
/// Interface bring-up (Wi-Fi association and the like) belongs to the host OS;
/// name resolution is the first thing that fails when it is missing.
#[derive(Debug, Clone)]
pub struct ResolverLink {
    host: String,
    port: u16,
    up: bool,
}

impl ResolverLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            up: false,
        }
    }
}

impl NetworkLink for ResolverLink {
    async fn connect(&mut self) -> Result<()> {
        let target = format!("{}:{}", self.host, self.port);
        let mut addrs = lookup_host(&target).await.map_err(|e| {
            self.up = false;
            AppError::Link(format!("cannot resolve {}: {}", target, e))
        })?;
        match addrs.next() {
            Some(addr) => {
                debug!(host = %self.host, %addr, "broker address resolved");
                self.up = true;
                Ok(())
            }
            None => {
                self.up = false;
                Err(AppError::Link(format!("{} resolved to no addresses", target)))
            }
        }
    }

    fn is_up(&self) -> bool {
        self.up
    }
}
