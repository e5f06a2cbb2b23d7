//! Link and broker-session lifecycle.
//!
//! `ensure_connected` walks `Disconnected -> LinkUp -> SessionUp`, syncing the
//! clock and installing TLS material on the way. With the default unbounded
//! attempt caps a network or broker that never comes back blocks here forever;
//! that is only acceptable for supervised deployments. Setting
//! `max_link_attempts` / `max_session_attempts` turns the block into a
//! timeout outcome that the next cycle retries.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::link::NetworkLink;
use crate::mqtt::{InboundMessage, TelemetryTransport, TlsMaterial};
use crate::reading::{InboundCommand, Reading};
use crate::time_sync::{TimeSource, TimeSync};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    LinkUp,
    /// Implies the link is up as well
    SessionUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    AlreadyConnected,
    Connected,
    LinkTimeout,
    SessionTimeout,
}

impl ConnectOutcome {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectOutcome::AlreadyConnected | ConnectOutcome::Connected)
    }
}

pub struct ConnectionManager<L, T> {
    link: L,
    transport: T,
    client_id: String,
    publish_topic: String,
    subscribe_topic: Option<String>,
    tls: Option<TlsMaterial>,
    retry_delay: Duration,
    max_link_attempts: Option<u32>,
    max_session_attempts: Option<u32>,
    state: ConnectionState,
    pending: Vec<InboundMessage>,
}

impl<L: NetworkLink, T: TelemetryTransport> ConnectionManager<L, T> {
    pub fn new(link: L, transport: T, cfg: &Config, tls: Option<TlsMaterial>) -> Self {
        Self {
            link,
            transport,
            client_id: cfg.device.thing_name.clone(),
            publish_topic: cfg.mqtt.publish_topic.clone(),
            subscribe_topic: cfg.mqtt.subscribe_topic.clone(),
            tls,
            retry_delay: Duration::from_millis(cfg.connection.retry_delay_ms),
            max_link_attempts: cfg.connection.max_link_attempts,
            max_session_attempts: cfg.connection.max_session_attempts,
            state: ConnectionState::Disconnected,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drops the recorded state to whatever the link and transport currently report.
    /// A lost session re-checks the link, so an outage underneath it is noticed.
    async fn reconcile(&mut self) {
        if self.state == ConnectionState::SessionUp && !self.transport.is_connected() {
            warn!("broker session lost");
            self.state = ConnectionState::LinkUp;
            if let Err(e) = self.link.connect().await {
                debug!(error = %e, "link re-check failed");
            }
        }
        if self.state != ConnectionState::Disconnected && !self.link.is_up() {
            warn!("network link lost");
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Idempotent; safe to call every cycle.
    pub async fn ensure_connected<S: TimeSource>(&mut self, time: &mut TimeSync<S>) -> ConnectOutcome {
        self.reconcile().await;
        if self.state == ConnectionState::SessionUp {
            return ConnectOutcome::AlreadyConnected;
        }

        let mut link_came_up = false;
        if self.state == ConnectionState::Disconnected {
            if !self.connect_link().await {
                warn!(attempts = ?self.max_link_attempts, "network link connect timeout");
                return ConnectOutcome::LinkTimeout;
            }
            self.state = ConnectionState::LinkUp;
            link_came_up = true;
            info!("network link up");
        }

        if link_came_up || !time.is_synced() {
            time.sync_until_plausible().await;
        }

        if let Some(material) = &self.tls {
            if let Err(e) = self.transport.configure_tls(material) {
                warn!(error = %e, "installing TLS material failed");
                return ConnectOutcome::SessionTimeout;
            }
        }

        info!(client_id = %self.client_id, "connecting to broker");
        if !self.connect_session().await || !self.transport.is_connected() {
            warn!(attempts = ?self.max_session_attempts, "broker connect timeout");
            return ConnectOutcome::SessionTimeout;
        }
        self.state = ConnectionState::SessionUp;
        info!(client_id = %self.client_id, "broker session established");

        if let Some(topic) = self.subscribe_topic.clone() {
            match self.transport.subscribe(&topic).await {
                Ok(()) => info!(topic = %topic, "subscribed to inbound topic"),
                Err(e) => warn!(topic = %topic, error = %e, "subscribe failed"),
            }
        }
        ConnectOutcome::Connected
    }

    async fn connect_link(&mut self) -> bool {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.link.connect().await {
                Ok(()) if self.link.is_up() => return true,
                Ok(()) => debug!(attempt, "link connect returned but link is not up"),
                Err(e) => warn!(attempt, error = %e, "trying network link"),
            }
            if self.max_link_attempts.is_some_and(|max| attempt >= max) {
                return false;
            }
            sleep(self.retry_delay).await;
        }
    }

    async fn connect_session(&mut self) -> bool {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.connect(&self.client_id).await {
                Ok(()) => return true,
                Err(e) => warn!(attempt, error = %e, "trying broker"),
            }
            if self.max_session_attempts.is_some_and(|max| attempt >= max) {
                return false;
            }
            sleep(self.retry_delay).await;
        }
    }

    /// Liveness probe. Drives the session briefly and keeps any inbound
    /// messages for `process_inbound`.
    pub async fn is_alive(&mut self) -> bool {
        if self.state != ConnectionState::SessionUp {
            return false;
        }
        match self.transport.service().await {
            Ok(mut inbound) => {
                self.pending.append(&mut inbound);
                true
            }
            Err(e) => {
                warn!(error = %e, "session probe failed");
                self.reconcile().await;
                false
            }
        }
    }

    /// Sends one reading on the telemetry topic. Fails, without touching the
    /// connection state, when no session is up or the send is refused.
    pub async fn publish(&mut self, reading: &Reading) -> Result<()> {
        if self.state != ConnectionState::SessionUp {
            return Err(AppError::Mqtt(format!(
                "cannot publish while {:?}",
                self.state
            )));
        }
        let payload = reading.encode()?;
        self.transport.publish(&self.publish_topic, payload).await
    }

    /// Flushes the session and handles every inbound message received so far.
    /// Returns how many messages were handled.
    pub async fn process_inbound(&mut self) -> usize {
        if self.state == ConnectionState::SessionUp {
            match self.transport.service().await {
                Ok(mut inbound) => self.pending.append(&mut inbound),
                Err(e) => {
                    debug!(error = %e, "session service failed while processing inbound");
                    self.reconcile().await;
                }
            }
        }
        let pending = std::mem::take(&mut self.pending);
        for msg in &pending {
            handle_inbound(msg);
        }
        pending.len()
    }
}

/// Logs the `message` field of a command; anything malformed is ignored.
pub fn handle_inbound(msg: &InboundMessage) -> Option<InboundCommand> {
    match InboundCommand::parse(&msg.payload) {
        Some(cmd) => {
            info!(topic = %msg.topic, message = %cmd.message, "inbound message");
            Some(cmd)
        }
        None => {
            warn!(
                topic = %msg.topic,
                bytes = msg.payload.len(),
                "ignoring malformed inbound message"
            );
            None
        }
    }
}
