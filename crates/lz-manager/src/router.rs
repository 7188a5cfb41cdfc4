//! Message routing between consoles and agents
//!
//! Every session runs one receive loop ([`MessageRouter::serve`]). Frames
//! are decoded into envelopes and dispatched by the role of the session
//! they arrived on:
//!
//! - Console messages are either a `device_info`/`list` request, answered
//!   from the registry, or a command with a `target`, forwarded to that
//!   agent with `senderIp` set to the console's address.
//! - Agent messages carrying `senderIp` are results for that console and
//!   are forwarded with `senderIp` rewritten to the agent's address. All
//!   other agent messages go to the registry.
//!
//! Any failure is logged and answered with a failure envelope on the
//! session the offending message came from. The loop itself never stops
//! because of one bad message.

use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, Span};

use lz_core::error::ConnectionError;
use lz_core::{PeerAddr, PeerRole};
use lz_protocol::{Envelope, ProtocolError};

use crate::connection::{ConnectionPool, Session, SessionReader};
use crate::registry::DeviceRegistry;

/// Reasons a message could not be routed
#[derive(Error, Debug)]
pub enum RouteError {
    /// The message was not a valid envelope for its command
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// A console command without a target device
    #[error("Command '{0}' requires a target device")]
    MissingTarget(String),

    /// The target is not a registered device with an open session
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    /// Forwarding to the target device failed
    #[error("Device {target} unreachable: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: ConnectionError,
    },

    /// Replying to the requesting session failed
    #[error("Reply failed: {0}")]
    Reply(#[source] ConnectionError),
}

/// Routes envelopes between the two populations
pub struct MessageRouter {
    agents: Arc<ConnectionPool>,
    apps: Arc<ConnectionPool>,
    registry: Arc<DeviceRegistry>,
    span: Span,
}

impl MessageRouter {
    /// Create a router over the two connection pools and the registry
    pub fn new(
        agents: Arc<ConnectionPool>,
        apps: Arc<ConnectionPool>,
        registry: Arc<DeviceRegistry>,
        span: Span,
    ) -> Self {
        Self {
            agents,
            apps,
            registry,
            span,
        }
    }

    /// Receive loop for one session.
    ///
    /// Returns once the connection is gone, after removing the session from
    /// its pool and, for an agent, marking the device `Offline`.
    pub async fn serve(&self, session: Arc<Session>, mut reader: SessionReader) {
        let span = tracing::debug_span!(
            parent: &self.span,
            "session",
            role = %session.role(),
            addr = %session.addr()
        );

        async {
            while let Some(text) = reader.next_text().await {
                self.dispatch(&session, &text).await;
            }
            self.on_disconnect(&session);
        }
        .instrument(span)
        .await
    }

    /// Decode and route one text frame, replying with a failure envelope on
    /// error
    pub async fn dispatch(&self, session: &Arc<Session>, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    "Malformed message from {} {}: {}",
                    session.role(),
                    session.addr(),
                    e
                );
                self.reply(session, &Envelope::malformed(e.to_string())).await;
                return;
            }
        };

        tracing::trace!("Received {} from {}", envelope, session.addr());
        let request = envelope.clone();

        let outcome = match session.role() {
            PeerRole::Agent => self.handle_agent_message(session, envelope).await,
            PeerRole::App => self.handle_app_message(session, envelope).await,
        };

        if let Err(e) = outcome {
            tracing::warn!(
                "Failed to route {} from {} {}: {}",
                request,
                session.role(),
                session.addr(),
                e
            );
            if !matches!(e, RouteError::Reply(_)) {
                self.reply(session, &request.failure(e.to_string())).await;
            }
        }
    }

    /// Route an envelope received from an agent
    pub async fn handle_agent_message(
        &self,
        agent: &Arc<Session>,
        mut envelope: Envelope,
    ) -> Result<(), RouteError> {
        self.registry.touch(agent);

        let Some(console) = envelope.sender_ip.take() else {
            self.registry.handle(agent, envelope)?;
            return Ok(());
        };

        let app = console
            .parse::<PeerAddr>()
            .ok()
            .and_then(|addr| self.apps.get_open(&addr));

        let Some(app) = app else {
            tracing::warn!(
                "App {} not found, dropping {} result from device {}",
                console,
                envelope.command,
                agent.addr()
            );
            return Ok(());
        };

        envelope.sender_ip = Some(agent.addr().to_string());
        tracing::info!(
            "Forwarding {} result from device {} to app {}",
            envelope.command,
            agent.addr(),
            app.addr()
        );

        if let Err(e) = app.send(&envelope).await {
            tracing::warn!("Could not deliver result to app {}: {}", app.addr(), e);
        }
        Ok(())
    }

    /// Route an envelope received from a console
    pub async fn handle_app_message(
        &self,
        app: &Arc<Session>,
        mut envelope: Envelope,
    ) -> Result<(), RouteError> {
        if envelope.is_device_listing() {
            let devices = self.registry.snapshot();
            tracing::info!("Sending {} device(s) to app {}", devices.len(), app.addr());

            for device in devices {
                app.send(&device.to_envelope()?)
                    .await
                    .map_err(RouteError::Reply)?;
            }
            return Ok(());
        }

        let target = envelope
            .target
            .clone()
            .ok_or_else(|| RouteError::MissingTarget(envelope.command.clone()))?;

        let agent = target
            .parse::<PeerAddr>()
            .ok()
            .and_then(|addr| self.registry.agent_session(&addr))
            .ok_or_else(|| RouteError::DeviceNotFound(target.clone()))?;

        envelope.sender_ip = Some(app.addr().to_string());
        tracing::info!(
            "Forwarding {} from app {} to device {}",
            envelope.command,
            app.addr(),
            agent.addr()
        );

        agent
            .send(&envelope)
            .await
            .map_err(|source| RouteError::Unreachable { target, source })
    }

    async fn reply(&self, session: &Session, envelope: &Envelope) {
        if let Err(e) = session.send(envelope).await {
            tracing::debug!("Could not reply to {} {}: {}", session.role(), session.addr(), e);
        }
    }

    fn on_disconnect(&self, session: &Session) {
        session.close();

        let pool = match session.role() {
            PeerRole::Agent => &self.agents,
            PeerRole::App => &self.apps,
        };
        if pool.remove_if_current(session) {
            tracing::info!("{} {} disconnected", session.role(), session.addr());
        }

        if session.role() == PeerRole::Agent {
            self.registry
                .mark_disconnected(&session.addr(), session.id());
        }
    }
}
