//! SMTP implementation of the transport seams, built on lettre's async
//! connection.
//!
//! Handshake, TLS upgrade and authentication are delegated to lettre; this
//! module only decides which of them to run from [`SmtpConfig`].

use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, DEFAULT_MECHANISMS};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::Message;
use tracing::{info, warn};

use super::{Connector, Link};
use crate::config::{SmtpConfig, TlsMode};
use crate::error::TransportError;

/// Opens authenticated SMTP connections to the configured gateway.
pub struct SmtpConnector {
    config: SmtpConfig,
    hello: ClientId,
}

impl SmtpConnector {
    pub fn new(config: SmtpConfig) -> Self {
        let hello = ClientId::Domain(config.helo_name.clone());
        Self { config, hello }
    }

    fn tls_parameters(&self) -> Result<TlsParameters, TransportError> {
        TlsParameters::new(self.config.host.clone())
            .map_err(|e| TransportError::Connect(format!("TLS setup failed: {e}")))
    }
}

#[async_trait]
impl Connector for SmtpConnector {
    type Link = SmtpLink;

    async fn connect(&self) -> Result<SmtpLink, TransportError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            tls = ?self.config.tls,
            "smtp_connecting"
        );

        let implicit_tls = match self.config.tls {
            TlsMode::Implicit => Some(self.tls_parameters()?),
            TlsMode::StartTls | TlsMode::None => None,
        };

        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (self.config.host.as_str(), self.config.port),
            Some(self.config.timeout),
            &self.hello,
            implicit_tls,
            None,
        )
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        if self.config.tls == TlsMode::StartTls {
            if !conn.can_starttls() {
                conn.abort().await;
                return Err(TransportError::Connect(
                    "server does not offer STARTTLS".to_string(),
                ));
            }

            conn.starttls(self.tls_parameters()?, &self.hello)
                .await
                .map_err(|e| TransportError::Connect(format!("STARTTLS failed: {e}")))?;
        }

        if !self.config.username.is_empty() {
            let credentials =
                Credentials::new(self.config.username.clone(), self.config.password.clone());

            conn.auth(DEFAULT_MECHANISMS, &credentials)
                .await
                .map_err(|e| TransportError::Auth(e.to_string()))?;
        }

        info!(
            host = %self.config.host,
            authenticated = !self.config.username.is_empty(),
            "smtp_connected"
        );

        Ok(SmtpLink { conn })
    }
}

/// One live SMTP connection.
pub struct SmtpLink {
    conn: AsyncSmtpConnection,
}

#[async_trait]
impl Link for SmtpLink {
    async fn probe(&mut self) -> bool {
        // Sends NOOP and checks for a positive reply
        let alive = self.conn.test_connected().await;
        if !alive {
            warn!("smtp_probe_failed");
        }
        alive
    }

    async fn submit(&mut self, message: &Message) -> Result<(), TransportError> {
        self.conn
            .send(message.envelope(), &message.formatted())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Submit(e.to_string()))
    }

    async fn quit(&mut self) -> Result<(), TransportError> {
        self.conn
            .quit()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Submit(format!("QUIT failed: {e}")))
    }
}
