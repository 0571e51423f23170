//! Listeners and shared server state.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cordirc_platform::Connector;
use cordirc_platform::discord::DiscordConnector;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use crate::config::ServerConfig;
use crate::connection;
use crate::registry::SessionRegistry;

/// State shared by every connection.
pub struct SharedState {
    pub server_name: String,
    pub config: ServerConfig,
    pub registry: Arc<SessionRegistry>,
    pub motd: Option<String>,
    pub created: DateTime<Utc>,
}

pub struct Server {
    config: ServerConfig,
    connector: Arc<dyn Connector>,
}

impl Server {
    /// A server bridging to Discord.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_connector(config, Arc::new(DiscordConnector::default()))
    }

    /// A server using the given upstream connector.
    pub fn with_connector(config: ServerConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    fn build_state(&self) -> Arc<SharedState> {
        Arc::new(SharedState {
            server_name: self.config.server_name.clone(),
            registry: SessionRegistry::new(self.connector.clone(), self.config.message_cache_size),
            motd: self.config.motd.clone(),
            config: self.config.clone(),
            created: Utc::now(),
        })
    }

    pub async fn run(self) -> Result<()> {
        let tls_acceptor = self.build_tls_acceptor()?;
        let state = self.build_state();

        let plain_listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("Plain listener on {}", self.config.listen_addr);

        if let Some(acceptor) = tls_acceptor {
            let tls_listener = TcpListener::bind(&self.config.tls_listen_addr)
                .await
                .with_context(|| format!("Failed to bind {}", self.config.tls_listen_addr))?;
            tracing::info!("TLS listener on {}", self.config.tls_listen_addr);
            tokio::spawn(accept_tls(tls_listener, acceptor, Arc::clone(&state)));
        }

        accept_plain(plain_listener, state).await
    }

    /// Start the plain listener and return the bound address + task handle
    /// (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");
        let state = self.build_state();
        let handle = tokio::spawn(accept_plain(listener, state));
        Ok((addr, handle))
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) =
            (self.config.tls_cert.as_deref(), self.config.tls_key.as_deref())
        else {
            return Ok(None);
        };

        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("Failed to read TLS key: {key_path}"))?;

        let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse TLS certificates")?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("Failed to parse TLS private key")?
            .context("No private key found in PEM file")?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Invalid TLS configuration")?;

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

async fn accept_plain(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}

async fn accept_tls(listener: TcpListener, acceptor: TlsAcceptor, state: Arc<SharedState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) = connection::handle_generic(tls_stream, state).await {
                                tracing::error!("TLS connection error: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("TLS handshake failed: {e}"),
                    }
                });
            }
            Err(e) => tracing::error!("TLS accept error: {e}"),
        }
    }
}
