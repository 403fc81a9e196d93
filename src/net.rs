use crate::{config::Config, conn::FrameConn, error::Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, ServerConfig},
    TlsAcceptor, TlsConnector,
};
use tracing::debug;

/// Dial a broker over plain TCP and come up as the dialer side of a tunnel.
pub async fn dial(addr: impl ToSocketAddrs, config: Config) -> Result<FrameConn> {
    let transport = TcpStream::connect(addr).await?;
    let peer = transport.peer_addr().ok();
    debug!(peer = ?peer, "dialed");
    FrameConn::spawn(transport, true, peer, config)
}

/// As `dial`, with the transport wrapped in TLS. Certificate material comes
/// ready-made from the caller; the framing layer never looks inside the wrap.
pub async fn dial_tls(
    addr: impl ToSocketAddrs,
    server_name: ServerName<'static>,
    tls: Arc<ClientConfig>,
    config: Config,
) -> Result<FrameConn> {
    let transport = TcpStream::connect(addr).await?;
    let peer = transport.peer_addr().ok();
    let transport = TlsConnector::from(tls).connect(server_name, transport).await?;
    debug!(peer = ?peer, "dialed with tls");
    FrameConn::spawn(transport, true, peer, config)
}

/// Accepts transports and hands each out as the acceptor side of a tunnel.
pub struct FrameListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    config: Config,
}

impl FrameListener {
    pub async fn bind(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            tls: None,
            config,
        })
    }

    /// Terminate TLS on every accepted transport.
    pub fn with_tls(mut self, tls: Arc<ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(tls));
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<FrameConn> {
        let (transport, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "accepted transport");
        match &self.tls {
            Some(acceptor) => {
                let transport = acceptor.accept(transport).await?;
                FrameConn::spawn(transport, false, Some(peer), self.config.clone())
            }
            None => FrameConn::spawn(transport, false, Some(peer), self.config.clone()),
        }
    }
}
