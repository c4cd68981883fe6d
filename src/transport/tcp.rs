//! Plain TCP acceptor for demo mode.
//!
//! Lets the relay run without a radio: `telnet localhost 6300` behaves like
//! a connected AX.25 station whose identity is its socket address.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, ToSocketAddrs};

use super::stream::StreamLink;
use super::{Acceptor, Incoming, TransportError};

/// Accepts TCP connections and presents them as links.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind a listener.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Option<Incoming>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        log::info!("[TCP] Connection from {peer}");
        Ok(Some(StreamLink::incoming(peer.to_string(), stream)))
    }
}
