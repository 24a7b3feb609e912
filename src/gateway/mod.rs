//! Gateway - TCP listener for peers.
//!
//! The gateway binds a socket and spawns a [`Session`] task per
//! connection. Sessions speak line-delimited JSON ([`frames`]), pass their
//! hello through the handshake loop, and once admitted share the
//! [`PeerTable`] for routing calls and publishing.

pub mod frames;
mod peers;
mod session;

pub use peers::{PeerSession, PeerTable};
pub use session::Session;

use crate::handshake::HandshakeJob;
use crate::telemetry::spans;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{Instrument, error, info, instrument};

/// Longest accepted frame line, in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Accepts peer connections and spawns sessions.
pub struct Gateway {
    listener: TcpListener,
    peers: Arc<PeerTable>,
    handshakes: mpsc::Sender<HandshakeJob>,
}

impl Gateway {
    pub async fn bind(
        addr: SocketAddr,
        peers: Arc<PeerTable>,
        handshakes: mpsc::Sender<HandshakeJob>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "gateway listener bound");
        Ok(Self {
            listener,
            peers,
            handshakes,
        })
    }

    /// Bound address; differs from the requested one when port 0 was used.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped.
    #[instrument(skip(self), name = "gateway")]
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "connection accepted");
                    let session = Session::new(
                        stream,
                        addr,
                        Arc::clone(&self.peers),
                        self.handshakes.clone(),
                    );
                    let span = spans::session(&addr.to_string());
                    tokio::spawn(
                        async move {
                            if let Err(e) = session.run().await {
                                error!(%addr, error = %e, "session error");
                            }
                            info!(%addr, "connection closed");
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}
