//! Session - one peer connection.
//!
//! ```text
//! Phase 1: hello -> handshake loop -> welcome | denied
//! Phase 2: read loop dispatching frames, writer task draining the outbox
//! ```

use super::frames::{ClientFrame, ServerFrame};
use super::peers::{PeerSession, PeerTable};
use super::MAX_FRAME_LEN;
use crate::error::AuthError;
use crate::handshake::{HandshakeJob, HandshakeRequest, HandshakeResponse};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// Frames queued per session before senders wait.
const OUTBOX_CAPACITY: usize = 256;

type Lines = Framed<TcpStream, LinesCodec>;

/// A peer connection from accept to close.
pub struct Session {
    addr: SocketAddr,
    stream: TcpStream,
    peers: Arc<PeerTable>,
    handshakes: mpsc::Sender<HandshakeJob>,
}

async fn write_frame(lines: &mut Lines, frame: &ServerFrame) -> anyhow::Result<()> {
    lines.send(serde_json::to_string(frame)?).await?;
    Ok(())
}

impl Session {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        peers: Arc<PeerTable>,
        handshakes: mpsc::Sender<HandshakeJob>,
    ) -> Self {
        Self {
            addr,
            stream,
            peers,
            handshakes,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            addr,
            stream,
            peers,
            handshakes,
        } = self;
        let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

        // Phase 1
        let Some(line) = lines.next().await.transpose()? else {
            debug!("closed before hello");
            return Ok(());
        };
        let hello = match serde_json::from_str::<ClientFrame>(&line) {
            Ok(ClientFrame::Hello {
                domain,
                mechanism,
                credentials,
                identity,
            }) => (
                HandshakeRequest {
                    domain,
                    address: addr.ip().to_string(),
                    mechanism,
                    credentials,
                },
                identity,
            ),
            Ok(_) => {
                let reason = "expected hello".to_string();
                return write_frame(&mut lines, &ServerFrame::Denied { reason }).await;
            }
            Err(e) => {
                let reason = format!("malformed hello: {e}");
                return write_frame(&mut lines, &ServerFrame::Denied { reason }).await;
            }
        };
        let (request, identity) = hello;

        let (reply_tx, reply_rx) = oneshot::channel();
        handshakes.send((request, reply_tx)).await?;
        let user_id = match reply_rx.await? {
            HandshakeResponse::Granted { user_id } => user_id,
            HandshakeResponse::Denied { reason } => {
                return write_frame(&mut lines, &ServerFrame::Denied { reason }).await;
            }
        };

        let identity = identity.unwrap_or_else(|| user_id.clone());
        let (tx, mut rx) = mpsc::channel(OUTBOX_CAPACITY);
        let session = match peers.register(identity, user_id, tx) {
            Ok(session) => session,
            Err(e) => {
                let reason = e.to_string();
                return write_frame(&mut lines, &ServerFrame::Denied { reason }).await;
            }
        };
        write_frame(
            &mut lines,
            &ServerFrame::Welcome {
                user_id: session.user_id.clone(),
                identity: session.identity.clone(),
            },
        )
        .await?;

        // Phase 2
        let (mut sink, mut stream) = lines.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "unserializable frame dropped");
                        continue;
                    }
                };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let result = read_loop(&peers, &session, &mut stream).await;
        peers.unregister(&session.identity);
        drop(session);
        writer.abort();
        result
    }
}

async fn read_loop(
    peers: &Arc<PeerTable>,
    session: &Arc<PeerSession>,
    stream: &mut SplitStream<Lines>,
) -> anyhow::Result<()> {
    while let Some(line) = stream.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame = match serde_json::from_str::<ClientFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "unparseable frame");
                let message = format!("malformed frame: {e}");
                session.send(ServerFrame::Error { message }).await?;
                continue;
            }
        };
        dispatch(peers, session, frame).await?;
    }
    info!(identity = %session.identity, "peer closed connection");
    Ok(())
}

async fn dispatch(peers: &Arc<PeerTable>, session: &Arc<PeerSession>, frame: ClientFrame) -> anyhow::Result<()> {
    match frame {
        ClientFrame::Rpc {
            id,
            peer,
            method,
            params,
        } => {
            // Forwarded calls may wait on this peer's own answers.
            let peers = Arc::clone(peers);
            let session = Arc::clone(session);
            tokio::spawn(async move {
                let result = peers.route_rpc(&session.user_id, &peer, &method, params).await;
                let _ = session.send(reply(id, result)).await;
            });
        }
        ClientFrame::Result { id, result } => peers.complete(id, Ok(result)),
        ClientFrame::Error { id, error } => peers.complete(id, Err(AuthError::from_wire(&error))),
        ClientFrame::Subscribe { prefix } => session.subscribe(prefix),
        ClientFrame::Publish { id, topic, message } => {
            let result = peers.publish(session, &topic, message).await;
            match id {
                Some(id) => session.send(reply(id, result.map(serde_json::Value::from))).await?,
                None => {
                    if let Err(e) = result {
                        info!(identity = %session.identity, topic = %topic, error = %e, "publish refused");
                        let message = e.to_string();
                        session.send(ServerFrame::Error { message }).await?;
                    }
                }
            }
        }
        ClientFrame::Hello { .. } => {
            let message = "already authenticated".to_string();
            session.send(ServerFrame::Error { message }).await?;
        }
    }
    Ok(())
}

fn reply(id: u64, result: Result<serde_json::Value, AuthError>) -> ServerFrame {
    match result {
        Ok(value) => ServerFrame::Reply {
            id,
            result: Some(value),
            error: None,
        },
        Err(e) => ServerFrame::Reply {
            id,
            result: None,
            error: Some(e.to_wire()),
        },
    }
}
