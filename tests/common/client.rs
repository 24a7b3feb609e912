//! Test peer.
//!
//! Speaks the gateway's line-JSON frames and lets tests wait for
//! specific replies while keeping everything else for later assertions.

use capgate::rpc::{CallContext, RpcDispatcher};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// A test peer.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    /// Frames received while waiting for something else.
    backlog: Vec<Value>,
    next_id: u64,
}

impl TestClient {
    /// Connect to a test server.
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            backlog: Vec::new(),
            next_id: 1,
        })
    }

    /// Connect and authenticate; fails unless the server welcomes us.
    pub async fn login(
        address: &str,
        mechanism: &str,
        credentials: &[&str],
        identity: &str,
    ) -> anyhow::Result<Self> {
        let mut client = Self::connect(address).await?;
        let answer = client.hello(mechanism, credentials, Some(identity)).await?;
        anyhow::ensure!(answer["type"] == "welcome", "not welcomed: {answer}");
        Ok(client)
    }

    /// Send a frame.
    pub async fn send(&mut self, frame: Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next frame from the wire.
    pub async fn recv(&mut self) -> anyhow::Result<Value> {
        self.recv_timeout(Duration::from_secs(5)).await
    }

    /// Receive a frame with a timeout.
    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<Value> {
        let mut line = String::new();
        let read = timeout(dur, self.reader.read_line(&mut line)).await??;
        anyhow::ensure!(read > 0, "connection closed");
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Receive frames until one satisfies `predicate`; the others are kept
    /// in the backlog.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> anyhow::Result<Value>
    where
        F: FnMut(&Value) -> bool,
    {
        if let Some(pos) = self.backlog.iter().position(&mut predicate) {
            return Ok(self.backlog.remove(pos));
        }
        loop {
            let frame = self.recv().await?;
            if predicate(&frame) {
                return Ok(frame);
            }
            self.backlog.push(frame);
        }
    }

    /// Send a hello frame and return the server's answer.
    pub async fn hello(
        &mut self,
        mechanism: &str,
        credentials: &[&str],
        identity: Option<&str>,
    ) -> anyhow::Result<Value> {
        self.send(json!({
            "type": "hello",
            "mechanism": mechanism,
            "credentials": credentials,
            "identity": identity,
        }))
        .await?;
        self.recv().await
    }

    /// Call `method` on `peer` and wait for the reply frame.
    pub async fn rpc(&mut self, peer: &str, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!({
            "type": "rpc",
            "id": id,
            "peer": peer,
            "method": method,
            "params": params,
        }))
        .await?;
        self.recv_until(|f| f["type"] == "reply" && f["id"] == id).await
    }

    /// Call the authentication service.
    pub async fn auth(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.rpc("platform.auth", method, params).await
    }

    pub async fn subscribe(&mut self, prefix: &str) -> anyhow::Result<()> {
        self.send(json!({"type": "subscribe", "prefix": prefix})).await
    }

    /// Publish and wait for the acknowledgement.
    pub async fn publish(&mut self, topic: &str, message: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!({
            "type": "publish",
            "id": id,
            "topic": topic,
            "message": message,
        }))
        .await?;
        self.recv_until(|f| f["type"] == "reply" && f["id"] == id).await
    }

    /// Answer a forwarded call.
    pub async fn answer(&mut self, id: u64, result: Value) -> anyhow::Result<()> {
        self.send(json!({"type": "result", "id": id, "result": result})).await
    }

    /// Hand the connection to `dispatcher`: notifications and forwarded
    /// calls are dispatched the way a real component would, until the
    /// connection closes.
    pub fn serve(mut self, dispatcher: Arc<RpcDispatcher>, auth_identity: &str) -> JoinHandle<()> {
        let auth_identity = auth_identity.to_string();
        tokio::spawn(async move {
            loop {
                let frame = match self.recv_timeout(Duration::from_secs(3600)).await {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                let params = frame["params"].clone();
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                match frame["type"].as_str() {
                    Some("notify") => {
                        let ctx = CallContext::remote(auth_identity.clone());
                        let _ = dispatcher.call(ctx, &method, params).await;
                    }
                    Some("call") => {
                        let id = frame["id"].as_u64().unwrap_or_default();
                        let caller = frame["caller"].as_str().unwrap_or_default();
                        let answer = match dispatcher.call(CallContext::remote(caller), &method, params).await {
                            Ok(result) => json!({"type": "result", "id": id, "result": result}),
                            Err(e) => json!({"type": "error", "id": id, "error": e.to_wire()}),
                        };
                        if self.send(answer).await.is_err() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        })
    }
}
