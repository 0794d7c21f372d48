//! TCP server and client transport using length-prefixed bincode frames.
//!
//! Each frame carries the sender id and one [`Message`]. A connection
//! carries a sequence of request/response pairs.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{decode_frame, frame_message, Message, MAX_FRAME_SIZE};
use crate::network::transport::{MessageHandler, Transport};
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// TCP server dispatching frames to a [`MessageHandler`].
pub struct NetworkServer {
    listener: TcpListener,

    /// This node's ID.
    node_id: NodeId,

    handler: Arc<dyn MessageHandler>,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind the server. Use port 0 to pick a free port.
    pub async fn bind(
        bind_addr: SocketAddr,
        node_id: NodeId,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            node_id,
            handler,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server until shut down.
    pub async fn run(mut self) -> Result<()> {
        info!(node_id = self.node_id, addr = ?self.listener.local_addr().ok(), "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn MessageHandler>) -> Result<()> {
        loop {
            let data = match read_frame(&mut stream).await {
                Ok(data) => data,
                Err(NetworkError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let (from, msg) = decode_frame(&data)?;
            let response = handler.handle(from, msg).await;
            let framed = frame_message(from, &response)?;
            stream.write_all(&framed).await.map_err(NetworkError::Io)?;
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::result::Result<Vec<u8>, NetworkError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetworkError::ConnectionClosed);
        }
        Err(e) => return Err(NetworkError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::Deserialization(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

/// Client side: one short-lived connection per request.
#[derive(Debug)]
pub struct TcpTransport {
    node_id: NodeId,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
}

impl TcpTransport {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the address of a peer.
    pub fn add_peer(&self, node: NodeId, addr: SocketAddr) {
        self.peers.write().insert(node, addr);
    }

    pub fn remove_peer(&self, node: NodeId) {
        self.peers.write().remove(&node);
    }

    async fn exchange(&self, addr: SocketAddr, target: NodeId, msg: &Message) -> Result<Message> {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| {
            debug!(target, %addr, error = %e, "Connect failed");
            NetworkError::Suspect(target)
        })?;
        let framed = frame_message(self.node_id, msg)?;
        stream.write_all(&framed).await.map_err(NetworkError::Io)?;
        let data = read_frame(&mut stream).await?;
        let (_, response) = decode_frame(&data)?;
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    async fn send(&self, target: NodeId, msg: Message, timeout: Duration) -> Result<Message> {
        let addr = self
            .peers
            .read()
            .get(&target)
            .copied()
            .ok_or(NetworkError::Suspect(target))?;
        match tokio::time::timeout(timeout, self.exchange(addr, target, &msg)).await {
            Ok(result) => result?.into_result(),
            Err(_) => Err(NetworkError::Timeout(target).into()),
        }
    }
}
