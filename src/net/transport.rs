//! Peer transport: request/response calls between nodes
//!
//! `Transport` is the seam the whole cluster talks through; production
//! uses framed TCP with idle-connection reuse, tests use the in-memory
//! registry in `net::mem`.

use crate::common::{Error, Result};
use crate::net::codec::{read_frame, write_frame};
use crate::net::message::PeerMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Request/response transport to a peer address.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, addr: &str, msg: PeerMessage) -> Result<PeerMessage>;
}

/// Handler side: a node's dispatch point for incoming peer messages.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn handle(&self, msg: PeerMessage) -> PeerMessage;
}

/// TCP transport with a small idle-connection pool per peer.
pub struct TcpTransport {
    pool: Mutex<HashMap<String, Vec<TcpStream>>>,
    call_timeout: Duration,
}

const POOL_PER_PEER: usize = 4;

impl TcpTransport {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            call_timeout,
        }
    }

    fn checkout(&self, addr: &str) -> Option<TcpStream> {
        let mut pool = self.pool.lock().unwrap();
        pool.get_mut(addr).and_then(|streams| streams.pop())
    }

    fn checkin(&self, addr: &str, stream: TcpStream) {
        let mut pool = self.pool.lock().unwrap();
        let streams = pool.entry(addr.to_string()).or_default();
        if streams.len() < POOL_PER_PEER {
            streams.push(stream);
        }
    }

    async fn round_trip(stream: &mut TcpStream, msg: &PeerMessage) -> Result<PeerMessage> {
        write_frame(stream, msg).await?;
        match read_frame(stream).await? {
            Some(resp) => Ok(resp),
            None => Err(Error::NodeUnreachable("connection closed".into())),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, addr: &str, msg: PeerMessage) -> Result<PeerMessage> {
        let fut = async {
            // try one pooled connection first; it may have gone stale
            if let Some(mut stream) = self.checkout(addr) {
                match Self::round_trip(&mut stream, &msg).await {
                    Ok(resp) => {
                        self.checkin(addr, stream);
                        return Ok(resp);
                    }
                    Err(e) => {
                        tracing::debug!("pooled connection to {} failed: {}", addr, e);
                    }
                }
            }

            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::NodeUnreachable(format!("{}: {}", addr, e)))?;
            let resp = Self::round_trip(&mut stream, &msg).await?;
            self.checkin(addr, stream);
            Ok(resp)
        };

        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(format!("call to {}", addr))),
        }
    }
}

/// Accept loop for the peer wire protocol. One task per connection;
/// connections are reused for many request/response exchanges.
pub async fn serve_peer(listener: TcpListener, handler: Arc<dyn PeerHandler>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("peer accept error: {}", e);
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                let msg = match read_frame(&mut stream).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        // corrupt frames are discarded, the connection dropped
                        tracing::debug!("peer read error from {}: {}", peer, e);
                        break;
                    }
                };
                let resp = handler.handle(msg).await;
                if let Err(e) = write_frame(&mut stream, &resp).await {
                    tracing::debug!("peer write error to {}: {}", peer, e);
                    break;
                }
            }
        });
    }
}
