//! Peer-to-peer transport for the key-value store.
//!
//! Messages are length-prefixed canonical frames over any reliable stream.
//! The store is written against [`PeerTransport`]; production uses
//! [`TcpPeerTransport`] plus [`serve_peer_endpoint`], tests wire stores
//! together with [`MemTransport`].

use crate::{KvError, KvStore};
use async_trait::async_trait;
use spindle_codec::{decode_frame, encode_frame, KvMessage, MAX_FRAME_SIZE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Request/response transport toward one peer endpoint.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn request(&self, url: &str, msg: KvMessage) -> Result<KvMessage, KvError>;
}

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

pub(crate) async fn write_frame(stream: &mut TcpStream, msg: &KvMessage) -> Result<(), KvError> {
    let frame = encode_frame(msg);
    stream.write_all(&frame).await?;
    Ok(())
}

pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<KvMessage, KvError> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(KvError::Transport(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len + 4];
    body[..4].copy_from_slice(&(len as u32).to_be_bytes());
    stream.read_exact(&mut body[4..]).await?;
    match decode_frame(&body)? {
        Some((msg, _)) => Ok(msg),
        None => Err(KvError::Transport("short frame".into())),
    }
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

/// TCP implementation with one pooled connection per peer.
#[derive(Default)]
pub struct TcpPeerTransport {
    /// Connections are taken out of the pool for the duration of a request
    /// so concurrent requests to one peer never interleave frames.
    pool: Mutex<HashMap<String, TcpStream>>,
}

impl TcpPeerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, url: &str) -> Option<TcpStream> {
        self.pool.lock().expect("pool lock").remove(url)
    }

    fn put_back(&self, url: &str, stream: TcpStream) {
        self.pool
            .lock()
            .expect("pool lock")
            .insert(url.to_string(), stream);
    }
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn request(&self, url: &str, msg: KvMessage) -> Result<KvMessage, KvError> {
        // One retry with a fresh connection: the pooled stream may have
        // been closed by the peer since its last use.
        let pooled = self.take(url);
        let had_pooled = pooled.is_some();

        let mut stream = match pooled {
            Some(stream) => stream,
            None => TcpStream::connect(url).await?,
        };

        match write_frame(&mut stream, &msg).await {
            Ok(()) => match read_frame(&mut stream).await {
                Ok(response) => {
                    self.put_back(url, stream);
                    return Ok(response);
                }
                Err(e) if !had_pooled => return Err(e),
                Err(_) => {}
            },
            Err(e) if !had_pooled => return Err(e),
            Err(_) => {}
        }

        let mut stream = TcpStream::connect(url).await?;
        write_frame(&mut stream, &msg).await?;
        let response = read_frame(&mut stream).await?;
        self.put_back(url, stream);
        Ok(response)
    }
}

/// Serve the store's command endpoint: one task per connection, one
/// request/response frame pair at a time.
pub async fn serve_peer_endpoint(listener: TcpListener, store: KvStore) {
    loop {
        let (mut stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("peer endpoint accept failed: {}", e);
                continue;
            }
        };
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                let request = match read_frame(&mut stream).await {
                    Ok(request) => request,
                    Err(KvError::Io(ref e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return;
                    }
                    Err(e) => {
                        tracing::debug!("peer {} connection error: {}", peer_addr, e);
                        return;
                    }
                };
                let response = store.handle_peer_message(request).await;
                if let Err(e) = write_frame(&mut stream, &response).await {
                    tracing::debug!("peer {} write error: {}", peer_addr, e);
                    return;
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// In-process transport for tests
// ---------------------------------------------------------------------------

/// Routes requests straight to registered store handles, no sockets.
#[derive(Clone, Default)]
pub struct MemTransport {
    registry: Arc<Mutex<HashMap<String, KvStore>>>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `store` reachable at `url`.
    pub fn register(&self, url: impl Into<String>, store: KvStore) {
        self.registry
            .lock()
            .expect("registry lock")
            .insert(url.into(), store);
    }

    pub fn unregister(&self, url: &str) {
        self.registry.lock().expect("registry lock").remove(url);
    }
}

#[async_trait]
impl PeerTransport for MemTransport {
    async fn request(&self, url: &str, msg: KvMessage) -> Result<KvMessage, KvError> {
        let store = {
            let registry = self.registry.lock().expect("registry lock");
            registry.get(url).cloned()
        };
        match store {
            Some(store) => Ok(store.handle_peer_message(msg).await),
            None => Err(KvError::Transport(format!("no peer at {}", url))),
        }
    }
}
