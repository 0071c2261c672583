//! Byte-level links underneath the connection manager.
//!
//! A [`Connector`] opens one [`Link`]: a pair of channels carrying whole
//! frames. The manager never sees sockets, so the same reconnection logic
//! drives a real WebSocket ([`WsConnector`]) and an in-process pipe
//! ([`MemoryConnector`]).
//!
//! ```text
//!  ConnectionManager ── outgoing ──▶ writer task ──▶ socket / peer
//!  ConnectionManager ◀── incoming ── reader task ◀── socket / peer
//! ```
//!
//! A link is closed when `incoming` yields `None`. Dropping `outgoing`
//! closes the link from the client side.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::ConnectionError;

/// Frames buffered per direction before senders wait.
const LINK_BUFFER: usize = 256;

/// An established bidirectional frame link.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Vec<u8>>,
}

/// Opens links. Called once per connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Link, ConnectionError>> + Send;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

/// Connects to a relay over WebSocket, one binary message per frame.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> impl Future<Output = Result<Link, ConnectionError>> + Send {
        let url = self.url.clone();
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ConnectionError::Refused(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER);

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                        return;
                    }
                }
                let _ = ws_writer.send(Message::Close(None)).await;
            });

            // Reader task: forward binary frames until the socket closes
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if in_tx.send(data.into()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
            });

            log::debug!("WebSocket link open to {url}");
            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

/// The far end of an in-memory link, handed to whoever plays the server.
#[derive(Debug)]
pub struct MemoryPeer {
    pub to_client: mpsc::Sender<Vec<u8>>,
    pub from_client: mpsc::Receiver<Vec<u8>>,
}

impl MemoryPeer {
    /// Close the link as a server would.
    pub fn close(self) {}
}

struct MemoryShared {
    accept: mpsc::UnboundedSender<MemoryPeer>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

/// In-process connector. Each successful `connect` delivers a
/// [`MemoryPeer`] on the receiver returned by [`MemoryConnector::new`].
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accept, accepted) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(MemoryShared {
                accept,
                fail_next: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
            }),
        };
        (connector, accepted)
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    fn open(&self) -> Result<Link, ConnectionError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::Refused("connection refused".into()));
        }

        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        self.shared
            .accept
            .send(MemoryPeer {
                to_client: in_tx,
                from_client: out_rx,
            })
            .map_err(|_| ConnectionError::Refused("no listener".into()))?;

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> impl Future<Output = Result<Link, ConnectionError>> + Send {
        let result = self.open();
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_carries_frames_both_ways() {
        let (connector, mut accepted) = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();
        let mut peer = accepted.recv().await.unwrap();

        link.outgoing.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), vec![1, 2, 3]);

        peer.to_client.send(vec![9]).await.unwrap();
        assert_eq!(link.incoming.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_memory_peer_close_ends_link() {
        let (connector, mut accepted) = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();
        accepted.recv().await.unwrap().close();
        assert!(link.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_next_refuses_then_recovers() {
        let (connector, _accepted) = MemoryConnector::new();
        connector.fail_next(2);

        assert!(matches!(connector.connect().await, Err(ConnectionError::Refused(_))));
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_no_listener_is_refused() {
        let (connector, accepted) = MemoryConnector::new();
        drop(accepted);
        assert!(connector.connect().await.is_err());
    }
}
