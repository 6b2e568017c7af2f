//! TCP connection pool: accepts inbound connections, dials outbound ones, and
//! keeps one reader task per live connection that decodes frames and hands them to
//! a [`Handler`]. Writes are serialized per-connection behind a mutex so a
//! `send`/`broadcast` from any task is safe to call concurrently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::{BrokerError, Result};
use crate::net::message::Message;
use crate::net::wire::{self, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};

/// Callbacks a connection pool owner implements to react to connection lifecycle
/// and incoming messages. Implementations are expected to be cheap and non-blocking;
/// anything that does real work should hand off to its own task.
pub trait Handler: Send + Sync + 'static {
    fn on_connected(&self, addr: SocketAddr);
    fn on_disconnected(&self, addr: SocketAddr);
    fn on_receive(&self, addr: SocketAddr, msg: Message);
}

struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    /// `want_full_info` from the last `RequestWorkerList` sent on this connection,
    /// consulted when decoding a `WorkerList` reply (the flavor isn't repeated on
    /// the wire, so the requester has to remember what it asked for).
    pending_want_full_info: Mutex<Option<bool>>,
}

/// Shared connection table plus accept loop. Cheap to clone (it's an `Arc` inside).
pub struct ConnectionPool<H: Handler> {
    connections: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    handler: Arc<H>,
}

impl<H: Handler> ConnectionPool<H> {
    pub fn new(handler: Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            handler,
        })
    }

    /// Bind `port` on all interfaces and spawn the accept loop. Returns once bound;
    /// the loop itself runs in the background for the lifetime of the pool.
    pub async fn listen(self: &Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| BrokerError::BindFailed { port, source })?;
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        pool.clone().adopt(stream, addr).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// Dial `addr`, bounded by `timeout`.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr, timeout: Duration) -> Result<()> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BrokerError::Timeout(timeout))?
            .map_err(|source| BrokerError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        self.clone().adopt(stream, addr).await;
        Ok(())
    }

    async fn adopt(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Connection {
            writer: Mutex::new(write_half),
            pending_want_full_info: Mutex::new(None),
        });
        self.connections.lock().await.insert(addr, Arc::clone(&conn));
        self.handler.on_connected(addr);

        let pool = self;
        tokio::spawn(async move {
            pool.read_loop(addr, conn, read_half).await;
            pool.connections.lock().await.remove(&addr);
            pool.handler.on_disconnected(addr);
        });
    }

    async fn read_loop(&self, addr: SocketAddr, conn: Arc<Connection>, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        loop {
            let frame = match wire::read_frame(&mut reader, MAX_FRAME_LEN).await {
                Ok(f) => f,
                Err(e) => {
                    tracing::debug!(peer = %addr, error = %e, "connection closed");
                    return;
                }
            };
            let header = match crate::net::message::MessageHeader::decode(&frame) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(peer = %addr, error = %e, "corrupt header");
                    return;
                }
            };
            let payload = if header.has_payload {
                match wire::read_frame(&mut reader, MAX_PAYLOAD_LEN).await {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(peer = %addr, error = %e, "corrupt payload");
                        return;
                    }
                }
            } else {
                None
            };

            let want_full_info_hint = conn.pending_want_full_info.lock().await.take().unwrap_or(false);
            match Message::decode(&frame, payload.as_deref(), want_full_info_hint) {
                Ok(msg) => self.handler.on_receive(addr, msg),
                Err(e) => {
                    tracing::warn!(peer = %addr, error = %e, "failed to decode message");
                    return;
                }
            }
        }
    }

    /// Send `msg` to `addr`. Records `want_full_info` if `msg` is a
    /// `RequestWorkerList`, so the matching `WorkerList` reply decodes correctly.
    pub async fn send(&self, addr: SocketAddr, msg: &Message) -> Result<()> {
        let conn = {
            let connections = self.connections.lock().await;
            connections
                .get(&addr)
                .cloned()
                .ok_or_else(|| BrokerError::ConnectFailed {
                    addr: addr.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotConnected, "not connected"),
                })?
        };

        if let Message::RequestWorkerList { want_full_info, .. } = msg {
            *conn.pending_want_full_info.lock().await = Some(*want_full_info);
        }

        let (frame, payload) = msg.encode();
        let mut writer = conn.writer.lock().await;
        wire::write_frame(&mut *writer, &frame).await?;
        if let Some(payload) = payload {
            wire::write_frame(&mut *writer, &payload).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Send `msg` to every currently connected peer, logging (not failing on)
    /// individual send errors.
    pub async fn broadcast(&self, msg: &Message) {
        let addrs: Vec<SocketAddr> = self.connections.lock().await.keys().copied().collect();
        for addr in addrs {
            if let Err(e) = self.send(addr, msg).await {
                tracing::warn!(peer = %addr, error = %e, "broadcast send failed");
            }
        }
    }

    pub async fn disconnect(&self, addr: SocketAddr) {
        if self.connections.lock().await.remove(&addr).is_some() {
            self.handler.on_disconnected(addr);
        }
    }

    pub async fn shutdown_all(&self) {
        let addrs: Vec<SocketAddr> = self.connections.lock().await.keys().copied().collect();
        for addr in addrs {
            self.disconnect(addr).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::address::Address;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct RecordingHandler {
        received: std::sync::Mutex<Vec<Message>>,
        notify: Notify,
        disconnects: AtomicUsize,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: std::sync::Mutex::new(Vec::new()),
                notify: Notify::new(),
                disconnects: AtomicUsize::new(0),
            })
        }
    }

    impl Handler for RecordingHandler {
        fn on_connected(&self, _addr: SocketAddr) {}
        fn on_disconnected(&self, _addr: SocketAddr) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn on_receive(&self, _addr: SocketAddr, msg: Message) {
            self.received.lock().unwrap().push(msg);
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn request_worker_list_round_trips_over_loopback() {
        let server_handler = RecordingHandler::new();
        let server_pool = ConnectionPool::new(Arc::clone(&server_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        server_pool.listen(port).await.unwrap();

        let client_handler = RecordingHandler::new();
        let client_pool = ConnectionPool::new(Arc::clone(&client_handler));
        let server_addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        client_pool
            .connect(server_addr, Duration::from_secs(2))
            .await
            .unwrap();

        // give the server a moment to register the inbound connection
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = Message::WorkerList {
            entries: vec![crate::net::message::WorkerListEntry::AddressOnly(
                Address::from_ipv4("10.0.0.9".parse().unwrap()),
            )],
        };
        server_pool.broadcast(&reply).await;

        tokio::time::timeout(Duration::from_secs(2), client_handler.notify.notified())
            .await
            .unwrap();
        let received = client_handler.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], reply);
    }

    #[tokio::test]
    async fn disconnect_notifies_handler() {
        let handler = RecordingHandler::new();
        let pool = ConnectionPool::new(Arc::clone(&handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        pool.listen(port).await.unwrap();

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let other_handler = RecordingHandler::new();
        let other_pool = ConnectionPool::new(other_handler);
        other_pool.connect(addr, Duration::from_secs(2)).await.unwrap();
        other_pool.shutdown_all().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    }
}
