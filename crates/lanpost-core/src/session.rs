// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Session engine
//
// Owns the listener, the peer roster and the inbox, and fans events out to
// frontends over a broadcast channel. This replaces the ambient mutable
// manager object pattern: every collaborator receives explicit handles.
//
// The listener keeps at most one inbound connection. A new inbound
// connection supersedes the previous one, which is closed first
// (last-writer-wins). Outbound connections are tracked per peer address.

use crate::connection::{Connection, ReceiveContext};
use crate::inbox::Inbox;
use crate::settings::SessionSettings;
use crate::types::{ConnectionState, FileHeader, Message, SessionError, SessionEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};

/// Peer message-exchange session
pub struct Session {
    settings: SessionSettings,
    inbox: Arc<Inbox>,
    event_tx: broadcast::Sender<SessionEvent>,
    /// Single inbound slot, replaced on every accept
    inbound: Arc<Mutex<Option<Arc<Connection>>>>,
    /// Outbound connections, one per dialed peer
    outbound: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            settings,
            inbox: Arc::new(Inbox::new()),
            event_tx,
            inbound: Arc::new(Mutex::new(None)),
            outbound: RwLock::new(HashMap::new()),
            listener_task: Mutex::new(None),
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Shared read access to the inbox
    pub fn inbox(&self) -> Arc<Inbox> {
        Arc::clone(&self.inbox)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn receive_context(&self) -> ReceiveContext {
        ReceiveContext {
            inbox: Arc::clone(&self.inbox),
            event_tx: self.event_tx.clone(),
            download_dir: self.settings.download_dir.clone(),
            read_timeout: self.settings.read_timeout(),
        }
    }

    /// Bind the listener and start accepting inbound connections.
    ///
    /// Bind failure is fatal to the listener and surfaces immediately; it
    /// is never silently retried.
    pub async fn start_listener(&self) -> Result<SocketAddr, SessionError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.port));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SessionError::Bind(format!("Failed to bind to port {}: {}", self.settings.port, e)))?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Listening on {}", local_addr);

        let inbound = Arc::clone(&self.inbound);
        let event_tx = self.event_tx.clone();
        let ctx = self.receive_context();

        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };

                tracing::info!("Inbound connection from {}", peer);

                // Close the superseded connection before the new one
                // becomes Ready
                let mut slot = inbound.lock().await;
                if let Some(old) = slot.take() {
                    tracing::info!("Replacing inbound connection {}", old.peer_addr());
                    old.close().await;
                }

                let conn = Arc::new(Connection::accept(stream, peer));
                Arc::clone(&conn).spawn_receive_loop(ctx.clone());
                *slot = Some(Arc::clone(&conn));
                drop(slot);

                let _ = event_tx.send(SessionEvent::PeerConnected { addr: peer });
            }
        });

        *self.listener_task.lock().await = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting inbound connections and close the inbound slot
    pub async fn stop_listener(&self) {
        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }
        if let Some(conn) = self.inbound.lock().await.take() {
            conn.close().await;
        }
    }

    /// Dial a peer with the configured timeout and bounded retry policy
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), SessionError> {
        let mut last_err = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_delay()).await;
                tracing::info!("Retrying connect to {} (attempt {})", addr, attempt + 1);
            }

            match Connection::connect(addr, self.settings.connect_timeout()).await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    Arc::clone(&conn).spawn_receive_loop(self.receive_context());

                    let mut outbound = self.outbound.write().await;
                    if let Some(old) = outbound.insert(addr, Arc::clone(&conn)) {
                        old.close().await;
                    }
                    drop(outbound);

                    let _ = self.event_tx.send(SessionEvent::PeerConnected { addr });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SessionError::Transport(format!("Connect to {} failed", addr))
        }))
    }

    /// Close and forget an outbound peer
    pub async fn disconnect(&self, addr: SocketAddr) {
        if let Some(conn) = self.outbound.write().await.remove(&addr) {
            conn.close().await;
        }
    }

    /// Addresses of all live outbound peers. Connections that reached
    /// Closed (peer hung up, link error) are dropped from the roster here.
    pub async fn peers(&self) -> Vec<SocketAddr> {
        let mut outbound = self.outbound.write().await;
        outbound.retain(|_, conn| conn.state() != ConnectionState::Closed);
        outbound.keys().copied().collect()
    }

    /// Resolve recipient addresses to live connections. Outbound peers are
    /// matched by the address they were dialed on; the inbound slot matches
    /// its remote address, so the listening side can reply. A Closed
    /// connection never resolves: fan-out reports NotConnected instead of
    /// targeting a dead socket.
    async fn recipients(
        &self,
        recipients: &[SocketAddr],
    ) -> Vec<(SocketAddr, Option<Arc<Connection>>)> {
        let outbound = self.outbound.read().await;
        let inbound = self.inbound.lock().await;

        recipients
            .iter()
            .map(|addr| {
                let conn = outbound
                    .get(addr)
                    .or_else(|| inbound.as_ref().filter(|c| c.peer_addr() == *addr))
                    .filter(|c| c.state() == ConnectionState::Ready)
                    .cloned();
                (*addr, conn)
            })
            .collect()
    }

    /// Send a chat message to each recipient.
    ///
    /// Fan-out is one send per recipient connection; each result is
    /// independent and surfaced to the caller, never rolled back. The
    /// message is appended to the inbox once if any recipient acknowledged
    /// it, and a SendCompleted event fires exactly once per attempt.
    pub async fn send_message(
        &self,
        content: &str,
        recipients: &[SocketAddr],
    ) -> (Message, Vec<(SocketAddr, Result<(), SessionError>)>) {
        let message = Message::new(self.settings.device_name.clone(), content);
        let mut results = Vec::with_capacity(recipients.len());
        let mut any_ok = false;

        for (addr, conn) in self.recipients(recipients).await {
            let result = match conn {
                Some(conn) => conn.send_message(&message).await,
                None => Err(SessionError::NotConnected(addr)),
            };

            let _ = self.event_tx.send(SessionEvent::SendCompleted {
                message_id: message.id,
                peer: addr,
                error: result.as_ref().err().map(|e| e.to_string()),
            });

            any_ok |= result.is_ok();
            results.push((addr, result));
        }

        if any_ok {
            self.inbox.append(message.clone());
        }

        (message, results)
    }

    /// Read a file and send its bytes to each recipient as a file frame.
    ///
    /// Completion semantics match send_message: a SendCompleted event fires
    /// exactly once per recipient attempt, carrying the id of the Message
    /// that records the attachment.
    pub async fn send_file(
        &self,
        path: &Path,
        recipients: &[SocketAddr],
    ) -> Result<Vec<(SocketAddr, Result<(), SessionError>)>, SessionError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| SessionError::FileIo(format!("Failed to read {}: {}", path.display(), e)))?;

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment")
            .to_string();

        let header = FileHeader {
            name: name.clone(),
            sender: self.settings.device_name.clone(),
            size: data.len() as u64,
        };

        let message = Message::with_file(
            self.settings.device_name.clone(),
            name,
            path.display().to_string(),
        );

        let mut results = Vec::with_capacity(recipients.len());
        let mut any_ok = false;

        for (addr, conn) in self.recipients(recipients).await {
            let result = match conn {
                Some(conn) => conn.send_file(&header, &data).await,
                None => Err(SessionError::NotConnected(addr)),
            };

            let _ = self.event_tx.send(SessionEvent::SendCompleted {
                message_id: message.id,
                peer: addr,
                error: result.as_ref().err().map(|e| e.to_string()),
            });

            any_ok |= result.is_ok();
            results.push((addr, result));
        }

        if any_ok {
            self.inbox.append(message);
        }

        Ok(results)
    }

    /// Close everything: listener, inbound slot and all outbound peers
    pub async fn shutdown(&self) {
        self.stop_listener().await;

        let peers: Vec<Arc<Connection>> = self.outbound.write().await.drain().map(|(_, c)| c).collect();
        for conn in peers {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> SessionSettings {
        SessionSettings {
            port: 0,
            device_name: "test-device".to_string(),
            download_dir: std::env::temp_dir(),
            max_retries: 0,
            retry_delay_ms: 10,
            ..SessionSettings::default()
        }
    }

    #[tokio::test]
    async fn test_bind_error_surfaces() {
        let first = Session::new(test_settings());
        let addr = first.start_listener().await.unwrap();

        let mut settings = test_settings();
        settings.port = addr.port();
        let second = Session::new(settings);

        let err = second.start_listener().await.unwrap_err();
        assert!(matches!(err, SessionError::Bind(_)));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_not_connected() {
        let session = Session::new(test_settings());
        let ghost: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let (_, results) = session.send_message("hello", &[ghost]).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, Err(SessionError::NotConnected(_))));

        // Nothing acknowledged the send, so the inbox stays empty
        assert!(session.inbox().is_empty());
    }

    #[tokio::test]
    async fn test_connect_retry_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut settings = test_settings();
        settings.max_retries = 2;
        settings.retry_delay_ms = 5;
        let session = Session::new(settings);

        assert!(session.connect(addr).await.is_err());
        assert!(session.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_closes_peer() {
        let acceptor = Session::new(test_settings());
        let addr = acceptor.start_listener().await.unwrap();
        let target: SocketAddr = format!("127.0.0.1:{}", addr.port()).parse().unwrap();

        let session = Session::new(test_settings());
        session.connect(target).await.unwrap();
        assert_eq!(session.peers().await, vec![target]);

        let conn = session.outbound.read().await.get(&target).cloned().unwrap();
        session.disconnect(target).await;

        assert!(session.peers().await.is_empty());
        assert_eq!(conn.state(), ConnectionState::Closed);

        acceptor.shutdown().await;
    }
}
