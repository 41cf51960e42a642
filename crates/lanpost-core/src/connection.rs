// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Peer connection
//
// Wraps one live TCP socket as an explicit state machine:
//
//   Idle -> Connecting -> Ready -> Closed
//
// Closed is terminal and reachable from any state on transport error or
// explicit close. The receive loop runs as a spawned task; closing the
// connection unblocks a pending receive through a watch signal.

use crate::codec::{self, Frame};
use crate::inbox::Inbox;
use crate::types::{ConnectionState, FileHeader, Message, SessionError, SessionEvent};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};

/// Context handed to the receive loop of a connection
#[derive(Clone)]
pub struct ReceiveContext {
    pub inbox: Arc<Inbox>,
    pub event_tx: broadcast::Sender<SessionEvent>,
    pub download_dir: PathBuf,
    pub read_timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct Connection {
    peer_addr: SocketAddr,
    state: Arc<StdMutex<ConnectionState>>,
    writer: Mutex<OwnedWriteHalf>,
    close_tx: watch::Sender<bool>,
    // Taken exactly once by spawn_receive_loop
    reader: StdMutex<Option<OwnedReadHalf>>,
}

impl Connection {
    /// Dial a peer. One attempt; retry policy lives in the session layer.
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let state = Arc::new(StdMutex::new(ConnectionState::Connecting));

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                *state.lock().unwrap() = ConnectionState::Closed;
                return Err(SessionError::Transport(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                *state.lock().unwrap() = ConnectionState::Closed;
                return Err(SessionError::Timeout(format!(
                    "Connect to {} timed out",
                    addr
                )));
            }
        };

        Ok(Self::from_stream(stream, addr, state))
    }

    /// Wrap an accepted inbound stream. The stream is live, so the
    /// connection starts out Ready.
    pub fn accept(stream: TcpStream, addr: SocketAddr) -> Self {
        Self::from_stream(stream, addr, Arc::new(StdMutex::new(ConnectionState::Idle)))
    }

    fn from_stream(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<StdMutex<ConnectionState>>,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (close_tx, _) = watch::channel(false);

        *state.lock().unwrap() = ConnectionState::Ready;

        Self {
            peer_addr: addr,
            state,
            writer: Mutex::new(write_half),
            close_tx,
            reader: StdMutex::new(Some(read_half)),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Transition to Closed. Returns false if already there.
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        true
    }

    /// Close the connection. Idempotent: closing a Closed connection is a
    /// no-op. Unblocks a pending receive via the close signal.
    pub async fn close(&self) {
        if !self.mark_closed() {
            return;
        }

        let _ = self.close_tx.send(true);

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Shutdown of {} returned: {}", self.peer_addr, e);
        }
    }

    /// Send one chat message frame. Completes exactly once per attempt.
    pub async fn send_message(&self, message: &Message) -> Result<(), SessionError> {
        self.send_frame(&codec::encode_message_frame(message)).await
    }

    /// Send one file frame
    pub async fn send_file(&self, header: &FileHeader, data: &[u8]) -> Result<(), SessionError> {
        let frame = codec::encode_file_frame(header, data)?;
        self.send_frame(&frame).await
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Ready {
            return Err(SessionError::NotConnected(self.peer_addr));
        }

        let mut writer = self.writer.lock().await;
        match codec::write_frame(&mut *writer, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The socket is gone; a dead writer never comes back
                drop(writer);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Spawn the receive loop for this connection. Must be called at most
    /// once; further calls are ignored.
    pub fn spawn_receive_loop(
        self: Arc<Self>,
        ctx: ReceiveContext,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let reader = self.reader.lock().unwrap().take()?;
        let close_rx = self.close_tx.subscribe();

        Some(tokio::spawn(async move {
            self.receive_loop(reader, close_rx, ctx).await;
        }))
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        mut close_rx: watch::Receiver<bool>,
        ctx: ReceiveContext,
    ) {
        let mut reason: Option<String> = None;

        loop {
            let next = tokio::select! {
                _ = close_rx.changed() => break,
                next = read_with_timeout(&mut reader, ctx.read_timeout) => next,
            };

            match next {
                Ok(Some(Frame::Message(message))) => {
                    tracing::debug!("Message {} from {}", message.id, self.peer_addr);
                    ctx.inbox.append(message.clone());
                    let _ = ctx.event_tx.send(SessionEvent::MessageReceived { message });
                }
                Ok(Some(Frame::File { header, data })) => {
                    self.handle_file(&ctx, header, data).await;
                }
                Ok(None) => {
                    tracing::info!("Peer {} closed the connection", self.peer_addr);
                    break;
                }
                Err(SessionError::Decode(e)) => {
                    // Malformed payload: drop it and re-arm the loop
                    tracing::warn!("Discarding bad frame from {}: {}", self.peer_addr, e);
                }
                Err(e) => {
                    tracing::warn!("Receive from {} failed: {}", self.peer_addr, e);
                    reason = Some(e.to_string());
                    break;
                }
            }
        }

        self.close().await;
        let _ = ctx.event_tx.send(SessionEvent::ConnectionClosed {
            addr: self.peer_addr,
            reason,
        });
    }

    async fn handle_file(&self, ctx: &ReceiveContext, header: FileHeader, data: Vec<u8>) {
        match save_file(&ctx.download_dir, &header.name, &data).await {
            Ok(path) => {
                tracing::info!(
                    "File received from {}: {} ({} bytes)",
                    header.sender,
                    path.display(),
                    header.size
                );

                let message = Message::with_file(
                    header.sender.clone(),
                    header.name.clone(),
                    path.display().to_string(),
                );
                ctx.inbox.append(message.clone());

                let _ = ctx.event_tx.send(SessionEvent::FileReceived {
                    from: header.sender,
                    path,
                    size: header.size,
                });
                let _ = ctx.event_tx.send(SessionEvent::MessageReceived { message });
            }
            Err(e) => {
                // Local disk trouble is not the peer's fault; keep receiving
                tracing::error!("Failed to save file {}: {}", header.name, e);
            }
        }
    }
}

async fn read_with_timeout(
    reader: &mut OwnedReadHalf,
    read_timeout: Option<Duration>,
) -> Result<Option<Frame>, SessionError> {
    match read_timeout {
        Some(limit) => match tokio::time::timeout(limit, codec::read_frame(reader)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(format!(
                "No frame within {:?}",
                limit
            ))),
        },
        None => codec::read_frame(reader).await,
    }
}

fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let trimmed = name.trim();
    let file_name = Path::new(trimmed)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..");

    file_name
        .map(|n| n.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn split_file_name(name: &str) -> (&str, &str) {
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if !stem.is_empty() {
            return (stem, ext);
        }
    }
    (name, "")
}

async fn open_unique_file(
    download_dir: &Path,
    base_name: &str,
) -> Result<(PathBuf, File), std::io::Error> {
    let (stem, ext) = split_file_name(base_name);

    for index in 0..1000 {
        let candidate = if index == 0 {
            base_name.to_string()
        } else if ext.is_empty() {
            format!("{} ({})", stem, index)
        } else {
            format!("{} ({}).{}", stem, index, ext)
        };

        let path = download_dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        "Too many filename conflicts",
    ))
}

/// Write received file bytes under a collision-free name
async fn save_file(
    download_dir: &Path,
    name: &str,
    data: &[u8],
) -> Result<PathBuf, SessionError> {
    tokio::fs::create_dir_all(download_dir)
        .await
        .map_err(|e| SessionError::FileIo(format!("Failed to create download dir: {}", e)))?;

    let fallback = uuid::Uuid::new_v4().to_string();
    let safe_name = sanitize_file_name(name, &fallback);

    let (path, mut file) = open_unique_file(download_dir, &safe_name)
        .await
        .map_err(|e| SessionError::FileIo(format!("Failed to create file: {}", e)))?;

    file.write_all(data)
        .await
        .map_err(|e| SessionError::FileIo(format!("Failed to write file: {}", e)))?;
    file.flush()
        .await
        .map_err(|e| SessionError::FileIo(format!("Failed to flush file: {}", e)))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("notes.txt", "x"), "notes.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd", "x"), "passwd");
        assert_eq!(sanitize_file_name("..", "x"), "x");
        assert_eq!(sanitize_file_name("   ", "x"), "x");
    }

    #[test]
    fn test_split_file_name() {
        assert_eq!(split_file_name("a.txt"), ("a", "txt"));
        assert_eq!(split_file_name("archive.tar.gz"), ("archive.tar", "gz"));
        assert_eq!(split_file_name("noext"), ("noext", ""));
        assert_eq!(split_file_name(".hidden"), (".hidden", ""));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = TcpStream::connect(addr).await.unwrap();
        let (server_stream, peer) = accept.await.unwrap();
        drop(stream);

        let conn = Connection::accept(server_stream, peer);
        assert_eq!(conn.state(), ConnectionState::Ready);

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Second close is a no-op
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_on_closed_connection_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, peer) = accept.await.unwrap();

        let conn = Connection::accept(server_stream, peer);
        conn.close().await;

        let err = conn.send_message(&Message::new("A", "late")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connection::connect(addr, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
