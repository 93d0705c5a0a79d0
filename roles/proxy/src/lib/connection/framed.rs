//! Newline-framed Stratum connection over TCP.
//!
//! One reader task and one writer at a time; writes are serialized behind a
//! lock. Reads and writes are cancellable and report cancellation as
//! [`Error::Cancelled`], never as an I/O deadline error, so shutdown can be
//! told apart from network faults.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use sv1_api::Message;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex as TokioMutex},
    time::sleep,
};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub const READ_CLOSE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const WRITE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub const MAX_LINE_LENGTH: usize = 1 << 16;

pub struct StratumConnection {
    id: String,
    connected_at: Instant,

    reader: TokioMutex<FramedRead<OwnedReadHalf, LinesCodec>>,
    writer: TokioMutex<OwnedWriteHalf>,

    read_happened: mpsc::Sender<()>,
    write_happened: mpsc::Sender<()>,
    closed: CancellationToken,

    // unix seconds when the connection will close due to an idle direction
    idle_read_at: AtomicI64,
    idle_write_at: AtomicI64,
}

impl std::fmt::Debug for StratumConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StratumConnection")
            .field("id", &self.id)
            .finish()
    }
}

impl StratumConnection {
    /// Wraps an accepted or dialed stream and starts the idle-close timers.
    pub fn new(
        stream: TcpStream,
        id: &str,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> std::sync::Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (read_tx, read_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(1);

        let conn = std::sync::Arc::new(Self {
            id: id.to_string(),
            connected_at: Instant::now(),
            reader: TokioMutex::new(FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            writer: TokioMutex::new(write_half),
            read_happened: read_tx,
            write_happened: write_tx,
            closed: CancellationToken::new(),
            idle_read_at: AtomicI64::new(0),
            idle_write_at: AtomicI64::new(0),
        });
        conn.spawn_idle_timers(read_rx, write_rx, read_timeout, write_timeout);
        conn
    }

    /// Dials a destination with the default idle-close timeouts.
    pub async fn connect(url: &Url) -> Result<std::sync::Arc<Self>, Error> {
        let host = url.host_str().ok_or(url::ParseError::EmptyHost)?;
        let port = url.port().unwrap_or(3333);
        let addr = format!("{host}:{port}");

        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial timeout {addr}"),
            )))??;

        Ok(Self::new(
            stream,
            url.as_str(),
            READ_CLOSE_TIMEOUT,
            WRITE_CLOSE_TIMEOUT,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Reads one message. Unblocks with [`Error::Cancelled`] when `cancel`
    /// fires and [`Error::ConnectionClosed`] when an idle timer closed the
    /// connection.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<Message, Error> {
        let mut reader = self.reader.lock().await;
        let line = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
            line = reader.next() => line,
        };
        match line {
            None => Err(Error::Eof),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(Error::FrameTooLong),
            Some(Err(LinesCodecError::Io(e))) => Err(Error::Io(e)),
            Some(Ok(line)) => {
                let _ = self.read_happened.try_send(());
                debug!("{} <= {}", self.id, line);
                // malformed JSON is fatal for the connection
                Ok(sv1_api::parse_message(&line)?)
            }
        }
    }

    /// Writes one message. Bounded by [`WRITE_TIMEOUT`]; serialized with
    /// respect to all other writers of this connection.
    pub async fn write(&self, cancel: &CancellationToken, msg: &Message) -> Result<(), Error> {
        let line = sv1_api::serialize_message(msg);
        let mut writer = self.writer.lock().await;
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
            res = tokio::time::timeout(WRITE_TIMEOUT, async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }) => res,
        };
        match res {
            Err(_elapsed) => Err(Error::WriteTimeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) => {
                let _ = self.write_happened.try_send(());
                debug!("{} => {}", self.id, line);
                Ok(())
            }
        }
    }

    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!("connection closed {}", self.id);
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn idle_close_at(&self) -> SystemTime {
        let read_at = self.idle_read_at.load(Ordering::Relaxed);
        let write_at = self.idle_write_at.load(Ordering::Relaxed);
        UNIX_EPOCH + Duration::from_secs(read_at.max(write_at).max(0) as u64)
    }

    /// Marks both directions as recently active, pushing the idle closure
    /// forward. Used when a cached destination is taken back into service.
    pub fn reset_idle_close_timers(&self) {
        let _ = self.read_happened.try_send(());
        let _ = self.write_happened.try_send(());
    }

    fn spawn_idle_timers(
        self: &std::sync::Arc<Self>,
        mut read_rx: mpsc::Receiver<()>,
        mut write_rx: mpsc::Receiver<()>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) {
        let conn = self.clone();
        tokio::spawn(async move {
            let read_sleep = sleep(read_timeout);
            let write_sleep = sleep(write_timeout);
            tokio::pin!(read_sleep, write_sleep);
            loop {
                tokio::select! {
                    _ = &mut read_sleep => {
                        info!("connection read timeout {}", conn.id);
                        conn.close();
                        return;
                    }
                    _ = &mut write_sleep => {
                        info!("connection write timeout {}", conn.id);
                        conn.close();
                        return;
                    }
                    happened = read_rx.recv() => {
                        if happened.is_none() {
                            warn!("read activity channel closed {}", conn.id);
                            return;
                        }
                        read_sleep.as_mut().reset(tokio::time::Instant::now() + read_timeout);
                        conn.idle_read_at.store(unix_now() + read_timeout.as_secs() as i64, Ordering::Relaxed);
                    }
                    happened = write_rx.recv() => {
                        if happened.is_none() {
                            warn!("write activity channel closed {}", conn.id);
                            return;
                        }
                        write_sleep.as_mut().reset(tokio::time::Instant::now() + write_timeout);
                        conn.idle_write_at.store(unix_now() + write_timeout.as_secs() as i64, Ordering::Relaxed);
                    }
                    _ = conn.closed.cancelled() => return,
                }
            }
        });
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    async fn connected_pair() -> (Arc<StratumConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = StratumConnection::new(
            server,
            "test",
            READ_CLOSE_TIMEOUT,
            WRITE_CLOSE_TIMEOUT,
        );
        (conn, client)
    }

    #[tokio::test]
    async fn read_returns_cancelled_on_token_cancel() {
        let (conn, _client) = connected_pair().await;
        let cancel = CancellationToken::new();

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });

        // the socket stays idle so only the token can unblock the read
        let err = conn.read(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn read_parses_one_frame_per_line() {
        let (conn, mut client) = connected_pair().await;
        client
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let msg = conn.read(&cancel).await.unwrap();
        assert_eq!(msg.id(), Some(1));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let (conn, mut client) = connected_pair().await;
        let big = vec![b'a'; MAX_LINE_LENGTH + 10];
        client.write_all(&big).await.unwrap();
        client.write_all(b"\n").await.unwrap();

        let cancel = CancellationToken::new();
        let err = conn.read(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLong));
    }

    #[tokio::test]
    async fn write_appends_newline() {
        let (conn, mut client) = connected_pair().await;
        let cancel = CancellationToken::new();
        let msg: Message = sv1_api::json_rpc::Response::success(7).into();
        conn.write(&cancel, &msg).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"id\":7"));
    }

    #[tokio::test]
    async fn idle_read_timer_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = StratumConnection::new(
            server,
            "test",
            Duration::from_millis(30),
            WRITE_CLOSE_TIMEOUT,
        );

        let cancel = CancellationToken::new();
        let err = conn.read(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(conn.is_closed());
    }
}
