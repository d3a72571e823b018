//! Connection Handler Module
//!
//! Each client gets its own handler task. The task first sniffs the
//! protocol, then runs the matching codec in a loop until the client leaves.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. Sniff: read until the prefix names a protocol
//!        │   (bytes stay in the buffer)
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  Main Loop (one codec)       │
//!    │                              │
//!    │  decode ──> execute ──> encode (repeat while
//!    │                              │  the buffer holds requests)
//!    │  flush replies               │
//!    │  read more bytes             │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects, asks to quit, or sends garbage
//! ```
//!
//! Replies to pipelined requests are collected in one output buffer and
//! written with a single flush once the read buffer runs dry.

use super::sniff::{classify, Sniff, SNIFF_LIMIT};
use crate::commands::CommandHandler;
use crate::protocol::{
    Codec, Flow, FrameError, HttpCodec, MemcacheCodec, PostgresCodec, Protocol, RespCodec,
    MAX_VALUE_SIZE,
};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum size for the read buffer: one maximal value plus framing.
const MAX_BUFFER_SIZE: usize = MAX_VALUE_SIZE + 64 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Connections closed because no protocol matched
    pub connections_rejected: AtomicU64,
    /// Total requests processed, across all protocols
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    /// The TCP stream for this connection
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Bytes received and not yet decoded
    buffer: BytesMut,

    /// Encoded replies waiting to be flushed
    output: BytesMut,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            output: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            stats,
        }
    }

    /// Runs the connection until the client disconnects or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                ConnectionError::Unclassified => {
                    self.stats.connection_rejected();
                    warn!(client = %self.addr, "Unrecognized protocol, closing connection")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let protocol = self.sniff().await?;
        info!(client = %self.addr, %protocol, "Client connected");

        match protocol {
            Protocol::Resp => self.serve(RespCodec::new()).await,
            Protocol::Memcache => self.serve(MemcacheCodec::new()).await,
            Protocol::Http => self.serve(HttpCodec::new()).await,
            Protocol::Postgres => self.serve(PostgresCodec::new()).await,
        }
    }

    /// Reads until the buffered prefix identifies a protocol.
    async fn sniff(&mut self) -> Result<Protocol, ConnectionError> {
        loop {
            match classify(&self.buffer) {
                Sniff::Matched(protocol) => return Ok(protocol),
                Sniff::Rejected => return Err(ConnectionError::Unclassified),
                Sniff::Pending if self.buffer.len() >= SNIFF_LIMIT => {
                    return Err(ConnectionError::Unclassified)
                }
                Sniff::Pending => self.read_more_data(SNIFF_LIMIT).await?,
            }
        }
    }

    /// The decode-execute-encode loop for one protocol.
    async fn serve<C: Codec>(&mut self, mut codec: C) -> Result<(), ConnectionError> {
        loop {
            loop {
                match codec.decode(&mut self.buffer) {
                    Ok(Some(request)) => {
                        self.stats.command_processed();
                        let flow = codec.handle(request, &self.command_handler, &mut self.output);
                        if flow == Flow::Close {
                            self.flush_output().await?;
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        trace!(
                            client = %self.addr,
                            buffered = self.buffer.len(),
                            "Incomplete request, need more data"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(client = %self.addr, error = %e, "Framing error");
                        codec.encode_error(&e, &mut self.output);
                        self.flush_output().await?;
                        return Err(ConnectionError::FrameError(e));
                    }
                }
            }

            self.flush_output().await?;
            self.read_more_data(MAX_BUFFER_SIZE).await?;
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self, limit: usize) -> Result<(), ConnectionError> {
        if self.buffer.len() >= limit {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Writes every pending reply to the client.
    async fn flush_output(&mut self) -> Result<(), ConnectionError> {
        if self.output.is_empty() {
            return Ok(());
        }
        let pending = self.output.split();
        self.stream.write_all(&pending).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(pending.len());
        trace!(client = %self.addr, bytes = pending.len(), "Sent response");
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Unrecoverable framing error, already reported to the client
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial request)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// The opening bytes matched no supported protocol
    #[error("Unrecognized protocol")]
    Unclassified,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use bytes::BufMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn create_test_server() -> (SocketAddr, Arc<StorageEngine>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let storage = Arc::new(StorageEngine::new());
        let stats = Arc::new(ConnectionStats::new());

        let storage_clone = Arc::clone(&storage);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let handler = CommandHandler::new(Arc::clone(&storage_clone));
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(stream, client_addr, handler, stats));
            }
        });

        (addr, storage, stats)
    }

    /// Reads until the received bytes end with `suffix`.
    async fn read_until(client: &mut TcpStream, suffix: &[u8]) -> Vec<u8> {
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while !received.ends_with(suffix) {
            let n = timeout(Duration::from_secs(2), client.read(&mut chunk))
                .await
                .expect("timed out waiting for reply")
                .unwrap();
            assert!(n > 0, "connection closed, got {:?}", received);
            received.extend_from_slice(&chunk[..n]);
        }
        received
    }

    /// The server closed its side: EOF, or a reset if bytes were left unread.
    async fn assert_closed(client: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let result = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("timed out waiting for close");
        assert!(matches!(result, Ok(0) | Err(_)), "got {:?}", result);
    }

    async fn request(addr: SocketAddr, input: &[u8], suffix: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(input).await.unwrap();
        read_until(&mut client, suffix).await
    }

    #[tokio::test]
    async fn test_resp_ping_pong() {
        let (addr, _, _) = create_test_server().await;
        let reply = request(addr, b"*1\r\n$4\r\nPING\r\n", b"\r\n").await;
        assert_eq!(reply, b"+PONG\r\n");

        let reply = request(addr, b"PING\r\n", b"\r\n").await;
        assert_eq!(reply, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_resp_pipeline() {
        let (addr, _, _) = create_test_server().await;
        let reply = request(
            addr,
            b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n*3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n*2\r\n$3\r\nGET\r\n$2\r\nk2\r\n",
            b"v2\r\n",
        )
        .await;
        assert_eq!(reply, b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n");
    }

    #[tokio::test]
    async fn test_memcache_set_get() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // The data block arrives in a separate write.
        client.write_all(b"set greeting 0 0 5\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"hello\r\n").await.unwrap();
        assert_eq!(read_until(&mut client, b"\r\n").await, b"STORED\r\n");

        client.write_all(b"get greeting\r\n").await.unwrap();
        assert_eq!(
            read_until(&mut client, b"END\r\n").await,
            b"VALUE greeting 0 5\r\nhello\r\nEND\r\n"
        );
    }

    #[tokio::test]
    async fn test_cross_protocol_visibility() {
        let (addr, _, _) = create_test_server().await;

        request(addr, b"*3\r\n$3\r\nSET\r\n$6\r\nshared\r\n$5\r\nvalue\r\n", b"\r\n").await;

        let http = request(addr, b"GET /shared HTTP/1.1\r\n\r\n", b"value").await;
        assert!(http.starts_with(b"HTTP/1.1 200 OK\r\n"));

        let memcache = request(addr, b"get shared\r\n", b"END\r\n").await;
        assert_eq!(memcache, b"VALUE shared 0 5\r\nvalue\r\nEND\r\n");

        request(
            addr,
            b"PUT /from-http HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi",
            b"Stored\r\n",
        )
        .await;
        let resp = request(addr, b"GET from-http\r\n", b"hi\r\n").await;
        assert_eq!(resp, b"$2\r\nhi\r\n");
    }

    #[tokio::test]
    async fn test_postgres_handshake_and_query() {
        let (addr, storage, _) = create_test_server().await;
        storage.set("pg".into(), "yes".into()).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f])
            .await
            .unwrap();
        let mut answer = [0u8; 1];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"N");

        let mut startup = BytesMut::new();
        let params = b"user\0test\0\0";
        startup.put_u32(8 + params.len() as u32);
        startup.put_u32(196_608);
        startup.put_slice(params);
        client.write_all(&startup).await.unwrap();
        // ReadyForQuery, idle
        read_until(&mut client, b"Z\0\0\0\x05I").await;

        let sql = b"GET pg\0";
        let mut query = BytesMut::new();
        query.put_u8(b'Q');
        query.put_u32(4 + sql.len() as u32);
        query.put_slice(sql);
        client.write_all(&query).await.unwrap();
        let reply = read_until(&mut client, b"Z\0\0\0\x05I").await;
        assert!(reply.windows(3).any(|w| w == b"yes"));
        assert!(reply.windows(6).any(|w| w == b"GET 1\0"));
    }

    #[tokio::test]
    async fn test_concurrent_gets_cas_increments() {
        let (addr, _, _) = create_test_server().await;
        request(addr, b"set counter 0 0 1\r\n0\r\n", b"STORED\r\n").await;

        let mut workers = Vec::new();
        for _ in 0..2 {
            workers.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                loop {
                    client.write_all(b"gets counter\r\n").await.unwrap();
                    let reply = read_until(&mut client, b"END\r\n").await;
                    let text = String::from_utf8(reply).unwrap();
                    let mut lines = text.lines();
                    let header: Vec<&str> = lines.next().unwrap().split(' ').collect();
                    let token: u64 = header[4].parse().unwrap();
                    let value: u64 = lines.next().unwrap().parse().unwrap();

                    let next = (value + 1).to_string();
                    let cas = format!("cas counter 0 0 {} {}\r\n{}\r\n", next.len(), token, next);
                    client.write_all(cas.as_bytes()).await.unwrap();
                    if read_until(&mut client, b"\r\n").await == b"STORED\r\n" {
                        break;
                    }
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let reply = request(addr, b"get counter\r\n", b"END\r\n").await;
        assert_eq!(reply, b"VALUE counter 0 1\r\n2\r\nEND\r\n");
    }

    #[tokio::test]
    async fn test_unclassified_connection_is_closed() {
        let (addr, _, stats) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"\x01\x02garbage\r\n").await.unwrap();

        assert_closed(&mut client).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.connections_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_resp_protocol_error_closes() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n:5\r\n").await.unwrap();
        let reply = read_until(&mut client, b"\r\n").await;
        assert!(reply.starts_with(b"-ERR Protocol error"));

        assert_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, _, stats) = create_test_server().await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        read_until(&mut client, b"\r\n").await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
