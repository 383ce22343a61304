//! Memcached backend speaking the text protocol
//!
//! One TCP connection per handler, shared by all in-flight requests. Each
//! command is a single request/response exchange, serialized by an async
//! mutex so responses can never interleave.
//!
//! The stream is checked out of its slot for the duration of a command and
//! only put back once the reply has been read completely. A command that
//! fails or is cancelled halfway leaves the slot empty, and the next command
//! opens a fresh connection, so a stale reply can never be read as the
//! answer to a later command.

use super::CacheBackend;
use crate::error::{BouncerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default memcached port
pub const DEFAULT_PORT: u16 = 11211;

/// Largest expiry memcached treats as relative seconds (30 days); larger
/// values are read as absolute Unix timestamps
pub const MAX_RELATIVE_EXPIRY: u32 = 60 * 60 * 24 * 30;

/// Longest key memcached accepts
const MAX_KEY_LENGTH: usize = 250;

type Stream = BufStream<TcpStream>;

#[derive(Default)]
struct ConnectionSlot {
    stream: Option<Stream>,
    closed: bool,
}

/// Memcached client over a single connection
pub struct MemcachedBackend {
    addr: String,
    conn: Mutex<ConnectionSlot>,
}

impl MemcachedBackend {
    /// Connect to a memcached server
    ///
    /// # Arguments
    /// * `host` - Server host name or address
    /// * `port` - Server port
    ///
    /// # Returns
    /// * `Ok(MemcachedBackend)` once the TCP connection is established
    /// * `Err(BouncerError)` if the server is unreachable
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = Self::open(&addr).await?;
        info!("Connected to memcached at {}", addr);

        Ok(MemcachedBackend {
            addr,
            conn: Mutex::new(ConnectionSlot {
                stream: Some(stream),
                closed: false,
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn open(addr: &str) -> Result<Stream> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            BouncerError::CacheError(format!("Failed to connect to memcached at {}: {}", addr, e))
        })?;
        stream.set_nodelay(true)?;
        Ok(BufStream::new(stream))
    }

    /// Take the stream out of its slot, reconnecting if an earlier command
    /// left it empty
    async fn checkout(&self, slot: &mut ConnectionSlot) -> Result<Stream> {
        if slot.closed {
            return Err(BouncerError::CacheError("connection closed".to_string()));
        }
        match slot.stream.take() {
            Some(stream) => Ok(stream),
            None => {
                info!("Reconnecting to memcached at {}", self.addr);
                Self::open(&self.addr).await
            }
        }
    }

    /// Return the stream to its slot if the exchange completed cleanly
    fn checkin<T>(&self, slot: &mut ConnectionSlot, stream: Stream, result: &Result<T>) {
        match result {
            Ok(_) => slot.stream = Some(stream),
            Err(e) => warn!(
                "Dropping memcached connection to {} after failed command: {}",
                self.addr, e
            ),
        }
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(BouncerError::ProtocolError(format!(
                "key length must be between 1 and {}, got {}",
                MAX_KEY_LENGTH,
                key.len()
            )));
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(BouncerError::ProtocolError(format!(
                "key contains whitespace or control characters: {:?}",
                key
            )));
        }
        Ok(())
    }

    /// Send a command (and optional data block), return the first reply line
    async fn exchange(stream: &mut Stream, command: &str, data: Option<&[u8]>) -> Result<String> {
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        if let Some(data) = data {
            stream.write_all(data).await?;
            stream.write_all(b"\r\n").await?;
        }
        stream.flush().await?;
        Self::read_line(stream).await
    }

    async fn read_line(stream: &mut Stream) -> Result<String> {
        let mut line = String::new();
        let read = stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(BouncerError::ProtocolError(
                "connection closed by server".to_string(),
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        Self::check_error_reply(&line)?;
        Ok(line)
    }

    fn check_error_reply(line: &str) -> Result<()> {
        if line == "ERROR"
            || line.starts_with("CLIENT_ERROR")
            || line.starts_with("SERVER_ERROR")
        {
            return Err(BouncerError::ProtocolError(line.to_string()));
        }
        Ok(())
    }

    fn unexpected(command: &str, line: &str) -> BouncerError {
        BouncerError::ProtocolError(format!("unexpected reply to {}: {}", command, line))
    }

    async fn get_on(stream: &mut Stream, key: &str) -> Result<Option<Bytes>> {
        let line = Self::exchange(stream, &format!("get {}", key), None).await?;
        if line == "END" {
            debug!("memcached miss: key={}", key);
            return Ok(None);
        }

        // VALUE <key> <flags> <bytes> [<cas unique>]
        let mut parts = line.split_whitespace();
        if parts.next() != Some("VALUE") {
            return Err(Self::unexpected("get", &line));
        }
        if parts.next() != Some(key) {
            return Err(BouncerError::ProtocolError(format!(
                "reply for another key while fetching {}: {}",
                key, line
            )));
        }
        let length = parts
            .nth(1)
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| Self::unexpected("get", &line))?;

        let mut data = vec![0u8; length + 2];
        stream.read_exact(&mut data).await?;
        data.truncate(length);

        let end = Self::read_line(stream).await?;
        if end != "END" {
            return Err(Self::unexpected("get", &end));
        }

        debug!("memcached hit: key={}, size={}", key, length);
        Ok(Some(Bytes::from(data)))
    }

    async fn set_on(stream: &mut Stream, key: &str, value: &[u8], ttl_secs: u32) -> Result<()> {
        let command = format!("set {} 0 {} {}", key, ttl_secs, value.len());
        let line = Self::exchange(stream, &command, Some(value)).await?;
        match line.as_str() {
            "STORED" => Ok(()),
            "NOT_STORED" => Err(BouncerError::CacheError(format!("value not stored: {}", key))),
            _ => Err(Self::unexpected("set", &line)),
        }
    }

    async fn increment_on(stream: &mut Stream, key: &str, delta: u64) -> Result<Option<u64>> {
        let line = Self::exchange(stream, &format!("incr {} {}", key, delta), None).await?;
        if line == "NOT_FOUND" {
            return Ok(None);
        }
        line.parse::<u64>()
            .map(Some)
            .map_err(|_| Self::unexpected("incr", &line))
    }
}

#[async_trait]
impl CacheBackend for MemcachedBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Self::validate_key(key)?;
        let mut slot = self.conn.lock().await;
        let mut stream = self.checkout(&mut slot).await?;
        let result = Self::get_on(&mut stream, key).await;
        self.checkin(&mut slot, stream, &result);
        result
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<()> {
        Self::validate_key(key)?;
        if ttl_secs > MAX_RELATIVE_EXPIRY {
            return Err(BouncerError::CacheError(format!(
                "lifetime {}s exceeds the {}s memcached allows for relative expiry",
                ttl_secs, MAX_RELATIVE_EXPIRY
            )));
        }
        let mut slot = self.conn.lock().await;
        let mut stream = self.checkout(&mut slot).await?;
        let result = Self::set_on(&mut stream, key, value.as_ref(), ttl_secs).await;
        self.checkin(&mut slot, stream, &result);
        result
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        Self::validate_key(key)?;
        let mut slot = self.conn.lock().await;
        let mut stream = self.checkout(&mut slot).await?;
        let result = Self::increment_on(&mut stream, key, delta).await;
        self.checkin(&mut slot, stream, &result);
        result
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        slot.closed = true;
        if let Some(mut stream) = slot.stream.take() {
            if let Err(e) = stream.write_all(b"quit\r\n").await {
                warn!("Failed to send quit to memcached at {}: {}", self.addr, e);
            } else if let Err(e) = stream.flush().await {
                warn!("Failed to flush quit to memcached at {}: {}", self.addr, e);
            }
            info!("Closed memcached connection to {}", self.addr);
        }
        Ok(())
    }
}
