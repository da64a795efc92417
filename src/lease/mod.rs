//! Shared Lease Store
//!
//! Consumer-side contract for the TTL-backed liveness store, plus the two
//! implementations the node ships with: a RESP client speaking to a
//! Redis-compatible service, and an in-memory store for tests and embedded
//! single-process setups.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lease store error types
#[derive(Debug)]
pub enum LeaseError {
    /// Connecting to the store failed
    Connection(String),
    /// IO error on an established connection
    Io(std::io::Error),
    /// The store answered something the client cannot interpret
    Protocol(String),
    /// The store reported a command error
    Server(String),
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::Connection(msg) => write!(f, "connection failed: {}", msg),
            LeaseError::Io(e) => write!(f, "IO error: {}", e),
            LeaseError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            LeaseError::Server(msg) => write!(f, "server error: {}", msg),
        }
    }
}

impl std::error::Error for LeaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LeaseError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LeaseError {
    fn from(err: std::io::Error) -> Self {
        LeaseError::Io(err)
    }
}

/// The lease operations the liveness monitor consumes
///
/// `set_lease` creates (or overwrites) the key with a fresh TTL; `pexpire`
/// refreshes the TTL of an existing key and reports whether the key was
/// still there to refresh. A `false` from `pexpire` means the lease expired
/// before it could be renewed.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn set_lease(&self, key: &str, ttl_ms: u64) -> Result<(), LeaseError>;
    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool, LeaseError>;
    async fn del(&self, key: &str) -> Result<(), LeaseError>;
}

/// RESP client for a Redis-compatible lease store
///
/// One dedicated connection per client; requests are serialized on it. The
/// liveness monitor owns its own instance so that renewal latency is never
/// a function of traffic on the node's primary store connections.
pub struct RespLeaseStore {
    stream: Mutex<BufStream<TcpStream>>,
}

impl RespLeaseStore {
    /// Open a dedicated connection to the store
    pub async fn connect(addr: &str) -> Result<Self, LeaseError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| LeaseError::Connection(format!("timed out connecting to {}", addr)))?
            .map_err(|e| LeaseError::Connection(e.to_string()))?;

        Ok(Self {
            stream: Mutex::new(BufStream::new(stream)),
        })
    }

    /// Issue one command and return the first reply line, without its CRLF
    async fn command(&self, args: &[&str]) -> Result<String, LeaseError> {
        let mut request = format!("*{}\r\n", args.len());
        for arg in args {
            request.push_str(&format!("${}\r\n{}\r\n", arg.len(), arg));
        }

        let mut stream = self.stream.lock().await;
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(LeaseError::Protocol("connection closed by store".to_string()));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(msg) = line.strip_prefix('-') {
            return Err(LeaseError::Server(msg.to_string()));
        }
        Ok(line.to_string())
    }

    async fn integer_command(&self, args: &[&str]) -> Result<i64, LeaseError> {
        let line = self.command(args).await?;
        line.strip_prefix(':')
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| LeaseError::Protocol(format!("expected integer reply, got \"{}\"", line)))
    }
}

#[async_trait]
impl LeaseStore for RespLeaseStore {
    async fn set_lease(&self, key: &str, ttl_ms: u64) -> Result<(), LeaseError> {
        let ttl = ttl_ms.to_string();
        let line = self.command(&["SET", key, "alive", "PX", &ttl]).await?;
        if line == "+OK" {
            Ok(())
        } else {
            Err(LeaseError::Protocol(format!(
                "unexpected SET reply \"{}\"",
                line
            )))
        }
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool, LeaseError> {
        let ttl = ttl_ms.to_string();
        let refreshed = self.integer_command(&["PEXPIRE", key, &ttl]).await?;
        Ok(refreshed == 1)
    }

    async fn del(&self, key: &str) -> Result<(), LeaseError> {
        self.integer_command(&["DEL", key]).await?;
        Ok(())
    }
}

/// In-memory lease store
///
/// TTLs are not simulated; a key exists until dropped. Call counters make
/// renewal and cleanup behavior observable from tests, and `drop_key` /
/// `fail_io` inject the two failure modes the monitor must handle.
#[derive(Default)]
pub struct MemoryLeaseStore {
    keys: SyncMutex<HashMap<String, u64>>,
    fail_io: AtomicBool,
    set_calls: AtomicUsize,
    pexpire_calls: AtomicUsize,
    del_calls: AtomicUsize,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with an IO error
    pub fn fail_io(&self) {
        self.fail_io.store(true, Ordering::SeqCst);
    }

    /// Drop a key, as if its TTL expired
    pub fn drop_key(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains_key(key)
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn pexpire_calls(&self) -> usize {
        self.pexpire_calls.load(Ordering::SeqCst)
    }

    pub fn del_calls(&self) -> usize {
        self.del_calls.load(Ordering::SeqCst)
    }

    fn check_io(&self) -> Result<(), LeaseError> {
        if self.fail_io.load(Ordering::SeqCst) {
            Err(LeaseError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected failure",
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn set_lease(&self, key: &str, ttl_ms: u64) -> Result<(), LeaseError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        self.keys.lock().insert(key.to_string(), ttl_ms);
        Ok(())
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool, LeaseError> {
        self.pexpire_calls.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(ttl) => {
                *ttl = ttl_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<(), LeaseError> {
        self.del_calls.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        self.keys.lock().remove(key);
        Ok(())
    }
}
