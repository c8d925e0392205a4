//! Per-origin connection cache: `"host:port" -> Connection`, with a
//! lock-free read path and a per-key single-permit lock on the slow path
//! so concurrent callers for the same origin don't open N connections.

use crate::config::Options;
use crate::connection::Connection;
use crate::error::{Error, Result};
use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Caches live [`Connection`]s by origin. Cheap to clone via `Arc` if the
/// caller wants to share one cache across tasks; `get_or_create` itself
/// only needs `&self`.
pub struct ConnectionCache<T> {
    connections: DashMap<String, Arc<Connection<T>>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    disposed: AtomicBool,
}

impl<T> Default for ConnectionCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionCache<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self { connections: DashMap::new(), locks: DashMap::new(), disposed: AtomicBool::new(false) }
    }

    fn key(host: &str, port: u16) -> String {
        format!("{}:{port}", host.to_ascii_lowercase())
    }

    /// Reuse an alive connection for `host:port`, or hand `transport` to a
    /// freshly initialized one. If an alive connection already exists,
    /// `transport` is shut down and dropped instead of being used.
    pub async fn get_or_create(&self, host: &str, port: u16, transport: T, options: Options) -> Result<Arc<Connection<T>>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Network("connection cache disposed".into()));
        }
        let key = Self::key(host, port);

        if let Some(existing) = self.find_alive(&key) {
            Self::discard(transport).await;
            return Ok(existing);
        }

        let key_lock = self.locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _guard = key_lock.lock().await;

        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Network("connection cache disposed".into()));
        }
        if let Some(existing) = self.find_alive(&key) {
            Self::discard(transport).await;
            return Ok(existing);
        }

        debug!("connection cache miss for {key}, initializing a new connection");
        let conn = Connection::initialize(transport, options).await?;
        self.connections.insert(key, conn.clone());
        Ok(conn)
    }

    fn find_alive(&self, key: &str) -> Option<Arc<Connection<T>>> {
        let entry = self.connections.get(key)?;
        if entry.is_alive() {
            Some(entry.value().clone())
        } else {
            drop(entry);
            self.connections.remove(key);
            None
        }
    }

    async fn discard(mut transport: T) {
        let _ = transport.shutdown().await;
    }

    /// Drop the cached connection for `host:port`, if any. A no-op when
    /// there is nothing cached for that key.
    pub fn remove(&self, host: &str, port: u16) {
        self.connections.remove(&Self::key(host, port));
        self.locks.remove(&Self::key(host, port));
    }

    /// Dispose every cached connection and mark the cache unusable. Further
    /// calls to `get_or_create` fail; further calls to `dispose` are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.connections.iter() {
            entry.value().dispose().await;
        }
        self.connections.clear();
        self.locks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn handshaking_pair() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        duplex(4096)
    }

    #[tokio::test]
    async fn remove_on_absent_key_is_a_no_op() {
        let cache: ConnectionCache<tokio::io::DuplexStream> = ConnectionCache::new();
        cache.remove("example.com", 443);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let cache: ConnectionCache<tokio::io::DuplexStream> = ConnectionCache::new();
        cache.dispose().await;
        cache.dispose().await;
        let (client, _server) = handshaking_pair().await;
        assert!(cache.get_or_create("example.com", 443, client, Options::default()).await.is_err());
    }
}
