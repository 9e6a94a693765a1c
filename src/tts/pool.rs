//! Capacity-bounded connection pool for websocket-based providers.
//!
//! Streaming TTS providers keep websocket sessions warm between segments;
//! the pool bounds how many exist at once, returns the most recently used
//! first, and evicts sessions older than `max_session_duration`. Acquisition
//! is cancellable: dropping the acquire future releases its capacity slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{AgentError, ApiError, Result};

/// A pooled websocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a websocket connection, mapping failures to provider errors.
///
/// # Errors
///
/// Returns a retryable connection error when the URL is unreachable, and a
/// config error when it does not parse.
pub async fn connect_websocket(url: &str) -> Result<WsStream> {
    let url = Url::parse(url).map_err(|e| AgentError::Config(format!("invalid url: {e}")))?;
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| ApiError::Connection(e.to_string()))?;
    Ok(ws)
}

type ConnectFn<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// Pool of reusable provider connections.
pub struct ConnectionPool<C> {
    connect: ConnectFn<C>,
    max_session_duration: Option<Duration>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry<C>>>,
}

struct IdleEntry<C> {
    conn: C,
    created_at: Instant,
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Create a pool holding at most `capacity` live connections.
    ///
    /// Entries idle past `max_session_duration` are dropped instead of being
    /// handed out again.
    pub fn new(
        capacity: usize,
        max_session_duration: Option<Duration>,
        connect: impl Fn() -> BoxFuture<'static, Result<C>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            connect: Arc::new(connect),
            max_session_duration,
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            idle: Mutex::new(VecDeque::new()),
        })
    }

    /// Acquire a connection, reusing the most recently returned one when
    /// fresh, connecting otherwise. Cancel-safe: dropping the future frees
    /// the capacity slot.
    ///
    /// # Errors
    ///
    /// Propagates the connect error when a new connection is needed and
    /// fails.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<C>> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Channel("connection pool closed".into()))?;

        while let Some(entry) = self.pop_idle() {
            if self.is_fresh(&entry) {
                return Ok(PooledConnection {
                    conn: Some(entry.conn),
                    created_at: entry.created_at,
                    pool: Arc::downgrade(self),
                    _permit: permit,
                });
            }
            debug!("dropping expired pooled connection");
        }

        let conn = (self.connect)().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            created_at: Instant::now(),
            pool: Arc::downgrade(self),
            _permit: permit,
        })
    }

    fn pop_idle(&self) -> Option<IdleEntry<C>> {
        self.idle.lock().ok()?.pop_back()
    }

    fn is_fresh(&self, entry: &IdleEntry<C>) -> bool {
        match self.max_session_duration {
            Some(max) => entry.created_at.elapsed() < max,
            None => true,
        }
    }

    fn put_back(&self, entry: IdleEntry<C>) {
        if !self.is_fresh(&entry) {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push_back(entry);
        }
    }

    /// Number of idle connections currently held.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().map(|i| i.len()).unwrap_or(0)
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Call [`release`](Self::release) to return it for reuse; dropping without
/// releasing discards it, which is what error paths want.
pub struct PooledConnection<C: Send + 'static> {
    conn: Option<C>,
    created_at: Instant,
    pool: std::sync::Weak<ConnectionPool<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send + 'static> PooledConnection<C> {
    /// Return the connection to the pool for reuse.
    pub fn release(mut self) {
        if let (Some(conn), Some(pool)) = (self.conn.take(), self.pool.upgrade()) {
            pool.put_back(IdleEntry {
                conn,
                created_at: self.created_at,
            });
        }
    }

    /// Discard the connection; the next acquire dials a fresh one.
    pub fn discard(mut self) {
        self.conn.take();
    }
}

impl<C: Send + 'static> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            // conn is only None after release/discard, which consume self
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Send + 'static> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(
        capacity: usize,
        max_session_duration: Option<Duration>,
    ) -> (Arc<ConnectionPool<usize>>, Arc<AtomicUsize>) {
        let dials = Arc::new(AtomicUsize::new(0));
        let dials_in_connect = Arc::clone(&dials);
        let pool = ConnectionPool::new(capacity, max_session_duration, move || {
            let n = dials_in_connect.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(n) })
        });
        (pool, dials)
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let (pool, dials) = counting_pool(4, None);

        let conn = match pool.acquire().await {
            Ok(c) => c,
            Err(e) => unreachable!("acquire failed: {e}"),
        };
        let first = *conn;
        conn.release();

        let conn = match pool.acquire().await {
            Ok(c) => c,
            Err(e) => unreachable!("acquire failed: {e}"),
        };
        assert_eq!(*conn, first);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_connections_are_not_reused() {
        let (pool, dials) = counting_pool(4, None);
        {
            let _conn = pool.acquire().await;
            // dropped without release: treated as broken
        }
        let _conn2 = pool.acquire().await;
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn capacity_bounds_concurrent_acquires() {
        let (pool, _dials) = counting_pool(1, None);
        let held = match pool.acquire().await {
            Ok(c) => c,
            Err(e) => unreachable!("acquire failed: {e}"),
        };

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire().await.map(|c| c.release()) });
        // the waiter can't proceed until the held slot frees
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        held.release();
        let joined = waiter.await;
        assert!(matches!(joined, Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sessions_are_evicted() {
        let (pool, dials) = counting_pool(2, Some(Duration::from_secs(60)));
        match pool.acquire().await {
            Ok(c) => c.release(),
            Err(e) => unreachable!("acquire failed: {e}"),
        }
        assert_eq!(pool.idle_len(), 1);

        tokio::time::advance(Duration::from_secs(120)).await;

        match pool.acquire().await {
            Ok(c) => c.release(),
            Err(e) => unreachable!("acquire failed: {e}"),
        }
        // the stale entry was dropped and a fresh dial happened
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lru_hands_out_most_recent_first() {
        let (pool, _dials) = counting_pool(4, None);
        let a = match pool.acquire().await {
            Ok(c) => c,
            Err(e) => unreachable!("acquire failed: {e}"),
        };
        let b = match pool.acquire().await {
            Ok(c) => c,
            Err(e) => unreachable!("acquire failed: {e}"),
        };
        let a_id = *a;
        let b_id = *b;
        a.release();
        b.release();

        let next = match pool.acquire().await {
            Ok(c) => c,
            Err(e) => unreachable!("acquire failed: {e}"),
        };
        assert_eq!(*next, b_id);
        assert_ne!(*next, a_id);
    }
}
