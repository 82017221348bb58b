//! A Postgres connection pool and per-connection statement cache.
//!
//! Grounded directly in the `postgres` persistence crate's `ConvexPgPool`:
//! we limit the number of cached prepared statements per connection to avoid
//! unbounded memory on the Postgres server, and we reap idle connections in
//! the background rather than leaving them open forever. Unlike that crate,
//! this pool speaks plaintext Postgres (`NoTls`) -- TLS termination is a
//! deployment concern the minimal engine does not take on; see DESIGN.md.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        LazyLock,
        Weak,
    },
    time::Duration,
};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::{
    sync::{
        Semaphore,
        SemaphorePermit,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_postgres::{
    types::ToSql,
    NoTls,
    Row,
    Statement,
    Transaction,
};

use crate::{
    env::env_config,
    error::StatementTimeout,
    metrics,
};

static POOL_MAX_CONNECTIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("RRA_POOL_MAX_CONNECTIONS", 32));
static POOL_MAX_CACHED_STATEMENTS: LazyLock<usize> =
    LazyLock::new(|| env_config("RRA_POOL_MAX_CACHED_STATEMENTS", 256));
static POOL_IDLE_CONNECTION_LIFETIME: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("RRA_POOL_IDLE_SECONDS", 300)));
static STATEMENT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("RRA_STATEMENT_TIMEOUT_SECONDS", 30)));

async fn with_timeout<R, E, Fut>(f: Fut) -> anyhow::Result<R>
where
    E: Into<anyhow::Error>,
    Fut: Future<Output = Result<R, E>>,
{
    match tokio::time::timeout(*STATEMENT_TIMEOUT, f).await {
        Ok(Ok(r)) => Ok(r),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(StatementTimeout(*STATEMENT_TIMEOUT).into()),
    }
}

type StatementCache = LruCache<String, Statement>;

struct PooledConnection {
    client: tokio_postgres::Client,
    statement_cache: Mutex<StatementCache>,
    last_used: Instant,
}

async fn prepare_cached(
    client: &tokio_postgres::Client,
    cache: &Mutex<StatementCache>,
    statement: &str,
) -> anyhow::Result<Statement> {
    if let Some(prepared) = cache.lock().get(statement) {
        return Ok(prepared.clone());
    }
    let prepared = client.prepare(statement).await?;
    cache.lock().put(statement.to_owned(), prepared.clone());
    Ok(prepared)
}

impl PooledConnection {
    fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            statement_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(*POOL_MAX_CACHED_STATEMENTS)
                    .expect("RRA_POOL_MAX_CACHED_STATEMENTS must be nonzero"),
            )),
            last_used: Instant::now(),
        }
    }
}

/// An active connection checked out from a [`Pool`].
///
/// Returns the underlying connection to the pool on drop, unless it was
/// poisoned by a transport-level error, in which case it is discarded.
pub struct EngineConnection<'a> {
    pool: &'a Pool,
    _permit: SemaphorePermit<'a>,
    conn: Option<PooledConnection>,
    poisoned: AtomicBool,
}

fn handle_error(poisoned: &AtomicBool, e: impl Into<anyhow::Error>) -> anyhow::Error {
    let e = e.into();
    if e.downcast_ref::<tokio_postgres::Error>()
        .is_some_and(|e| e.is_closed())
        || e.downcast_ref::<StatementTimeout>().is_some()
    {
        tracing::error!("not reusing connection after error: {e:#}");
        poisoned.store(true, Ordering::Relaxed);
    }
    e
}

impl EngineConnection<'_> {
    fn conn(&self) -> &PooledConnection {
        self.conn.as_ref().expect("connection is only taken in Drop")
    }

    pub async fn batch_execute(&self, query: &str) -> anyhow::Result<()> {
        with_timeout(self.conn().client.batch_execute(query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query_opt(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        with_timeout(self.conn().client.query_opt(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        with_timeout(self.conn().client.query(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn prepare_cached(&self, query: &str) -> anyhow::Result<Statement> {
        let conn = self.conn();
        with_timeout(prepare_cached(&conn.client, &conn.statement_cache, query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout(self.conn().client.execute(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    /// Executes a query built at runtime (e.g. the multi-chunk flush
    /// statement, spec 4.5), bypassing the prepared-statement cache since
    /// its shape varies per call.
    pub async fn execute_unprepared(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout(self.conn().client.execute(query, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn transaction(&mut self) -> anyhow::Result<EngineTransaction<'_>> {
        let conn = self.conn.as_mut().expect("connection is only taken in Drop");
        let inner = with_timeout(conn.client.transaction())
            .await
            .map_err(|e| handle_error(&self.poisoned, e))?;
        Ok(EngineTransaction {
            inner,
            statement_cache: &conn.statement_cache,
            poisoned: &self.poisoned,
        })
    }
}

impl Drop for EngineConnection<'_> {
    fn drop(&mut self) {
        if *self.poisoned.get_mut() {
            metrics::log_connection_poisoned();
            return;
        }
        let mut conn = self.conn.take().expect("connection is only taken in Drop");
        conn.last_used = Instant::now();
        let mut idle = self.pool.connections.lock();
        if !self.pool.semaphore.is_closed() {
            idle.push_back(conn);
        }
    }
}

/// An active transaction on an [`EngineConnection`].
pub struct EngineTransaction<'a> {
    inner: Transaction<'a>,
    statement_cache: &'a Mutex<StatementCache>,
    poisoned: &'a AtomicBool,
}

impl EngineTransaction<'_> {
    pub async fn prepare_cached(&self, query: &str) -> anyhow::Result<Statement> {
        with_timeout(prepare_cached(self.inner.client(), self.statement_cache, query))
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout(self.inner.execute(statement, params))
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn query(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        with_timeout(self.inner.query(statement, params))
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn commit(self) -> anyhow::Result<()> {
        with_timeout(self.inner.commit())
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }
}

/// A Postgres connection pool. Always used behind an `Arc`.
pub struct Pool {
    pg_config: tokio_postgres::Config,
    semaphore: Semaphore,
    connections: Mutex<VecDeque<PooledConnection>>,
    idle_worker: JoinHandle<()>,
}

impl Pool {
    pub fn new(pg_config: tokio_postgres::Config) -> Arc<Self> {
        let max_size = *POOL_MAX_CONNECTIONS;
        tracing::info!("Postgres pool starting with max size {max_size}");
        let (this_tx, this_rx) = tokio::sync::oneshot::channel();
        let idle_worker = tokio::spawn(async move {
            let weak: Weak<Self> = this_rx.await.expect("nothing sent on this_tx?");
            Self::idle_worker(weak).await
        });
        let this = Arc::new(Self {
            pg_config,
            semaphore: Semaphore::new(max_size),
            connections: Mutex::new(VecDeque::new()),
            idle_worker,
        });
        let _ = this_tx.send(Arc::downgrade(&this));
        this
    }

    async fn get_connection_internal(&self) -> anyhow::Result<PooledConnection> {
        {
            let mut conns = self.connections.lock();
            while let Some(conn) = conns.pop_back() {
                if conn.client.is_closed() {
                    continue;
                }
                return Ok(conn);
            }
        }
        self.create_connection().await
    }

    async fn create_connection(&self) -> anyhow::Result<PooledConnection> {
        let (client, conn) = self.pg_config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::error!("postgres connection error: {e}");
            }
        });
        metrics::log_connection_created();
        Ok(PooledConnection::new(client))
    }

    pub async fn get_connection(&self) -> anyhow::Result<EngineConnection<'_>> {
        let timer = metrics::pool_acquire_timer();
        let permit = with_timeout(async {
            self.semaphore
                .acquire()
                .await
                .map_err(|_| anyhow::anyhow!("pool has been shut down"))
        })
        .await?;
        let conn = self.get_connection_internal().await?;
        drop(timer);
        Ok(EngineConnection {
            pool: self,
            _permit: permit,
            conn: Some(conn),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn shutdown(&self) {
        self.semaphore.close();
        self.connections.lock().clear();
        self.idle_worker.abort();
    }

    async fn idle_worker(this: Weak<Self>) {
        loop {
            let oldest = match this.upgrade() {
                Some(this) => this.cleanup_idle_connections(),
                None => break,
            };
            let next_wakeup = oldest.unwrap_or_else(Instant::now) + *POOL_IDLE_CONNECTION_LIFETIME;
            tokio::time::sleep_until(next_wakeup).await;
        }
    }

    fn cleanup_idle_connections(&self) -> Option<Instant> {
        let mut connections = self.connections.lock();
        while let Some(c) = connections.front() {
            if c.last_used.elapsed() <= *POOL_IDLE_CONNECTION_LIFETIME {
                break;
            }
            connections.pop_front();
        }
        connections.front().map(|c| c.last_used)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.idle_worker.abort();
    }
}
