//! MySQL/MariaDB node pools backed by sqlx

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql, MySqlPool, Row};

use crate::config::{DatabaseConfig, PoolSettings};
use crate::error::{Error, Result};
use crate::metrics::{LatencyHistogram, PoolMetrics};
use super::{Connection, NodePool, PoolProvider};

const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Creates lazily-connecting sqlx pools, one per node
#[derive(Debug, Clone, Default)]
pub struct MySqlPoolProvider;

impl MySqlPoolProvider {
    pub fn new() -> Self {
        Self
    }
}

impl PoolProvider for MySqlPoolProvider {
    fn create_pool(
        &self,
        address: &str,
        name: &str,
        settings: &PoolSettings,
        database: &DatabaseConfig,
    ) -> Result<Arc<dyn NodePool>> {
        let (host, port) = split_address(address)?;

        let mut options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(&database.user)
            .password(&database.password);
        if let Some(db) = &database.database {
            options = options.database(db);
        }

        let init_statements = Arc::new(settings.session_init_statements());

        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections_per_host)
            .min_connections(settings.min_idle())
            .acquire_timeout(settings.acquire_timeout())
            .idle_timeout(Some(settings.idle_timeout()))
            .max_lifetime(settings.max_lifetime())
            .after_connect(move |conn, _meta| {
                let init_statements = Arc::clone(&init_statements);
                Box::pin(async move {
                    for statement in init_statements.iter() {
                        (&mut *conn).execute(statement.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect_lazy_with(options);

        tracing::debug!("Created pool {} for {}", name, address);

        Ok(Arc::new(MySqlNodePool {
            name: name.to_string(),
            address: address.to_string(),
            pool,
            wait: LatencyHistogram::default(),
            usage: Arc::new(LatencyHistogram::default()),
            pending: AtomicU32::new(0),
        }))
    }
}

/// sqlx pool for one node, with wait/usage tracking
pub struct MySqlNodePool {
    name: String,
    address: String,
    pool: MySqlPool,
    wait: LatencyHistogram,
    usage: Arc<LatencyHistogram>,
    pending: AtomicU32,
}

#[async_trait]
impl NodePool for MySqlNodePool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let started = Instant::now();
        let result = {
            let _pending = Pending::enter(&self.pending);
            self.pool.acquire().await
        };
        self.wait.record(started.elapsed());

        let conn = result.map_err(|source| Error::ConnectionAcquisition {
            node: self.address.clone(),
            source,
        })?;

        Ok(Box::new(MySqlPooledConnection {
            node: self.address.clone(),
            conn,
            borrowed_at: Instant::now(),
            usage: Arc::clone(&self.usage),
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn metrics(&self) -> PoolMetrics {
        let total = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolMetrics {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            pending_connections: self.pending.load(Ordering::Relaxed),
            wait_p95_ms: self.wait.p95_ms(),
            usage_p95_ms: self.usage.p95_ms(),
        }
    }
}

/// Counts an acquire in flight until dropped, including when the
/// acquiring future is cancelled
struct Pending<'a>(&'a AtomicU32);

impl<'a> Pending<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A connection borrowed from a `MySqlNodePool`
pub struct MySqlPooledConnection {
    node: String,
    conn: PoolConnection<MySql>,
    borrowed_at: Instant,
    usage: Arc<LatencyHistogram>,
}

#[async_trait]
impl Connection for MySqlPooledConnection {
    fn node(&self) -> &str {
        &self.node
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = (&mut *self.conn).execute(sql).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_pairs(&mut self, sql: &str) -> Result<Vec<(String, String)>> {
        let rows = (&mut *self.conn).fetch_all(sql).await?;
        rows.iter()
            .map(|row| Ok((column_text(row, 0)?, column_text(row, 1)?)))
            .collect()
    }

    async fn ping(&mut self) -> Result<()> {
        sqlx::Connection::ping(&mut *self.conn).await?;
        Ok(())
    }

    fn as_mysql(&mut self) -> Option<&mut sqlx::MySqlConnection> {
        Some(&mut *self.conn)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.usage.record(this.borrowed_at.elapsed());
        // Dropping a PoolConnection returns it to the pool
        drop(this.conn);
        Ok(())
    }

    async fn discard(self: Box<Self>) {
        let this = *self;
        this.usage.record(this.borrowed_at.elapsed());
        if let Err(e) = sqlx::Connection::close(this.conn.detach()).await {
            tracing::warn!("Error discarding connection to {}: {}", this.node, e);
        }
    }

    fn close_on_drop(&mut self) {
        self.conn.close_on_drop();
    }
}

/// Read a SHOW STATUS / SHOW VARIABLES column as text. Some servers
/// report these columns as binary strings, so fall back to bytes.
fn column_text(row: &MySqlRow, index: usize) -> Result<String> {
    match row.try_get::<Option<String>, _>(index) {
        Ok(value) => Ok(value.unwrap_or_default()),
        Err(_) => {
            let bytes: Option<Vec<u8>> = row.try_get(index)?;
            Ok(bytes
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default())
        }
    }
}

/// Split `host[:port]` (or `[v6]:port`) into host and port
pub(crate) fn split_address(address: &str) -> Result<(&str, u16)> {
    let invalid = || Error::Config(format!("invalid node address '{}'", address));

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => DEFAULT_MYSQL_PORT,
            None => return Err(invalid()),
        };
        return Ok((host, port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok((host, port.parse().map_err(|_| invalid())?))
        }
        Some(_) => Err(invalid()),
        None if !address.is_empty() => Ok((address, DEFAULT_MYSQL_PORT)),
        None => Err(invalid()),
    }
}
