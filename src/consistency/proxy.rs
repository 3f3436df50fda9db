//! Consistency-enforcing connection decorator
//!
//! Sets the session consistency variable when a connection is borrowed and
//! restores the node's global default before the connection goes back to
//! its pool, so one caller's level never leaks to the next borrower.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::pool::Connection;
use crate::status::StatusSnapshot;
use super::{ConsistencyLevel, ConsistencyVariable};

/// A pooled connection pinned to a consistency level for its lifetime
pub struct ConsistentConnection {
    inner: Option<Box<dyn Connection>>,
    node: String,
    level: ConsistencyLevel,
    variable: ConsistencyVariable,
    level_mismatch: bool,
}

impl ConsistentConnection {
    /// Wrap `conn` and apply `level` immediately.
    ///
    /// The variable spelling and the default restored on close come from
    /// `status`. If applying the level fails the connection is discarded.
    pub async fn wrap(
        mut conn: Box<dyn Connection>,
        level: ConsistencyLevel,
        status: &StatusSnapshot,
    ) -> Result<Self> {
        let node = conn.node().to_string();

        let variable = match status.consistency {
            Some(variable) => variable,
            None => {
                conn.close().await?;
                return Err(Error::ConsistencyUnsupported(node));
            }
        };

        let level_mismatch = !variable.supports(level);
        if level_mismatch {
            tracing::warn!(
                "Node {} only supports {} and the requested consistency level is {}; it may not take effect as intended",
                node,
                variable.name(),
                level
            );
        }

        tracing::debug!("Setting connection consistency level on {} to {}", node, level);
        if let Err(e) = conn.execute(&variable.set_statement(level)).await {
            conn.discard().await;
            return Err(e);
        }

        Ok(Self {
            inner: Some(conn),
            node,
            level,
            variable,
            level_mismatch,
        })
    }

    /// Level applied to this connection
    pub fn level(&self) -> ConsistencyLevel {
        self.level
    }

    /// True when the requested level's variant does not match the
    /// variable the node supports (e.g. a sync-wait level on a
    /// causal-reads-only node)
    pub fn level_mismatch(&self) -> bool {
        self.level_mismatch
    }

    fn inner(&mut self) -> Result<&mut Box<dyn Connection>> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("connection to {} already closed", self.node)))
    }
}

#[async_trait]
impl Connection for ConsistentConnection {
    fn node(&self) -> &str {
        &self.node
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.inner()?.execute(sql).await
    }

    async fn fetch_pairs(&mut self, sql: &str) -> Result<Vec<(String, String)>> {
        self.inner()?.fetch_pairs(sql).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner()?.ping().await
    }

    fn as_mysql(&mut self) -> Option<&mut sqlx::MySqlConnection> {
        self.inner.as_mut().and_then(|conn| conn.as_mysql())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let Some(mut conn) = this.inner.take() else {
            return Ok(());
        };

        tracing::debug!(
            "Restoring {} to global default on {} before closing",
            this.variable.name(),
            this.node
        );
        match conn.execute(&this.variable.reset_statement()).await {
            Ok(_) => conn.close().await,
            Err(e) => {
                // Never hand a connection with a stale session level back to the pool
                conn.discard().await;
                Err(e)
            }
        }
    }

    async fn discard(self: Box<Self>) {
        let mut this = self;
        if let Some(conn) = this.inner.take() {
            conn.discard().await;
        }
    }

    fn close_on_drop(&mut self) {
        if let Some(conn) = self.inner.as_mut() {
            conn.close_on_drop();
        }
    }
}

impl Drop for ConsistentConnection {
    fn drop(&mut self) {
        // The reset needs I/O, so a dirty session is closed rather than pooled
        if let Some(conn) = self.inner.as_mut() {
            tracing::warn!(
                "Connection to {} dropped without close; {} was not restored, discarding it",
                self.node,
                self.variable.name()
            );
            conn.close_on_drop();
        }
    }
}
