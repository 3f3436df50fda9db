//! Consistency Level Module
//!
//! Per-session control of Galera's synchronous-read guarantee
//! (`wsrep_sync_wait`, or `wsrep_causal_reads` on older releases).

mod level;
mod proxy;

pub use level::{ConsistencyLevel, ConsistencyVariable};
pub use proxy::ConsistentConnection;
