//! Consistency levels and the session variable that carries them

use serde::{Deserialize, Serialize};

/// Synchronous-read consistency requested for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    // wsrep_sync_wait, MariaDB Galera 5.5.39 / 10.0.13 onwards
    SyncOff,
    SyncReads,
    SyncUpdateDelete,
    SyncReadUpdateDelete,
    SyncInsertReplace,

    // wsrep_causal_reads, earlier releases
    CausalReadsOff,
    CausalReadsOn,
}

impl ConsistencyLevel {
    /// Numeric value written to the session variable
    pub fn value(&self) -> u8 {
        match self {
            ConsistencyLevel::SyncOff => 0,
            ConsistencyLevel::SyncReads => 1,
            ConsistencyLevel::SyncUpdateDelete => 2,
            ConsistencyLevel::SyncReadUpdateDelete => 3,
            ConsistencyLevel::SyncInsertReplace => 4,
            ConsistencyLevel::CausalReadsOff => 0,
            ConsistencyLevel::CausalReadsOn => 1,
        }
    }

    /// Whether this is one of the old on/off causal-reads levels
    pub fn is_causal_reads(&self) -> bool {
        matches!(
            self,
            ConsistencyLevel::CausalReadsOff | ConsistencyLevel::CausalReadsOn
        )
    }
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyLevel::SyncOff => write!(f, "SYNC_OFF"),
            ConsistencyLevel::SyncReads => write!(f, "SYNC_READS"),
            ConsistencyLevel::SyncUpdateDelete => write!(f, "SYNC_UPDATE_DELETE"),
            ConsistencyLevel::SyncReadUpdateDelete => write!(f, "SYNC_READ_UPDATE_DELETE"),
            ConsistencyLevel::SyncInsertReplace => write!(f, "SYNC_INSERT_REPLACE"),
            ConsistencyLevel::CausalReadsOff => write!(f, "CAUSAL_READS_OFF"),
            ConsistencyLevel::CausalReadsOn => write!(f, "CAUSAL_READS_ON"),
        }
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let level = match s.to_lowercase().replace('-', "_").as_str() {
            "sync_off" => ConsistencyLevel::SyncOff,
            "sync_reads" => ConsistencyLevel::SyncReads,
            "sync_update_delete" => ConsistencyLevel::SyncUpdateDelete,
            "sync_read_update_delete" => ConsistencyLevel::SyncReadUpdateDelete,
            "sync_insert_replace" => ConsistencyLevel::SyncInsertReplace,
            "causal_reads_off" => ConsistencyLevel::CausalReadsOff,
            "causal_reads_on" => ConsistencyLevel::CausalReadsOn,
            other => {
                return Err(crate::Error::Config(format!(
                    "unknown consistency level '{}'",
                    other
                )))
            }
        };
        Ok(level)
    }
}

/// The consistency variable a node exposes, with its global default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variable", rename_all = "snake_case")]
pub enum ConsistencyVariable {
    /// `wsrep_sync_wait` bitmask
    SyncWait { global: u8 },
    /// `wsrep_causal_reads`, ON/OFF
    CausalReads { global: bool },
}

impl ConsistencyVariable {
    pub const SYNC_WAIT: &'static str = "wsrep_sync_wait";
    pub const CAUSAL_READS: &'static str = "wsrep_causal_reads";

    /// Session variable name
    pub fn name(&self) -> &'static str {
        match self {
            ConsistencyVariable::SyncWait { .. } => Self::SYNC_WAIT,
            ConsistencyVariable::CausalReads { .. } => Self::CAUSAL_READS,
        }
    }

    /// Whether a level belongs to the variant this variable understands
    pub fn supports(&self, level: ConsistencyLevel) -> bool {
        match self {
            ConsistencyVariable::SyncWait { .. } => !level.is_causal_reads(),
            ConsistencyVariable::CausalReads { .. } => level.is_causal_reads(),
        }
    }

    /// `SET SESSION` statement applying `level`
    pub fn set_statement(&self, level: ConsistencyLevel) -> String {
        match self {
            ConsistencyVariable::SyncWait { .. } => Self::sync_wait_statement(level.value()),
            ConsistencyVariable::CausalReads { .. } => {
                Self::causal_reads_statement(level.value() != 0)
            }
        }
    }

    /// `SET SESSION` statement restoring the global default
    pub fn reset_statement(&self) -> String {
        match self {
            ConsistencyVariable::SyncWait { global } => Self::sync_wait_statement(*global),
            ConsistencyVariable::CausalReads { global } => Self::causal_reads_statement(*global),
        }
    }

    fn sync_wait_statement(value: u8) -> String {
        format!("SET SESSION {} = {}", Self::SYNC_WAIT, value)
    }

    fn causal_reads_statement(on: bool) -> String {
        format!(
            "SET SESSION {} = {}",
            Self::CAUSAL_READS,
            if on { "ON" } else { "OFF" }
        )
    }
}
