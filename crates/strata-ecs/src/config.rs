//! Capacity configuration.
//!
//! Every capacity in the store is fixed at construction; nothing grows at
//! runtime. Exceeding a bound is a typed error at the violating call, never a
//! reallocation.

use serde::{Deserialize, Serialize};

/// Capacities for an [`Entities`](crate::entities::Entities) store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum simultaneous live entity handles.
    pub max_entities: u32,
    /// Maximum distinct component sets ever materialized.
    pub max_archetypes: u32,
    /// Number of storage chunks in the pool.
    pub max_chunks: u32,
    /// Byte size of one chunk.
    pub chunk_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entities: 4096,
            max_archetypes: 64,
            max_chunks: 256,
            chunk_bytes: 16 * 1024,
        }
    }
}

/// Capacities for one [`CmdBuf`](crate::cmd::CmdBuf).
///
/// The five dimensions are independent; a buffer is "full" in whichever
/// dimension an append would exceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdBufConfig {
    /// Operation tag stream length.
    pub max_ops: u32,
    /// Argument slots (type key + payload).
    pub max_args: u32,
    /// Byte arena for out-of-line payloads.
    pub max_bytes: usize,
    /// Destroy list length.
    pub max_destroys: u32,
    /// Pre-reserved entity handles available to `reserve`.
    pub max_reserved: u32,
}

impl Default for CmdBufConfig {
    fn default() -> Self {
        Self {
            max_ops: 1024,
            max_args: 1024,
            max_bytes: 16 * 1024,
            max_destroys: 256,
            max_reserved: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let store = StoreConfig::default();
        assert!(store.max_entities > 0);
        assert!(store.chunk_bytes >= 1024);
        let cmd = CmdBufConfig::default();
        assert!(cmd.max_ops >= cmd.max_destroys);
    }
}
