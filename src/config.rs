//! Layout bounds and segment configuration.
//!
//! The constants here are part of the shared-memory contract: every process
//! attaching to a segment must be built with the same values.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkHeader;
use crate::error::{Error, Result};
use crate::layout;

/// Maximum number of chunk records a single chunk group can track.
pub const MAX_CHUNKS_PER_GROUP: usize = 3;

/// Bits of a relative pointer reserved for the segment id.
pub const SEGMENT_ID_BITS: u32 = 16;

/// Bits of a relative pointer reserved for the offset into the segment.
pub const OFFSET_BITS: u32 = 48;

/// Alignment guaranteed for every chunk handed out by a pool.
pub const CHUNK_MEMORY_ALIGNMENT: usize = 8;

pub const MAX_POOLS_PER_SEGMENT: usize = 8;

const _: () = assert!(SEGMENT_ID_BITS + OFFSET_BITS == u64::BITS);

/// One fixed-size chunk pool inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemPoolConfig {
    /// Size of each chunk in bytes, header included.
    pub chunk_size: u32,
    /// Number of chunks in the pool.
    pub chunk_count: u32,
}

impl MemPoolConfig {
    pub fn new(chunk_size: u32, chunk_count: u32) -> Self {
        Self {
            chunk_size,
            chunk_count,
        }
    }
}

/// Layout of a shared-memory segment: chunk pools plus the pool backing
/// chunk group descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Chunk pools, in strictly ascending chunk size order.
    pub pools: Vec<MemPoolConfig>,

    /// Number of chunk group descriptors.
    /// Default: 64
    #[serde(default = "default_group_count")]
    pub group_count: u32,
}

fn default_group_count() -> u32 {
    64
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            pools: vec![
                MemPoolConfig::new(128, 32),
                MemPoolConfig::new(1024, 32),
                MemPoolConfig::new(16 * 1024, 8),
            ],
            group_count: default_group_count(),
        }
    }
}

impl SegmentConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SegmentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(Error::InvalidConfig("at least one chunk pool is required".into()));
        }
        if self.pools.len() > MAX_POOLS_PER_SEGMENT {
            return Err(Error::InvalidConfig(format!(
                "{} pools configured, at most {} allowed",
                self.pools.len(),
                MAX_POOLS_PER_SEGMENT
            )));
        }
        if self.group_count == 0 {
            return Err(Error::InvalidConfig("group_count must be non-zero".into()));
        }
        let mut previous = 0u32;
        for pool in &self.pools {
            if pool.chunk_count == 0 {
                return Err(Error::InvalidConfig(format!(
                    "pool with {} byte chunks has no chunks",
                    pool.chunk_size
                )));
            }
            if (pool.chunk_size as usize) <= std::mem::size_of::<ChunkHeader>() {
                return Err(Error::InvalidConfig(format!(
                    "chunk size {} leaves no room for a payload",
                    pool.chunk_size
                )));
            }
            if pool.chunk_size as usize % CHUNK_MEMORY_ALIGNMENT != 0 {
                return Err(Error::InvalidConfig(format!(
                    "chunk size {} is not a multiple of {}",
                    pool.chunk_size, CHUNK_MEMORY_ALIGNMENT
                )));
            }
            if pool.chunk_size <= previous {
                return Err(Error::InvalidConfig(
                    "pools must be in strictly ascending chunk size order".into(),
                ));
            }
            previous = pool.chunk_size;
        }
        Ok(())
    }

    /// Bytes needed for a segment formatted with this layout.
    pub fn required_size(&self) -> usize {
        layout::required_size(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SegmentConfig::default().validate().expect("default valid");
    }

    #[test]
    fn json_fills_default_group_count() {
        let config = SegmentConfig::from_json_str(
            r#"{"pools":[{"chunk_size":64,"chunk_count":4},{"chunk_size":256,"chunk_count":2}]}"#,
        )
        .expect("parse");
        assert_eq!(config.group_count, 64);
        assert_eq!(config.pools[1], MemPoolConfig::new(256, 2));
    }

    #[test]
    fn rejects_unordered_pools() {
        let config = SegmentConfig {
            pools: vec![MemPoolConfig::new(256, 2), MemPoolConfig::new(128, 2)],
            group_count: 4,
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_misaligned_chunk_size() {
        let config = SegmentConfig {
            pools: vec![MemPoolConfig::new(100, 2)],
            group_count: 4,
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_chunk_without_payload_room() {
        let size = std::mem::size_of::<ChunkHeader>() as u32;
        let config = SegmentConfig {
            pools: vec![MemPoolConfig::new(size, 2)],
            group_count: 4,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_many_pools() {
        let pools = (1..=(MAX_POOLS_PER_SEGMENT as u32 + 1))
            .map(|i| MemPoolConfig::new(64 * i, 1))
            .collect();
        let config = SegmentConfig {
            pools,
            group_count: 1,
        };
        assert!(config.validate().is_err());
    }
}
