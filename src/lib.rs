//! Reference-counted chunk groups for zero-copy shared-memory messaging.
//!
//! A producer loans chunks from pools inside a shared segment, bundles up to
//! [`MAX_CHUNKS_PER_GROUP`] of them in a [`ChunkGroup`] and hands the group
//! to consumers as a one-word [`PortableChunkGroup`] through a shared queue.
//! Each consumer turns it back into a [`SharedChunkGroup`]; the last handle
//! to go returns every chunk and the descriptor to their pools, from
//! whichever process that happens in.

pub mod chunk;
pub mod chunk_group;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod layout;
pub mod mem_pool;
pub mod portable;
pub mod relative_ptr;
pub mod segment;
pub mod shared;

pub use chunk::{ChunkHeader, ChunkRecord};
pub use chunk_group::ChunkGroup;
pub use config::{MemPoolConfig, SegmentConfig, MAX_CHUNKS_PER_GROUP};
pub use error::{Error, Result};
pub use layout::{format_segment, MemoryManager};
pub use mem_pool::{MemPool, MemPoolStats};
pub use portable::{ChunkGroupSlot, PortableChunkGroup};
pub use relative_ptr::{RelativePtr, SegmentId};
pub use segment::{Segment, SegmentRegistry};
pub use shared::SharedChunkGroup;
