//! Pack-file builder for a content-addressed object store.
//!
//! Objects (commits, trees, blobs, tags) are addressed by a fixed 20-byte
//! content hash and read from a backing [`pack::ObjectStore`]. The builder
//! collects a set of objects, searches for binary deltas between related
//! objects inside a bounded sliding window, orders the result so that every
//! delta's base precedes it in the stream, and emits a single pack file with
//! a trailing integrity hash.
//!
//! High-level flow:
//! 1. `insert` / `insert_tree` register objects (metadata only, no payload
//!    reads).
//! 2. The first emit call runs preparation: candidate filtering and sorting,
//!    then the windowed delta search, optionally across worker threads with
//!    dynamic load rebalancing.
//! 3. The write phase plans an emit order over the delta forest and streams
//!    header, objects, and trailer to a byte sink (buffer, file, or
//!    transport).
//!
//! Preparation is memory-disciplined: per-worker window payloads are bounded
//! by `pack.windowMemory` and cached deltas by `pack.deltaCacheSize`.

pub mod pack;

pub use pack::{
    apply_delta, create_delta, ConfigError, ConfigSource, DeltaError, DeltaIndex, FileSink,
    InMemoryStore, ObjectId, ObjectKind, ObjectStore, OdbObject, PackBuilder, PackConfig,
    PackError, PackSink, StoreError, StreamSink,
};
