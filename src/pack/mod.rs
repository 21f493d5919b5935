//! Pack building pipeline modules.
//!
//! Pipeline overview:
//! 1. `builder` collects object ids through `insert` / `insert_tree`,
//!    reading kind and size (never payloads) from the [`ObjectStore`].
//! 2. `object_table` keeps the per-object records and produces the sorted
//!    delta-candidate list.
//! 3. `delta_search` runs the sliding-window base selection; `parallel`
//!    fans it out across workers with name-hash aligned partitioning and
//!    work stealing.
//! 4. `write_order` plans the emit permutation over the delta forest.
//! 5. `writer` streams header, objects, and the trailing hash into a
//!    `sink`.
//!
//! # Invariants
//! - An object id never appears twice in a builder.
//! - Every emitted delta's base precedes it in the stream.
//! - Cached delta bytes never exceed the configured budget outside an
//!   in-progress accounting update.
//! - Outputs are deterministic for identical insertions, configuration,
//!   and a serial search.

mod builder;
mod config;
mod delta;
mod delta_search;
mod errors;
mod object_id;
mod object_table;
mod parallel;
mod sink;
mod store;
mod tree_entry;
mod write_order;
mod writer;
mod zlib;

pub use builder::PackBuilder;
pub use config::{
    ConfigSource, PackConfig, DEFAULT_DEPTH, DEFAULT_WINDOW, KEY_BIG_FILE_THRESHOLD,
    KEY_DELTA_CACHE_LIMIT, KEY_DELTA_CACHE_SIZE, KEY_WINDOW_MEMORY,
};
pub use delta::{apply_delta, create_delta, DeltaError, DeltaIndex};
pub use errors::{ConfigError, PackError, StoreError};
pub use object_id::{ObjectId, ObjectKind, OBJECT_ID_LEN};
pub use sink::{FileSink, PackSink, StreamSink};
pub use store::{InMemoryStore, ObjectStore, OdbObject};
pub use tree_entry::{EntryKind, TreeEntry, TreeEntryIter};
