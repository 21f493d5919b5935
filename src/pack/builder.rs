//! The pack builder: public entry points and phase orchestration.
//!
//! A builder collects object ids (directly or by walking a tree), then any
//! of the emit calls produces the pack: `send` to a transport,
//! `write_to_buffer`, or `write_to_file`. The first emit runs preparation
//! once — candidate selection, sorting, and the delta search — and a
//! `done` flag makes later emits reuse the result until a new insertion
//! invalidates it. The write phase itself is single-threaded and
//! deterministic for a given delta graph.

use std::io::Write;
use std::path::Path;

use log::debug;

use super::config::{ConfigSource, PackConfig};
use super::errors::{ConfigError, PackError};
use super::object_id::{ObjectId, ObjectKind};
use super::object_table::{name_hash, ObjectTable};
use super::parallel::run_delta_search;
use super::sink::{FileSink, PackSink, StreamSink};
use super::store::ObjectStore;
use super::tree_entry::{EntryKind, TreeEntryIter};
use super::writer::write_pack;

/// Builds pack files from objects in a backing store.
///
/// Dropping the builder releases the object table, any cached deltas, and
/// the store handle.
pub struct PackBuilder<S> {
    store: S,
    config: PackConfig,
    table: ObjectTable,
    workers: usize,
    done: bool,
    pack_id: Option<ObjectId>,
    written: u32,
}

impl<S: ObjectStore + Sync> PackBuilder<S> {
    /// Creates a builder over a read-only store view with default
    /// configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, PackConfig::DEFAULT)
    }

    /// Creates a builder with explicit tunables.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails validation.
    pub fn with_config(store: S, config: PackConfig) -> Self {
        config.validate();
        Self {
            store,
            config,
            table: ObjectTable::new(),
            // Workers stay on the caller thread unless asked otherwise.
            workers: 1,
            done: false,
            pack_id: None,
            written: 0,
        }
    }

    /// Creates a builder reading tunables from a configuration source.
    pub fn from_config_source(
        store: S,
        source: &impl ConfigSource,
    ) -> Result<Self, ConfigError> {
        Ok(Self::with_config(store, PackConfig::from_source(source)?))
    }

    /// Sets the delta-search worker count.
    ///
    /// Zero autodetects the CPU count; one forces serial search, which is
    /// also the only reproducible mode.
    pub fn set_worker_count(&mut self, workers: usize) {
        self.workers = workers;
    }

    /// Number of objects registered so far.
    #[must_use]
    pub fn object_count(&self) -> u32 {
        self.table.len()
    }

    /// Number of objects emitted by the most recent write.
    #[must_use]
    pub fn written_count(&self) -> u32 {
        self.written
    }

    /// Trailer hash of the most recent write, if any.
    #[must_use]
    pub fn pack_id(&self) -> Option<ObjectId> {
        self.pack_id
    }

    /// Registers one object.
    ///
    /// Reads kind and size from the store; inserting an id twice leaves
    /// the set unchanged. `name_hint` (usually a path) drives the locality
    /// sort during delta search.
    pub fn insert(&mut self, id: &ObjectId, name_hint: Option<&[u8]>) -> Result<(), PackError> {
        if self.table.contains(id) {
            return Ok(());
        }
        let (kind, size) = self.store.read_header(id).map_err(PackError::Store)?;
        let hash = name_hint.map_or(0, name_hash);
        self.table.push(*id, kind, size, hash);
        self.done = false;
        Ok(())
    }

    /// Registers a tree and everything reachable from it.
    ///
    /// Entries are visited in pre-order; each gets its slash-joined path
    /// as the name hint. Commit links (submodules) address a different
    /// store and are skipped.
    pub fn insert_tree(&mut self, root: &ObjectId) -> Result<(), PackError> {
        self.insert(root, None)?;
        let mut prefix = Vec::new();
        self.walk_tree(root, &mut prefix)
    }

    fn walk_tree(&mut self, id: &ObjectId, prefix: &mut Vec<u8>) -> Result<(), PackError> {
        let tree = self.store.read(id).map_err(PackError::Store)?;
        if tree.kind != ObjectKind::Tree {
            return Err(PackError::CorruptTree {
                detail: "object is not a tree",
            });
        }
        for entry in TreeEntryIter::new(&tree.data) {
            let entry = entry?;
            if entry.kind == EntryKind::CommitLink {
                continue;
            }
            let base_len = prefix.len();
            prefix.extend_from_slice(entry.name);
            self.insert(&entry.id, Some(prefix.as_slice()))?;
            if entry.kind == EntryKind::Tree {
                prefix.push(b'/');
                self.walk_tree(&entry.id, prefix)?;
            }
            prefix.truncate(base_len);
        }
        Ok(())
    }

    /// Sends the pack to a transport.
    pub fn send<W: Write>(&mut self, transport: &mut W) -> Result<(), PackError> {
        self.prepare()?;
        let mut sink = StreamSink::new(transport);
        self.write_to(&mut sink)
    }

    /// Appends the pack to an in-memory buffer.
    pub fn write_to_buffer(&mut self, buf: &mut Vec<u8>) -> Result<(), PackError> {
        self.prepare()?;
        self.write_to(buf)
    }

    /// Writes the pack to `path`, publishing atomically on success.
    ///
    /// On any failure the partially written staging file is removed and
    /// the target path is left untouched.
    pub fn write_to_file(&mut self, path: &Path) -> Result<(), PackError> {
        self.prepare()?;
        let mut sink = FileSink::create(path).map_err(PackError::Io)?;
        self.write_to(&mut sink)?;
        sink.commit().map_err(PackError::Io)
    }

    /// Runs candidate selection and the delta search once per object set.
    fn prepare(&mut self) -> Result<(), PackError> {
        if self.table.is_empty() || self.done {
            return Ok(());
        }

        self.table.mark_big_objects(self.config.big_file_threshold);
        let list = self.table.delta_candidates();
        debug!(
            "preparing pack: {} objects, {} delta candidates",
            self.table.len(),
            list.len()
        );
        if list.len() > 1 {
            let results =
                run_delta_search(&self.store, &self.config, &self.table, &list, self.workers)?;
            debug!("delta search chose {} deltas", results.len());
            for result in results {
                self.table.commit_delta(result);
            }
        }

        self.done = true;
        Ok(())
    }

    fn write_to(&mut self, sink: &mut dyn PackSink) -> Result<(), PackError> {
        let (pack_id, written) = write_pack(&mut self.table, &self.store, sink)?;
        self.pack_id = Some(pack_id);
        self.written = written;
        Ok(())
    }
}
