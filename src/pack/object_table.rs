//! Object table: per-object records and the id-to-index map.
//!
//! The table is append-only: records are created by insertion and live
//! until the builder is dropped. Links between records (delta base,
//! child/sibling forest) are stored as `u32` indexes into the table with
//! [`NONE`] as the null sentinel, so they stay valid as the table grows.
//!
//! # Invariants
//! - Ids are unique: an id never appears twice.
//! - `delta_base`, if set, references a record of the same kind.
//! - The delta base graph is a forest once preparation completes.

use ahash::AHashMap;

use super::delta_search::DeltaResult;
use super::object_id::{ObjectId, ObjectKind};

/// Null sentinel for record links.
pub(crate) const NONE: u32 = u32::MAX;

/// Objects smaller than this are never delta candidates.
const MIN_DELTA_TARGET_SIZE: u64 = 50;

/// Per-object record.
///
/// Scratch fields are grouped by the phase that owns them: delta linkage is
/// populated by the search, the child/sibling forest and flags by the
/// write-order planner, and `written`/`recursing` by the emitter.
#[derive(Debug)]
pub(crate) struct PackedObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    /// Uncompressed payload length in bytes.
    pub size: u64,
    /// Locality fingerprint of the insertion name hint; zero when none.
    pub name_hash: u32,

    // Delta linkage (populated during delta search).
    pub delta_base: u32,
    pub delta_size: u64,
    /// Chosen delta payload, when it fit the cache budget.
    pub delta_data: Option<Vec<u8>>,
    /// Compressed length of `delta_data` when it was pre-compressed.
    pub z_delta_size: u64,

    // Planner scratch (repopulated per write).
    pub delta_child: u32,
    pub delta_sibling: u32,
    pub tagged: bool,
    pub filled: bool,

    // Emitter scratch.
    pub written: bool,
    pub recursing: bool,

    pub no_try_delta: bool,
}

impl PackedObject {
    fn new(id: ObjectId, kind: ObjectKind, size: u64, name_hash: u32) -> Self {
        Self {
            id,
            kind,
            size,
            name_hash,
            delta_base: NONE,
            delta_size: 0,
            delta_data: None,
            z_delta_size: 0,
            delta_child: NONE,
            delta_sibling: NONE,
            tagged: false,
            filled: false,
            written: false,
            recursing: false,
            no_try_delta: false,
        }
    }
}

/// Locality fingerprint of a name hint.
///
/// Skips whitespace and folds each byte as `hash = (hash >> 2) + (c << 24)`
/// in wrapping 32-bit arithmetic, so the last ~16 non-whitespace bytes
/// dominate and names with identical suffixes cluster in the candidate sort.
#[must_use]
pub(crate) fn name_hash(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &c in name {
        if c.is_ascii_whitespace() {
            continue;
        }
        hash = (hash >> 2).wrapping_add(u32::from(c) << 24);
    }
    hash
}

/// Append-only record storage plus the id uniqueness map.
#[derive(Debug, Default)]
pub(crate) struct ObjectTable {
    objects: Vec<PackedObject>,
    index: AHashMap<ObjectId, u32>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.objects.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    #[inline]
    pub fn get(&self, ix: u32) -> &PackedObject {
        &self.objects[ix as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, ix: u32) -> &mut PackedObject {
        &mut self.objects[ix as usize]
    }

    pub fn lookup(&self, id: &ObjectId) -> Option<u32> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains_key(id)
    }

    /// Appends a record, returning its index.
    ///
    /// The caller must have checked uniqueness; duplicate ids are a logic
    /// error.
    pub fn push(&mut self, id: ObjectId, kind: ObjectKind, size: u64, name_hash: u32) -> u32 {
        debug_assert!(!self.index.contains_key(&id), "duplicate object id");
        let ix = self.objects.len() as u32;
        self.objects.push(PackedObject::new(id, kind, size, name_hash));
        self.index.insert(id, ix);
        ix
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PackedObject> {
        self.objects.iter_mut()
    }

    /// Installs a search result on its target record.
    pub fn commit_delta(&mut self, result: DeltaResult) {
        debug_assert_eq!(
            self.get(result.target).kind,
            self.get(result.base).kind,
            "delta base kind mismatch"
        );
        let po = self.get_mut(result.target);
        po.delta_base = result.base;
        po.delta_size = result.size;
        po.delta_data = result.data;
        po.z_delta_size = result.z_size;
    }

    /// Marks objects above the big-file threshold as non-candidates.
    pub fn mark_big_objects(&mut self, big_file_threshold: u64) {
        for po in &mut self.objects {
            po.no_try_delta = po.size > big_file_threshold;
        }
    }

    /// Builds the sorted delta-candidate list.
    ///
    /// Includes every record at or above the minimum target size that is
    /// not excluded by the big-file threshold, sorted by kind, then
    /// locality hash, then size, all descending, with newer records winning
    /// ties. Size-descending places larger objects earlier so they serve as
    /// bases within the window.
    pub fn delta_candidates(&self) -> Vec<u32> {
        let mut list: Vec<u32> = (0..self.len())
            .filter(|&ix| {
                let po = self.get(ix);
                po.size >= MIN_DELTA_TARGET_SIZE && !po.no_try_delta
            })
            .collect();

        list.sort_unstable_by(|&a, &b| {
            let (x, y) = (self.get(a), self.get(b));
            y.kind
                .pack_type()
                .cmp(&x.kind.pack_type())
                .then_with(|| y.name_hash.cmp(&x.name_hash))
                .then_with(|| y.size.cmp(&x.size))
                .then_with(|| b.cmp(&a))
        });
        list
    }
}
