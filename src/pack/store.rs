//! Backing object store abstraction.
//!
//! The builder reads object payloads through the [`ObjectStore`] trait and
//! never writes back. Implementations must return the raw, decompressed
//! payload without any kind/length framing.
//!
//! # Contract
//! - `read` returns the full payload; `read_header` may be cheaper when an
//!   implementation can answer kind and size without loading bytes.
//! - `for_each_tag` enumerates the ids at the tip of tag refs; the default
//!   reports none. Annotated tags are not peeled to their final target.
//!
//! [`InMemoryStore`] is a ready content-addressed implementation: ids are
//! the SHA-1 of `"<kind> <len>\0"` followed by the payload.

use ahash::AHashMap;
use sha1::{Digest, Sha1};

use super::errors::StoreError;
use super::object_id::{ObjectId, ObjectKind};

/// A decompressed object read from the store.
#[derive(Clone, Debug)]
pub struct OdbObject {
    /// Object kind.
    pub kind: ObjectKind,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

impl OdbObject {
    /// Returns the payload length in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Read-only view on a content-addressed object store.
pub trait ObjectStore {
    /// Loads an object by id.
    ///
    /// # Errors
    /// - `NotFound` if the store cannot supply the object
    /// - `Io` / `Corrupt` for backend failures
    fn read(&self, id: &ObjectId) -> Result<OdbObject, StoreError>;

    /// Returns an object's kind and payload length without the payload.
    ///
    /// The default reads the full object; override when metadata is cheaper.
    fn read_header(&self, id: &ObjectId) -> Result<(ObjectKind, u64), StoreError> {
        let obj = self.read(id)?;
        Ok((obj.kind, obj.size()))
    }

    /// Invokes `f` for the id at the tip of every tag ref.
    ///
    /// The default reports no tags.
    fn for_each_tag(&self, f: &mut dyn FnMut(&ObjectId)) -> Result<(), StoreError> {
        let _ = f;
        Ok(())
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for &S {
    fn read(&self, id: &ObjectId) -> Result<OdbObject, StoreError> {
        (**self).read(id)
    }

    fn read_header(&self, id: &ObjectId) -> Result<(ObjectKind, u64), StoreError> {
        (**self).read_header(id)
    }

    fn for_each_tag(&self, f: &mut dyn FnMut(&ObjectId)) -> Result<(), StoreError> {
        (**self).for_each_tag(f)
    }
}

/// In-memory content-addressed object store.
///
/// Intended for embedding and tests. Objects are keyed by the SHA-1 of
/// their framed payload, so identical content always maps to the same id.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: AHashMap<ObjectId, (ObjectKind, Vec<u8>)>,
    tags: Vec<ObjectId>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object, returning its content-derived id.
    ///
    /// Adding identical content twice is a no-op and yields the same id.
    pub fn add(&mut self, kind: ObjectKind, data: impl Into<Vec<u8>>) -> ObjectId {
        let data = data.into();
        let id = Self::object_id(kind, &data);
        self.objects.entry(id).or_insert((kind, data));
        id
    }

    /// Adds a tree object built from `(mode, name, id)` entries.
    ///
    /// Entries are serialized in the order given; callers are responsible
    /// for canonical ordering if they need it.
    pub fn add_tree(&mut self, entries: &[(u32, &[u8], ObjectId)]) -> ObjectId {
        let mut payload = Vec::new();
        for (mode, name, id) in entries {
            payload.extend_from_slice(format!("{mode:o}").as_bytes());
            payload.push(b' ');
            payload.extend_from_slice(name);
            payload.push(0);
            payload.extend_from_slice(id.as_bytes());
        }
        self.add(ObjectKind::Tree, payload)
    }

    /// Registers `id` as the tip of a tag ref.
    pub fn add_tag_ref(&mut self, id: ObjectId) {
        self.tags.push(id);
    }

    /// Returns true if the store holds `id`.
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Computes the content-derived id for a framed payload.
    #[must_use]
    pub fn object_id(kind: ObjectKind, data: &[u8]) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(kind.token());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        ObjectId::from_bytes(hasher.finalize().into())
    }
}

impl ObjectStore for InMemoryStore {
    fn read(&self, id: &ObjectId) -> Result<OdbObject, StoreError> {
        self.objects
            .get(id)
            .map(|(kind, data)| OdbObject {
                kind: *kind,
                data: data.clone(),
            })
            .ok_or(StoreError::NotFound(*id))
    }

    fn read_header(&self, id: &ObjectId) -> Result<(ObjectKind, u64), StoreError> {
        self.objects
            .get(id)
            .map(|(kind, data)| (*kind, data.len() as u64))
            .ok_or(StoreError::NotFound(*id))
    }

    fn for_each_tag(&self, f: &mut dyn FnMut(&ObjectId)) -> Result<(), StoreError> {
        for id in &self.tags {
            f(id);
        }
        Ok(())
    }
}
