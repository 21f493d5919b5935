//! Object ID and kind types for the pack builder.
//!
//! [`ObjectId`] is fixed-size, zero-heap storage for the 20-byte content
//! hash that addresses every object in the store.
//!
//! # Ordering Semantics
//! - `ObjectId` compares lexicographically on the raw bytes; only the byte
//!   content matters.

use std::fmt;

/// Raw byte length of an object id.
pub const OBJECT_ID_LEN: usize = 20;

/// Object kind stored in the backing store and encoded in pack entries.
///
/// The discriminants are the pack entry type codes and are stable; they may
/// be used for compact serialization.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Commit objects (pack type 1).
    Commit = 1,
    /// Tree objects (pack type 2).
    Tree = 2,
    /// Blob objects (pack type 3).
    Blob = 3,
    /// Annotated tag objects (pack type 4).
    Tag = 4,
}

/// Pack entry type code for delta entries referencing a base by id.
pub(crate) const REF_DELTA_TYPE: u8 = 7;

impl ObjectKind {
    /// Returns the pack entry type code for this kind.
    #[inline]
    #[must_use]
    pub const fn pack_type(self) -> u8 {
        self as u8
    }

    /// Returns the kind's header token used in content addressing.
    #[must_use]
    pub const fn token(self) -> &'static [u8] {
        match self {
            Self::Commit => b"commit",
            Self::Tree => b"tree",
            Self::Blob => b"blob",
            Self::Tag => b"tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token bytes are ASCII by construction.
        f.write_str(std::str::from_utf8(self.token()).expect("ascii token"))
    }
}

/// Fixed-size 20-byte object id.
///
/// A compact, layout-stable container that avoids heap allocation. Ids are
/// unique keys in the object table; equality and ordering are on the raw
/// bytes.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Creates an id from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Creates an id from a slice, returning `None` for invalid lengths.
    ///
    /// Use this for untrusted input where panicking is undesirable.
    #[must_use]
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; OBJECT_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Returns the id bytes as a slice.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Returns true if this is the zero id (all bytes are 0).
    ///
    /// This check is not constant-time; do not use it for secret material.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self([0u8; OBJECT_ID_LEN])
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Lowercase hex, the canonical id rendering.
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; OBJECT_ID_LEN]> for ObjectId {
    fn from(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }
}
