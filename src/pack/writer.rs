//! Streaming pack emission.
//!
//! Emits the 12-byte pack header, every object in planned order, and the
//! trailing integrity hash. Each object carries a variable-length header
//! encoding its type and uncompressed payload size; delta objects add the
//! base's 20-byte id and store the delta payload, not the reconstructed
//! object. Payloads are zlib streams.
//!
//! Every emitted byte is fed to a running SHA-1 in emission order; the
//! digest becomes the 20-byte trailer.
//!
//! `write_one` emits a record's base ahead of the record itself. If the
//! recursion ever revisits a record already on the active path, that
//! record's delta link is severed and it is emitted whole; a degenerate
//! graph therefore degrades the pack instead of failing it.

use sha1::{Digest, Sha1};

use super::delta::{create_delta, DeltaIndex};
use super::errors::PackError;
use super::object_id::{ObjectId, REF_DELTA_TYPE};
use super::object_table::{ObjectTable, NONE};
use super::sink::PackSink;
use super::store::ObjectStore;
use super::zlib;

/// Pack stream signature.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack stream version.
const PACK_VERSION: u32 = 2;

enum WriteOneStatus {
    /// Already written earlier in the stream.
    Skip,
    /// Freshly written.
    Written,
    /// Already on the active recursion path; the caller must not depend on
    /// it.
    Recursive,
}

/// Streams the whole pack to `sink`, returning the trailer id and the
/// number of objects written.
pub(crate) fn write_pack<S: ObjectStore + ?Sized>(
    table: &mut ObjectTable,
    store: &S,
    sink: &mut dyn PackSink,
) -> Result<(ObjectId, u32), PackError> {
    // Emitter scratch is per-write state; reset so repeated emits of the
    // same object set produce identical streams.
    for po in table.iter_mut() {
        po.written = false;
        po.recursing = false;
    }

    let order = super::write_order::compute_write_order(table, store)?;

    let mut hash = Sha1::new();
    let mut header = [0u8; 12];
    header[..4].copy_from_slice(PACK_SIGNATURE);
    header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
    header[8..12].copy_from_slice(&table.len().to_be_bytes());
    sink.write(&header).map_err(PackError::Io)?;
    hash.update(header);

    let mut written = 0u32;
    for &ix in &order {
        write_one(table, store, sink, &mut hash, ix, &mut written)?;
    }

    let digest: [u8; 20] = hash.finalize().into();
    sink.write(&digest).map_err(PackError::Io)?;
    Ok((ObjectId::from_bytes(digest), written))
}

fn write_one<S: ObjectStore + ?Sized>(
    table: &mut ObjectTable,
    store: &S,
    sink: &mut dyn PackSink,
    hash: &mut Sha1,
    ix: u32,
    written: &mut u32,
) -> Result<WriteOneStatus, PackError> {
    {
        let po = table.get(ix);
        if po.recursing {
            return Ok(WriteOneStatus::Recursive);
        }
        if po.written {
            return Ok(WriteOneStatus::Skip);
        }
    }

    let base = table.get(ix).delta_base;
    if base != NONE {
        table.get_mut(ix).recursing = true;
        let status = write_one(table, store, sink, hash, base, written)?;
        if matches!(status, WriteOneStatus::Recursive) {
            // We cannot depend on this base; emit whole instead.
            table.get_mut(ix).delta_base = NONE;
        }
    }

    {
        let po = table.get_mut(ix);
        po.written = true;
        po.recursing = false;
    }
    write_object(table, store, sink, hash, ix)?;
    *written += 1;
    Ok(WriteOneStatus::Written)
}

fn write_object<S: ObjectStore + ?Sized>(
    table: &mut ObjectTable,
    store: &S,
    sink: &mut dyn PackSink,
    hash: &mut Sha1,
    ix: u32,
) -> Result<(), PackError> {
    let delta_base = table.get(ix).delta_base;

    let (header_size, obj_type, base_id, payload) = if delta_base != NONE {
        let (delta_size, cached, z_size) = {
            let po = table.get_mut(ix);
            let cached = po.delta_data.take();
            let z = po.z_delta_size;
            po.z_delta_size = 0;
            (po.delta_size, cached, z)
        };
        let payload = match cached {
            // Pre-compressed during the search; emit the bytes directly.
            Some(data) if z_size > 0 => data,
            Some(data) => zlib::deflate(&data).map_err(PackError::Io)?,
            None => {
                let delta = recompute_delta(table, store, ix)?;
                zlib::deflate(&delta).map_err(PackError::Io)?
            }
        };
        let base_id = table.get(delta_base).id;
        (delta_size, REF_DELTA_TYPE, Some(base_id), payload)
    } else {
        let po = table.get(ix);
        let obj = store.read(&po.id).map_err(PackError::Store)?;
        if obj.size() != po.size {
            return Err(PackError::ObjectSizeChanged {
                id: po.id,
                expected: po.size,
                actual: obj.size(),
            });
        }
        let payload = zlib::deflate(&obj.data).map_err(PackError::Io)?;
        (po.size, po.kind.pack_type(), None, payload)
    };

    let (header, header_len) = encode_object_header(header_size, obj_type);
    sink.write(&header[..header_len]).map_err(PackError::Io)?;
    hash.update(&header[..header_len]);

    if let Some(base_id) = base_id {
        sink.write(base_id.as_bytes()).map_err(PackError::Io)?;
        hash.update(base_id.as_bytes());
    }

    sink.write(&payload).map_err(PackError::Io)?;
    hash.update(&payload);
    Ok(())
}

/// Rebuilds a delta that was not cached during the search.
fn recompute_delta<S: ObjectStore + ?Sized>(
    table: &ObjectTable,
    store: &S,
    ix: u32,
) -> Result<Vec<u8>, PackError> {
    let po = table.get(ix);
    let base = table.get(po.delta_base);
    let src = store.read(&base.id).map_err(PackError::Store)?;
    let trg = store.read(&po.id).map_err(PackError::Store)?;

    let delta = DeltaIndex::new(&src.data)
        .and_then(|index| create_delta(&index, &src.data, &trg.data, 0));
    match delta {
        Some(delta) if delta.len() as u64 == po.delta_size => Ok(delta),
        Some(delta) => Err(PackError::DeltaSizeChanged {
            id: po.id,
            expected: po.delta_size,
            actual: delta.len() as u64,
        }),
        None => Err(PackError::DeltaSizeChanged {
            id: po.id,
            expected: po.delta_size,
            actual: 0,
        }),
    }
}

/// Encodes the per-object header.
///
/// First byte: high bit "size continues", three type bits, low four size
/// bits; each following byte carries seven more size bits with the high bit
/// as the continuation flag. The size is the uncompressed payload length.
pub(crate) fn encode_object_header(mut size: u64, obj_type: u8) -> ([u8; 10], usize) {
    debug_assert!((1..=REF_DELTA_TYPE).contains(&obj_type));

    let mut header = [0u8; 10];
    let mut len = 0usize;
    let mut byte = (obj_type << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        header[len] = byte | 0x80;
        len += 1;
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    header[len] = byte;
    len += 1;
    (header, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::object_id::ObjectKind;
    use crate::pack::store::InMemoryStore;

    #[test]
    fn header_encoding_small_sizes() {
        let (header, len) = encode_object_header(10, ObjectKind::Blob.pack_type());
        assert_eq!(len, 1);
        assert_eq!(header[0], (3 << 4) | 10);

        let (header, len) = encode_object_header(0, ObjectKind::Commit.pack_type());
        assert_eq!(len, 1);
        assert_eq!(header[0], 1 << 4);
    }

    #[test]
    fn header_encoding_continues_above_fifteen() {
        // size 16: low nibble 0 with continuation, then 1.
        let (header, len) = encode_object_header(16, ObjectKind::Blob.pack_type());
        assert_eq!(len, 2);
        assert_eq!(header[0], 0x80 | (3 << 4));
        assert_eq!(header[1], 1);

        // A size needing three bytes: 4 + 7 + 7 bits.
        let size = 0x0004_0000u64;
        let (header, len) = encode_object_header(size, ObjectKind::Blob.pack_type());
        assert_eq!(len, 3);
        let decoded = u64::from(header[0] & 0x0f)
            | (u64::from(header[1] & 0x7f) << 4)
            | (u64::from(header[2] & 0x7f) << 11);
        assert_eq!(decoded, size);
        assert_eq!(header[0] & 0x80, 0x80);
        assert_eq!(header[1] & 0x80, 0x80);
        assert_eq!(header[2] & 0x80, 0);
    }

    #[test]
    fn empty_pack_bytes() {
        let mut table = ObjectTable::new();
        let store = InMemoryStore::new();
        let mut out = Vec::new();
        let (trailer, written) = write_pack(&mut table, &store, &mut out).unwrap();
        assert_eq!(written, 0);
        assert_eq!(out.len(), 12 + 20);
        assert_eq!(&out[..4], b"PACK");
        assert_eq!(&out[4..8], &[0, 0, 0, 2]);
        assert_eq!(&out[8..12], &[0, 0, 0, 0]);

        let mut hash = Sha1::new();
        hash.update(&out[..12]);
        let digest: [u8; 20] = hash.finalize().into();
        assert_eq!(&out[12..], &digest);
        assert_eq!(trailer, ObjectId::from_bytes(digest));
    }

    #[test]
    fn base_written_before_delta_even_when_planned_after() {
        let mut store = InMemoryStore::new();
        let base_data: Vec<u8> = (0..256u32).map(|i| (i % 251) as u8).collect();
        let mut trg_data = base_data.clone();
        trg_data[7] ^= 0xff;
        let trg_id = store.add(ObjectKind::Blob, trg_data.clone());
        let base_id = store.add(ObjectKind::Blob, base_data.clone());

        // Insert the delta target first so the planner sees it before its
        // base in insertion order.
        let mut table = ObjectTable::new();
        let trg_ix = table.push(trg_id, ObjectKind::Blob, trg_data.len() as u64, 0);
        let base_ix = table.push(base_id, ObjectKind::Blob, base_data.len() as u64, 0);

        let index = DeltaIndex::new(&base_data).unwrap();
        let delta = create_delta(&index, &base_data, &trg_data, 0).unwrap();
        {
            let po = table.get_mut(trg_ix);
            po.delta_base = base_ix;
            po.delta_size = delta.len() as u64;
        }

        let mut out = Vec::new();
        let (_, written) = write_pack(&mut table, &store, &mut out).unwrap();
        assert_eq!(written, 2);

        // The first emitted object must be the whole base (type blob), not
        // the ref-delta.
        assert_eq!(out[12] >> 4 & 0x07, ObjectKind::Blob.pack_type());
    }

    #[test]
    fn repeated_writes_are_identical() {
        let mut store = InMemoryStore::new();
        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let id = store.add(ObjectKind::Blob, data.clone());
        let mut table = ObjectTable::new();
        table.push(id, ObjectKind::Blob, data.len() as u64, 0);

        let mut first = Vec::new();
        write_pack(&mut table, &store, &mut first).unwrap();
        let mut second = Vec::new();
        write_pack(&mut table, &store, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stale_delta_size_is_an_invariant_error() {
        let mut store = InMemoryStore::new();
        let base_data: Vec<u8> = (0..256u32).map(|i| (i % 251) as u8).collect();
        let mut trg_data = base_data.clone();
        trg_data[0] ^= 1;
        let base_id = store.add(ObjectKind::Blob, base_data.clone());
        let trg_id = store.add(ObjectKind::Blob, trg_data.clone());

        let mut table = ObjectTable::new();
        let base_ix = table.push(base_id, ObjectKind::Blob, base_data.len() as u64, 0);
        let trg_ix = table.push(trg_id, ObjectKind::Blob, trg_data.len() as u64, 0);
        {
            let po = table.get_mut(trg_ix);
            po.delta_base = base_ix;
            po.delta_size = 1; // wrong on purpose
        }

        let mut out = Vec::new();
        let err = write_pack(&mut table, &store, &mut out).unwrap_err();
        assert!(matches!(err, PackError::DeltaSizeChanged { .. }));
    }
}
