//! End-to-end pack emission tests.
//!
//! Builds packs from an in-memory store and decodes them with a minimal
//! reader (header parse, zlib inflate, delta application) to verify the
//! stream layout, the integrity trailer, and that the decoded object set
//! matches what was inserted.

use std::collections::HashMap;

use flate2::{Decompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};

use odb_pack::{
    apply_delta, InMemoryStore, ObjectId, ObjectKind, ObjectStore, PackBuilder, PackConfig,
};

/// A single undecoded pack entry.
#[derive(Debug)]
enum RawEntry {
    Whole { kind: ObjectKind, data: Vec<u8> },
    RefDelta { base: ObjectId, delta: Vec<u8> },
}

/// Inflates one zlib stream, returning the payload and consumed bytes.
fn inflate(input: &[u8]) -> (Vec<u8>, usize) {
    let mut decompress = Decompress::new(true);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let mut pos = 0usize;
    loop {
        let before_in = decompress.total_in() as usize;
        let before_out = decompress.total_out() as usize;
        let status = decompress
            .decompress(&input[pos..], &mut buf, FlushDecompress::None)
            .expect("valid zlib stream");
        let consumed = decompress.total_in() as usize - before_in;
        let produced = decompress.total_out() as usize - before_out;
        pos += consumed;
        out.extend_from_slice(&buf[..produced]);
        match status {
            Status::StreamEnd => return (out, pos),
            Status::Ok | Status::BufError => {
                assert!(consumed > 0 || produced > 0, "inflate stalled");
            }
        }
    }
}

fn kind_from_code(code: u8) -> ObjectKind {
    match code {
        1 => ObjectKind::Commit,
        2 => ObjectKind::Tree,
        3 => ObjectKind::Blob,
        4 => ObjectKind::Tag,
        other => panic!("unexpected entry type {other}"),
    }
}

/// Parses a pack, verifying signature, version, object count coverage, and
/// the trailing hash.
fn parse_pack(bytes: &[u8]) -> Vec<RawEntry> {
    assert!(bytes.len() >= 32, "pack too small");
    assert_eq!(&bytes[..4], b"PACK");
    assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 2);
    let count = u32::from_be_bytes(bytes[8..12].try_into().unwrap());

    let data_end = bytes.len() - 20;
    let mut pos = 12usize;
    let mut entries = Vec::new();
    for _ in 0..count {
        let mut byte = bytes[pos];
        pos += 1;
        let type_code = (byte >> 4) & 0x07;
        let mut size = u64::from(byte & 0x0f);
        let mut shift = 4u32;
        while byte & 0x80 != 0 {
            byte = bytes[pos];
            pos += 1;
            size |= u64::from(byte & 0x7f) << shift;
            shift += 7;
        }

        let base = if type_code == 7 {
            let base = ObjectId::try_from_slice(&bytes[pos..pos + 20]).unwrap();
            pos += 20;
            Some(base)
        } else {
            None
        };

        let (payload, consumed) = inflate(&bytes[pos..data_end]);
        assert_eq!(payload.len() as u64, size, "header size matches payload");
        pos += consumed;

        entries.push(match base {
            Some(base) => RawEntry::RefDelta {
                base,
                delta: payload,
            },
            None => RawEntry::Whole {
                kind: kind_from_code(type_code),
                data: payload,
            },
        });
    }
    assert_eq!(pos, data_end, "pack has trailing garbage");

    let mut hash = Sha1::new();
    hash.update(&bytes[..data_end]);
    let digest: [u8; 20] = hash.finalize().into();
    assert_eq!(&bytes[data_end..], &digest, "trailer is the stream hash");

    entries
}

/// Resolves deltas in stream order, checking that every base precedes its
/// deltas and that chains respect `max_depth` when given.
fn resolve_entries(
    entries: &[RawEntry],
    max_depth: Option<u32>,
) -> Vec<(ObjectKind, Vec<u8>)> {
    let mut by_id: HashMap<ObjectId, (ObjectKind, Vec<u8>, u32)> = HashMap::new();
    let mut out = Vec::new();
    for entry in entries {
        let (kind, data, depth) = match entry {
            RawEntry::Whole { kind, data } => (*kind, data.clone(), 0),
            RawEntry::RefDelta { base, delta } => {
                let (kind, base_data, base_depth) = by_id
                    .get(base)
                    .expect("delta base precedes the delta in the stream")
                    .clone();
                let mut resolved = Vec::new();
                apply_delta(&base_data, delta, &mut resolved, 0).unwrap();
                (kind, resolved, base_depth + 1)
            }
        };
        if let Some(limit) = max_depth {
            assert!(depth <= limit, "delta chain depth {depth} exceeds {limit}");
        }
        let id = InMemoryStore::object_id(kind, &data);
        by_id.insert(id, (kind, data.clone(), depth));
        out.push((kind, data));
    }
    out
}

fn delta_count(entries: &[RawEntry]) -> usize {
    entries
        .iter()
        .filter(|e| matches!(e, RawEntry::RefDelta { .. }))
        .count()
}

fn patterned(len: usize, tweak: &[(usize, u8)]) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    for &(at, with) in tweak {
        data[at] ^= with;
    }
    data
}

#[test]
fn empty_pack_layout() {
    let store = InMemoryStore::new();
    let mut builder = PackBuilder::new(store);
    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();

    let mut expected = b"PACK\x00\x00\x00\x02\x00\x00\x00\x00".to_vec();
    let mut hash = Sha1::new();
    hash.update(&expected);
    expected.extend_from_slice(&hash.finalize());
    assert_eq!(pack, expected);
    assert!(parse_pack(&pack).is_empty());
}

#[test]
fn single_blob_pack() {
    let mut store = InMemoryStore::new();
    let id = store.add(ObjectKind::Blob, b"0123456789".to_vec());
    let mut builder = PackBuilder::new(store);
    builder.insert(&id, None).unwrap();
    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();

    // Object count 1; first entry header byte is type blob, size 10, no
    // continuation.
    assert_eq!(&pack[8..12], &[0, 0, 0, 1]);
    assert_eq!(pack[12], (3 << 4) | 10);

    let entries = parse_pack(&pack);
    assert_eq!(entries.len(), 1);
    let objects = resolve_entries(&entries, None);
    assert_eq!(objects[0], (ObjectKind::Blob, b"0123456789".to_vec()));

    // The builder retains the trailer hash as the pack id.
    let trailer = ObjectId::try_from_slice(&pack[pack.len() - 20..]).unwrap();
    assert_eq!(builder.pack_id(), Some(trailer));
    assert_eq!(builder.written_count(), 1);
}

#[test]
fn near_identical_blobs_share_a_delta() {
    let mut store = InMemoryStore::new();
    let a = store.add(ObjectKind::Blob, patterned(1024, &[]));
    let b = store.add(ObjectKind::Blob, patterned(1024, &[(512, 0xff), (513, 0xff)]));
    let mut builder = PackBuilder::new(store);
    builder.set_worker_count(1);
    builder.insert(&a, Some(b"data.bin".as_slice())).unwrap();
    builder.insert(&b, Some(b"data.bin".as_slice())).unwrap();

    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();
    let entries = parse_pack(&pack);
    assert_eq!(entries.len(), 2);
    assert_eq!(delta_count(&entries), 1, "exactly one object deltified");

    let objects = resolve_entries(&entries, Some(PackConfig::DEFAULT.depth));
    let mut payloads: Vec<Vec<u8>> = objects.into_iter().map(|(_, d)| d).collect();
    payloads.sort();
    let mut expected = vec![patterned(1024, &[]), patterned(1024, &[(512, 0xff), (513, 0xff)])];
    expected.sort();
    assert_eq!(payloads, expected);
}

#[test]
fn tagged_tip_ordering() {
    let mut store = InMemoryStore::new();
    let c1 = store.add(ObjectKind::Commit, b"commit one".to_vec());
    let c2 = store.add(ObjectKind::Commit, b"commit two".to_vec());
    let t = store.add(ObjectKind::Tag, b"tag of two".to_vec());
    let c3 = store.add(ObjectKind::Commit, b"commit three".to_vec());
    store.add_tag_ref(c2);

    let mut builder = PackBuilder::new(store);
    for id in [c1, c2, t, c3] {
        builder.insert(&id, None).unwrap();
    }
    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();

    let entries = parse_pack(&pack);
    let payloads: Vec<&[u8]> = entries
        .iter()
        .map(|e| match e {
            RawEntry::Whole { data, .. } => data.as_slice(),
            RawEntry::RefDelta { .. } => panic!("no deltas expected"),
        })
        .collect();
    // Untagged leading run, then the tagged tip, then the remaining
    // commits and tags in insertion order.
    assert_eq!(
        payloads,
        vec![
            b"commit one".as_slice(),
            b"commit two".as_slice(),
            b"tag of two".as_slice(),
            b"commit three".as_slice(),
        ]
    );
}

#[test]
fn insert_tree_round_trips_the_full_set() {
    let mut store = InMemoryStore::new();
    let blob_a = store.add(ObjectKind::Blob, b"alpha file contents".to_vec());
    let blob_b = store.add(ObjectKind::Blob, b"beta file contents".to_vec());
    let root = store.add_tree(&[
        (0o100644, b"alpha.txt", blob_a),
        (0o100644, b"beta.txt", blob_b),
    ]);
    let root_payload = store.read(&root).unwrap().data;

    let mut builder = PackBuilder::new(store);
    builder.insert_tree(&root).unwrap();
    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();

    let entries = parse_pack(&pack);
    let mut objects = resolve_entries(&entries, None);
    objects.sort();
    let mut expected = vec![
        (ObjectKind::Blob, b"alpha file contents".to_vec()),
        (ObjectKind::Blob, b"beta file contents".to_vec()),
        (ObjectKind::Tree, root_payload),
    ];
    expected.sort();
    assert_eq!(objects, expected);
}

#[test]
fn serial_search_is_deterministic() {
    let build = || {
        let mut store = InMemoryStore::new();
        let mut ids = Vec::new();
        for variant in 0..12usize {
            let data = patterned(700, &[(variant * 50 + 3, 0x5a)]);
            ids.push(store.add(ObjectKind::Blob, data));
        }
        let mut builder = PackBuilder::new(store);
        builder.set_worker_count(1);
        for id in &ids {
            builder.insert(id, Some(b"src/thing.c".as_slice())).unwrap();
        }
        let mut pack = Vec::new();
        builder.write_to_buffer(&mut pack).unwrap();
        pack
    };
    assert_eq!(build(), build());
}

#[test]
fn big_file_threshold_disables_deltas() {
    let mut store = InMemoryStore::new();
    let a = store.add(ObjectKind::Blob, patterned(1024, &[]));
    let b = store.add(ObjectKind::Blob, patterned(1024, &[(10, 0x11)]));
    let config = PackConfig {
        big_file_threshold: 100,
        ..PackConfig::DEFAULT
    };
    let mut builder = PackBuilder::with_config(store, config);
    builder.insert(&a, None).unwrap();
    builder.insert(&b, None).unwrap();

    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();
    let entries = parse_pack(&pack);
    assert_eq!(entries.len(), 2);
    assert_eq!(delta_count(&entries), 0);
    resolve_entries(&entries, Some(0));
}

#[test]
fn shallow_depth_limit_is_honored() {
    let mut store = InMemoryStore::new();
    let mut ids = Vec::new();
    for variant in 0..6usize {
        ids.push(store.add(ObjectKind::Blob, patterned(900, &[(variant * 100, 0x77)])));
    }
    let config = PackConfig {
        depth: 2,
        ..PackConfig::DEFAULT
    };
    let mut builder = PackBuilder::with_config(store, config);
    builder.set_worker_count(1);
    for id in &ids {
        builder.insert(id, Some(b"deep.bin".as_slice())).unwrap();
    }
    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();
    let entries = parse_pack(&pack);
    // Every chain stays within the configured depth.
    resolve_entries(&entries, Some(2));
    assert!(delta_count(&entries) >= 1);
}

#[test]
fn parallel_search_round_trips() {
    let mut store = InMemoryStore::new();
    let mut expected = Vec::new();
    for group in 0..6u8 {
        for variant in 0..8usize {
            let mut data = patterned(1200, &[(variant * 90 + 7, 0x3c)]);
            data[0] = group;
            let id = store.add(ObjectKind::Blob, data.clone());
            expected.push((id, data));
        }
    }
    expected.sort();
    expected.dedup();

    let mut builder = PackBuilder::new(store);
    builder.set_worker_count(4);
    let hints: [&[u8]; 6] = [b"a.c", b"b.c", b"c.h", b"d.h", b"e.rs", b"f.rs"];
    for (i, (id, _)) in expected.iter().enumerate() {
        builder.insert(id, Some(hints[i % hints.len()])).unwrap();
    }

    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();
    let entries = parse_pack(&pack);
    assert_eq!(entries.len(), expected.len());

    let objects = resolve_entries(&entries, Some(PackConfig::DEFAULT.depth));
    let mut decoded: Vec<(ObjectId, Vec<u8>)> = objects
        .into_iter()
        .map(|(kind, data)| (InMemoryStore::object_id(kind, &data), data))
        .collect();
    decoded.sort();
    decoded.dedup();
    assert_eq!(decoded, expected);
}

#[test]
fn corrupting_a_byte_breaks_the_trailer() {
    let mut store = InMemoryStore::new();
    let id = store.add(ObjectKind::Blob, patterned(300, &[]));
    let mut builder = PackBuilder::new(store);
    builder.insert(&id, None).unwrap();
    let mut pack = Vec::new();
    builder.write_to_buffer(&mut pack).unwrap();

    let mid = pack.len() / 2;
    pack[mid] ^= 0x01;
    let data_end = pack.len() - 20;
    let mut hash = Sha1::new();
    hash.update(&pack[..data_end]);
    let digest: [u8; 20] = hash.finalize().into();
    assert_ne!(&pack[data_end..], &digest);
}
