//! End-to-end delta tests: diff two archives, apply the delta against the
//! extracted old archive, and require the raw new tar byte for byte.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tar_delta::delta::{read_uvarint, DELTA_MAGIC, OP_ADD_DATA, OP_COPY, OP_DATA, OP_OPEN};
use tar_delta::{apply, diff, DeltaError, DiffOptions, DirSourceProvider, SourceProvider};
use tempfile::tempdir;

fn plain_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn make_delta(old_tar: &[u8], new_tar: &[u8], options: &DiffOptions) -> Vec<u8> {
    let mut delta = Vec::new();
    diff(
        &mut Cursor::new(old_tar),
        &mut Cursor::new(new_tar),
        &mut delta,
        options,
    )
    .unwrap();
    delta
}

/// Extract the old archive to disk and apply the delta against it
fn apply_delta(old_tar: &[u8], delta: &[u8]) -> Vec<u8> {
    let dir = tempdir().unwrap();
    tar::Archive::new(Cursor::new(old_tar))
        .unpack(dir.path())
        .unwrap();

    let provider = DirSourceProvider::new(dir.path());
    let mut out = Vec::new();
    apply(delta, &provider, &mut out).unwrap();
    out
}

/// Full cycle with default options; returns the delta for size checks
fn assert_roundtrip(old_tar: &[u8], new_tar: &[u8], raw_new: &[u8]) -> Vec<u8> {
    let delta = make_delta(old_tar, new_tar, &DiffOptions::default());
    assert_eq!(apply_delta(old_tar, &delta), raw_new);
    delta
}

/// Decode the delta into its opcode tags
fn opcode_tags(delta: &[u8]) -> Vec<u8> {
    assert_eq!(&delta[..DELTA_MAGIC.len()], DELTA_MAGIC);
    let mut stream = Vec::new();
    zstd::stream::Decoder::new(&delta[DELTA_MAGIC.len()..])
        .unwrap()
        .read_to_end(&mut stream)
        .unwrap();

    let mut tags = Vec::new();
    let mut rest = &stream[..];
    while !rest.is_empty() {
        let tag = rest[0];
        rest = &rest[1..];
        let size = read_uvarint(&mut rest).unwrap();
        if matches!(tag, OP_DATA | OP_OPEN | OP_ADD_DATA) {
            rest = &rest[size as usize..];
        }
        tags.push(tag);
    }
    tags
}

#[test]
fn identity_delta() {
    let archive = plain_tar(&[("f", b"HELLOHELLO")]);
    let delta = assert_roundtrip(&archive, &archive, &archive);

    // The single file is reused wholesale: literal tar framing around one
    // open and one copy.
    assert_eq!(opcode_tags(&delta), vec![OP_DATA, OP_OPEN, OP_COPY, OP_DATA]);
    assert!(delta.len() < archive.len());
}

#[test]
fn single_byte_change_uses_bsdiff() {
    let old_payload = vec![0x41u8; 64 * 1024];
    let mut new_payload = old_payload.clone();
    *new_payload.last_mut().unwrap() = 0x42;

    let old_tar = plain_tar(&[("f", &old_payload)]);
    let new_tar = plain_tar(&[("f", &new_payload)]);
    let delta = assert_roundtrip(&old_tar, &new_tar, &new_tar);

    assert!(opcode_tags(&delta).contains(&OP_ADD_DATA));
    // The add-delta bytes are almost all zero, so the delta stays tiny
    assert!(delta.len() < 5_000, "delta is {} bytes", delta.len());
}

#[test]
fn insertion_into_large_file() {
    let mut rng = StdRng::seed_from_u64(1);
    let old_payload: Vec<u8> = (0..2 * 1024 * 1024).map(|_| rng.gen()).collect();
    let mut new_payload = old_payload.clone();
    let insert: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
    new_payload.splice(1024 * 1024..1024 * 1024, insert);

    let old_tar = plain_tar(&[("big.bin", &old_payload)]);
    let new_tar = plain_tar(&[("big.bin", &new_payload)]);
    let delta = assert_roundtrip(&old_tar, &new_tar, &new_tar);

    assert!(delta.len() < 30_000, "delta is {} bytes", delta.len());
}

#[test]
fn compressed_blobs_are_copied_verbatim() {
    let mut rng = StdRng::seed_from_u64(2);
    let old_blob: Vec<u8> = (0..1024 * 1024).map(|_| rng.gen()).collect();
    let new_blob: Vec<u8> = (0..1024 * 1024 + 100).map(|_| rng.gen()).collect();

    let old_tar = plain_tar(&[(".xz-data", &old_blob)]);
    let new_tar = plain_tar(&[(".xz-data", &new_blob)]);
    let delta = assert_roundtrip(&old_tar, &new_tar, &new_tar);

    // Nothing to reuse: the delta carries the whole incompressible payload
    assert!(delta.len() as f64 > new_tar.len() as f64 * 0.8);
    assert!(!opcode_tags(&delta).contains(&OP_COPY));
}

#[test]
fn fuzzy_rename_still_deltas() {
    let mut rng = StdRng::seed_from_u64(3);
    let old_payload: Vec<u8> = (0..500 * 1024).map(|_| rng.gen()).collect();
    let mut new_payload = old_payload.clone();
    new_payload[1000] ^= 0xff;
    new_payload[200_000] ^= 0xff;

    let old_tar = plain_tar(&[("lib/libfoo.so.1", &old_payload)]);
    let new_tar = plain_tar(&[("lib/libfoo.so.2", &new_payload)]);
    let delta = assert_roundtrip(&old_tar, &new_tar, &new_tar);

    // Matched via the `libfoo.` prefix and bsdiffed
    assert!(delta.len() < 10_000, "delta is {} bytes", delta.len());
}

#[test]
fn chunk_reuse_when_bsdiff_is_capped() {
    let mut rng = StdRng::seed_from_u64(4);
    let old_payload: Vec<u8> = (0..300 * 1024).map(|_| rng.gen()).collect();
    let mut new_payload = old_payload.clone();
    new_payload[150_000] ^= 0xff;

    let old_tar = plain_tar(&[("data", &old_payload)]);
    let new_tar = plain_tar(&[("data", &new_payload)]);

    let options = DiffOptions {
        max_bsdiff_size: 1,
        ..DiffOptions::default()
    };
    let delta = make_delta(&old_tar, &new_tar, &options);
    assert_eq!(apply_delta(&old_tar, &delta), new_tar);

    // Unchanged chunks come from the source file
    assert!(opcode_tags(&delta).contains(&OP_COPY));
    assert!(
        (delta.len() as u64) < old_payload.len() as u64 / 2,
        "delta is {} bytes",
        delta.len()
    );
}

#[test]
fn rewritten_file_falls_back_to_literal_copy() {
    let mut rng = StdRng::seed_from_u64(6);
    let old_payload: Vec<u8> = (0..200 * 1024).map(|_| rng.gen()).collect();
    let new_payload: Vec<u8> = (0..200 * 1024).map(|_| rng.gen()).collect();

    let old_tar = plain_tar(&[("data", &old_payload)]);
    let new_tar = plain_tar(&[("data", &new_payload)]);

    // Same path and size keep the pairing alive, but no chunks match and
    // bsdiff is capped, so the payload ships verbatim.
    let options = DiffOptions {
        max_bsdiff_size: 1,
        ..DiffOptions::default()
    };
    let delta = make_delta(&old_tar, &new_tar, &options);
    assert_eq!(apply_delta(&old_tar, &delta), new_tar);
    assert!(!opcode_tags(&delta).contains(&OP_COPY));
}

#[test]
fn gzip_compressed_archives() {
    let old_raw = plain_tar(&[("a", b"shared content here"), ("b", b"old only")]);
    let new_raw = plain_tar(&[("a", b"shared content here"), ("c", b"new only")]);

    let delta = make_delta(&gzip(&old_raw), &gzip(&new_raw), &DiffOptions::default());
    // Sources are extracted from the *decompressed* old archive
    assert_eq!(apply_delta(&old_raw, &delta), new_raw);
}

#[test]
fn mixed_archive_with_several_files() {
    let mut rng = StdRng::seed_from_u64(5);
    let unchanged: Vec<u8> = (0..100_000).map(|_| rng.gen()).collect();
    let old_bin: Vec<u8> = (0..80_000).map(|_| rng.gen()).collect();
    let mut new_bin = old_bin.clone();
    new_bin.extend_from_slice(b"appended tail");

    let old_tar = plain_tar(&[
        ("usr/share/doc", b"some docs"),
        ("usr/lib/same.so", &unchanged),
        ("usr/bin/tool", &old_bin),
    ]);
    let new_tar = plain_tar(&[
        ("usr/lib/same.so", &unchanged),
        ("usr/bin/tool", &new_bin),
        ("usr/share/new-file", b"brand new"),
    ]);

    let delta = assert_roundtrip(&old_tar, &new_tar, &new_tar);
    assert!(delta.len() < old_tar.len() / 4);
}

#[test]
fn empty_files_flow_through() {
    let old_tar = plain_tar(&[("present", b"payload")]);
    let new_tar = plain_tar(&[("empty", b""), ("present", b"payload")]);
    assert_roundtrip(&old_tar, &new_tar, &new_tar);
}

#[test]
fn overwritten_path_roundtrip() {
    let old_tar = plain_tar(&[("f", b"version one"), ("f", b"version two")]);
    let new_tar = plain_tar(&[("f", b"version one")]);
    // "f" on disk holds "version two" after extraction; the delta must not
    // copy from the shadowed first entry.
    assert_roundtrip(&old_tar, &new_tar, &new_tar);
}

#[test]
fn corrupted_magic_is_rejected() {
    let archive = plain_tar(&[("f", b"data")]);
    let mut delta = make_delta(&archive, &archive, &DiffOptions::default());
    delta[0] ^= 0xff;

    let dir = tempdir().unwrap();
    let provider = DirSourceProvider::new(dir.path());
    let mut out = Vec::new();
    let err = apply(&delta[..], &provider, &mut out).unwrap_err();
    assert!(matches!(err, DeltaError::InvalidDelta(_)));
    assert!(out.is_empty());
}

#[test]
fn custom_source_provider() {
    struct MapProvider(HashMap<String, Vec<u8>>);

    impl SourceProvider for MapProvider {
        fn open(&self, path: &str) -> tar_delta::Result<Box<dyn tar_delta::SourceFile>> {
            let data = self.0.get(path).ok_or_else(|| {
                DeltaError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    path.to_string(),
                ))
            })?;
            Ok(Box::new(Cursor::new(data.clone())))
        }
    }

    let old_tar = plain_tar(&[("x", b"stable bytes"), ("y", b"also stable")]);
    let new_tar = plain_tar(&[("y", b"also stable"), ("x", b"stable bytes")]);
    let delta = make_delta(&old_tar, &new_tar, &DiffOptions::default());

    let provider = MapProvider(
        [
            ("x".to_string(), b"stable bytes".to_vec()),
            ("y".to_string(), b"also stable".to_vec()),
        ]
        .into_iter()
        .collect(),
    );
    let mut out = Vec::new();
    apply(&delta[..], &provider, &mut out).unwrap();
    assert_eq!(out, new_tar);
}
