//! Integration tests for payload compression through a caller-supplied codec.

use factheap_core::heap::{CompressionCodec, JsonSerializer, RawBytes};
use factheap_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Run-length encoding as `(count, byte)` pairs.
struct RunLength;

impl CompressionCodec for RunLength {
    fn name(&self) -> &'static str {
        "rle"
    }

    fn compress(&self, input: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut iter = input.iter().peekable();
        while let Some(&byte) = iter.next() {
            let mut count = 1u8;
            while count < u8::MAX && iter.peek() == Some(&&byte) {
                iter.next();
                count += 1;
            }
            out.push(count);
            out.push(byte);
        }
        Some(out)
    }

    fn decompress(&self, input: &[u8], original_len: usize) -> factheap_core::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(original_len);
        for pair in input.chunks_exact(2) {
            out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        if out.len() != original_len {
            return Err(FactHeapError::Compression {
                cause: format!("expected {original_len} bytes, got {}", out.len()),
            });
        }
        Ok(out)
    }
}

fn compressed_region() -> Region {
    Region::init(RegionConfig::testing().with_compression(1))
        .unwrap()
        .with_codec(Arc::new(RunLength))
}

#[test]
fn test_compressible_payload_is_stored_small() {
    let region = compressed_region();
    let heap = region.heap();
    let key = Fingerprint::of(b"zeros");
    let value = vec![0u8; 4096];

    match heap.put(&RawBytes, key, &value).unwrap() {
        PutOutcome::Stored(size) => {
            assert!(size.stored < size.original);
            assert_eq!(size.original, 4096);
        }
        PutOutcome::AlreadyPresent => panic!("fresh key reported as present"),
    }
    assert!(heap.entry_size(key).unwrap().unwrap() < 4096);
    assert_eq!(heap.get(&RawBytes, key).unwrap(), Some(value));
}

#[test]
fn test_incompressible_payload_is_stored_plain() {
    let region = compressed_region();
    let heap = region.heap();
    let key = Fingerprint::of(b"ramp");
    let value: Vec<u8> = (0..=255u8).collect();

    heap.put(&RawBytes, key, &value).unwrap();
    assert_eq!(heap.entry_size(key).unwrap(), Some(256));
    assert_eq!(heap.get(&RawBytes, key).unwrap(), Some(value));
}

#[test]
fn test_reader_without_codec_reports_compression_error() {
    let region = compressed_region();
    let key = Fingerprint::of(b"zeros");
    region.heap().put(&RawBytes, key, &vec![0u8; 1024]).unwrap();

    let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();
    let err = worker.heap().get(&RawBytes, key).unwrap_err();
    assert_eq!(err.code(), "E206");

    let worker = worker.with_codec(Arc::new(RunLength));
    assert_eq!(worker.heap().get(&RawBytes, key).unwrap(), Some(vec![0u8; 1024]));
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Fact {
    name: String,
    deps: Vec<u32>,
}

#[test]
fn test_json_values_survive_compression_and_collect() {
    let region = compressed_region();
    let heap = region.heap();
    let serializer = JsonSerializer::<Fact>::new();
    let fact = Fact {
        name: "a".repeat(500),
        deps: vec![0; 200],
    };

    let keep = Fingerprint::of(b"keep");
    let drop = Fingerprint::of(b"drop");
    heap.put(&serializer, drop, &fact).unwrap();
    heap.put(&serializer, keep, &fact).unwrap();
    heap.remove(drop).unwrap();

    let report = heap.collect().unwrap();
    assert!(report.bytes_reclaimed() > 0);
    assert_eq!(heap.get(&serializer, keep).unwrap(), Some(fact));
    assert_eq!(heap.get(&serializer, drop).unwrap(), None);
}
