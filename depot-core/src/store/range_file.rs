//! Immutable sorted range files.
//!
//! Layout: `DRNG ‖ format(1) ‖ entries ‖ count(u64 BE) ‖ sha256(preceding bytes)`,
//! where each entry is `key_len(u32 BE) ‖ key ‖ value_len(u32 BE) ‖ value` and
//! keys are strictly increasing.

use crate::error::{DepotError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

const MAGIC: &[u8; 4] = b"DRNG";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;
const FOOTER_LEN: usize = 8 + 32;

pub type RangeEntry = (Vec<u8>, Vec<u8>);

pub fn encode_entries<I, K, V>(entries: I) -> Result<Bytes>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut buf = BytesMut::with_capacity(HEADER_LEN + FOOTER_LEN);
    buf.put_slice(MAGIC);
    buf.put_u8(FORMAT_VERSION);

    let mut count = 0_u64;
    let mut previous: Option<Vec<u8>> = None;

    for (key, value) in entries {
        let key = key.as_ref();
        let value = value.as_ref();

        if let Some(previous) = previous.as_deref()
            && previous >= key
        {
            return Err(DepotError::InvalidArgument(
                "range file keys must be strictly increasing".to_string(),
            ));
        }

        buf.put_u32(frame_len(key.len())?);
        buf.put_slice(key);
        buf.put_u32(frame_len(value.len())?);
        buf.put_slice(value);

        previous = Some(key.to_vec());
        count += 1;
    }

    buf.put_u64(count);
    let digest = Sha256::digest(&buf[..]);
    buf.put_slice(&digest);
    Ok(buf.freeze())
}

pub fn decode_entries(data: &[u8]) -> Result<Vec<RangeEntry>> {
    if data.len() < HEADER_LEN + FOOTER_LEN {
        return Err(corrupted("range file is truncated"));
    }

    let (signed, digest) = data.split_at(data.len() - 32);
    if Sha256::digest(signed).as_slice() != digest {
        return Err(corrupted("range file digest mismatch"));
    }

    let (body, count_bytes) = signed.split_at(signed.len() - 8);
    let mut count_bytes = count_bytes;
    let expected_count = count_bytes.get_u64();

    if &body[..4] != MAGIC {
        return Err(corrupted("bad range file magic"));
    }
    if body[4] != FORMAT_VERSION {
        return Err(corrupted(&format!(
            "unsupported range file format {}",
            body[4]
        )));
    }

    let mut cursor = &body[HEADER_LEN..];
    let mut entries: Vec<RangeEntry> = Vec::new();

    while cursor.has_remaining() {
        let key = read_frame(&mut cursor)?;
        let value = read_frame(&mut cursor)?;

        if let Some((previous, _)) = entries.last()
            && previous.as_slice() >= key.as_slice()
        {
            return Err(corrupted("range file keys are not sorted"));
        }

        entries.push((key, value));
    }

    if entries.len() as u64 != expected_count {
        return Err(corrupted(&format!(
            "range file entry count mismatch: footer={} actual={}",
            expected_count,
            entries.len()
        )));
    }

    Ok(entries)
}

/// Writes the entries to `path` atomically (temp file, fsync, rename).
pub fn write_range_file<I, K, V>(path: &Path, entries: I) -> Result<u64>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let encoded = encode_entries(entries)?;
    let mut count_bytes = &encoded[encoded.len() - FOOTER_LEN..];
    let count = count_bytes.get_u64();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension(format!("{}.tmp", ulid::Ulid::new()));
    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;
    Ok(count)
}

pub fn read_range_file(path: &Path) -> Result<Vec<RangeEntry>> {
    let data = std::fs::read(path)?;
    decode_entries(&data)
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        DepotError::InvalidArgument(format!("range file frame of {} bytes is too large", len))
    })
}

fn read_frame(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.remaining() < 4 {
        return Err(corrupted("range file frame header is truncated"));
    }

    let len = cursor.get_u32() as usize;
    if cursor.remaining() < len {
        return Err(corrupted("range file frame is truncated"));
    }

    let frame = cursor[..len].to_vec();
    cursor.advance(len);
    Ok(frame)
}

fn corrupted(message: &str) -> DepotError {
    DepotError::Corrupted(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.range");

        let entries = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), Vec::new()),
            (b"c".to_vec(), vec![0_u8; 1024]),
        ];

        let count = write_range_file(&path, entries.clone()).unwrap();
        assert_eq!(count, 3);
        assert_eq!(read_range_file(&path).unwrap(), entries);
    }

    #[test]
    fn empty_range_file_is_valid() {
        let encoded = encode_entries(Vec::<(Vec<u8>, Vec<u8>)>::new()).unwrap();
        assert!(decode_entries(&encoded).unwrap().is_empty());
    }

    #[test]
    fn unsorted_keys_are_rejected() {
        let result = encode_entries(vec![(b"b".to_vec(), b"1".to_vec()), (b"a".to_vec(), b"2".to_vec())]);
        assert!(matches!(result, Err(DepotError::InvalidArgument(_))));
    }

    #[test]
    fn tampered_bytes_are_detected() {
        let encoded = encode_entries(vec![(b"key".to_vec(), b"value".to_vec())]).unwrap();
        let mut tampered = encoded.to_vec();
        tampered[HEADER_LEN + 5] ^= 0xff;
        assert!(matches!(
            decode_entries(&tampered),
            Err(DepotError::Corrupted(_))
        ));

        assert!(matches!(
            decode_entries(&encoded[..10]),
            Err(DepotError::Corrupted(_))
        ));
    }
}
