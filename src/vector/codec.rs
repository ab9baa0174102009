//! Single-file persistence for the flat vector index.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "LMVX" | version u32 | metric u8 | dimension u32 | count u64
//!   | count x (id i64, dimension x f32) | crc32 u32
//! ```
//!
//! The trailing checksum covers everything after the magic. Files are
//! replaced atomically: the encoded image is written to a temporary file in
//! the destination directory and renamed over the target path, so readers
//! never observe a partial index.

use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{LoamError, Result};
use crate::vector::{Metric, VectorIndex};

const MAGIC: &[u8; 4] = b"LMVX";
const FORMAT_VERSION: u32 = 1;

const METRIC_L2: u8 = 0;
const METRIC_COSINE: u8 = 1;

fn metric_tag(metric: Metric) -> u8 {
    match metric {
        Metric::L2 => METRIC_L2,
        Metric::Cosine => METRIC_COSINE,
    }
}

fn tag_metric(tag: u8) -> Result<Metric> {
    match tag {
        METRIC_L2 => Ok(Metric::L2),
        METRIC_COSINE => Ok(Metric::Cosine),
        other => Err(LoamError::corrupt_index(format!(
            "unknown metric tag {other}"
        ))),
    }
}

/// Serialize `index` into its on-disk image.
pub fn encode(index: &VectorIndex) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(25 + index.len() * (8 + index.dimension() * 4));
    buf.extend_from_slice(MAGIC);
    buf.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    buf.write_u8(metric_tag(index.metric()))?;
    buf.write_u32::<LittleEndian>(index.dimension() as u32)?;
    buf.write_u64::<LittleEndian>(index.len() as u64)?;

    for (pos, &id) in index.ids.iter().enumerate() {
        buf.write_i64::<LittleEndian>(id)?;
        let start = pos * index.dimension();
        for &value in &index.data[start..start + index.dimension()] {
            buf.write_f32::<LittleEndian>(value)?;
        }
    }

    let checksum = crc32fast::hash(&buf[MAGIC.len()..]);
    buf.write_u32::<LittleEndian>(checksum)?;
    Ok(buf)
}

/// Decode an on-disk image produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<VectorIndex> {
    if bytes.len() < MAGIC.len() + 4 + 1 + 4 + 8 + 4 {
        return Err(LoamError::corrupt_index("file too short"));
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(LoamError::corrupt_index("bad magic"));
    }

    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed_crc = crc32fast::hash(&body[MAGIC.len()..]);
    if stored_crc != computed_crc {
        return Err(LoamError::corrupt_index(format!(
            "checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let mut cursor = Cursor::new(&body[MAGIC.len()..]);
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(LoamError::corrupt_index(format!(
            "unsupported format version {version}"
        )));
    }
    let metric = tag_metric(cursor.read_u8()?)?;
    let dimension = cursor.read_u32::<LittleEndian>()? as usize;
    let count = cursor.read_u64::<LittleEndian>()? as usize;

    let expected_payload = count * (8 + dimension * 4);
    let remaining = body.len() - MAGIC.len() - cursor.position() as usize;
    if remaining != expected_payload {
        return Err(LoamError::corrupt_index(format!(
            "payload length mismatch: expected {expected_payload} bytes, found {remaining}"
        )));
    }

    let mut index = VectorIndex::new(metric, dimension);
    let mut vector = vec![0.0f32; dimension];
    for _ in 0..count {
        let id = cursor.read_i64::<LittleEndian>()?;
        for value in vector.iter_mut() {
            *value = cursor.read_f32::<LittleEndian>()?;
        }
        index.add(id, &vector)?;
    }
    Ok(index)
}

/// Read and decode the index file at `path`.
pub fn read_index(path: &Path) -> Result<VectorIndex> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}

/// Atomically replace the index file at `path` with the encoding of `index`.
pub fn write_index(index: &VectorIndex, path: &Path) -> Result<()> {
    let bytes = encode(index)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    tmp.write_all(&bytes)?;
    tmp.persist(path)
        .map_err(|err| LoamError::Io(err.error))?;
    Ok(())
}
