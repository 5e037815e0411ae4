//! Chunk codec and record-range operations over a chunk backend.

use super::{ArraySpec, Element, ElementKind};
use crate::error::{Result, StoreError};

/// Magic bytes for chunk payloads.
const CHUNK_MAGIC: &[u8; 4] = b"CHK\0";

/// Current chunk format version.
const CHUNK_VERSION: u8 = 1;

/// Fixed chunk header: magic + version + element count + payload length.
const CHUNK_HEADER_SIZE: usize = 4 + 1 + 4 + 4;

/// Where encoded chunks live.
pub(crate) trait ChunkBackend {
    fn load_chunk(&mut self, index: u64) -> Result<Option<Vec<u8>>>;

    fn store_chunk(&mut self, index: u64, bytes: Vec<u8>) -> Result<()>;

    /// Remove a chunk. Missing chunks are not an error.
    fn remove_chunk(&mut self, index: u64) -> Result<()>;
}

/// Encode chunk scalars.
pub(crate) fn encode_chunk<T: Element>(values: &[T]) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(values)?;

    let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(CHUNK_MAGIC);
    buf.push(CHUNK_VERSION);
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    let checksum = crc32fast::hash(&payload);
    buf.extend_from_slice(&checksum.to_le_bytes());

    Ok(buf)
}

/// Decode and verify chunk scalars.
pub(crate) fn decode_chunk<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() < CHUNK_HEADER_SIZE + 4 {
        return Err(StoreError::Corruption("chunk too short".into()));
    }
    if &bytes[0..4] != CHUNK_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid chunk magic".into()));
    }
    if bytes[4] != CHUNK_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported chunk version: {}",
            bytes[4]
        )));
    }

    let count = read_u32(&bytes[5..9]) as usize;
    let payload_len = read_u32(&bytes[9..13]) as usize;
    let payload_end = CHUNK_HEADER_SIZE + payload_len;
    if bytes.len() != payload_end + 4 {
        return Err(StoreError::Corruption(format!(
            "chunk length {} does not match payload length {}",
            bytes.len(),
            payload_len
        )));
    }

    let payload = &bytes[CHUNK_HEADER_SIZE..payload_end];
    let stored_checksum = read_u32(&bytes[payload_end..]);
    let computed_checksum = crc32fast::hash(payload);
    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let values: Vec<T> = rmp_serde::from_slice(payload)?;
    if values.len() != count {
        return Err(StoreError::Corruption(format!(
            "chunk declares {} scalars, holds {}",
            count,
            values.len()
        )));
    }
    Ok(values)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn load_values<T: Element, B: ChunkBackend>(backend: &mut B, index: u64) -> Result<Vec<T>> {
    match backend.load_chunk(index)? {
        Some(bytes) => decode_chunk(&bytes),
        None => Ok(Vec::new()),
    }
}

/// Write `values` at record `start`. The range must be inside `spec.len`.
pub(crate) fn write_records<T: Element, B: ChunkBackend>(
    backend: &mut B,
    spec: &ArraySpec,
    start: u64,
    values: &[T],
) -> Result<()> {
    spec.check_kind::<T>()?;

    let stride = spec.stride as u64;
    if values.len() as u64 % stride != 0 {
        return Err(StoreError::LengthMismatch(format!(
            "{} values do not fill records of stride {}",
            values.len(),
            stride
        )));
    }
    let count = values.len() as u64 / stride;
    if start.checked_add(count).map_or(true, |end| end > spec.len) {
        return Err(StoreError::OutOfBounds {
            start,
            count,
            len: spec.len,
        });
    }

    let per_chunk = spec.chunk_scalars()?;
    let mut scalar = spec.scalars(start)?;
    let end = spec.scalars(start + count)?;
    let mut cursor = 0usize;

    while scalar < end {
        let index = scalar / per_chunk;
        let offset = (scalar % per_chunk) as usize;
        let take = (per_chunk - offset as u64).min(end - scalar) as usize;

        let mut chunk: Vec<T> = load_values(backend, index)?;
        if chunk.len() < offset + take {
            chunk.resize(offset + take, T::default());
        }
        chunk[offset..offset + take].clone_from_slice(&values[cursor..cursor + take]);
        backend.store_chunk(index, encode_chunk(&chunk)?)?;

        scalar += take as u64;
        cursor += take;
    }

    Ok(())
}

/// Read all `spec.len` records as a flat scalar vector.
pub(crate) fn read_records<T: Element, B: ChunkBackend>(
    backend: &mut B,
    spec: &ArraySpec,
) -> Result<Vec<T>> {
    spec.check_kind::<T>()?;

    let per_chunk = spec.chunk_scalars()?;
    let total = spec.scalars(spec.len)?;
    let mut out = Vec::with_capacity(total as usize);

    let mut index = 0u64;
    while index * per_chunk < total {
        let want = per_chunk.min(total - index * per_chunk) as usize;
        let mut chunk: Vec<T> = load_values(backend, index)?;
        chunk.resize(want, T::default());
        out.extend(chunk);
        index += 1;
    }

    Ok(out)
}

/// Drop the stored scalars past `new_len` records.
///
/// Chunks wholly beyond the new end are removed and the boundary chunk is
/// cut, so records re-exposed by a later grow read back as defaults.
pub(crate) fn truncate_records<B: ChunkBackend>(
    backend: &mut B,
    spec: &ArraySpec,
    new_len: u64,
) -> Result<()> {
    if new_len >= spec.len {
        return Ok(());
    }

    let per_chunk = spec.chunk_scalars()?;
    let old_total = spec.scalars(spec.len)?;
    let new_total = spec.scalars(new_len)?;

    let first_removed = new_total.div_ceil(per_chunk);
    let old_chunks = old_total.div_ceil(per_chunk);
    for index in first_removed..old_chunks {
        backend.remove_chunk(index)?;
    }

    let keep = (new_total % per_chunk) as usize;
    if keep > 0 {
        let index = new_total / per_chunk;
        match spec.kind {
            ElementKind::Str => cut_chunk::<String, B>(backend, index, keep)?,
            ElementKind::F64 => cut_chunk::<f64, B>(backend, index, keep)?,
            ElementKind::U64 => cut_chunk::<u64, B>(backend, index, keep)?,
            ElementKind::I64 => cut_chunk::<i64, B>(backend, index, keep)?,
        }
    }

    Ok(())
}

fn cut_chunk<T: Element, B: ChunkBackend>(backend: &mut B, index: u64, keep: usize) -> Result<()> {
    let Some(bytes) = backend.load_chunk(index)? else {
        return Ok(());
    };
    let mut chunk: Vec<T> = decode_chunk(&bytes)?;
    if chunk.len() > keep {
        chunk.truncate(keep);
        backend.store_chunk(index, encode_chunk(&chunk)?)?;
    }
    Ok(())
}

impl ChunkBackend for std::collections::HashMap<u64, Vec<u8>> {
    fn load_chunk(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.get(&index).cloned())
    }

    fn store_chunk(&mut self, index: u64, bytes: Vec<u8>) -> Result<()> {
        self.insert(index, bytes);
        Ok(())
    }

    fn remove_chunk(&mut self, index: u64) -> Result<()> {
        self.remove(&index);
        Ok(())
    }
}
